//! Key value map management API backend.
//!
//! Talks to an Apigee-style management API where each store partition is a
//! key value map scoped to an organization and environment:
//!
//! - `GET    {base}/v1/organizations/{org}/environments/{env}/keyvaluemaps` lists map names
//! - `POST   .../keyvaluemaps` creates a map (`{"name", "encrypted", "entry"}`)
//! - `GET    .../keyvaluemaps/{map}` returns the map with all its entries
//! - `GET    .../keyvaluemaps/{map}/entries/{name}` returns one entry
//! - `POST   .../keyvaluemaps/{map}/entries/{name}` updates an entry
//! - `POST   .../keyvaluemaps/{map}/entries` creates an entry
//! - `DELETE .../keyvaluemaps/{map}/entries/{name}` removes an entry

use error_stack::Report;
use serde::{Deserialize, Serialize};

use jwks_provisioner_common::error::KeyLifecycleError;
use jwks_provisioner_common::key_store::{
    check_partition_encryption, KeyStore, PartitionLayout, RemoveOutcome, StoreEntry,
};
use jwks_provisioner_common::naming::Partition;
use jwks_provisioner_common::settings::{
    ManagementApiSettings, Settings, StoreBackend, API_TOKEN_ENV,
};

use crate::error::CliError;
use crate::local::FileKeyStore;

#[derive(Debug, Deserialize)]
struct KeyValueMap {
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    entry: Vec<StoreEntry>,
}

#[derive(Debug, Serialize)]
struct NewKeyValueMap<'a> {
    name: &'a str,
    encrypted: bool,
    entry: Vec<StoreEntry>,
}

#[derive(Debug, Serialize)]
struct EntryBody<'a> {
    name: &'a str,
    value: &'a str,
}

/// Key store backed by the management API.
pub struct ManagementApiKeyStore {
    base_url: String,
    organization: String,
    environment: String,
    api_token: String,
    layout: PartitionLayout,
}

impl ManagementApiKeyStore {
    pub fn new(
        settings: &ManagementApiSettings,
        layout: PartitionLayout,
        api_token: String,
    ) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            organization: settings.organization.clone(),
            environment: settings.environment.clone(),
            api_token,
            layout,
        }
    }

    pub fn from_env(
        settings: &ManagementApiSettings,
        layout: PartitionLayout,
    ) -> Result<Self, CliError> {
        let api_token = std::env::var(API_TOKEN_ENV).map_err(|_| {
            CliError::Config(format!("{} environment variable not set", API_TOKEN_ENV))
        })?;
        Ok(Self::new(settings, layout, api_token))
    }

    fn maps_url(&self) -> String {
        format!(
            "{}/v1/organizations/{}/environments/{}/keyvaluemaps",
            self.base_url,
            urlencoding::encode(&self.organization),
            urlencoding::encode(&self.environment)
        )
    }

    fn map_url(&self, partition: Partition) -> String {
        format!(
            "{}/{}",
            self.maps_url(),
            urlencoding::encode(self.layout.map_name(partition))
        )
    }

    fn entry_url(&self, partition: Partition, name: &str) -> String {
        format!(
            "{}/entries/{}",
            self.map_url(partition),
            urlencoding::encode(name)
        )
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    /// GET returning `None` on 404.
    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, Report<KeyLifecycleError>> {
        let response = match ureq::get(url)
            .header("Authorization", &self.authorization())
            .header("Accept", "application/json")
            .call()
        {
            Ok(resp) => resp,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(e) => return Err(read_error(url, &e)),
        };

        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| read_error(url, &e))?;
        serde_json::from_str(&body).map(Some).map_err(|e| {
            Report::new(KeyLifecycleError::StoreRead {
                message: format!("Unexpected response from {}: {}", url, e),
            })
        })
    }

    fn map_exists(&self, partition: Partition) -> Result<bool, Report<KeyLifecycleError>> {
        let names: Vec<String> = self.get_json(&self.maps_url())?.unwrap_or_default();
        let map_name = self.layout.map_name(partition);
        Ok(names.iter().any(|name| name == map_name))
    }

    fn missing_map(&self, partition: Partition) -> Report<KeyLifecycleError> {
        Report::new(KeyLifecycleError::StoreRead {
            message: format!("Map '{}' does not exist", self.layout.map_name(partition)),
        })
    }

    fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<(), ureq::Error> {
        ureq::post(url)
            .header("Authorization", &self.authorization())
            .header("Accept", "application/json")
            .send_json(body)
            .map(|_| ())
    }
}

fn read_error(url: &str, err: &dyn std::fmt::Display) -> Report<KeyLifecycleError> {
    Report::new(KeyLifecycleError::StoreRead {
        message: format!("GET {} failed: {}", url, err),
    })
}

fn write_error(method: &str, url: &str, err: &ureq::Error) -> Report<KeyLifecycleError> {
    Report::new(KeyLifecycleError::StoreWrite {
        message: format!("{} {} failed: {}", method, url, err),
    })
}

impl KeyStore for ManagementApiKeyStore {
    fn ensure_partition(
        &self,
        partition: Partition,
        encrypted: bool,
    ) -> Result<(), Report<KeyLifecycleError>> {
        check_partition_encryption(partition, encrypted)?;

        let map_name = self.layout.map_name(partition);

        if self.map_exists(partition)? {
            if partition == Partition::Secrets {
                let map: Option<KeyValueMap> = self.get_json(&self.map_url(partition))?;
                let map = map.ok_or_else(|| {
                    Report::new(KeyLifecycleError::StoreRead {
                        message: format!("Map '{}' disappeared while checking it", map_name),
                    })
                })?;
                check_partition_encryption(partition, map.encrypted)?;
            }
            log::debug!("Map '{}' already exists", map_name);
            return Ok(());
        }

        log::info!("Creating map '{}' (encrypted: {})", map_name, encrypted);
        let url = self.maps_url();
        self.post_json(
            &url,
            &NewKeyValueMap {
                name: map_name,
                encrypted,
                entry: Vec::new(),
            },
        )
        .map_err(|e| write_error("POST", &url, &e))
    }

    fn put_raw(
        &self,
        partition: Partition,
        name: &str,
        value: &str,
    ) -> Result<(), Report<KeyLifecycleError>> {
        let body = EntryBody { name, value };

        let update_url = self.entry_url(partition, name);
        match self.post_json(&update_url, &body) {
            Ok(()) => return Ok(()),
            Err(ureq::Error::StatusCode(404)) => {
                log::debug!("Entry '{}' does not exist yet, creating it", name);
            }
            Err(e) => return Err(write_error("POST", &update_url, &e)),
        }

        let create_url = format!("{}/entries", self.map_url(partition));
        self.post_json(&create_url, &body)
            .map_err(|e| write_error("POST", &create_url, &e))
    }

    fn get_raw(
        &self,
        partition: Partition,
        name: Option<&str>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        match name {
            Some(name) => {
                let entry: Option<StoreEntry> = self.get_json(&self.entry_url(partition, name))?;
                if let Some(entry) = entry {
                    return Ok(vec![entry]);
                }
                // The entry endpoint answers 404 for a missing map as well.
                if self.map_exists(partition)? {
                    Ok(Vec::new())
                } else {
                    Err(self.missing_map(partition))
                }
            }
            None => {
                let map: Option<KeyValueMap> = self.get_json(&self.map_url(partition))?;
                map.map(|map| map.entry)
                    .ok_or_else(|| self.missing_map(partition))
            }
        }
    }

    fn remove_raw(
        &self,
        partition: Partition,
        name: &str,
    ) -> Result<RemoveOutcome, Report<KeyLifecycleError>> {
        let url = self.entry_url(partition, name);
        match ureq::delete(&url)
            .header("Authorization", &self.authorization())
            .header("Accept", "application/json")
            .call()
        {
            Ok(_) => Ok(RemoveOutcome::Removed),
            Err(ureq::Error::StatusCode(404)) => Ok(RemoveOutcome::Absent),
            Err(e) => Err(write_error("DELETE", &url, &e)),
        }
    }
}

/// Create the key store selected by the settings.
pub fn create_store(settings: &Settings) -> Result<Box<dyn KeyStore>, CliError> {
    let layout = settings.store.partition_layout();
    match settings.store.backend {
        StoreBackend::ManagementApi => {
            let api = settings.management_api.as_ref().ok_or_else(|| {
                CliError::Config(
                    "The management-api backend needs a [management_api] section".into(),
                )
            })?;
            Ok(Box::new(ManagementApiKeyStore::from_env(api, layout)?))
        }
        StoreBackend::File => Ok(Box::new(FileKeyStore::open(&settings.store.file_path)?)),
    }
}

//! Provisioner configuration.
//!
//! Settings come from a TOML file merged with `JWKS_PROVISIONER__`-prefixed
//! environment variables (`__` separates nesting levels, e.g.
//! `JWKS_PROVISIONER__KEYS__RSA_BITS=3072`).

use std::fs;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::KeyLifecycleError;
use crate::key_management::generator::{EcCurve, DEFAULT_EC_CURVE, DEFAULT_RSA_BITS};
use crate::key_store::{PartitionLayout, DEFAULT_NON_SECRETS_PARTITION, DEFAULT_SECRETS_PARTITION};
use crate::naming::KeyFamily;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "jwks-provisioner.toml";

/// Prefix of environment overrides.
pub const ENVIRONMENT_PREFIX: &str = "JWKS_PROVISIONER";

/// Variable holding the management API bearer token. Never read from the file.
pub const API_TOKEN_ENV: &str = "JWKS_PROVISIONER_API_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    ManagementApi,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StoreSettings {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Name of the encrypted map holding private keys.
    #[serde(default = "default_secrets_partition")]
    #[validate(length(min = 1))]
    pub secrets_partition: String,

    /// Name of the plaintext map holding public keys, pointers and the JWKS.
    #[serde(default = "default_non_secrets_partition")]
    #[validate(length(min = 1))]
    pub non_secrets_partition: String,

    /// JSON file used by the `file` backend.
    #[serde(default = "default_file_path")]
    #[validate(length(min = 1))]
    pub file_path: String,
}

impl StoreSettings {
    #[must_use]
    pub fn partition_layout(&self) -> PartitionLayout {
        PartitionLayout::new(&self.secrets_partition, &self.non_secrets_partition)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            secrets_partition: default_secrets_partition(),
            non_secrets_partition: default_non_secrets_partition(),
            file_path: default_file_path(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::File
}

fn default_secrets_partition() -> String {
    DEFAULT_SECRETS_PARTITION.to_string()
}

fn default_non_secrets_partition() -> String {
    DEFAULT_NON_SECRETS_PARTITION.to_string()
}

fn default_file_path() -> String {
    "jwks-store.json".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ManagementApiSettings {
    /// e.g. `https://api.enterprise.apigee.com`
    #[validate(url)]
    pub base_url: String,
    #[validate(length(min = 1))]
    pub organization: String,
    #[validate(length(min = 1))]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct KeySettings {
    #[validate(range(min = 2048, max = 4096))]
    pub rsa_bits: usize,

    #[validate(custom(function = "validate_ec_curve"))]
    pub ec_curve: String,

    /// Families bootstrapped by `provision`.
    #[validate(length(min = 1))]
    pub families: Vec<KeyFamily>,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            rsa_bits: DEFAULT_RSA_BITS,
            ec_curve: DEFAULT_EC_CURVE.to_string(),
            families: KeyFamily::ALL.to_vec(),
        }
    }
}

fn validate_ec_curve(curve: &str) -> Result<(), ValidationError> {
    curve
        .parse::<EcCurve>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("unsupported_ec_curve"))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate(nested)]
    pub store: StoreSettings,

    /// Required when `store.backend` is `management-api`.
    #[serde(default)]
    #[validate(nested)]
    pub management_api: Option<ManagementApiSettings>,

    #[serde(default)]
    #[validate(nested)]
    pub keys: KeySettings,
}

impl Settings {
    /// Loads settings from `path`.
    ///
    /// Without an explicit path the default file is used when present;
    /// otherwise built-in defaults apply. Environment overrides apply either way.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::Configuration`] if an explicit file cannot
    /// be read or the resulting settings are invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, Report<KeyLifecycleError>> {
        let toml_str = match path {
            Some(path) => fs::read_to_string(path).change_context(
                KeyLifecycleError::Configuration {
                    message: format!("Failed to read config file {}", path.display()),
                },
            )?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                fs::read_to_string(DEFAULT_CONFIG_FILE).change_context(
                    KeyLifecycleError::Configuration {
                        message: format!("Failed to read config file {}", DEFAULT_CONFIG_FILE),
                    },
                )?
            }
            None => {
                log::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                String::new()
            }
        };

        Self::from_toml(&toml_str)
    }

    /// Parses and validates settings from a TOML string plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::Configuration`] if the TOML is malformed
    /// or any value fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self, Report<KeyLifecycleError>> {
        let environment = Environment::with_prefix(ENVIRONMENT_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("keys.families");

        let toml = File::from_str(toml_str, FileFormat::Toml);
        let settings: Self = Config::builder()
            .add_source(toml)
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize())
            .change_context(KeyLifecycleError::Configuration {
                message: "Failed to parse settings".into(),
            })?;

        settings.validate().map_err(|e| {
            Report::new(KeyLifecycleError::Configuration {
                message: format!("Invalid settings: {}", e),
            })
        })?;

        if settings.store.backend == StoreBackend::ManagementApi
            && settings.management_api.is_none()
        {
            return Err(Report::new(KeyLifecycleError::Configuration {
                message: "The management-api backend needs a [management_api] section".into(),
            }));
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs `f` with the overrides used by the env tests cleared.
    fn without_overrides<F: FnOnce()>(f: F) {
        temp_env::with_vars_unset(
            [
                "JWKS_PROVISIONER__KEYS__RSA_BITS",
                "JWKS_PROVISIONER__KEYS__FAMILIES",
                "JWKS_PROVISIONER__STORE__NON_SECRETS_PARTITION",
            ],
            f,
        );
    }

    #[test]
    fn test_settings_defaults_from_empty_toml() {
        without_overrides(|| {
            let settings = Settings::from_toml("").expect("should load defaults");

            assert_eq!(settings.store.backend, StoreBackend::File);
            assert_eq!(settings.store.secrets_partition, "secrets");
            assert_eq!(settings.store.non_secrets_partition, "settings");
            assert_eq!(settings.keys.rsa_bits, 2048);
            assert_eq!(settings.keys.ec_curve, "P-256");
            assert_eq!(settings.keys.families, vec![KeyFamily::Rsa, KeyFamily::Ec]);
            assert!(settings.management_api.is_none());
        });
    }

    #[test]
    fn test_settings_from_valid_toml() {
        without_overrides(|| {
            let toml_str = r#"
                [store]
                backend = "management-api"
                secrets_partition = "private-keys"

                [management_api]
                base_url = "https://api.enterprise.apigee.com"
                organization = "acme"
                environment = "test"

                [keys]
                rsa_bits = 3072
                ec_curve = "P-384"
                families = ["ec"]
                "#;

            let settings = Settings::from_toml(toml_str).expect("should parse settings");
            assert_eq!(settings.store.backend, StoreBackend::ManagementApi);
            assert_eq!(
                settings.store.partition_layout(),
                PartitionLayout::new("private-keys", "settings")
            );
            let api = settings.management_api.expect("should have api section");
            assert_eq!(api.organization, "acme");
            assert_eq!(settings.keys.rsa_bits, 3072);
            assert_eq!(settings.keys.families, vec![KeyFamily::Ec]);
        });
    }

    #[test]
    fn test_management_api_backend_requires_section() {
        let result = Settings::from_toml("[store]\nbackend = \"management-api\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rsa_bits_out_of_range() {
        without_overrides(|| {
            assert!(Settings::from_toml("[keys]\nrsa_bits = 512\n").is_err());
            assert!(Settings::from_toml("[keys]\nrsa_bits = 1024\n").is_err());
            assert!(Settings::from_toml("[keys]\nrsa_bits = 8192\n").is_err());
        });
    }

    #[test]
    fn test_unsupported_curve_rejected() {
        assert!(Settings::from_toml("[keys]\nec_curve = \"secp256k1\"\n").is_err());
    }

    #[test]
    fn test_invalid_management_url_rejected() {
        let toml_str = r#"
            [management_api]
            base_url = "not a url"
            organization = "acme"
            environment = "test"
            "#;
        assert!(Settings::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_invalid_toml_syntax() {
        let err = Settings::from_toml("[keys\nrsa_bits = 2048")
            .expect_err("should reject broken TOML");
        assert!(matches!(
            err.current_context(),
            KeyLifecycleError::Configuration { .. }
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        temp_env::with_vars(
            [
                ("JWKS_PROVISIONER__KEYS__RSA_BITS", Some("4096")),
                ("JWKS_PROVISIONER__STORE__NON_SECRETS_PARTITION", Some("public-keys")),
            ],
            || {
                let settings = Settings::from_toml("[keys]\nrsa_bits = 2048\n")
                    .expect("should load settings");
                assert_eq!(settings.keys.rsa_bits, 4096);
                assert_eq!(settings.store.non_secrets_partition, "public-keys");
            },
        );
    }

    #[test]
    fn test_env_family_list() {
        temp_env::with_var("JWKS_PROVISIONER__KEYS__FAMILIES", Some("ec,rsa"), || {
            let settings = Settings::from_toml("").expect("should load settings");
            assert_eq!(settings.keys.families, vec![KeyFamily::Ec, KeyFamily::Rsa]);
        });
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let result = Settings::load(Some(Path::new("/nonexistent/jwks-provisioner.toml")));
        assert!(result.is_err());
    }
}

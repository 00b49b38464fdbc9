//! Local development support.
//!
//! [`FileKeyStore`] keeps both partitions in one JSON file so the key lifecycle
//! can be exercised without the management platform. The secrets partition is
//! flagged encrypted but stored as plain text; the file is created owner-only
//! on Unix.

use std::fs;
use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use jwks_provisioner_common::error::KeyLifecycleError;
use jwks_provisioner_common::key_store::{
    KeyStore, MemoryKeyStore, RemoveOutcome, StoreEntry, StoreSnapshot,
};
use jwks_provisioner_common::naming::Partition;

use crate::error::CliError;

pub struct FileKeyStore {
    path: PathBuf,
    inner: MemoryKeyStore,
}

impl FileKeyStore {
    /// Opens the store at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CliError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<StoreSnapshot>(&content).map_err(|e| {
                CliError::Config(format!("Invalid store file {}: {}", path.display(), e))
            })?
        } else {
            log::debug!("Store file {} does not exist yet", path.display());
            StoreSnapshot::default()
        };

        log::warn!(
            "Using local store {}; private keys are kept unencrypted on disk",
            path.display()
        );
        Ok(Self {
            path,
            inner: MemoryKeyStore::from_snapshot(snapshot),
        })
    }

    fn persist(&self) -> Result<(), Report<KeyLifecycleError>> {
        let error = || KeyLifecycleError::StoreWrite {
            message: format!("Failed to save store file {}", self.path.display()),
        };

        let json = serde_json::to_string_pretty(&self.inner.snapshot()?).change_context_lazy(error)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).change_context_lazy(error)?;
            }
        }
        write_private(&self.path, &json).change_context_lazy(error)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)
}

impl KeyStore for FileKeyStore {
    fn ensure_partition(
        &self,
        partition: Partition,
        encrypted: bool,
    ) -> Result<(), Report<KeyLifecycleError>> {
        self.inner.ensure_partition(partition, encrypted)?;
        self.persist()
    }

    fn put_raw(
        &self,
        partition: Partition,
        name: &str,
        value: &str,
    ) -> Result<(), Report<KeyLifecycleError>> {
        self.inner.put_raw(partition, name, value)?;
        self.persist()
    }

    fn get_raw(
        &self,
        partition: Partition,
        name: Option<&str>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        self.inner.get_raw(partition, name)
    }

    fn remove_raw(
        &self,
        partition: Partition,
        name: &str,
    ) -> Result<RemoveOutcome, Report<KeyLifecycleError>> {
        let outcome = self.inner.remove_raw(partition, name)?;
        if outcome == RemoveOutcome::Removed {
            self.persist()?;
        }
        Ok(outcome)
    }
}

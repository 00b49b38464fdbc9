//! Store abstraction over the two key partitions.
//!
//! Backends (remote management API, local file, in-memory) implement the raw
//! string methods. Callers go through the typed methods, which take an
//! [`EntryName`] and derive the partition from it, so nothing outside
//! [`crate::naming`] builds entry names by hand and private key material can
//! only be addressed in the secrets partition.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::error::KeyLifecycleError;
use crate::naming::{EntryName, Partition};

/// Default name of the encrypted map holding private keys.
pub const DEFAULT_SECRETS_PARTITION: &str = "secrets";

/// Default name of the plaintext map holding public keys, pointers and the JWKS.
pub const DEFAULT_NON_SECRETS_PARTITION: &str = "settings";

/// A raw name/value pair as returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub name: String,
    pub value: String,
}

impl StoreEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Decodes the entry name, `None` for names outside the key layout.
    #[must_use]
    pub fn entry_name(&self) -> Option<EntryName> {
        EntryName::decode(&self.name)
    }
}

/// Result of a best-effort delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Nothing to delete. Not an error: cleanup flows are idempotent.
    Absent,
}

/// Maps the logical partitions onto backend map names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    pub secrets: String,
    pub non_secrets: String,
}

impl PartitionLayout {
    pub fn new(secrets: impl Into<String>, non_secrets: impl Into<String>) -> Self {
        Self {
            secrets: secrets.into(),
            non_secrets: non_secrets.into(),
        }
    }

    #[must_use]
    pub fn map_name(&self, partition: Partition) -> &str {
        match partition {
            Partition::Secrets => &self.secrets,
            Partition::NonSecrets => &self.non_secrets,
        }
    }
}

impl Default for PartitionLayout {
    fn default() -> Self {
        Self::new(DEFAULT_SECRETS_PARTITION, DEFAULT_NON_SECRETS_PARTITION)
    }
}

/// Rejects any attempt to declare the secrets partition unencrypted.
///
/// # Errors
///
/// Returns [`KeyLifecycleError::Configuration`] when `partition` is the secrets
/// partition and `encrypted` is false.
pub fn check_partition_encryption(
    partition: Partition,
    encrypted: bool,
) -> Result<(), Report<KeyLifecycleError>> {
    if partition == Partition::Secrets && !encrypted {
        return Err(Report::new(KeyLifecycleError::Configuration {
            message: "The secrets partition must be encrypted".into(),
        }));
    }
    Ok(())
}

/// Capability set of the remote key-value store.
pub trait KeyStore {
    /// Idempotently creates the partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot create or inspect the partition,
    /// or if the secrets partition would end up unencrypted.
    fn ensure_partition(
        &self,
        partition: Partition,
        encrypted: bool,
    ) -> Result<(), Report<KeyLifecycleError>>;

    /// Writes (creates or overwrites) a raw entry.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreWrite`] if the write is not committed.
    fn put_raw(
        &self,
        partition: Partition,
        name: &str,
        value: &str,
    ) -> Result<(), Report<KeyLifecycleError>>;

    /// Reads one entry (`Some(name)`) or every entry of the partition (`None`).
    ///
    /// A missing entry yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] if the partition does not exist
    /// or the store is unreachable.
    fn get_raw(
        &self,
        partition: Partition,
        name: Option<&str>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>>;

    /// Deletes a raw entry.
    ///
    /// # Errors
    ///
    /// Returns an error only for transient failures; an absent entry is
    /// [`RemoveOutcome::Absent`].
    fn remove_raw(
        &self,
        partition: Partition,
        name: &str,
    ) -> Result<RemoveOutcome, Report<KeyLifecycleError>>;

    /// Ensures both partitions, the secrets one encrypted.
    ///
    /// # Errors
    ///
    /// Propagates the first [`KeyStore::ensure_partition`] failure.
    fn ensure_partitions(&self) -> Result<(), Report<KeyLifecycleError>> {
        self.ensure_partition(Partition::Secrets, true)?;
        self.ensure_partition(Partition::NonSecrets, false)
    }

    /// Writes a typed entry into the partition its name belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreWrite`] if the write is not committed.
    fn put(&self, name: &EntryName, value: &str) -> Result<(), Report<KeyLifecycleError>> {
        self.put_raw(name.partition(), &name.encode(), value)
    }

    /// Reads one typed entry or the whole partition.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] on backend failure and
    /// [`KeyLifecycleError::Configuration`] if `name` does not belong to
    /// `partition`.
    fn get(
        &self,
        partition: Partition,
        name: Option<&EntryName>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        match name {
            Some(name) if name.partition() != partition => {
                Err(Report::new(KeyLifecycleError::Configuration {
                    message: format!("Entry '{}' does not live in the {} partition", name, partition),
                }))
            }
            Some(name) => self.get_raw(partition, Some(&name.encode())),
            None => self.get_raw(partition, None),
        }
    }

    /// Reads the value of a single typed entry.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] on backend failure.
    fn get_value(&self, name: &EntryName) -> Result<Option<String>, Report<KeyLifecycleError>> {
        let encoded = name.encode();
        Ok(self
            .get(name.partition(), Some(name))?
            .into_iter()
            .find(|entry| entry.name == encoded)
            .map(|entry| entry.value))
    }

    /// Best-effort delete of a typed entry.
    ///
    /// # Errors
    ///
    /// Returns an error only for transient failures.
    fn remove_entry(&self, name: &EntryName) -> Result<RemoveOutcome, Report<KeyLifecycleError>> {
        self.remove_raw(name.partition(), &name.encode())
    }
}

impl<S: KeyStore + ?Sized> KeyStore for Box<S> {
    fn ensure_partition(
        &self,
        partition: Partition,
        encrypted: bool,
    ) -> Result<(), Report<KeyLifecycleError>> {
        (**self).ensure_partition(partition, encrypted)
    }

    fn put_raw(
        &self,
        partition: Partition,
        name: &str,
        value: &str,
    ) -> Result<(), Report<KeyLifecycleError>> {
        (**self).put_raw(partition, name, value)
    }

    fn get_raw(
        &self,
        partition: Partition,
        name: Option<&str>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        (**self).get_raw(partition, name)
    }

    fn remove_raw(
        &self,
        partition: Partition,
        name: &str,
    ) -> Result<RemoveOutcome, Report<KeyLifecycleError>> {
        (**self).remove_raw(partition, name)
    }
}

impl<S: KeyStore + ?Sized> KeyStore for &S {
    fn ensure_partition(
        &self,
        partition: Partition,
        encrypted: bool,
    ) -> Result<(), Report<KeyLifecycleError>> {
        (**self).ensure_partition(partition, encrypted)
    }

    fn put_raw(
        &self,
        partition: Partition,
        name: &str,
        value: &str,
    ) -> Result<(), Report<KeyLifecycleError>> {
        (**self).put_raw(partition, name, value)
    }

    fn get_raw(
        &self,
        partition: Partition,
        name: Option<&str>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        (**self).get_raw(partition, name)
    }

    fn remove_raw(
        &self,
        partition: Partition,
        name: &str,
    ) -> Result<RemoveOutcome, Report<KeyLifecycleError>> {
        (**self).remove_raw(partition, name)
    }
}

/// Serializable contents of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub encrypted: bool,
    pub entries: Vec<StoreEntry>,
}

/// Serializable contents of a whole store. `None` means the partition was
/// never created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<PartitionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_secrets: Option<PartitionSnapshot>,
}

impl StoreSnapshot {
    fn partition(&self, partition: Partition) -> Option<&PartitionSnapshot> {
        match partition {
            Partition::Secrets => self.secrets.as_ref(),
            Partition::NonSecrets => self.non_secrets.as_ref(),
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut Option<PartitionSnapshot> {
        match partition {
            Partition::Secrets => &mut self.secrets,
            Partition::NonSecrets => &mut self.non_secrets,
        }
    }
}

/// In-process store. Entries keep insertion order; overwrites keep the
/// original position.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    state: RwLock<StoreSnapshot>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Copies the current contents.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] if the lock was poisoned.
    pub fn snapshot(&self) -> Result<StoreSnapshot, Report<KeyLifecycleError>> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreSnapshot>, Report<KeyLifecycleError>> {
        self.state.read().map_err(|_| {
            Report::new(KeyLifecycleError::StoreRead {
                message: "In-memory store lock poisoned".into(),
            })
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreSnapshot>, Report<KeyLifecycleError>> {
        self.state.write().map_err(|_| {
            Report::new(KeyLifecycleError::StoreWrite {
                message: "In-memory store lock poisoned".into(),
            })
        })
    }
}

impl KeyStore for MemoryKeyStore {
    fn ensure_partition(
        &self,
        partition: Partition,
        encrypted: bool,
    ) -> Result<(), Report<KeyLifecycleError>> {
        check_partition_encryption(partition, encrypted)?;

        let mut state = self.write()?;
        let slot = state.partition_mut(partition);
        if let Some(existing) = slot.as_ref() {
            return check_partition_encryption(partition, existing.encrypted);
        }

        log::debug!("Creating {} partition (encrypted: {})", partition, encrypted);
        *slot = Some(PartitionSnapshot {
            encrypted,
            entries: Vec::new(),
        });
        Ok(())
    }

    fn put_raw(
        &self,
        partition: Partition,
        name: &str,
        value: &str,
    ) -> Result<(), Report<KeyLifecycleError>> {
        let mut state = self.write()?;
        let Some(snapshot) = state.partition_mut(partition).as_mut() else {
            return Err(Report::new(KeyLifecycleError::StoreWrite {
                message: format!("Partition '{}' does not exist", partition),
            }));
        };

        match snapshot.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.value = value.to_string(),
            None => snapshot.entries.push(StoreEntry::new(name, value)),
        }
        Ok(())
    }

    fn get_raw(
        &self,
        partition: Partition,
        name: Option<&str>,
    ) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        let state = self.read()?;
        let Some(snapshot) = state.partition(partition) else {
            return Err(Report::new(KeyLifecycleError::StoreRead {
                message: format!("Partition '{}' does not exist", partition),
            }));
        };

        Ok(snapshot
            .entries
            .iter()
            .filter(|entry| name.is_none_or(|name| entry.name == name))
            .cloned()
            .collect())
    }

    fn remove_raw(
        &self,
        partition: Partition,
        name: &str,
    ) -> Result<RemoveOutcome, Report<KeyLifecycleError>> {
        let mut state = self.write()?;
        let Some(snapshot) = state.partition_mut(partition).as_mut() else {
            return Err(Report::new(KeyLifecycleError::StoreWrite {
                message: format!("Partition '{}' does not exist", partition),
            }));
        };

        let before = snapshot.entries.len();
        snapshot.entries.retain(|entry| entry.name != name);
        if snapshot.entries.len() < before {
            Ok(RemoveOutcome::Removed)
        } else {
            Ok(RemoveOutcome::Absent)
        }
    }
}

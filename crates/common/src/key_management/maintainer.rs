//! Inspection, pruning and reconciliation of stored public keys.
//!
//! The stored `public__<kid>` entries are authoritative; the `jwks` document is
//! derived from them and can always be rebuilt.

use std::collections::BTreeSet;

use error_stack::{Report, ResultExt};
use jose_jwk::{Jwk, JwkSet};

use crate::error::KeyLifecycleError;
use crate::key_store::{KeyStore, RemoveOutcome, StoreEntry};
use crate::naming::{EntryName, KeyFamily, Kid, Partition};

use super::jwks::{self, kid_of};

/// Differences between stored keys, pointers and the published JWKS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    /// Stored public keys missing from the JWKS.
    pub unpublished: Vec<Kid>,
    /// Private keys without a public key, left by a rotation that stopped
    /// after writing the private key.
    pub orphaned_private: Vec<Kid>,
    /// JWKS entries with no stored public key.
    pub stale_published: Vec<Kid>,
    /// Pointers naming a kid with no stored public key.
    pub dangling_pointers: Vec<(KeyFamily, Kid)>,
    /// The published document did not parse.
    pub jwks_corrupt: bool,
}

impl DriftReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unpublished.is_empty()
            && self.orphaned_private.is_empty()
            && self.stale_published.is_empty()
            && self.dangling_pointers.is_empty()
            && !self.jwks_corrupt
    }

    /// Whether [`PublicKeyMaintainer::update`] would change the published set.
    #[must_use]
    pub fn needs_republish(&self) -> bool {
        !self.unpublished.is_empty() || !self.stale_published.is_empty() || self.jwks_corrupt
    }
}

pub struct PublicKeyMaintainer<S> {
    store: S,
}

impl<S: KeyStore> PublicKeyMaintainer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Converts every stored public key to a JWK, in store order.
    /// Entries that are not PEM public keys are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] if the partition cannot be read.
    pub fn list(&self) -> Result<Vec<Jwk>, Report<KeyLifecycleError>> {
        Ok(jwks::rebuild(&self.non_secret_entries()?).keys)
    }

    /// Removes the `public__<kid>` entries of `kids`, best effort.
    ///
    /// Kids that are currently pointed to are kept. Absent entries and failed
    /// deletes are logged and left out of the result. Private keys are never
    /// removed. The published JWKS is not touched; call [`Self::update`]
    /// afterwards to drop the removed keys from it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the current pointers cannot be read.
    pub fn remove(&self, kids: &[Kid]) -> Result<Vec<Kid>, Report<KeyLifecycleError>> {
        let current: Vec<Kid> = self
            .current_pointers()
            .attach("while checking which kids are current")?
            .into_iter()
            .map(|(_, kid)| kid)
            .collect();

        let mut removed = Vec::new();
        for kid in kids {
            if current.contains(kid) {
                log::warn!("Not removing '{}': it is the current kid of its family", kid);
                continue;
            }

            match self.store.remove_entry(&EntryName::PublicKey(kid.clone())) {
                Ok(RemoveOutcome::Removed) => {
                    log::info!("Removed public key '{}'", kid);
                    removed.push(kid.clone());
                }
                Ok(RemoveOutcome::Absent) => {
                    log::info!("No public key stored for '{}', nothing to remove", kid);
                }
                Err(report) => {
                    log::warn!("Failed to remove public key '{}': {:?}", kid, report);
                }
            }
        }
        Ok(removed)
    }

    /// Rebuilds the JWKS from the stored public keys and overwrites `jwks`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn update(&self) -> Result<JwkSet, Report<KeyLifecycleError>> {
        let rebuilt = jwks::rebuild(&self.non_secret_entries()?);
        let raw = jwks::to_json(&rebuilt)?;
        self.store
            .put(&EntryName::Jwks, &raw)
            .attach("while publishing the rebuilt JWKS")?;
        log::info!("Published JWKS with {} keys", rebuilt.keys.len());
        Ok(rebuilt)
    }

    /// Compares both partitions, the pointers and the published JWKS.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] if either partition cannot be read.
    pub fn reconcile(&self) -> Result<DriftReport, Report<KeyLifecycleError>> {
        let entries = self.non_secret_entries()?;
        let stored: BTreeSet<Kid> = jwks::rebuild(&entries)
            .keys
            .iter()
            .filter_map(kid_of)
            .filter_map(|kid| Kid::new(kid).ok())
            .collect();

        let mut report = DriftReport::default();

        let published: Vec<Kid> = match jwks::load_published_jwks(&self.store) {
            Ok(Some(parsed)) => parsed
                .jwks
                .kids()
                .into_iter()
                .filter_map(|kid| Kid::new(kid).ok())
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) if matches!(e.current_context(), KeyLifecycleError::JwksCorrupt { .. }) => {
                log::warn!("Published JWKS is corrupt: {:?}", e);
                report.jwks_corrupt = true;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        report.unpublished = stored
            .iter()
            .filter(|kid| !published.contains(kid))
            .cloned()
            .collect();
        report.stale_published = published
            .iter()
            .filter(|kid| !stored.contains(kid))
            .cloned()
            .collect();

        report.orphaned_private = self
            .store
            .get(Partition::Secrets, None)
            .attach("while listing private keys")?
            .iter()
            .filter_map(|entry| match entry.entry_name() {
                Some(EntryName::PrivateKey(kid)) if !stored.contains(&kid) => Some(kid),
                _ => None,
            })
            .collect();

        report.dangling_pointers = pointers_in(&entries)
            .into_iter()
            .filter(|(_, kid)| !stored.contains(kid))
            .collect();

        if report.is_clean() {
            log::info!("Stored keys and published JWKS are consistent");
        } else {
            log::warn!("Key store drift detected: {:?}", report);
        }
        Ok(report)
    }

    fn non_secret_entries(&self) -> Result<Vec<StoreEntry>, Report<KeyLifecycleError>> {
        self.store
            .get(Partition::NonSecrets, None)
            .attach("while listing stored public keys")
    }

    fn current_pointers(&self) -> Result<Vec<(KeyFamily, Kid)>, Report<KeyLifecycleError>> {
        Ok(pointers_in(&self.non_secret_entries()?))
    }
}

fn pointers_in(entries: &[StoreEntry]) -> Vec<(KeyFamily, Kid)> {
    entries
        .iter()
        .filter_map(|entry| match entry.entry_name() {
            Some(EntryName::CurrentKid(family)) => {
                Kid::new(entry.value.trim()).ok().map(|kid| (family, kid))
            }
            _ => None,
        })
        .collect()
}

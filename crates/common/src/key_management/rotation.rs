//! Key rotation management.
//!
//! A rotation adds one signing key without touching existing ones. It runs as
//! a fixed sequence of store writes:
//!
//! 1. generate the keypair and allocate its kid ([`RotationStage::Generated`])
//! 2. write `private__<kid>` to the secrets partition ([`RotationStage::PrivateWritten`])
//! 3. write `public__<kid>` ([`RotationStage::PublicWritten`])
//! 4. overwrite `currentKid__<family>` and append to `kidHistory__<family>`
//!    ([`RotationStage::PointerUpdated`]). The history is read first, so an
//!    unreadable history stops the rotation before the pointer moves.
//! 5. merge the new JWK into `jwks` ([`RotationStage::Published`])
//!
//! The sequence is not transactional. A failure carries a
//! [`RotationCheckpoint`] naming the last committed stage; the drift it leaves
//! behind is found by [`crate::key_management::maintainer::PublicKeyMaintainer::reconcile`].
//! Concurrent rotations of the same family against one store race on the
//! pointer and on the JWKS read-modify-write and must be serialized by the caller.

use std::fmt;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};

use crate::error::KeyLifecycleError;
use crate::key_store::KeyStore;
use crate::logging::escape_pem;
use crate::naming::{EntryName, KeyFamily, Kid};

use super::generator::{KeyGenerator, KeyPair};
use super::jwks::{self, JwksAnomaly};
use super::kid::allocate_kid;

/// Completed steps of a rotation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RotationStage {
    Generated,
    PrivateWritten,
    PublicWritten,
    PointerUpdated,
    Published,
}

impl fmt::Display for RotationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationStage::Generated => "generated",
            RotationStage::PrivateWritten => "private-written",
            RotationStage::PublicWritten => "public-written",
            RotationStage::PointerUpdated => "pointer-updated",
            RotationStage::Published => "published",
        };
        f.write_str(name)
    }
}

/// Attached to every rotation failure after the keypair was generated. A
/// generation failure has no kid yet and carries none.
///
/// Retrieve it with `report.downcast_ref::<RotationCheckpoint>()`. A retry
/// always allocates a fresh kid; the half-written one is left for
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationCheckpoint {
    pub family: KeyFamily,
    pub kid: Kid,
    pub completed: RotationStage,
}

impl fmt::Display for RotationCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rotation of {} key '{}' stopped after stage '{}'",
            self.family, self.kid, self.completed
        )
    }
}

/// One entry of `kidHistory__<family>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KidRecord {
    pub kid: Kid,
    pub rotated_at: DateTime<Utc>,
}

/// The active kid of a family. `rotated_at` is `None` for pointers written
/// before history was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentKid {
    pub kid: Kid,
    pub rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RotationResult {
    pub key_pair: KeyPair,
    pub jwk: Jwk,
    pub previous_kid: Option<Kid>,
    pub jwks_anomalies: Vec<JwksAnomaly>,
}

/// Result of rotating one family during [`KeyRotationManager::provision`].
pub type FamilyOutcome = (KeyFamily, Result<RotationResult, Report<KeyLifecycleError>>);

pub struct KeyRotationManager<S> {
    store: S,
    generator: KeyGenerator,
}

impl<S: KeyStore> KeyRotationManager<S> {
    pub fn new(store: S, generator: KeyGenerator) -> Self {
        Self { store, generator }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Bootstraps the given families: ensures both partitions, then rotates
    /// each family once.
    ///
    /// Families are rotated independently; one family's failure is returned
    /// in its slot and does not stop the others. Duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error only if the partitions cannot be ensured.
    pub fn provision(
        &self,
        families: &[KeyFamily],
    ) -> Result<Vec<FamilyOutcome>, Report<KeyLifecycleError>> {
        self.store
            .ensure_partitions()
            .attach("while preparing the key partitions")?;

        let mut seen = Vec::with_capacity(families.len());
        let mut outcomes = Vec::with_capacity(families.len());
        for &family in families {
            if seen.contains(&family) {
                continue;
            }
            seen.push(family);

            let outcome = self.rotate(family);
            if let Err(report) = &outcome {
                log::error!("Provisioning the {} key failed: {:?}", family, report);
            }
            outcomes.push((family, outcome));
        }
        Ok(outcomes)
    }

    /// Adds a new key of `family` and makes it current.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error with a [`RotationCheckpoint`]
    /// attached. Writes of earlier stages are not rolled back.
    pub fn rotate(&self, family: KeyFamily) -> Result<RotationResult, Report<KeyLifecycleError>> {
        let key_pair = self
            .generator
            .generate(family)
            .attach(format!("while rotating the {} key family", family))?
            .into_key_pair(allocate_kid(family));
        let kid = key_pair.kid.clone();
        let checkpoint = |completed| RotationCheckpoint {
            family,
            kid: kid.clone(),
            completed,
        };

        let jwk = jwks::to_jwk(&key_pair.public_key_pem, &kid)
            .attach(checkpoint(RotationStage::Generated))?;
        log::info!("Generated {} key '{}'", family, kid);
        log::debug!(
            "Public key for '{}': {}",
            kid,
            escape_pem(&key_pair.public_key_pem)
        );

        self.store
            .put(&EntryName::PrivateKey(kid.clone()), &key_pair.private_key_pem)
            .attach(checkpoint(RotationStage::Generated))?;
        log::info!("Stored private key '{}'", kid);

        self.store
            .put(&EntryName::PublicKey(kid.clone()), &key_pair.public_key_pem)
            .attach(checkpoint(RotationStage::PrivateWritten))?;
        log::info!("Stored public key '{}'", kid);

        let mut history = self
            .kid_history(family)
            .attach(checkpoint(RotationStage::PublicWritten))?;
        let previous_kid = self
            .update_pointer(family, &kid)
            .attach(checkpoint(RotationStage::PublicWritten))?;
        log::info!(
            "Current {} kid is now '{}' (was {})",
            family,
            kid,
            previous_kid
                .as_ref()
                .map_or_else(|| "unset".to_string(), Kid::to_string)
        );

        history.push(KidRecord {
            kid: kid.clone(),
            rotated_at: Utc::now(),
        });
        self.write_history(family, &history)
            .attach(checkpoint(RotationStage::PointerUpdated))?;

        let jwks_anomalies = self
            .publish(&jwk)
            .attach(checkpoint(RotationStage::PointerUpdated))?;
        log::info!("Published '{}' in the JWKS", kid);

        Ok(RotationResult {
            key_pair,
            jwk,
            previous_kid,
            jwks_anomalies,
        })
    }

    /// The kid a signer should use for `family`, if any key was issued.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] if the store cannot be read.
    pub fn current_kid(
        &self,
        family: KeyFamily,
    ) -> Result<Option<CurrentKid>, Report<KeyLifecycleError>> {
        let Some(kid) = self.read_pointer(family)? else {
            return Ok(None);
        };

        let history = match self.store.get_value(&EntryName::KidHistory(family))? {
            Some(raw) => parse_history(family, &raw).unwrap_or_else(|report| {
                log::warn!("Current {} kid has no rotation time: {:?}", family, report);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let rotated_at = history
            .into_iter()
            .rev()
            .find(|record| record.kid == kid)
            .map(|record| record.rotated_at);

        Ok(Some(CurrentKid { kid, rotated_at }))
    }

    /// Every kid that was made current for `family`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::StoreRead`] if the store cannot be read or
    /// the stored history does not parse.
    pub fn kid_history(
        &self,
        family: KeyFamily,
    ) -> Result<Vec<KidRecord>, Report<KeyLifecycleError>> {
        match self.store.get_value(&EntryName::KidHistory(family))? {
            Some(raw) => parse_history(family, &raw),
            None => Ok(Vec::new()),
        }
    }

    fn read_pointer(&self, family: KeyFamily) -> Result<Option<Kid>, Report<KeyLifecycleError>> {
        Ok(self
            .store
            .get_value(&EntryName::CurrentKid(family))?
            .and_then(|value| Kid::new(value.trim()).ok()))
    }

    fn update_pointer(
        &self,
        family: KeyFamily,
        kid: &Kid,
    ) -> Result<Option<Kid>, Report<KeyLifecycleError>> {
        let previous = self.read_pointer(family)?;
        self.store
            .put(&EntryName::CurrentKid(family), kid.as_str())?;
        Ok(previous)
    }

    fn write_history(
        &self,
        family: KeyFamily,
        history: &[KidRecord],
    ) -> Result<(), Report<KeyLifecycleError>> {
        let raw = serde_json::to_string(history).change_context(KeyLifecycleError::StoreWrite {
            message: format!("Failed to serialize {} kid history", family),
        })?;
        self.store.put(&EntryName::KidHistory(family), &raw)
    }

    fn publish(&self, jwk: &Jwk) -> Result<Vec<JwksAnomaly>, Report<KeyLifecycleError>> {
        let existing = self.store.get_value(&EntryName::Jwks)?;
        let merged = jwks::merge(existing.as_deref(), jwk)?;
        let raw = jwks::to_json(&merged.jwks)?;
        self.store.put(&EntryName::Jwks, &raw)?;
        Ok(merged.anomalies)
    }
}

fn parse_history(family: KeyFamily, raw: &str) -> Result<Vec<KidRecord>, Report<KeyLifecycleError>> {
    serde_json::from_str(raw).change_context(KeyLifecycleError::StoreRead {
        message: format!("{} is not a valid kid history", EntryName::KidHistory(family)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::generator::DEFAULT_RSA_BITS;
    use crate::key_store::MemoryKeyStore;
    use crate::naming::Partition;
    use crate::test_support::tests::{fast_generator, ready_store, FailingStore};

    fn manager() -> KeyRotationManager<MemoryKeyStore> {
        KeyRotationManager::new(ready_store(), fast_generator())
    }

    fn published_kids<S: KeyStore>(manager: &KeyRotationManager<S>) -> Vec<String> {
        jwks::load_published_jwks(manager.store())
            .expect("should read jwks")
            .expect("should have published jwks")
            .jwks
            .kids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_rotate_writes_every_entry() {
        let manager = manager();
        let result = manager.rotate(KeyFamily::Ec).expect("should rotate");
        let kid = result.key_pair.kid.clone();

        let store = manager.store();
        assert_eq!(
            store
                .get_value(&EntryName::PrivateKey(kid.clone()))
                .expect("should read private key"),
            Some(result.key_pair.private_key_pem.clone())
        );
        assert_eq!(
            store
                .get_value(&EntryName::PublicKey(kid.clone()))
                .expect("should read public key"),
            Some(result.key_pair.public_key_pem.clone())
        );
        assert_eq!(
            store
                .get_value(&EntryName::CurrentKid(KeyFamily::Ec))
                .expect("should read pointer")
                .as_deref(),
            Some(kid.as_str())
        );
        assert_eq!(published_kids(&manager), vec![kid.to_string()]);
        assert!(result.previous_kid.is_none());
        assert!(result.jwks_anomalies.is_empty());
    }

    #[test]
    fn test_private_key_never_in_non_secrets() {
        let manager = manager();
        manager.rotate(KeyFamily::Rsa).expect("should rotate");

        let entries = manager
            .store()
            .get(Partition::NonSecrets, None)
            .expect("should read non-secrets");
        assert!(entries
            .iter()
            .all(|entry| !entry.value.contains("PRIVATE KEY")));
    }

    #[test]
    fn test_second_rotation_reports_previous_and_history() {
        let manager = manager();
        let first = manager.rotate(KeyFamily::Ec).expect("should rotate");
        let second = manager.rotate(KeyFamily::Ec).expect("should rotate again");

        assert_eq!(second.previous_kid, Some(first.key_pair.kid.clone()));

        let history = manager
            .kid_history(KeyFamily::Ec)
            .expect("should read history");
        let kids: Vec<_> = history.iter().map(|record| record.kid.clone()).collect();
        assert_eq!(kids, vec![first.key_pair.kid, second.key_pair.kid.clone()]);

        let current = manager
            .current_kid(KeyFamily::Ec)
            .expect("should read pointer")
            .expect("should have a current kid");
        assert_eq!(current.kid, second.key_pair.kid);
        assert_eq!(current.rotated_at, Some(history[1].rotated_at));
    }

    #[test]
    fn test_current_kid_without_history() {
        let manager = manager();
        manager
            .store()
            .put(&EntryName::CurrentKid(KeyFamily::Rsa), "legacy")
            .expect("should write pointer");

        let current = manager
            .current_kid(KeyFamily::Rsa)
            .expect("should read pointer")
            .expect("should have a current kid");
        assert_eq!(current.kid.as_str(), "legacy");
        assert!(current.rotated_at.is_none());
        assert!(manager
            .current_kid(KeyFamily::Ec)
            .expect("should read pointer")
            .is_none());
    }

    #[test]
    fn test_rotation_recovers_from_corrupt_jwks() {
        let manager = manager();
        manager
            .store()
            .put(&EntryName::Jwks, "not json")
            .expect("should write jwks");

        let result = manager.rotate(KeyFamily::Ec).expect("should rotate");
        assert!(matches!(
            result.jwks_anomalies.as_slice(),
            [JwksAnomaly::Corrupt { .. }]
        ));
        assert_eq!(published_kids(&manager), vec![result.key_pair.kid.to_string()]);
    }

    #[test]
    fn test_failed_public_write_reports_checkpoint() {
        let store = FailingStore::new(ready_store()).failing_puts("public__");
        let manager = KeyRotationManager::new(store, fast_generator());

        let err = manager
            .rotate(KeyFamily::Ec)
            .expect_err("should fail writing the public key");
        assert!(matches!(
            err.current_context(),
            KeyLifecycleError::StoreWrite { .. }
        ));

        let checkpoint = err
            .downcast_ref::<RotationCheckpoint>()
            .expect("should carry a checkpoint");
        assert_eq!(checkpoint.family, KeyFamily::Ec);
        assert_eq!(checkpoint.completed, RotationStage::PrivateWritten);

        let store = &manager.store().inner;
        assert!(store
            .get_value(&EntryName::PrivateKey(checkpoint.kid.clone()))
            .expect("should read private key")
            .is_some());
        assert!(store
            .get_value(&EntryName::CurrentKid(KeyFamily::Ec))
            .expect("should read pointer")
            .is_none());
    }

    #[test]
    fn test_rotation_keeps_foreign_jwks_entries() {
        let manager = manager();
        manager
            .store()
            .put(
                &EntryName::Jwks,
                r#"{"keys":[{"kty":"OKP","crv":"X25519","kid":"agreement","use":"enc","x":"hSDwCYkwp1R0i33ctD73Wg2_Og0mOBr066SpjqqbTmo"}]}"#,
            )
            .expect("should write jwks");

        let result = manager.rotate(KeyFamily::Ec).expect("should rotate");
        assert!(result.jwks_anomalies.is_empty());
        assert_eq!(
            published_kids(&manager),
            vec!["agreement".to_string(), result.key_pair.kid.to_string()]
        );
    }

    #[test]
    fn test_corrupt_history_stops_rotation_before_pointer() {
        let manager = manager();
        let first = manager.rotate(KeyFamily::Ec).expect("should rotate");
        manager
            .store()
            .put(&EntryName::KidHistory(KeyFamily::Ec), "[{\"kid\":")
            .expect("should write history");

        let err = manager
            .rotate(KeyFamily::Ec)
            .expect_err("should refuse to overwrite the history");
        assert!(matches!(
            err.current_context(),
            KeyLifecycleError::StoreRead { .. }
        ));
        let checkpoint = err
            .downcast_ref::<RotationCheckpoint>()
            .expect("should carry a checkpoint");
        assert_eq!(checkpoint.completed, RotationStage::PublicWritten);

        let store = manager.store();
        assert_eq!(
            store
                .get_value(&EntryName::KidHistory(KeyFamily::Ec))
                .expect("should read history")
                .as_deref(),
            Some("[{\"kid\":")
        );
        assert_eq!(
            store
                .get_value(&EntryName::CurrentKid(KeyFamily::Ec))
                .expect("should read pointer")
                .as_deref(),
            Some(first.key_pair.kid.as_str())
        );
        assert!(manager.kid_history(KeyFamily::Ec).is_err());

        let current = manager
            .current_kid(KeyFamily::Ec)
            .expect("should read pointer despite the history")
            .expect("should have a current kid");
        assert_eq!(current.kid, first.key_pair.kid);
        assert!(current.rotated_at.is_none());
    }

    #[test]
    fn test_generation_failure_carries_no_checkpoint() {
        let manager = KeyRotationManager::new(
            ready_store(),
            KeyGenerator::new(DEFAULT_RSA_BITS, "secp256k1"),
        );

        let err = manager
            .rotate(KeyFamily::Ec)
            .expect_err("should reject the curve");
        assert!(matches!(
            err.current_context(),
            KeyLifecycleError::KeyGeneration { .. }
        ));
        assert!(err.downcast_ref::<RotationCheckpoint>().is_none());
        assert!(manager
            .store()
            .get(Partition::Secrets, None)
            .expect("should read secrets")
            .is_empty());
    }

    #[test]
    fn test_failed_publish_leaves_pointer_updated() {
        let store = FailingStore::new(ready_store()).failing_puts("jwks");
        let manager = KeyRotationManager::new(store, fast_generator());

        let err = manager
            .rotate(KeyFamily::Rsa)
            .expect_err("should fail publishing");
        let checkpoint = err
            .downcast_ref::<RotationCheckpoint>()
            .expect("should carry a checkpoint");
        assert_eq!(checkpoint.completed, RotationStage::PointerUpdated);
    }

    #[test]
    fn test_provision_isolates_family_failures() {
        let store = FailingStore::new(ready_store()).failing_puts("private__rsa__");
        let manager = KeyRotationManager::new(store, fast_generator());

        let outcomes = manager
            .provision(&[KeyFamily::Rsa, KeyFamily::Ec, KeyFamily::Rsa])
            .expect("should ensure partitions");

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0, KeyFamily::Rsa);
        assert!(outcomes[0].1.is_err());
        assert_eq!(outcomes[1].0, KeyFamily::Ec);
        let ec = outcomes[1].1.as_ref().expect("should provision EC");
        assert_eq!(published_kids(&manager), vec![ec.key_pair.kid.to_string()]);
    }

    #[test]
    fn test_provision_creates_partitions() {
        let manager = KeyRotationManager::new(MemoryKeyStore::new(), fast_generator());
        let outcomes = manager
            .provision(&[KeyFamily::Ec])
            .expect("should provision");
        assert!(outcomes[0].1.is_ok());

        let snapshot = manager.store().snapshot().expect("should snapshot");
        assert!(snapshot.secrets.expect("should create secrets").encrypted);
    }
}

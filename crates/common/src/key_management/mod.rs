//! Signing key lifecycle.
//!
//! Keys are generated, given a kid, written to both store partitions, made
//! current for their family and published in the JWKS. The maintainer prunes
//! and reconciles what is stored, and the validator checks tokens against a
//! served JWKS.

pub mod generator;
pub mod jwks;
pub mod kid;
pub mod maintainer;
pub mod rotation;
pub mod signing;
pub mod validation;

pub use generator::{EcCurve, KeyGenerator, KeyMaterial, KeyPair};
pub use jwks::{JwksAnomaly, MergedJwks, PublishedJwks};
pub use kid::allocate_kid;
pub use maintainer::{DriftReport, PublicKeyMaintainer};
pub use rotation::{
    CurrentKid, KeyRotationManager, KidRecord, RotationCheckpoint, RotationResult, RotationStage,
};
pub use signing::TokenSigner;
pub use validation::{HttpJwksFetcher, JwksFetcher, TokenValidator, ValidatedToken};

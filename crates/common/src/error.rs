//! Error taxonomy for the key lifecycle.
//!
//! Every fallible operation in this crate returns
//! `error_stack::Report<KeyLifecycleError>`. The variant says which class of
//! failure happened; attachments on the report say where.

use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum KeyLifecycleError {
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// The cryptographic primitive rejected the requested parameters.
    #[display("Key generation failed: {message}")]
    KeyGeneration { message: String },

    /// The store was unreachable or the partition does not exist.
    #[display("Store read failed: {message}")]
    StoreRead { message: String },

    #[display("Store write failed: {message}")]
    StoreWrite { message: String },

    /// A value that should be a PEM public key is not one.
    #[display("Key format error: {message}")]
    KeyFormat { message: String },

    #[display("Stored JWKS is corrupt: {message}")]
    JwksCorrupt { message: String },

    #[display("Token format error: {message}")]
    TokenFormat { message: String },

    #[display("JWKS fetch failed: {message}")]
    Fetch { message: String },

    #[display("No key with kid '{kid}' in the JWKS")]
    KeyNotFound { kid: String },

    #[display("Signature is invalid: {message}")]
    SignatureInvalid { message: String },
}

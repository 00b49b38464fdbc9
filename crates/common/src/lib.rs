//! Signing key lifecycle and JWKS publishing.
//!
//! This crate generates asymmetric signing keys, persists them into a secrets
//! and a non-secrets store partition, tracks the current key per algorithm
//! family, publishes the public keys as a JSON Web Key Set, and verifies
//! tokens against a served key set.
//!
//! # Modules
//!
//! - [`error`]: Error types and error handling utilities
//! - [`key_management`]: Key generation, rotation, JWKS building, maintenance and token validation
//! - [`key_store`]: Store abstraction over the two partitions, plus an in-memory backend
//! - [`logging`]: Logger setup
//! - [`naming`]: Typed names of every persisted entry
//! - [`settings`]: Configuration management and validation
//! - [`test_support`]: Testing utilities and mocks

pub mod error;
pub mod key_management;
pub mod key_store;
pub mod logging;
pub mod naming;
pub mod settings;

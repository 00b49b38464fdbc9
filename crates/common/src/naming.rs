//! Typed names for every entry the key lifecycle persists.
//!
//! Stores only see strings. This module is the single place where the
//! persisted layout is encoded and decoded:
//!
//! - `private__<kid>` - PKCS8 private key (secrets partition)
//! - `public__<kid>` - SPKI public key (non-secret partition)
//! - `currentKid__<family>` - kid a signer should prefer (non-secret partition)
//! - `kidHistory__<family>` - JSON array of past pointer values (non-secret partition)
//! - `jwks` - the published key set, `{"keys":[...]}` (non-secret partition)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeyLifecycleError;

const PRIVATE_PREFIX: &str = "private__";
const PUBLIC_PREFIX: &str = "public__";
const CURRENT_KID_PREFIX: &str = "currentKid__";
const KID_HISTORY_PREFIX: &str = "kidHistory__";
const JWKS_NAME: &str = "jwks";

/// Separator between the family and the random token of a kid.
pub const KID_SEPARATOR: &str = "__";

/// Asymmetric algorithm family of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    pub const ALL: [KeyFamily; 2] = [KeyFamily::Rsa, KeyFamily::Ec];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFamily::Rsa => "rsa",
            KeyFamily::Ec => "ec",
        }
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyFamily {
    type Err = KeyLifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyFamily::Rsa),
            "ec" => Ok(KeyFamily::Ec),
            other => Err(KeyLifecycleError::Configuration {
                message: format!("Unknown key family '{}' (expected rsa or ec)", other),
            }),
        }
    }
}

/// Key identifier, the join key between both partitions and the JWKS.
///
/// Kids minted by this crate look like `<family>__<token>`, but kids read back
/// from a store are treated as opaque: older deployments used bare tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kid(String);

impl Kid {
    /// Wraps an existing identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyLifecycleError::Configuration`] if the identifier is empty.
    pub fn new(value: impl Into<String>) -> Result<Self, KeyLifecycleError> {
        let value = value.into();
        if value.is_empty() {
            return Err(KeyLifecycleError::Configuration {
                message: "A kid cannot be empty".into(),
            });
        }
        Ok(Self(value))
    }

    pub(crate) fn from_parts(family: KeyFamily, token: &str) -> Self {
        Self(format!("{}{}{}", family, KID_SEPARATOR, token))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The family encoded in the kid, if it follows the `<family>__` convention.
    #[must_use]
    pub fn family(&self) -> Option<KeyFamily> {
        let (prefix, _) = self.0.split_once(KID_SEPARATOR)?;
        prefix.parse().ok()
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Kid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One of the two logical stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Encrypted; holds private keys only.
    Secrets,
    /// Plaintext; holds public keys, pointers and the JWKS document.
    NonSecrets,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Secrets => f.write_str("secrets"),
            Partition::NonSecrets => f.write_str("non-secrets"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryName {
    PrivateKey(Kid),
    PublicKey(Kid),
    CurrentKid(KeyFamily),
    KidHistory(KeyFamily),
    Jwks,
}

impl EntryName {
    /// The partition this entry must live in.
    #[must_use]
    pub fn partition(&self) -> Partition {
        match self {
            EntryName::PrivateKey(_) => Partition::Secrets,
            EntryName::PublicKey(_)
            | EntryName::CurrentKid(_)
            | EntryName::KidHistory(_)
            | EntryName::Jwks => Partition::NonSecrets,
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            EntryName::PrivateKey(kid) => format!("{}{}", PRIVATE_PREFIX, kid),
            EntryName::PublicKey(kid) => format!("{}{}", PUBLIC_PREFIX, kid),
            EntryName::CurrentKid(family) => format!("{}{}", CURRENT_KID_PREFIX, family),
            EntryName::KidHistory(family) => format!("{}{}", KID_HISTORY_PREFIX, family),
            EntryName::Jwks => JWKS_NAME.to_string(),
        }
    }

    /// Parses a raw store entry name. Names outside the layout yield `None`.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        if raw == JWKS_NAME {
            return Some(EntryName::Jwks);
        }
        if let Some(kid) = raw.strip_prefix(PRIVATE_PREFIX) {
            return Kid::new(kid).ok().map(EntryName::PrivateKey);
        }
        if let Some(kid) = raw.strip_prefix(PUBLIC_PREFIX) {
            return Kid::new(kid).ok().map(EntryName::PublicKey);
        }
        if let Some(family) = raw.strip_prefix(CURRENT_KID_PREFIX) {
            return family.parse().ok().map(EntryName::CurrentKid);
        }
        if let Some(family) = raw.strip_prefix(KID_HISTORY_PREFIX) {
            return family.parse().ok().map(EntryName::KidHistory);
        }
        None
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

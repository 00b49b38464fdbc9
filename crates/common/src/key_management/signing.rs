//! Compact JWS issuance with a stored private key.

use error_stack::{Report, ResultExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs8::DecodePrivateKey;
use serde::Serialize;

use crate::error::KeyLifecycleError;
use crate::naming::Kid;

use super::generator::KeyPair;

pub struct TokenSigner {
    kid: Kid,
    algorithm: Algorithm,
    key: EncodingKey,
}

impl TokenSigner {
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::KeyFormat`] if the private key does not load.
    pub fn from_key_pair(key_pair: &KeyPair) -> Result<Self, Report<KeyLifecycleError>> {
        Self::from_private_key_pem(key_pair.kid.clone(), &key_pair.private_key_pem)
    }

    /// Loads a PKCS8 PEM private key; the algorithm follows the key type
    /// (RS256 for RSA, ES256 for P-256, ES384 for P-384).
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::KeyFormat`] if the PEM is not a supported
    /// PKCS8 private key.
    pub fn from_private_key_pem(kid: Kid, pem: &str) -> Result<Self, Report<KeyLifecycleError>> {
        let (algorithm, key) = if rsa::RsaPrivateKey::from_pkcs8_pem(pem).is_ok() {
            (Algorithm::RS256, EncodingKey::from_rsa_pem(pem.as_bytes()))
        } else if p256::SecretKey::from_pkcs8_pem(pem).is_ok() {
            (Algorithm::ES256, EncodingKey::from_ec_pem(pem.as_bytes()))
        } else if p384::SecretKey::from_pkcs8_pem(pem).is_ok() {
            (Algorithm::ES384, EncodingKey::from_ec_pem(pem.as_bytes()))
        } else {
            return Err(Report::new(KeyLifecycleError::KeyFormat {
                message: format!("Private key for '{}' is not a supported PKCS8 PEM", kid),
            }));
        };

        let key = key.change_context(KeyLifecycleError::KeyFormat {
            message: format!("Failed to load {:?} signing key for '{}'", algorithm, kid),
        })?;

        Ok(Self {
            kid,
            algorithm,
            key,
        })
    }

    #[must_use]
    pub fn kid(&self) -> &Kid {
        &self.kid
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Signs `claims` into a compact token with `kid` and `alg` in the header.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::KeyFormat`] if the claims cannot be
    /// serialized or signing fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, Report<KeyLifecycleError>> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.to_string());

        jsonwebtoken::encode(&header, claims, &self.key).change_context(
            KeyLifecycleError::KeyFormat {
                message: format!("Failed to sign token with '{}'", self.kid),
            },
        )
    }
}

//! Signing keypair generation.
//!
//! Public keys are emitted as SPKI PEM, private keys as PKCS8 PEM, both with
//! `\n` line endings.

use std::fmt;
use std::str::FromStr;

use error_stack::{Report, ResultExt};
use jsonwebtoken::Algorithm;
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;

use crate::error::KeyLifecycleError;
use crate::naming::{KeyFamily, Kid};
use crate::settings::KeySettings;

pub const DEFAULT_RSA_BITS: usize = 2048;
pub const DEFAULT_EC_CURVE: &str = "P-256";

/// Smallest modulus the generator accepts. `jsonwebtoken` refuses to sign or
/// verify with anything shorter.
pub const MIN_RSA_BITS: usize = 2048;
/// Largest modulus verifiers built on the `rsa` crate will load.
pub const MAX_RSA_BITS: usize = 4096;

/// Named curves supported for the EC family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
}

impl EcCurve {
    /// The JOSE curve name (`crv`).
    #[must_use]
    pub fn jose_name(&self) -> &'static str {
        match self {
            EcCurve::P256 => "P-256",
            EcCurve::P384 => "P-384",
        }
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        match self {
            EcCurve::P256 => Algorithm::ES256,
            EcCurve::P384 => Algorithm::ES384,
        }
    }
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jose_name())
    }
}

impl FromStr for EcCurve {
    type Err = KeyLifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "p-256" | "p256" | "prime256v1" | "secp256r1" => Ok(EcCurve::P256),
            "p-384" | "p384" | "secp384r1" => Ok(EcCurve::P384),
            _ => Err(KeyLifecycleError::KeyGeneration {
                message: format!("Unsupported EC curve '{}'", s),
            }),
        }
    }
}

/// Freshly generated key material that has not been assigned a kid yet.
#[derive(Clone)]
pub struct KeyMaterial {
    pub family: KeyFamily,
    pub algorithm: Algorithm,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

impl KeyMaterial {
    #[must_use]
    pub fn into_key_pair(self, kid: Kid) -> KeyPair {
        KeyPair {
            kid,
            family: self.family,
            algorithm: self.algorithm,
            public_key_pem: self.public_key_pem,
            private_key_pem: self.private_key_pem,
        }
    }
}

/// An issued signing key. Immutable once the kid is assigned.
#[derive(Clone)]
pub struct KeyPair {
    pub kid: Kid,
    pub family: KeyFamily,
    pub algorithm: Algorithm,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .field("public_key_pem", &self.public_key_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    rsa_bits: usize,
    ec_curve: String,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_RSA_BITS, DEFAULT_EC_CURVE)
    }
}

impl KeyGenerator {
    /// The curve name is only checked when an EC key is generated.
    pub fn new(rsa_bits: usize, ec_curve: impl Into<String>) -> Self {
        Self {
            rsa_bits,
            ec_curve: ec_curve.into(),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &KeySettings) -> Self {
        Self::new(settings.rsa_bits, settings.ec_curve.clone())
    }

    /// Generates a keypair for `family`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::KeyGeneration`] if the modulus size or
    /// curve is unsupported, or if encoding the keys fails.
    pub fn generate(&self, family: KeyFamily) -> Result<KeyMaterial, Report<KeyLifecycleError>> {
        match family {
            KeyFamily::Rsa => self.generate_rsa(),
            KeyFamily::Ec => self.generate_ec(),
        }
    }

    fn generate_rsa(&self) -> Result<KeyMaterial, Report<KeyLifecycleError>> {
        if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&self.rsa_bits) {
            return Err(Report::new(KeyLifecycleError::KeyGeneration {
                message: format!(
                    "RSA modulus of {} bits is outside {}..={}",
                    self.rsa_bits, MIN_RSA_BITS, MAX_RSA_BITS
                ),
            }));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, self.rsa_bits).map_err(|e| {
            Report::new(KeyLifecycleError::KeyGeneration {
                message: format!("Failed to generate RSA-{} key: {}", self.rsa_bits, e),
            })
        })?;

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| encoding_error("RSA private key", e))?
            .to_string();
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| encoding_error("RSA public key", e))?;

        Ok(KeyMaterial {
            family: KeyFamily::Rsa,
            algorithm: Algorithm::RS256,
            public_key_pem,
            private_key_pem,
        })
    }

    fn generate_ec(&self) -> Result<KeyMaterial, Report<KeyLifecycleError>> {
        let curve: EcCurve = self
            .ec_curve
            .parse()
            .map_err(Report::new)
            .attach(format!("while generating an EC key on '{}'", self.ec_curve))?;

        let (public_key_pem, private_key_pem) = match curve {
            EcCurve::P256 => {
                let secret = p256::SecretKey::random(&mut OsRng);
                encode_ec_pair(
                    secret.public_key().to_public_key_pem(LineEnding::LF),
                    secret
                        .to_pkcs8_pem(LineEnding::LF)
                        .map(|pem| pem.to_string()),
                )?
            }
            EcCurve::P384 => {
                let secret = p384::SecretKey::random(&mut OsRng);
                encode_ec_pair(
                    secret.public_key().to_public_key_pem(LineEnding::LF),
                    secret
                        .to_pkcs8_pem(LineEnding::LF)
                        .map(|pem| pem.to_string()),
                )?
            }
        };

        Ok(KeyMaterial {
            family: KeyFamily::Ec,
            algorithm: curve.algorithm(),
            public_key_pem,
            private_key_pem,
        })
    }
}

fn encode_ec_pair(
    public: Result<String, rsa::pkcs8::spki::Error>,
    private: Result<String, rsa::pkcs8::Error>,
) -> Result<(String, String), Report<KeyLifecycleError>> {
    let public = public.map_err(|e| encoding_error("EC public key", e))?;
    let private = private.map_err(|e| encoding_error("EC private key", e))?;
    Ok((public, private))
}

fn encoding_error(what: &str, err: impl fmt::Display) -> Report<KeyLifecycleError> {
    Report::new(KeyLifecycleError::KeyGeneration {
        message: format!("Failed to PEM-encode {}: {}", what, err),
    })
}

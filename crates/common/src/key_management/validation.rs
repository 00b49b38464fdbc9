//! Verification of compact signed tokens against a JWKS served over HTTP.
//!
//! Every call fetches the key set once. Caching across calls is left to the
//! caller. Only the signature is checked; registered claims such as `exp`
//! are returned untouched.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use error_stack::{Report, ResultExt};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::KeyLifecycleError;

static COMPACT_TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^.]+)\.([^.]+)\.([^.]+)$").expect("valid compact token regex")
});

/// Retrieves the raw JWKS document from an endpoint.
pub trait JwksFetcher {
    /// # Errors
    ///
    /// Returns [`KeyLifecycleError::Fetch`] on transport failure or a non-2xx
    /// status.
    fn fetch(&self, endpoint: &str) -> Result<String, Report<KeyLifecycleError>>;
}

/// Blocking HTTP `GET` with `Accept: application/json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpJwksFetcher;

impl JwksFetcher for HttpJwksFetcher {
    fn fetch(&self, endpoint: &str) -> Result<String, Report<KeyLifecycleError>> {
        log::debug!("Fetching JWKS from {}", endpoint);

        let response = ureq::get(endpoint)
            .header("Accept", "application/json")
            .call()
            .map_err(|e| {
                let message = match e {
                    ureq::Error::StatusCode(code) => {
                        format!("JWKS endpoint {} returned status {}", endpoint, code)
                    }
                    other => format!("Failed to fetch JWKS from {}: {}", endpoint, other),
                };
                Report::new(KeyLifecycleError::Fetch { message })
            })?;

        response
            .into_body()
            .read_to_string()
            .change_context(KeyLifecycleError::Fetch {
                message: format!("Failed to read JWKS response from {}", endpoint),
            })
    }
}

/// A token whose signature verified.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedToken {
    pub kid: String,
    pub algorithm: Algorithm,
    pub header: Value,
    pub payload: Value,
}

pub struct TokenValidator<F = HttpJwksFetcher> {
    fetcher: F,
}

impl TokenValidator<HttpJwksFetcher> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fetcher: HttpJwksFetcher,
        }
    }
}

impl Default for TokenValidator<HttpJwksFetcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: JwksFetcher> TokenValidator<F> {
    pub fn with_fetcher(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Verifies `token` with the key its header names in the JWKS at `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`KeyLifecycleError::TokenFormat`] if the token is not three segments,
    ///   or its header is not JSON with `kid` and `alg`
    /// - [`KeyLifecycleError::Fetch`] if the JWKS cannot be retrieved or parsed
    /// - [`KeyLifecycleError::KeyNotFound`] if no JWK has the header's kid
    /// - [`KeyLifecycleError::SignatureInvalid`] if verification fails
    pub fn validate(
        &self,
        token: &str,
        endpoint: &str,
    ) -> Result<ValidatedToken, Report<KeyLifecycleError>> {
        let token = token.trim();
        let Some(captures) = COMPACT_TOKEN_PATTERN.captures(token) else {
            return Err(Report::new(KeyLifecycleError::TokenFormat {
                message: "Token is not in header.payload.signature form".into(),
            }));
        };

        let keys = parse_key_list(&self.fetcher.fetch(endpoint)?)
            .attach(format!("JWKS endpoint: {}", endpoint))?;

        let header = decode_header(&captures[1])?;
        let (kid, algorithm) = header_kid_and_alg(&header)?;
        log::debug!("Token signed by '{}' with {:?}", kid, algorithm);

        let jwk_value = keys
            .into_iter()
            .find(|jwk| jwk.get("kid").and_then(Value::as_str) == Some(kid.as_str()))
            .ok_or_else(|| Report::new(KeyLifecycleError::KeyNotFound { kid: kid.clone() }))?;

        let jwk: Jwk =
            serde_json::from_value(jwk_value).change_context(KeyLifecycleError::KeyFormat {
                message: format!("JWK '{}' is not a usable verification key", kid),
            })?;
        let key = DecodingKey::from_jwk(&jwk).change_context(KeyLifecycleError::KeyFormat {
            message: format!("JWK '{}' is not a usable verification key", kid),
        })?;

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Value>(token, &key, &validation).map_err(|e| {
            let context = match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    KeyLifecycleError::SignatureInvalid {
                        message: format!("Signature does not verify with key '{}'", kid),
                    }
                }
                _ => KeyLifecycleError::TokenFormat {
                    message: format!("Token could not be verified: {}", e),
                },
            };
            Report::new(e).change_context(context)
        })?;

        log::info!("Token signed by '{}' verified", kid);
        Ok(ValidatedToken {
            kid,
            algorithm,
            header,
            payload: data.claims,
        })
    }
}

fn parse_key_list(raw: &str) -> Result<Vec<Value>, Report<KeyLifecycleError>> {
    let document: Value = serde_json::from_str(raw).change_context(KeyLifecycleError::Fetch {
        message: "JWKS response is not valid JSON".into(),
    })?;

    match document {
        Value::Object(mut object) => match object.remove("keys") {
            Some(Value::Array(keys)) => Ok(keys),
            _ => Err(Report::new(KeyLifecycleError::Fetch {
                message: "JWKS response has no 'keys' array".into(),
            })),
        },
        _ => Err(Report::new(KeyLifecycleError::Fetch {
            message: "JWKS response is not a JSON object".into(),
        })),
    }
}

fn decode_header(segment: &str) -> Result<Value, Report<KeyLifecycleError>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .change_context(KeyLifecycleError::TokenFormat {
            message: "Token header is not base64url".into(),
        })?;

    let header: Value =
        serde_json::from_slice(&bytes).change_context(KeyLifecycleError::TokenFormat {
            message: "Token header is not JSON".into(),
        })?;

    if !header.is_object() {
        return Err(Report::new(KeyLifecycleError::TokenFormat {
            message: "Token header is not a JSON object".into(),
        }));
    }
    Ok(header)
}

fn header_kid_and_alg(header: &Value) -> Result<(String, Algorithm), Report<KeyLifecycleError>> {
    let kid = header
        .get("kid")
        .and_then(Value::as_str)
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| {
            Report::new(KeyLifecycleError::TokenFormat {
                message: "Token header has no 'kid'".into(),
            })
        })?;

    let alg = header.get("alg").and_then(Value::as_str).ok_or_else(|| {
        Report::new(KeyLifecycleError::TokenFormat {
            message: "Token header has no 'alg'".into(),
        })
    })?;
    let algorithm = alg
        .parse::<Algorithm>()
        .change_context(KeyLifecycleError::TokenFormat {
            message: format!("Unsupported token algorithm '{}'", alg),
        })?;

    Ok((kid.to_string(), algorithm))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::key_management::generator::KeyPair;
    use crate::key_management::jwks::{merge, to_json, to_jwk};
    use crate::key_management::kid::allocate_kid;
    use crate::key_management::signing::TokenSigner;
    use crate::naming::KeyFamily;
    use crate::test_support::tests::fast_generator;

    struct StaticFetcher(Result<String, ()>);

    impl JwksFetcher for StaticFetcher {
        fn fetch(&self, endpoint: &str) -> Result<String, Report<KeyLifecycleError>> {
            self.0.clone().map_err(|()| {
                Report::new(KeyLifecycleError::Fetch {
                    message: format!("{} unreachable", endpoint),
                })
            })
        }
    }

    fn key_pair(family: KeyFamily) -> KeyPair {
        fast_generator()
            .generate(family)
            .expect("should generate key")
            .into_key_pair(allocate_kid(family))
    }

    fn jwks_for(key_pair: &KeyPair) -> String {
        let jwk = to_jwk(&key_pair.public_key_pem, &key_pair.kid).expect("should build JWK");
        let merged = merge(None, &jwk).expect("should merge JWK");
        to_json(&merged.jwks).expect("should serialize JWKS")
    }

    fn validator_for(jwks: String) -> TokenValidator<StaticFetcher> {
        TokenValidator::with_fetcher(StaticFetcher(Ok(jwks)))
    }

    fn sign(key_pair: &KeyPair, claims: &Value) -> String {
        TokenSigner::from_key_pair(key_pair)
            .expect("should load signer")
            .sign(claims)
            .expect("should sign")
    }

    fn context(err: &Report<KeyLifecycleError>) -> &KeyLifecycleError {
        err.current_context()
    }

    #[test]
    fn test_validate_round_trip_rsa_and_ec() {
        for family in KeyFamily::ALL {
            let key_pair = key_pair(family);
            let token = sign(&key_pair, &json!({"sub": "test"}));

            let validated = validator_for(jwks_for(&key_pair))
                .validate(&token, "https://issuer.example/jwks")
                .expect("should validate token");
            assert_eq!(validated.kid, key_pair.kid.as_str());
            assert_eq!(validated.algorithm, key_pair.algorithm);
            assert_eq!(validated.payload, json!({"sub": "test"}));
            assert_eq!(validated.header["kid"], key_pair.kid.as_str());
        }
    }

    #[test]
    fn test_validate_ignores_expiry() {
        let key_pair = key_pair(KeyFamily::Ec);
        let token = sign(&key_pair, &json!({"sub": "test", "exp": 1}));

        validator_for(jwks_for(&key_pair))
            .validate(&token, "https://issuer.example/jwks")
            .expect("should not enforce exp");
    }

    #[test]
    fn test_validate_rejects_malformed_token() {
        let validator = validator_for(r#"{"keys":[]}"#.to_string());
        for token in ["", "a.b", "a.b.c.d", "a..c"] {
            let err = validator
                .validate(token, "https://issuer.example/jwks")
                .expect_err("should reject token");
            assert!(
                matches!(context(&err), KeyLifecycleError::TokenFormat { .. }),
                "token {:?}",
                token
            );
        }
    }

    #[test]
    fn test_validate_unknown_kid() {
        let signer_pair = key_pair(KeyFamily::Ec);
        let other_pair = key_pair(KeyFamily::Ec);
        let token = sign(&signer_pair, &json!({"sub": "test"}));

        let err = validator_for(jwks_for(&other_pair))
            .validate(&token, "https://issuer.example/jwks")
            .expect_err("should not find key");
        assert!(matches!(
            context(&err),
            KeyLifecycleError::KeyNotFound { kid } if kid == signer_pair.kid.as_str()
        ));
    }

    #[test]
    fn test_validate_detects_tampered_payload() {
        let key_pair = key_pair(KeyFamily::Rsa);
        let token = sign(&key_pair, &json!({"sub": "test"}));
        let segments: Vec<&str> = token.split('.').collect();
        let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"tesu"}"#);
        let forged = format!("{}.{}.{}", segments[0], forged_payload, segments[2]);

        let err = validator_for(jwks_for(&key_pair))
            .validate(&forged, "https://issuer.example/jwks")
            .expect_err("should reject forged payload");
        assert!(matches!(
            context(&err),
            KeyLifecycleError::SignatureInvalid { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_every_payload_bit_flip() {
        for family in KeyFamily::ALL {
            let key_pair = key_pair(family);
            let token = sign(&key_pair, &json!({"sub": "test", "n": 1}));
            let validator = validator_for(jwks_for(&key_pair));

            let segments: Vec<&str> = token.split('.').collect();
            let payload = URL_SAFE_NO_PAD
                .decode(segments[1])
                .expect("should decode payload");

            for bit in 0..payload.len() * 8 {
                let mut flipped = payload.clone();
                flipped[bit / 8] ^= 1 << (bit % 8);
                let forged = format!(
                    "{}.{}.{}",
                    segments[0],
                    URL_SAFE_NO_PAD.encode(&flipped),
                    segments[2]
                );

                let err = validator
                    .validate(&forged, "https://issuer.example/jwks")
                    .expect_err("should reject flipped payload");
                assert!(
                    matches!(context(&err), KeyLifecycleError::SignatureInvalid { .. }),
                    "{} payload bit {} gave {:?}",
                    family,
                    bit,
                    context(&err)
                );
            }
        }
    }

    #[test]
    fn test_validate_fetch_failures() {
        let key_pair = key_pair(KeyFamily::Ec);
        let token = sign(&key_pair, &json!({"sub": "test"}));

        let unreachable = TokenValidator::with_fetcher(StaticFetcher(Err(())));
        let err = unreachable
            .validate(&token, "https://issuer.example/jwks")
            .expect_err("should fail to fetch");
        assert!(matches!(context(&err), KeyLifecycleError::Fetch { .. }));

        for body in ["<html>", r#"{"jwks":[]}"#, "[]"] {
            let err = validator_for(body.to_string())
                .validate(&token, "https://issuer.example/jwks")
                .expect_err("should reject malformed JWKS");
            assert!(matches!(context(&err), KeyLifecycleError::Fetch { .. }));
        }
    }

    #[test]
    fn test_header_requires_kid_and_alg() {
        let no_kid = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let header = decode_header(&no_kid).expect("should decode header");
        assert!(header_kid_and_alg(&header).is_err());

        let padded = format!("{}==", URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","kid":"k"}"#));
        let header = decode_header(&padded).expect("should tolerate padding");
        let (kid, alg) = header_kid_and_alg(&header).expect("should read kid and alg");
        assert_eq!(kid, "k");
        assert_eq!(alg, Algorithm::ES256);
    }
}

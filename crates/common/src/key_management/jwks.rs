//! JSON Web Key Set (JWKS) management.
//!
//! This module converts stored PEM public keys into JWKs, merges new keys into
//! the published key set, and rebuilds the set from the stored public keys.

use std::fmt;

use error_stack::{Report, ResultExt};
use jose_jwk::{
    jose_jwa::{Algorithm, Signing},
    Class, Ec, EcCurves, Jwk, JwkSet, Key, Parameters, Rsa,
};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::Serialize;
use serde_json::Value;

use crate::error::KeyLifecycleError;
use crate::key_store::{KeyStore, StoreEntry};
use crate::naming::{EntryName, Kid};

/// Values not starting with this marker are never treated as public keys.
pub const PUBLIC_KEY_PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";

/// JWK members that only private or symmetric keys carry.
const PRIVATE_MEMBERS: [&str; 8] = ["d", "p", "q", "dp", "dq", "qi", "oth", "k"];

/// Something unexpected found in the previously published JWKS and recovered
/// from while merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwksAnomaly {
    /// The document did not parse at all; it was replaced.
    Corrupt { reason: String },
    /// Individual entries had no public form and were dropped.
    DroppedEntries { count: usize },
    /// The new key's kid was already published; the old entry was replaced.
    DuplicateKid { kid: String },
}

impl fmt::Display for JwksAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JwksAnomaly::Corrupt { reason } => {
                write!(f, "existing JWKS was unparsable and replaced ({})", reason)
            }
            JwksAnomaly::DroppedEntries { count } => {
                write!(f, "{} invalid entries dropped from existing JWKS", count)
            }
            JwksAnomaly::DuplicateKid { kid } => {
                write!(f, "kid '{}' was already published and got replaced", kid)
            }
        }
    }
}

/// A published key set, kept as raw JSON entries.
///
/// Entries are carried as they were published so that keys this crate cannot
/// model (encryption keys, other algorithms) survive a merge unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishedJwks {
    pub keys: Vec<Value>,
}

impl PublishedJwks {
    /// Kids of the entries that carry one, in document order.
    #[must_use]
    pub fn kids(&self) -> Vec<&str> {
        self.keys.iter().filter_map(entry_kid).collect()
    }
}

#[derive(Debug, Clone)]
pub struct MergedJwks {
    pub jwks: PublishedJwks,
    pub anomalies: Vec<JwksAnomaly>,
}

/// A leniently parsed JWKS document.
#[derive(Debug, Clone)]
pub struct ParsedJwks {
    pub jwks: PublishedJwks,
    pub dropped: usize,
}

#[must_use]
pub fn kid_of(jwk: &Jwk) -> Option<&str> {
    jwk.prm.kid.as_deref()
}

fn entry_kid(entry: &Value) -> Option<&str> {
    entry.get("kid").and_then(Value::as_str)
}

/// Converts a PEM-encoded SPKI public key into a public-only signing JWK.
///
/// The conversion is deterministic: the same PEM and kid always produce the
/// same JWK.
///
/// # Errors
///
/// Returns [`KeyLifecycleError::KeyFormat`] if the PEM is not an RSA, P-256 or
/// P-384 public key.
pub fn to_jwk(public_key_pem: &str, kid: &Kid) -> Result<Jwk, Report<KeyLifecycleError>> {
    let (key, signing) = if let Ok(public) = RsaPublicKey::from_public_key_pem(public_key_pem) {
        let rsa = Rsa {
            n: public.n().to_bytes_be().into(),
            e: public.e().to_bytes_be().into(),
            prv: None,
        };
        (Key::Rsa(rsa), Signing::Rs256)
    } else if let Ok(public) = p256::PublicKey::from_public_key_pem(public_key_pem) {
        let point = public.to_encoded_point(false);
        (
            ec_key(EcCurves::P256, point.x().map(|x| x.to_vec()), point.y().map(|y| y.to_vec()))?,
            Signing::Es256,
        )
    } else if let Ok(public) = p384::PublicKey::from_public_key_pem(public_key_pem) {
        let point = public.to_encoded_point(false);
        (
            ec_key(EcCurves::P384, point.x().map(|x| x.to_vec()), point.y().map(|y| y.to_vec()))?,
            Signing::Es384,
        )
    } else {
        return Err(Report::new(KeyLifecycleError::KeyFormat {
            message: format!("Value stored for kid '{}' is not a supported PEM public key", kid),
        }));
    };

    Ok(Jwk {
        key,
        prm: Parameters {
            kid: Some(kid.to_string()),
            alg: Some(Algorithm::Signing(signing)),
            cls: Some(Class::Signing),
            ..Default::default()
        },
    })
}

fn ec_key(
    crv: EcCurves,
    x: Option<Vec<u8>>,
    y: Option<Vec<u8>>,
) -> Result<Key, Report<KeyLifecycleError>> {
    match (x, y) {
        (Some(x), Some(y)) => Ok(Key::Ec(Ec {
            crv,
            x: x.into(),
            y: y.into(),
            d: None, // No private key in JWK (public only)
        })),
        _ => Err(Report::new(KeyLifecycleError::KeyFormat {
            message: "EC public key is the identity point".into(),
        })),
    }
}

/// Strips private members. Entries without a `kty`, and symmetric keys, have
/// no public form and are dropped.
fn public_entry(entry: Value) -> Option<Value> {
    let Value::Object(mut members) = entry else {
        return None;
    };
    match members.get("kty").and_then(Value::as_str) {
        None | Some("oct") => return None,
        Some(_) => {}
    }
    for member in PRIVATE_MEMBERS {
        members.remove(member);
    }
    Some(Value::Object(members))
}

/// Parses a stored JWKS document, dropping entries that cannot be published.
///
/// A bare JSON array of keys is accepted as well, since older tooling
/// published the key list without the `keys` wrapper.
///
/// # Errors
///
/// Returns [`KeyLifecycleError::JwksCorrupt`] if the document is not JSON or
/// has no key list.
pub fn parse_jwks(raw: &str) -> Result<ParsedJwks, Report<KeyLifecycleError>> {
    let value: Value =
        serde_json::from_str(raw).change_context(KeyLifecycleError::JwksCorrupt {
            message: "JWKS document is not valid JSON".into(),
        })?;

    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("keys") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(Report::new(KeyLifecycleError::JwksCorrupt {
                    message: "JWKS document has no 'keys' array".into(),
                }))
            }
        },
        _ => {
            return Err(Report::new(KeyLifecycleError::JwksCorrupt {
                message: "JWKS document is neither an object nor an array".into(),
            }))
        }
    };

    let total = entries.len();
    let keys: Vec<Value> = entries.into_iter().filter_map(public_entry).collect();

    Ok(ParsedJwks {
        dropped: total - keys.len(),
        jwks: PublishedJwks { keys },
    })
}

/// Appends `new_jwk` to the existing key set, preserving order.
///
/// Existing entries are kept verbatim apart from private members. A missing
/// document starts a new set. An unparsable one is logged, flagged and treated
/// as empty so that a rotation is never blocked by it.
///
/// # Errors
///
/// Returns [`KeyLifecycleError::KeyFormat`] if `new_jwk` cannot be serialized.
pub fn merge(
    existing: Option<&str>,
    new_jwk: &Jwk,
) -> Result<MergedJwks, Report<KeyLifecycleError>> {
    let new_entry = serde_json::to_value(new_jwk).change_context(KeyLifecycleError::KeyFormat {
        message: "Failed to serialize the new JWK".into(),
    })?;
    let mut anomalies = Vec::new();

    let mut jwks = match existing {
        None => {
            log::debug!("No JWKS published yet, starting a new key set");
            PublishedJwks::default()
        }
        Some(raw) => match parse_jwks(raw) {
            Ok(parsed) => {
                if parsed.dropped > 0 {
                    log::warn!(
                        "Dropped {} unpublishable entries from the existing JWKS",
                        parsed.dropped
                    );
                    anomalies.push(JwksAnomaly::DroppedEntries {
                        count: parsed.dropped,
                    });
                }
                parsed.jwks
            }
            Err(report) => {
                log::warn!(
                    "Existing JWKS is unparsable, starting from an empty key set: {:?}",
                    report
                );
                anomalies.push(JwksAnomaly::Corrupt {
                    reason: report.current_context().to_string(),
                });
                PublishedJwks::default()
            }
        },
    };

    let new_kid = kid_of(new_jwk).map(str::to_string);
    let existing_position = new_kid
        .as_deref()
        .and_then(|kid| jwks.keys.iter().position(|entry| entry_kid(entry) == Some(kid)));

    match (existing_position, new_kid) {
        (Some(position), Some(kid)) => {
            log::warn!("Kid '{}' is already published, replacing its JWK", kid);
            jwks.keys[position] = new_entry;
            anomalies.push(JwksAnomaly::DuplicateKid { kid });
        }
        _ => jwks.keys.push(new_entry),
    }

    Ok(MergedJwks { jwks, anomalies })
}

/// Recomputes the key set from every stored `public__<kid>` entry, in store
/// order. Entries that do not parse as PEM public keys are skipped.
#[must_use]
pub fn rebuild(entries: &[StoreEntry]) -> JwkSet {
    let keys = entries
        .iter()
        .filter_map(|entry| match entry.entry_name() {
            Some(EntryName::PublicKey(kid)) if entry.value.starts_with(PUBLIC_KEY_PEM_HEADER) => {
                Some((kid, entry))
            }
            _ => None,
        })
        .filter_map(|(kid, entry)| match to_jwk(&entry.value, &kid) {
            Ok(jwk) => Some(jwk),
            Err(report) => {
                log::warn!("Skipping stored public key '{}': {:?}", kid, report);
                None
            }
        })
        .collect();

    JwkSet { keys }
}

/// Serializes a key set to the compact `{"keys":[...]}` form that is stored
/// and served.
///
/// # Errors
///
/// Returns [`KeyLifecycleError::KeyFormat`] if serialization fails.
pub fn to_json<T: Serialize + ?Sized>(jwks: &T) -> Result<String, Report<KeyLifecycleError>> {
    serde_json::to_string(jwks).change_context(KeyLifecycleError::KeyFormat {
        message: "Failed to serialize JWKS".into(),
    })
}

/// Reads the published key set from the store.
///
/// Returns `Ok(None)` if nothing has been published yet.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the document is corrupt.
pub fn load_published_jwks<S: KeyStore + ?Sized>(
    store: &S,
) -> Result<Option<ParsedJwks>, Report<KeyLifecycleError>> {
    store
        .get_value(&EntryName::Jwks)
        .attach("while fetching the published JWKS")?
        .map(|raw| parse_jwks(&raw))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::generator::KeyGenerator;
    use crate::naming::KeyFamily;

    fn kid(value: &str) -> Kid {
        Kid::new(value).expect("should build kid")
    }

    fn ec_public_pem() -> String {
        KeyGenerator::default()
            .generate(KeyFamily::Ec)
            .expect("should generate EC key")
            .public_key_pem
    }

    #[test]
    fn test_rsa_pem_to_jwk() {
        let material = KeyGenerator::new(2048, "P-256")
            .generate(KeyFamily::Rsa)
            .expect("should generate RSA key");
        let jwk = to_jwk(&material.public_key_pem, &kid("rsa__abc123xyz456"))
            .expect("should convert RSA key");

        assert_eq!(jwk.prm.kid.as_deref(), Some("rsa__abc123xyz456"));
        assert_eq!(jwk.prm.cls, Some(Class::Signing));
        assert_eq!(jwk.prm.alg, Some(Algorithm::Signing(Signing::Rs256)));
        match jwk.key {
            Key::Rsa(rsa) => {
                assert_eq!(rsa.n.len(), 256);
                assert!(rsa.prv.is_none());
            }
            _ => panic!("Expected RSA key type"),
        }
    }

    #[test]
    fn test_ec_pem_to_jwk_json_shape() {
        let jwk = to_jwk(&ec_public_pem(), &kid("ec__k1")).expect("should convert EC key");
        let value = serde_json::to_value(&jwk).expect("should serialize JWK");

        assert_eq!(value["kty"], "EC");
        assert_eq!(value["crv"], "P-256");
        assert_eq!(value["kid"], "ec__k1");
        assert_eq!(value["use"], "sig");
        assert_eq!(value["alg"], "ES256");
        assert!(value.get("d").is_none());
    }

    #[test]
    fn test_to_jwk_is_deterministic() {
        let pem = ec_public_pem();
        let first = to_jwk(&pem, &kid("ec__k1")).expect("should convert");
        let second = to_jwk(&pem, &kid("ec__k1")).expect("should convert");
        assert_eq!(first, second);
    }

    #[test]
    fn test_to_jwk_rejects_non_public_key() {
        let err = to_jwk("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----\n", &kid("rsa__x"))
            .expect_err("should reject garbage PEM");
        assert!(matches!(
            err.current_context(),
            KeyLifecycleError::KeyFormat { .. }
        ));
    }

    fn merge_all(existing: Option<&str>, jwk: &Jwk) -> MergedJwks {
        merge(existing, jwk).expect("should merge")
    }

    #[test]
    fn test_merge_without_existing_document() {
        let jwk = to_jwk(&ec_public_pem(), &kid("ec__k1")).expect("should convert");
        let merged = merge_all(None, &jwk);

        assert_eq!(merged.jwks.kids(), vec!["ec__k1"]);
        assert!(merged.anomalies.is_empty());
    }

    #[test]
    fn test_merge_appends_in_order() {
        let first = to_jwk(&ec_public_pem(), &kid("ec__k1")).expect("should convert");
        let second = to_jwk(&ec_public_pem(), &kid("ec__k2")).expect("should convert");

        let raw = to_json(&merge_all(None, &first).jwks).expect("should serialize");
        let merged = merge_all(Some(&raw), &second);

        assert_eq!(merged.jwks.kids(), vec!["ec__k1", "ec__k2"]);
        assert!(merged.anomalies.is_empty());
    }

    #[test]
    fn test_merge_keeps_entries_it_cannot_model() {
        let existing = r#"{"keys":[
            {"kty":"RSA","kid":"enc1","use":"enc","alg":"RSA-OAEP-256",
             "n":"sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw",
             "e":"AQAB","d":"Y29ycnVwdGVk","p":"cHJpbWU"},
            {"kty":"OKP","crv":"Ed25519","kid":"ed1","x":"11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo"}
        ]}"#;
        let jwk = to_jwk(&ec_public_pem(), &kid("ec__new")).expect("should convert");

        let merged = merge_all(Some(existing), &jwk);

        assert_eq!(merged.jwks.kids(), vec!["enc1", "ed1", "ec__new"]);
        assert!(merged.anomalies.is_empty());

        let encryption_key = &merged.jwks.keys[0];
        assert_eq!(encryption_key["use"], "enc");
        assert_eq!(encryption_key["alg"], "RSA-OAEP-256");
        assert_eq!(encryption_key["e"], "AQAB");
        assert!(encryption_key.get("d").is_none());
        assert!(encryption_key.get("p").is_none());
    }

    #[test]
    fn test_merge_recovers_from_corrupt_document() {
        let jwk = to_jwk(&ec_public_pem(), &kid("ec__k1")).expect("should convert");
        let merged = merge_all(Some("{not json"), &jwk);

        assert_eq!(merged.jwks.keys.len(), 1);
        assert!(matches!(
            merged.anomalies.as_slice(),
            [JwksAnomaly::Corrupt { .. }]
        ));
    }

    #[test]
    fn test_merge_replaces_duplicate_kid() {
        let pem = ec_public_pem();
        let original = to_jwk(&pem, &kid("ec__k1")).expect("should convert");
        let raw = to_json(&merge_all(None, &original).jwks).expect("should serialize");

        let replacement = to_jwk(&ec_public_pem(), &kid("ec__k1")).expect("should convert");
        let merged = merge_all(Some(&raw), &replacement);

        assert_eq!(
            merged.jwks.keys,
            vec![serde_json::to_value(&replacement).expect("should serialize")]
        );
        assert_eq!(
            merged.anomalies,
            vec![JwksAnomaly::DuplicateKid {
                kid: "ec__k1".into()
            }]
        );
    }

    #[test]
    fn test_parse_drops_unpublishable_and_private_material() {
        let raw = r#"{"keys":[
            {"kty":"oct","k":"c2VjcmV0","kid":"sym"},
            {"kid":"no-type"},
            "not an object",
            {"kty":"EC","crv":"P-256","kid":"ec__x",
             "x":"f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU",
             "y":"x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0",
             "d":"jpsQnnGQmL-YBIffH1136cspYG6-0iY7X1fCE9-E9LI"}
        ]}"#;

        let parsed = parse_jwks(raw).expect("should parse document");
        assert_eq!(parsed.dropped, 3);
        assert_eq!(parsed.jwks.kids(), vec!["ec__x"]);

        let value = serde_json::to_value(&parsed.jwks).expect("should serialize");
        assert!(value["keys"][0].get("d").is_none());
        assert_eq!(value["keys"][0]["crv"], "P-256");
    }

    #[test]
    fn test_parse_accepts_bare_array() {
        let parsed = parse_jwks("[]").expect("should parse bare array");
        assert!(parsed.jwks.keys.is_empty());
        assert!(parse_jwks(r#"{"other":[]}"#).is_err());
    }

    #[test]
    fn test_rebuild_skips_foreign_and_unparsable_entries() {
        let pem = ec_public_pem();
        let entries = vec![
            StoreEntry::new("public__ec__good", pem.clone()),
            StoreEntry::new("public__ec__bad", "-----BEGIN PUBLIC KEY-----\ngarbage\n"),
            StoreEntry::new("public__ec__notpem", "hello"),
            StoreEntry::new("currentKid__ec", "ec__good"),
            StoreEntry::new("jwks", "{}"),
        ];

        let jwks = rebuild(&entries);
        let kids: Vec<_> = jwks.keys.iter().filter_map(kid_of).collect();
        assert_eq!(kids, vec!["ec__good"]);
    }
}

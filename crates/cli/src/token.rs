//! Token signing and validation commands.

use std::fs;
use std::path::Path;

use jwks_provisioner_common::key_management::{TokenSigner, TokenValidator};
use jwks_provisioner_common::naming::Kid;

use crate::error::CliError;

/// Validate `token` against the JWKS served at `endpoint` and print its claims.
pub fn validate(token: &str, endpoint: &str) -> Result<(), CliError> {
    let validated = TokenValidator::new().validate(token, endpoint)?;
    let payload = serde_json::to_string_pretty(&validated.payload)
        .map_err(|e| CliError::Key(format!("Failed to render payload: {}", e)))?;

    println!("Token is valid");
    println!("  kid: {}", validated.kid);
    println!("  alg: {:?}", validated.algorithm);
    println!("{}", payload);
    Ok(())
}

/// Sign `claims` (a JSON object) with the PKCS#8 private key at `private_key`.
pub fn sign(private_key: &Path, kid: &str, claims: &str) -> Result<(), CliError> {
    let pem = fs::read_to_string(private_key)?;
    let kid = Kid::new(kid).map_err(|e| CliError::Key(e.to_string()))?;
    let claims: serde_json::Value = serde_json::from_str(claims)
        .map_err(|e| CliError::Config(format!("Claims must be a JSON object: {}", e)))?;
    if !claims.is_object() {
        return Err(CliError::Config("Claims must be a JSON object".into()));
    }

    let signer = TokenSigner::from_private_key_pem(kid, &pem)?;
    println!("{}", signer.sign(&claims)?);
    Ok(())
}

//! Key provisioning, rotation and maintenance commands.

use jwks_provisioner_common::key_management::{
    DriftReport, KeyGenerator, KeyRotationManager, PublicKeyMaintainer, RotationResult,
};
use jwks_provisioner_common::key_store::KeyStore;
use jwks_provisioner_common::logging::escape_pem;
use jwks_provisioner_common::naming::{KeyFamily, Kid};
use jwks_provisioner_common::settings::Settings;

use crate::error::CliError;

fn print_rotation(result: &RotationResult) -> Result<(), CliError> {
    let jwk = serde_json::to_string(&result.jwk)
        .map_err(|e| CliError::Key(format!("Failed to serialize JWK: {}", e)))?;

    println!("{}: new key '{}'", result.key_pair.family, result.key_pair.kid);
    if let Some(previous) = &result.previous_kid {
        println!("  previous current kid: {}", previous);
    }
    println!("  public key: {}", escape_pem(&result.key_pair.public_key_pem));
    println!("  jwk: {}", jwk);
    for anomaly in &result.jwks_anomalies {
        println!("  warning: {}", anomaly);
    }
    Ok(())
}

/// Bootstrap the given families (or the configured ones) with one key each.
pub fn provision<S: KeyStore>(
    store: S,
    settings: &Settings,
    families: &[KeyFamily],
) -> Result<(), CliError> {
    let families = if families.is_empty() {
        settings.keys.families.as_slice()
    } else {
        families
    };

    let manager = KeyRotationManager::new(store, KeyGenerator::from_settings(&settings.keys));
    let outcomes = manager.provision(families)?;

    let mut failed = Vec::new();
    for (family, outcome) in &outcomes {
        match outcome {
            Ok(result) => print_rotation(result)?,
            Err(report) => {
                println!("{}: failed: {}", family, report.current_context());
                failed.push(family.to_string());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(CliError::Key(format!(
            "Provisioning failed for {} (see log for the failing step)",
            failed.join(", ")
        )))
    }
}

/// Add a new key for one family and make it current.
pub fn rotate<S: KeyStore>(store: S, settings: &Settings, family: KeyFamily) -> Result<(), CliError> {
    store.ensure_partitions()?;
    let manager = KeyRotationManager::new(store, KeyGenerator::from_settings(&settings.keys));
    let result = manager.rotate(family)?;
    print_rotation(&result)
}

/// Print the JWKS rebuilt from the stored public keys.
pub fn list<S: KeyStore>(store: S) -> Result<(), CliError> {
    let keys = PublicKeyMaintainer::new(store).list()?;
    let json = serde_json::to_string_pretty(&serde_json::json!({ "keys": keys }))
        .map_err(|e| CliError::Key(format!("Failed to serialize JWKS: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// Remove stored public keys, optionally republishing the JWKS afterwards.
pub fn remove<S: KeyStore>(store: S, kids: &[Kid], update: bool) -> Result<(), CliError> {
    let maintainer = PublicKeyMaintainer::new(store);
    let removed = maintainer.remove(kids)?;

    if removed.is_empty() {
        println!("No public keys removed");
    }
    for kid in &removed {
        println!("removed public__{}", kid);
    }

    if update {
        let published = maintainer.update()?;
        println!("JWKS republished with {} keys", published.keys.len());
    } else if !removed.is_empty() {
        println!("The published JWKS still lists removed keys; run `jwksctl keys update`");
    }
    Ok(())
}

/// Overwrite the published JWKS with the set rebuilt from stored public keys.
pub fn update<S: KeyStore>(store: S) -> Result<(), CliError> {
    let published = PublicKeyMaintainer::new(store).update()?;
    println!("JWKS republished with {} keys", published.keys.len());
    Ok(())
}

fn print_drift(report: &DriftReport) {
    if report.is_clean() {
        println!("No drift: stored keys, pointers and JWKS agree");
        return;
    }
    if report.jwks_corrupt {
        println!("published JWKS is corrupt");
    }
    for kid in &report.unpublished {
        println!("unpublished: {}", kid);
    }
    for kid in &report.stale_published {
        println!("stale in JWKS: {}", kid);
    }
    for kid in &report.orphaned_private {
        println!("orphaned private key: {}", kid);
    }
    for (family, kid) in &report.dangling_pointers {
        println!("dangling pointer: currentKid__{} -> {}", family, kid);
    }
}

/// Report drift, and with `repair` republish the JWKS when it is out of date.
pub fn reconcile<S: KeyStore>(store: S, repair: bool) -> Result<(), CliError> {
    let maintainer = PublicKeyMaintainer::new(store);
    let report = maintainer.reconcile()?;
    print_drift(&report);

    if repair && report.needs_republish() {
        let published = maintainer.update()?;
        println!("JWKS republished with {} keys", published.keys.len());
    }
    if !report.orphaned_private.is_empty() || !report.dangling_pointers.is_empty() {
        println!("Orphaned private keys and dangling pointers need a new rotation or manual cleanup");
    }
    Ok(())
}

/// Print the current kid of a family.
pub fn current<S: KeyStore>(store: S, settings: &Settings, family: KeyFamily) -> Result<(), CliError> {
    let manager = KeyRotationManager::new(store, KeyGenerator::from_settings(&settings.keys));

    match manager.current_kid(family)? {
        Some(current) => match current.rotated_at {
            Some(at) => println!("{}: {} (since {})", family, current.kid, at.to_rfc3339()),
            None => println!("{}: {}", family, current.kid),
        },
        None => println!("{}: no key issued yet", family),
    }
    Ok(())
}

/// Print every kid a family has been rotated to, oldest first.
pub fn history<S: KeyStore>(store: S, settings: &Settings, family: KeyFamily) -> Result<(), CliError> {
    let manager = KeyRotationManager::new(store, KeyGenerator::from_settings(&settings.keys));
    let records = manager.kid_history(family)?;

    if records.is_empty() {
        println!("{}: no rotations recorded", family);
    }
    for record in records {
        println!("{}  {}", record.rotated_at.to_rfc3339(), record.kid);
    }
    Ok(())
}

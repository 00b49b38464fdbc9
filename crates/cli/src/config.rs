//! Configuration commands.
//!
//! Configuration is loaded from a TOML file and merged with environment
//! variables prefixed with `JWKS_PROVISIONER__`. For example,
//! `JWKS_PROVISIONER__STORE__BACKEND=management-api` overrides `store.backend`.

use std::path::Path;

use jwks_provisioner_common::settings::{Settings, StoreBackend, API_TOKEN_ENV};

use crate::error::CliError;

/// Load settings from `file` (or the default file) merged with the environment.
pub(crate) fn load(file: Option<&Path>) -> Result<Settings, CliError> {
    if let Some(file) = file {
        log::debug!("Loading config from: {}", file.display());
    }
    Ok(Settings::load(file)?)
}

/// Validate configuration and summarize what it selects.
pub fn validate(file: Option<&Path>) -> Result<(), CliError> {
    let settings = load(file)?;

    println!("Configuration is valid");
    match settings.store.backend {
        StoreBackend::File => {
            println!("  Store: local file {}", settings.store.file_path);
        }
        StoreBackend::ManagementApi => {
            if let Some(api) = &settings.management_api {
                println!(
                    "  Store: management API {} (organization '{}', environment '{}')",
                    api.base_url, api.organization, api.environment
                );
            }
            if std::env::var(API_TOKEN_ENV).is_err() {
                println!("  Warning: {} is not set", API_TOKEN_ENV);
            }
        }
    }
    println!(
        "  Partitions: secrets '{}', non-secrets '{}'",
        settings.store.secrets_partition, settings.store.non_secrets_partition
    );
    println!(
        "  Keys: RSA {} bits, EC {}",
        settings.keys.rsa_bits, settings.keys.ec_curve
    );

    let families: Vec<String> = settings.keys.families.iter().map(ToString::to_string).collect();
    println!("  Provisioned families: {}", families.join(", "));
    Ok(())
}

/// Print the effective configuration after environment overrides.
pub fn show(file: Option<&Path>) -> Result<(), CliError> {
    let settings = load(file)?;
    print!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}

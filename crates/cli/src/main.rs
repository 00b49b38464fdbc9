//! Signing key lifecycle CLI.
//!
//! This tool provides commands for:
//! - Bootstrapping and rotating RSA and EC signing keys
//! - Publishing, pruning and reconciling the JWKS
//! - Signing and validating tokens against a served JWKS
//! - Validating configuration

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use jwks_provisioner_common::logging::init_logging;
use jwks_provisioner_common::naming::{KeyFamily, Kid};
use log::LevelFilter;

mod config;
mod error;
mod keys;
mod local;
mod platform;
mod token;

use error::CliError;
use platform::create_store;

#[derive(Parser)]
#[command(name = "jwksctl")]
#[command(about = "Signing key provisioning, rotation and JWKS publishing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file (default: ./jwks-provisioner.toml)
    #[arg(long, short, global = true, env = "JWKS_PROVISIONER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store partitions and issue one key per family
    Provision {
        /// Families to provision (default: `keys.families` from the config)
        #[arg(long, short, value_delimiter = ',')]
        family: Vec<KeyFamily>,
    },

    /// Issue a new key for a family and make it current
    Rotate {
        #[arg(long, short)]
        family: KeyFamily,
    },

    /// Public key and JWKS maintenance
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Token signing and validation
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Print the JWKS rebuilt from stored public keys
    List,

    /// Remove stored public keys by kid
    Remove {
        #[arg(required = true)]
        kids: Vec<String>,

        /// Republish the JWKS afterwards
        #[arg(long)]
        update: bool,
    },

    /// Republish the JWKS from stored public keys
    Update,

    /// Compare stored keys, pointers and the published JWKS
    Reconcile {
        /// Republish the JWKS if it is out of date
        #[arg(long)]
        repair: bool,
    },

    /// Show the current kid of a family
    Current {
        #[arg(long, short)]
        family: KeyFamily,
    },

    /// Show the rotation history of a family
    History {
        #[arg(long, short)]
        family: KeyFamily,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Verify a token against the JWKS served at an endpoint
    Validate {
        #[arg(long, short)]
        token: String,

        /// URL serving the JWKS
        #[arg(long, short)]
        endpoint: String,
    },

    /// Sign a claims object with a PKCS#8 private key
    Sign {
        /// Path to the PEM private key
        #[arg(long)]
        private_key: PathBuf,

        /// Key id placed in the token header
        #[arg(long)]
        kid: String,

        /// JSON claims object
        #[arg(long, default_value = "{}")]
        claims: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate configuration and environment overrides
    Validate,

    /// Print the effective configuration
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = init_logging(level) {
        eprintln!("Failed to initialize logging: {:?}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_file = cli.config.as_deref();

    match cli.command {
        Commands::Provision { family } => {
            let settings = config::load(config_file)?;
            keys::provision(create_store(&settings)?, &settings, &family)
        }
        Commands::Rotate { family } => {
            let settings = config::load(config_file)?;
            keys::rotate(create_store(&settings)?, &settings, family)
        }
        Commands::Keys { action } => run_keys(config_file, action),
        Commands::Token { action } => match action {
            TokenAction::Validate { token, endpoint } => token::validate(&token, &endpoint),
            TokenAction::Sign {
                private_key,
                kid,
                claims,
            } => token::sign(&private_key, &kid, &claims),
        },
        Commands::Config { action } => match action {
            ConfigAction::Validate => config::validate(config_file),
            ConfigAction::Show => config::show(config_file),
        },
    }
}

fn run_keys(config_file: Option<&Path>, action: KeysAction) -> Result<(), CliError> {
    let settings = config::load(config_file)?;
    let store = create_store(&settings)?;

    match action {
        KeysAction::List => keys::list(store),
        KeysAction::Remove { kids, update } => {
            let kids = kids
                .into_iter()
                .map(Kid::new)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CliError::Config(e.to_string()))?;
            keys::remove(store, &kids, update)
        }
        KeysAction::Update => keys::update(store),
        KeysAction::Reconcile { repair } => keys::reconcile(store, repair),
        KeysAction::Current { family } => keys::current(store, &settings, family),
        KeysAction::History { family } => keys::history(store, &settings, family),
    }
}

//! CLI error types.

use std::fmt;

use error_stack::Report;
use jwks_provisioner_common::error::KeyLifecycleError;

#[derive(Debug)]
pub enum CliError {
    /// Configuration file error
    Config(String),
    /// IO error
    Io(std::io::Error),
    /// TOML serialization error
    Toml(String),
    /// Key lifecycle failure, with the full report
    Key(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Io(err) => write!(f, "IO error: {}", err),
            CliError::Toml(msg) => write!(f, "TOML error: {}", msg),
            CliError::Key(msg) => write!(f, "Key lifecycle error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}

impl From<toml::ser::Error> for CliError {
    fn from(err: toml::ser::Error) -> Self {
        CliError::Toml(err.to_string())
    }
}

impl From<Report<KeyLifecycleError>> for CliError {
    fn from(report: Report<KeyLifecycleError>) -> Self {
        let message = format!("{:?}", report);
        match report.current_context() {
            KeyLifecycleError::Configuration { .. } => CliError::Config(message),
            _ => CliError::Key(message),
        }
    }
}

use error_stack::Report;
use log::LevelFilter;

use crate::error::KeyLifecycleError;

/// Initialize logging for the application.
/// Should be called once at the start of main().
///
/// # Errors
///
/// Returns [`KeyLifecycleError::Configuration`] if a logger is already installed.
pub fn init_logging(level: LevelFilter) -> Result<(), Report<KeyLifecycleError>> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}  {} {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .map_err(|e| {
            Report::new(KeyLifecycleError::Configuration {
                message: format!("Failed to initialize logger: {}", e),
            })
        })
}

/// Renders a PEM on a single line, newlines escaped as `\n`.
///
/// Only ever pass public key material here.
#[must_use]
pub fn escape_pem(pem: &str) -> String {
    pem.trim_end().replace('\n', "\\n")
}

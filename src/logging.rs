//! Optional `tracing` subscriber installation.
//!
//! The crate only emits events. Applications that do not install a subscriber of their own can
//! call [`init`] once at startup.

use crate::{
    config::{Config, Env},
    error::{Error, Result},
};

use tracing_subscriber::EnvFilter;

/// Filter built from `MODULAR_SDK_LOG_LEVEL`.
///
/// Plain levels such as `INFO` apply to the whole process; full directives such as
/// `modular_sdk=debug,warn` are accepted as well.
pub fn filter(config: &Config) -> Result<EnvFilter> {
    let level = config.log_level().to_ascii_lowercase();
    EnvFilter::try_new(&level).map_err(|error| Error::Config {
        key: Env::LogLevel.name().to_string(),
        reason: error.to_string(),
    })
}

/// Installs a fmt subscriber filtered by the configured level.
///
/// Does nothing when a global subscriber is already set, so repeated calls are harmless.
pub fn init(config: &Config) -> Result<()> {
    let filter = filter(config)?;
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already initialized, skipping");
    }
    Ok(())
}

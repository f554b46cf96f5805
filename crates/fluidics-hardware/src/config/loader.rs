//! Configuration loading.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. the TOML file
//! 2. `FLUIDICS_`-prefixed environment variables, nested with `__`
//!    (`FLUIDICS_SIMULATION__TIME_SCALE=0.1`)
//!
//! The merged result is checked with `serde_valid`, then with the cross-field
//! rules in [`validation`](super::validation).
//!
//! ```rust,ignore
//! use fluidics_hardware::config::load_config;
//!
//! let config = load_config(Path::new("config/open_chamber.toml"))?;
//! ```

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde_valid::Validate;
use std::path::Path;
use tracing::{debug, info};

use super::schema::FluidicsConfig;
use super::validation::validate_fluidics_config;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FLUIDICS_";

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Config validation failed: {0}")]
    ValidationError(String),

    /// Schema validation error
    #[error("Schema validation failed:\n{0}")]
    SchemaValidationError(String),
}

/// Load the instrument configuration from `path` plus environment overrides.
pub fn load_config(path: &Path) -> Result<FluidicsConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }
    debug!("Loading fluidics config from: {}", path.display());

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));
    let config: FluidicsConfig = figment
        .extract()
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    check(config)
}

/// Load the configuration from TOML text, without environment overrides.
pub fn load_config_from_str(toml_content: &str) -> Result<FluidicsConfig> {
    let config: FluidicsConfig = Figment::new()
        .merge(Toml::string(toml_content))
        .extract()
        .context("Failed to parse TOML content")?;
    check(config)
}

fn check(config: FluidicsConfig) -> Result<FluidicsConfig> {
    if let Err(errors) = config.validate() {
        let error_messages: Vec<String> =
            errors.to_string().lines().map(|s| s.to_string()).collect();
        return Err(ConfigLoadError::SchemaValidationError(error_messages.join("\n")).into());
    }

    if let Err(errors) = validate_fluidics_config(&config) {
        return Err(ConfigLoadError::ValidationError(errors.join("\n")).into());
    }

    info!(
        application = %config.application,
        valves = config.selector_valves.valve_ids_allowed.len(),
        syringe_ul = config.syringe_pump.volume_ul,
        "Loaded fluidics config"
    );
    Ok(config)
}

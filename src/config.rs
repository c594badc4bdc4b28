//! Configuration loading via `ortho-config`.
//!
//! [`ScalewayConfig`] is the profile every command needs: credentials, the
//! project to scope lookups to, and launch defaults. Values merge defaults,
//! `armada.toml` discovery, `SCW_*` environment variables, and CLI flags.

use std::ffi::OsString;

use chrono::TimeDelta;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Name of the discovered configuration file.
pub const CONFIG_FILE_NAME: &str = "armada.toml";

/// Scaleway profile derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "armada",
        env_var = "ARMADA_CONFIG_PATH",
        config_file_name = "armada.toml",
        dotfile_name = ".armada.toml",
        project_file_name = "armada.toml"
    )
)]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not needed for API
    /// calls; kept so profiles copied from the Scaleway CLI load unchanged.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used to scope every listing.
    pub default_project_id: String,
    /// Zone used when neither the caller nor a load balancer picks one.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type used when a launch neither sets nor inherits one.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// CPU architecture used to select image variants.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Lifetime of cached listings, in hours.
    #[ortho_config(default = 24)]
    pub cache_ttl_hours: u32,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl ScalewayConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive, including CLI
    /// flags from the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("armada")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads and validates the profile.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load_validated() -> Result<Self, ConfigError> {
        let config = Self::load_without_cli_args()?;
        config.validate()?;
        Ok(config)
    }

    /// Lifetime of cached listings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the hour count is out of range.
    pub fn cache_ttl(&self) -> Result<TimeDelta, ConfigError> {
        TimeDelta::try_hours(i64::from(self.cache_ttl_hours)).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "cache_ttl_hours is out of range: {}",
                self.cache_ttl_hours
            ))
        })
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.secret_key,
                FieldMetadata::new("Scaleway API secret key", "SCW_SECRET_KEY", "secret_key"),
            ),
            (
                &self.default_project_id,
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                ),
            ),
            (
                &self.default_zone,
                FieldMetadata::new("availability zone", "SCW_DEFAULT_ZONE", "default_zone"),
            ),
            (
                &self.default_instance_type,
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                ),
            ),
            (
                &self.default_architecture,
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                ),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A field holds a value outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

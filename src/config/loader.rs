//! Configuration Loader
//!
//! Environment-aware loading: `base.toml`, then
//! `environments/{env}.toml`, then `REMEDIATION__SECTION__KEY` environment
//! variables. Later sources override earlier ones key by key.

use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::ConfigResult;
use super::RemediationConfig;

#[derive(Debug)]
pub struct ConfigManager {
    config: RemediationConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load with an explicit environment, without reading `REMEDIATION_ENV`
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading remediation configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = environment,
            cache_capacity = config.task.cache_capacity,
            correction_enabled = config.correction.enabled,
            threshold_min = config.correction.service_timeout_threshold_min,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<RemediationConfig> {
        let environment_file = config_directory
            .join("environments")
            .join(format!("{environment}.toml"));

        let settings = Config::builder()
            .add_source(File::from(config_directory.join("base.toml")).required(false))
            .add_source(File::from(environment_file).required(false))
            .add_source(
                Environment::with_prefix("REMEDIATION")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize::<RemediationConfig>()?)
    }

    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    pub fn detect_environment() -> String {
        env::var("REMEDIATION_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("REMEDIATION_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/remediation"))
    }
}

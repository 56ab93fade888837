//! Configuration Loader
//!
//! File and environment layering for [`OffloadConfig`] built on the `config`
//! crate. Sources, lowest precedence first: struct defaults, an optional
//! TOML file (`OFFLOAD_CONFIG_PATH`, or `offload.toml` in the working
//! directory), then `OFFLOAD__`-prefixed environment variables
//! (e.g. `OFFLOAD__POOL__REQUEST_TIMEOUT_MS=5000`).

use std::path::{Path, PathBuf};

use tracing::debug;

use super::OffloadConfig;
use crate::constants::env;
use crate::error::{OffloadError, Result};

const DEFAULT_CONFIG_FILE: &str = "offload.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with file auto-discovery.
    pub fn load() -> Result<OffloadConfig> {
        let file = match std::env::var(env::CONFIG_PATH) {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                default.exists().then(|| default.to_path_buf())
            }
        };
        Self::load_from(file.as_deref())
    }

    /// Load configuration from an explicit file, or defaults + environment
    /// only when `file` is `None`.
    pub fn load_from(file: Option<&Path>) -> Result<OffloadConfig> {
        let defaults = config::Config::try_from(&OffloadConfig::default())
            .map_err(|e| OffloadError::configuration(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = file {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("OFFLOAD").separator("__"))
            .build()
            .map_err(|e| OffloadError::configuration(e.to_string()))?;

        let loaded: OffloadConfig = settings
            .try_deserialize()
            .map_err(|e| OffloadError::configuration(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }
}

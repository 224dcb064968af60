//! Process configuration

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use kaleidoscope_core::UniverseConfig;

fn default_tick_rate() -> u32 {
    200
}

fn default_max_failures() -> u32 {
    kaleidoscope_host::MAX_CONSECUTIVE_FAILURES
}

/// The structure of the configuration file.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// Endpoint the per-tick output vectors are POSTed to.
    pub submarine_url: String,
    /// Control-plane listen address.
    pub http_listen_address: String,
    /// Prometheus exporter listen address.
    pub metrics_listen_address: String,
    /// Directory of per-fixture YAML files.
    pub fixtures_path: String,
    /// Optional directory of standalone rhai programs.
    #[serde(default)]
    pub programs_path: Option<String>,
    /// Tick rate, Hz.
    #[serde(default = "default_tick_rate")]
    pub tick_rate_hz: u32,
    /// Consecutive script failures before auto-disable.
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// The channel universe.
    pub universe: UniverseConfig,
}

impl Config {
    /// Reads a config from a file.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {:?}", path.as_ref()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("unable to parse config")?;

        if config.tick_rate_hz == 0 {
            anyhow::bail!("tick_rate_hz must be >= 1");
        }

        Ok(config)
    }
}

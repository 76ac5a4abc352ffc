use serde::Deserialize;
use vigil_common::types::RealTime;
use vigil_engine::EngineOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Sample the machine vigil runs on.
    #[default]
    Local,
    /// Replay recorded archives.
    Archive,
    /// Serve the values listed under `[[simulated]]`, for dry runs.
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Sample interval in seconds for rules that do not set one.
    #[serde(default = "default_delta")]
    pub delta: f64,
    #[serde(default)]
    pub source: SourceKind,
    /// Archive files, for `source = "archive"`.
    #[serde(default)]
    pub archives: Vec<String>,
    /// JSON rule file.
    #[serde(default = "default_rules")]
    pub rules: String,
    /// 0: quiet, 1: log rule values, 2: label values with host and instance.
    #[serde(default)]
    pub verbose: u8,
    /// Suppress host connection messages.
    #[serde(default)]
    pub quiet: bool,
    /// Where to write evaluation statistics on shutdown.
    pub stats_path: Option<String>,
    /// Log to this file instead of standard error; reopened on SIGHUP.
    pub log_file: Option<String>,
    /// Host for fetches that name none. Defaults to the first archive host,
    /// or `localhost`.
    pub default_host: Option<String>,
    /// Seconds after the start of the archive to begin evaluating.
    pub start_offset_secs: Option<f64>,
    /// Seconds after the start of the archive to stop.
    pub stop_offset_secs: Option<f64>,
    #[serde(default)]
    pub simulated: Vec<SimulatedMetric>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedMetric {
    #[serde(default = "default_host")]
    pub host: String,
    pub metric: String,
    #[serde(default = "default_sem")]
    pub sem: String,
    pub value: f64,
}

fn default_delta() -> f64 {
    10.0
}

fn default_rules() -> String {
    "config/rules.json".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_sem() -> String {
    "instant".to_string()
}

impl DaemonConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        if !(config.delta.is_finite() && config.delta > 0.0) {
            anyhow::bail!("delta must be a positive number of seconds");
        }
        Ok(config)
    }

    /// Engine options for a source covering `window` (archives only).
    pub fn engine_options(
        &self,
        window: Option<(RealTime, RealTime)>,
        fallback_host: &str,
    ) -> EngineOptions {
        let offset = |off: Option<f64>| window.zip(off).map(|((first, _), off)| first + off);
        EngineOptions {
            default_host: self
                .default_host
                .clone()
                .unwrap_or_else(|| fallback_host.to_string()),
            default_delta: self.delta,
            quiet: self.quiet,
            verbose: self.verbose,
            start: offset(self.start_offset_secs),
            stop: offset(self.stop_offset_secs),
        }
    }
}

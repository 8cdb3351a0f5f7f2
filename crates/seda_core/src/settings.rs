use std::collections::BTreeMap;
use std::path::Path;

use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use seda_error::{Result, ResultExt};
use serde::Deserialize;

use crate::history::{DEFAULT_MAX_EVENT_HOPS, EventHistoryConfig};
use crate::stage::StageProperties;

const ENV_PREFIX: &str = "SEDA";
const ENV_SEPARATOR: &str = "__";

/// Pipeline configuration.
///
/// Values from a file can be overridden by environment variables prefixed
/// with `SEDA__`, e.g. `SEDA__EVENT_HISTORY=true`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SedaSettings {
    #[serde(default)]
    pub event_history: bool,
    #[serde(default = "default_max_event_hops")]
    pub max_event_hops: u32,
    #[serde(default)]
    pub thread_pools: Vec<ThreadPoolSettings>,
    #[serde(default)]
    pub stages: Vec<StageSettings>,
}

fn default_max_event_hops() -> u32 {
    DEFAULT_MAX_EVENT_HOPS
}

impl Default for SedaSettings {
    fn default() -> Self {
        SedaSettings {
            event_history: false,
            max_event_hops: DEFAULT_MAX_EVENT_HOPS,
            thread_pools: Vec::new(),
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadPoolSettings {
    pub name: String,
    /// Number of threads, less than 1 uses the number of CPUs.
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageSettings {
    pub name: String,
    /// Registered stage class, defaults to the stage name.
    #[serde(default)]
    pub class: Option<String>,
    /// Defaults to the `default` pool.
    #[serde(default)]
    pub thread_pool: Option<String>,
    #[serde(default)]
    pub next_stages: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl StageSettings {
    pub fn class(&self) -> &str {
        self.class.as_deref().unwrap_or(&self.name)
    }

    pub fn properties(&self) -> StageProperties {
        StageProperties::from(self.properties.clone())
    }
}

impl SedaSettings {
    /// Load settings from a TOML file, applying environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::base()
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()
            .context_fn(|| format!("Failed to load pipeline config from {}", path.display()))?;

        config
            .try_deserialize()
            .context("Failed to deserialize pipeline config")
    }

    /// Parse settings from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config = Self::base()
            .add_source(File::from_str(s, FileFormat::Toml))
            .build()
            .context("Failed to parse pipeline config")?;

        config
            .try_deserialize()
            .context("Failed to deserialize pipeline config")
    }

    fn base() -> ConfigBuilder<DefaultState> {
        Config::builder()
    }

    pub fn history_config(&self) -> EventHistoryConfig {
        EventHistoryConfig {
            enabled: self.event_history,
            max_hops: self.max_event_hops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full() {
        let settings = SedaSettings::from_toml_str(
            r#"
            event_history = true
            max_event_hops = 20

            [[thread_pools]]
            name = "default"
            count = 2

            [[thread_pools]]
            name = "io"

            [[stages]]
            name = "SessionStage"
            next_stages = ["ParseStage"]

            [[stages]]
            name = "metrics"
            class = "MetricsStage"
            thread_pool = "io"
            next_stages = ["timer", "SessionStage"]
            properties = { report_interval_ms = "500" }
            "#,
        )
        .unwrap();

        assert!(settings.event_history);
        assert_eq!(EventHistoryConfig::enabled(20), settings.history_config());
        assert_eq!(2, settings.thread_pools.len());
        assert_eq!(0, settings.thread_pools[1].count);

        let session = &settings.stages[0];
        assert_eq!("SessionStage", session.class());
        assert_eq!(None, session.thread_pool);

        let metrics = &settings.stages[1];
        assert_eq!("MetricsStage", metrics.class());
        assert_eq!(Some("io"), metrics.thread_pool.as_deref());
        assert_eq!(vec!["timer", "SessionStage"], metrics.next_stages);
        assert_eq!(
            Some(500),
            metrics
                .properties()
                .get_parsed::<u64>("report_interval_ms")
                .unwrap()
        );
    }

    #[test]
    fn defaults() {
        let settings = SedaSettings::from_toml_str(
            r#"
            [[thread_pools]]
            name = "default"
            "#,
        )
        .unwrap();

        assert_eq!(EventHistoryConfig::default(), settings.history_config());
        assert!(settings.stages.is_empty());
    }

    #[test]
    fn invalid_toml() {
        SedaSettings::from_toml_str("thread_pools = [").unwrap_err();
    }

    #[test]
    fn missing_file() {
        let err = SedaSettings::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}

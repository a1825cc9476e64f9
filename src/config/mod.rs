use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration.
///
/// Built once in `main` and handed down by reference; nothing else reads the
/// environment.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Scraper invocation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    #[serde(default)]
    pub channel_url: String,

    /// Explicit path to the scraper executable. Looked up when absent.
    #[serde(default)]
    pub binary: Option<PathBuf>,

    #[serde(default, deserialize_with = "loose::positive_int")]
    pub max_items: Option<u64>,

    #[serde(default, deserialize_with = "loose::flag")]
    pub verbose: bool,

    #[serde(default)]
    pub extra_args: String,

    #[serde(default = "default_rate_limit_preset")]
    pub rate_limit_preset: Option<String>,

    #[serde(default)]
    pub date_after: Option<String>,

    #[serde(default, deserialize_with = "loose::flag")]
    pub disable_auto_cutoff: bool,

    #[serde(default, deserialize_with = "loose::positive_int")]
    pub heartbeat_secs: Option<u64>,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true", deserialize_with = "loose::flag")]
    pub run_migrations: bool,

    #[serde(default, deserialize_with = "loose::positive_int")]
    pub retry_attempts: Option<u64>,

    #[serde(default, deserialize_with = "loose::positive_int")]
    pub retry_base_delay_ms: Option<u64>,

    #[serde(default, deserialize_with = "loose::positive_int")]
    pub retry_max_delay_ms: Option<u64>,
}

/// Pipeline configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default, deserialize_with = "loose::positive_int")]
    pub progress_interval: Option<u64>,

    #[serde(default, deserialize_with = "loose::flag")]
    pub skip_duplicate_logs: bool,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u64 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 250;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_PROGRESS_INTERVAL: u64 = 50;

fn default_rate_limit_preset() -> Option<String> {
    Some("sleep".to_string())
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/channel.duckdb")
}
fn default_true() -> bool {
    true
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            channel_url: String::new(),
            binary: None,
            max_items: None,
            verbose: false,
            extra_args: String::new(),
            rate_limit_preset: default_rate_limit_preset(),
            date_after: None,
            disable_auto_cutoff: false,
            heartbeat_secs: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
            retry_attempts: None,
            retry_base_delay_ms: None,
            retry_max_delay_ms: None,
        }
    }
}

// ── Accessors ────────────────────────────────────────────────────────────────

impl ScraperConfig {
    /// Preset alias passed to the scraper; `off` or blank disables it.
    pub fn rate_limit_preset(&self) -> Option<&str> {
        let preset = self.rate_limit_preset.as_deref()?.trim();
        if preset.is_empty() || preset.eq_ignore_ascii_case("off") {
            None
        } else {
            Some(preset)
        }
    }

    /// Operator-supplied YYYYMMDD cutoff, if any.
    pub fn date_after(&self) -> Option<&str> {
        self.date_after
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS))
    }
}

impl StorageConfig {
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
            .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
            .min(u32::MAX as u64) as u32
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS))
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS))
    }
}

impl PipelineConfig {
    pub fn progress_interval(&self) -> u64 {
        self.progress_interval.unwrap_or(DEFAULT_PROGRESS_INTERVAL)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("INGEST").separator("__"))
            .build()?;

        cfg.try_deserialize().context("Invalid configuration")
    }

    /// Apply command-line overrides on top of the loaded layers.
    pub fn with_overrides(
        mut self,
        channel_url: Option<String>,
        max_items: Option<u64>,
        date_after: Option<String>,
    ) -> Self {
        if let Some(url) = channel_url {
            self.scraper.channel_url = url;
        }
        if let Some(n) = max_items.filter(|n| *n > 0) {
            self.scraper.max_items = Some(n);
        }
        if let Some(date) = date_after {
            self.scraper.date_after = Some(date);
        }
        self
    }
}

/// Deserializers for loosely-typed values: env vars arrive as strings, TOML as
/// native types.
mod loose {
    use crate::utils::{is_truthy, parse_positive_int};
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(String),
    }

    impl Loose {
        fn into_text(self) -> String {
            match self {
                Loose::Bool(b) => b.to_string(),
                Loose::Int(n) => n.to_string(),
                Loose::Float(f) => f.to_string(),
                Loose::Str(s) => s,
            }
        }
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(is_truthy(&Loose::deserialize(d)?.into_text()))
    }

    pub fn positive_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let raw = Option::<Loose>::deserialize(d)?.map(Loose::into_text);
        Ok(parse_positive_int(raw.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> AppConfig {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap().try_deserialize().unwrap()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = from_pairs(&[]);
        assert_eq!(cfg.scraper.rate_limit_preset(), Some("sleep"));
        assert_eq!(cfg.scraper.heartbeat(), Duration::from_secs(30));
        assert_eq!(cfg.storage.retry_attempts(), 5);
        assert_eq!(cfg.storage.retry_base_delay(), Duration::from_millis(250));
        assert_eq!(cfg.storage.retry_max_delay(), Duration::from_millis(5000));
        assert_eq!(cfg.pipeline.progress_interval(), 50);
        assert!(cfg.storage.run_migrations);
        assert!(!cfg.scraper.verbose);
    }

    #[test]
    fn string_values_are_parsed_loosely() {
        let cfg = from_pairs(&[
            ("scraper.verbose", "yes"),
            ("scraper.max_items", "25.7"),
            ("scraper.heartbeat_secs", "-4"),
            ("storage.retry_attempts", "0"),
            ("pipeline.skip_duplicate_logs", "1"),
        ]);
        assert!(cfg.scraper.verbose);
        assert_eq!(cfg.scraper.max_items, Some(25));
        // invalid values fall back to defaults
        assert_eq!(cfg.scraper.heartbeat(), Duration::from_secs(30));
        assert_eq!(cfg.storage.retry_attempts(), 5);
        assert!(cfg.pipeline.skip_duplicate_logs);
    }

    #[test]
    fn rate_limit_preset_can_be_disabled() {
        let off = from_pairs(&[("scraper.rate_limit_preset", "OFF")]);
        assert_eq!(off.scraper.rate_limit_preset(), None);
        let blank = from_pairs(&[("scraper.rate_limit_preset", "  ")]);
        assert_eq!(blank.scraper.rate_limit_preset(), None);
    }

    #[test]
    fn overrides_replace_loaded_values() {
        let cfg = AppConfig::default().with_overrides(
            Some("https://www.youtube.com/@someone".into()),
            Some(10),
            Some("20240101".into()),
        );
        assert_eq!(cfg.scraper.channel_url, "https://www.youtube.com/@someone");
        assert_eq!(cfg.scraper.max_items, Some(10));
        assert_eq!(cfg.scraper.date_after(), Some("20240101"));
    }
}

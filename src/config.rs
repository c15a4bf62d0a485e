//! Configuration
//!
//! Settings come from an optional TOML file. Every field has a built-in
//! default, so an empty file (or no file at all) yields a working setup.
//! Command-line flags override file values in the binary.
//!
//! ```toml
//! [classifier]
//! threshold = 0.9
//! frame_interval_ms = 100
//!
//! [scale]
//! device = "/sys/bus/iio/devices/iio:device0/in_voltage0_raw"
//! ratio = -1363.992
//!
//! [tracker]
//! history = "aligned"
//!
//! [pricing]
//! unknown_label = "fallback"
//!
//! [billing]
//! endpoint = "https://automaticbilling-ivrf.onrender.com"
//! ```

use crate::error::ConfigError;
use crate::types::{HistoryMode, UnknownLabelPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "autobill.toml";

/// Default ledger endpoint
pub const DEFAULT_ENDPOINT: &str = "https://automaticbilling-ivrf.onrender.com";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub classifier: ClassifierConfig,
    pub scale: ScaleConfig,
    pub tracker: TrackerConfig,
    pub pricing: PricingConfig,
    pub billing: BillingConfig,
    pub logging: LoggingConfig,
}

/// Frame acceptance and cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// A label is accepted when its score is strictly above this
    pub threshold: f64,
    /// Minimum time between processed frames
    pub frame_interval_ms: u64,
    /// Label order override; empty means model order
    pub labels: Vec<String>,
    /// Frames buffered ahead of the checkout loop during replay. A live
    /// runner only ever hands over its newest frame.
    pub channel_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            frame_interval_ms: 100,
            labels: Vec::new(),
            channel_capacity: 32,
        }
    }
}

impl ClassifierConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Load cell settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Raw channel of the load cell ADC
    pub device: PathBuf,
    /// Raw counts per gram
    pub ratio: f64,
    /// Raw reads averaged into one weight sample
    pub samples: usize,
    /// Raw reads averaged into the tare offset
    pub tare_samples: usize,
    /// Wait before each weight sample
    pub settle_ms: u64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_voltage0_raw"),
            ratio: -1363.992,
            samples: 20,
            tare_samples: 20,
            settle_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub history: HistoryMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub unknown_label: UnknownLabelPolicy,
    /// Id given to the first billing record
    pub first_id: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            unknown_label: UnknownLabelPolicy::default(),
            first_id: 1,
        }
    }
}

/// Ledger submission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub endpoint: String,
    pub path: String,
    pub timeout_secs: u64,
    /// Pause after every submission attempt
    pub post_delay_ms: u64,
    /// Records waiting for the ledger before the checkout loop has to wait
    pub queue_capacity: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            path: "/product".to_string(),
            timeout_secs: 10,
            post_delay_ms: 1000,
            queue_capacity: 64,
        }
    }
}

impl BillingConfig {
    /// Full URL records are posted to
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn post_delay(&self) -> Duration {
        Duration::from_millis(self.post_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `autobill.toml` in the
    /// working directory is used when present, otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Reject values the checkout cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.classifier.threshold;
        if !(0.0..1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "classifier.threshold must be in [0, 1), got {threshold}"
            )));
        }
        if self.classifier.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "classifier.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.scale.ratio == 0.0 || !self.scale.ratio.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "scale.ratio must be a non-zero number, got {}",
                self.scale.ratio
            )));
        }
        if self.scale.samples == 0 || self.scale.tare_samples == 0 {
            return Err(ConfigError::Invalid(
                "scale.samples and scale.tare_samples must be at least 1".to_string(),
            ));
        }
        if self.billing.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "billing.queue_capacity must be at least 1".to_string(),
            ));
        }
        let endpoint = &self.billing.endpoint;
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "billing.endpoint must be an http(s) URL, got {endpoint:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.classifier.threshold, 0.9);
        assert_eq!(config.classifier.frame_interval(), Duration::from_millis(100));
        assert_eq!(config.scale.ratio, -1363.992);
        assert_eq!(config.tracker.history, HistoryMode::Aligned);
        assert_eq!(config.pricing.unknown_label, UnknownLabelPolicy::Fallback);
        assert_eq!(config.billing.post_delay(), Duration::from_secs(1));
        assert_eq!(config.billing.queue_capacity, 64);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [tracker]
            history = "legacy"

            [billing]
            endpoint = "http://localhost:8080/"
            post_delay_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.tracker.history, HistoryMode::Legacy);
        assert_eq!(config.billing.url(), "http://localhost:8080/product");
        assert_eq!(config.billing.timeout_secs, 10);
        assert_eq!(config.scale.samples, 20);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[classifier]\nthreshold = 1.0",
            "[classifier]\nchannel_capacity = 0",
            "[scale]\nratio = 0.0",
            "[scale]\nsamples = 0",
            "[billing]\nendpoint = \"ftp://ledger\"",
            "[billing]\nqueue_capacity = 0",
        ];
        for case in cases {
            let err = Config::from_toml_str(case).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{case}: {err}");
        }
    }

    #[test]
    fn test_unknown_enum_value_is_parse_error() {
        let err = Config::from_toml_str("[pricing]\nunknown_label = \"ignore\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[classifier]\nthreshold = 0.75\nlabels = [\"Coke\", \"Apple\"]").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.classifier.threshold, 0.75);
        assert_eq!(config.classifier.labels, vec!["Coke", "Apple"]);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.pricing.unknown_label = UnknownLabelPolicy::Reject;
        let text = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&text).unwrap(), config);
    }
}

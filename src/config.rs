//! TOML configuration for the log intelligence engine.
//!
//! Every section has compiled-in defaults so an empty file (or no file) is a
//! valid configuration. Values are validated once at startup by
//! [`EngineConfig::validate`]; out-of-range values are rejected, never clamped.
//! The validated config is passed by reference into every pipeline stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalize::Field;

/// Environment variable that points at a config file.
pub const CONFIG_ENV: &str = "LOGINTEL_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "logintel.toml";

/// Longest accepted window or series bucket: one week.
pub const MAX_WINDOW_SECS: i64 = 7 * 86_400;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSource {
    Env,
    Local,
}

/// A config file that exists but could not be loaded.
#[derive(Debug)]
pub struct ConfigFallback {
    pub path: PathBuf,
    pub error: anyhow::Error,
    pub origin: FallbackSource,
}

impl ConfigFallback {
    pub fn log(&self) {
        match self.origin {
            FallbackSource::Env => warn!(
                path = %self.path.display(),
                error = %self.error,
                "LOGINTEL_CONFIG set but file could not be loaded, trying fallback"
            ),
            FallbackSource::Local => warn!(
                path = %self.path.display(),
                error = %self.error,
                "local config file exists but could not be loaded, using defaults"
            ),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one analysis run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub normalizer: NormalizerConfig,
    pub window: WindowConfig,
    pub detection: DetectionConfig,
    pub ml: MlConfig,
    pub risk: RiskConfig,
    pub health: HealthConfig,
    pub analytics: AnalyticsConfig,
    pub logging: LoggingConfig,
    /// Worker threads for the data-parallel stages. `0` or `1` runs serially.
    pub workers: usize,
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to load config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("malformed TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Try, in order: the file named by `LOGINTEL_CONFIG`, `./logintel.toml`,
    /// then compiled-in defaults. Files that exist but fail to load are
    /// skipped and returned so the caller can report them once logging is up.
    pub fn discover() -> (Self, Vec<ConfigFallback>) {
        let mut skipped = Vec::new();
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(env_path);
            match Self::load(&path) {
                Ok(cfg) => return (cfg, skipped),
                Err(error) => skipped.push(ConfigFallback {
                    path,
                    error,
                    origin: FallbackSource::Env,
                }),
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(&local) {
                Ok(cfg) => return (cfg, skipped),
                Err(error) => skipped.push(ConfigFallback {
                    path: local,
                    error,
                    origin: FallbackSource::Local,
                }),
            }
        }

        debug!("no usable config file found, using compiled-in defaults");
        (Self::default(), skipped)
    }

    /// Reject invalid thresholds, fractions and weights.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.normalizer.validate()?;
        self.window.validate()?;
        self.detection.validate()?;
        self.ml.validate()?;
        self.risk.validate()?;
        self.health.validate()?;
        self.analytics.validate()?;
        Ok(())
    }

    /// Effective worker count (at least one).
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Endpoints treated as authentication attempts (case-insensitive).
    pub auth_paths: Vec<String>,
    /// Explicit column/key name to canonical field mapping. Overrides aliases.
    pub field_map: BTreeMap<String, Field>,
    /// Year assumed for RFC 3164 syslog timestamps. Defaults to the current year.
    pub syslog_year: Option<i32>,
    /// How many failed lines to keep as samples in the parse report.
    pub max_failure_samples: usize,
    /// Static CIDR to country code table used when records carry no country.
    pub geo_ranges: BTreeMap<String, String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            auth_paths: ["/login", "/auth", "/signin", "/authenticate", "/token"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            field_map: BTreeMap::new(),
            syslog_year: None,
            max_failure_samples: 20,
            geo_ranges: BTreeMap::new(),
        }
    }
}

impl NormalizerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (cidr, country) in &self.geo_ranges {
            crate::normalize::geo::parse_cidr(cidr)
                .map_err(|e| invalid("normalizer.geo_ranges", e.to_string()))?;
            if country.trim().is_empty() {
                return Err(invalid("normalizer.geo_ranges", format!("empty country for {}", cidr)));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Windowing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Entity window size in seconds.
    pub size_secs: i64,
    /// Bucket size for the batch-wide traffic series.
    pub series_bucket_secs: i64,
    /// Rolling window (in buckets) for spike z-scores.
    pub spike_window: usize,
    /// Absolute z-score above which a bucket is a spike.
    pub spike_threshold: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_secs: 300,
            series_bucket_secs: 3600,
            spike_window: 20,
            spike_threshold: 2.5,
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        bucket_secs("window.size_secs", self.size_secs)?;
        bucket_secs("window.series_bucket_secs", self.series_bucket_secs)?;
        if self.spike_window < 2 {
            return Err(invalid("window.spike_window", "must be at least 2"));
        }
        positive("window.spike_threshold", self.spike_threshold)
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Failed auth attempts against one target inside one window.
    pub brute_force_threshold: u32,
    /// Consecutive windows for the sustained brute-force variant.
    pub sustained_windows: usize,
    /// Minimum focused failures in each of the sustained windows.
    pub sustained_min_failures: u32,
    /// Raw-event burst span: `brute_force_threshold` failures inside this many
    /// seconds escalate the finding one tier.
    pub burst_secs: i64,
    /// Distinct user identifiers tried from one IP inside one window.
    pub stuffing_min_users: u32,
    /// Upper bound on mean attempts per identifier for stuffing.
    pub stuffing_max_attempts_per_user: f64,
    /// Distinct IPs sharing one request signature.
    pub botnet_min_ips: usize,
    /// Requests an IP window needs before its signature is considered.
    pub botnet_min_requests: u32,
    /// Resolution of the inter-arrival timing component of the signature.
    pub botnet_cadence_secs: f64,
    /// Distinct countries for one user before a geo anomaly is raised.
    pub geo_min_countries: usize,
    /// Hits separated by at most this many buckets are merged into one finding.
    pub coalesce_gap_windows: i64,
    pub tiers: SeverityTiers,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            brute_force_threshold: 10,
            sustained_windows: 3,
            sustained_min_failures: 3,
            burst_secs: 60,
            stuffing_min_users: 10,
            stuffing_max_attempts_per_user: 2.0,
            botnet_min_ips: 5,
            botnet_min_requests: 3,
            botnet_cadence_secs: 1.0,
            geo_min_countries: 3,
            coalesce_gap_windows: 1,
            tiers: SeverityTiers::default(),
        }
    }
}

/// Severity escalation expressed as multiples of a rule's threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityTiers {
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityTiers {
    fn default() -> Self {
        Self {
            high: 2.0,
            critical: 4.0,
        }
    }
}

impl DetectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.brute_force_threshold == 0 {
            return Err(invalid("detection.brute_force_threshold", "must be at least 1"));
        }
        if self.sustained_windows < 2 {
            return Err(invalid("detection.sustained_windows", "must be at least 2"));
        }
        if self.sustained_min_failures == 0 {
            return Err(invalid("detection.sustained_min_failures", "must be at least 1"));
        }
        bucket_secs("detection.burst_secs", self.burst_secs)?;
        if self.stuffing_min_users < 2 {
            return Err(invalid("detection.stuffing_min_users", "must be at least 2"));
        }
        positive(
            "detection.stuffing_max_attempts_per_user",
            self.stuffing_max_attempts_per_user,
        )?;
        if self.botnet_min_ips < 2 {
            return Err(invalid("detection.botnet_min_ips", "must be at least 2"));
        }
        positive("detection.botnet_cadence_secs", self.botnet_cadence_secs)?;
        if self.geo_min_countries < 2 {
            return Err(invalid("detection.geo_min_countries", "must be at least 2"));
        }
        if self.coalesce_gap_windows < 0 {
            return Err(invalid("detection.coalesce_gap_windows", "must not be negative"));
        }
        if !(self.tiers.high >= 1.0 && self.tiers.critical >= self.tiers.high) {
            return Err(invalid(
                "detection.tiers",
                format!(
                    "expected 1 <= high <= critical, got high={} critical={}",
                    self.tiers.high, self.tiers.critical
                ),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ML
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Fraction of windows flagged as outliers.
    pub contamination: f64,
    pub trees: usize,
    pub sample_size: usize,
    /// Requested number of behavioral clusters.
    pub clusters: usize,
    pub max_iterations: usize,
    pub restarts: usize,
    pub seed: u64,
    /// Error or failed-auth rate marking a cluster as suspicious.
    pub suspicious_error_rate: f64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            trees: 100,
            sample_size: 256,
            clusters: 4,
            max_iterations: 100,
            restarts: 10,
            seed: 42,
            suspicious_error_rate: 0.3,
        }
    }
}

impl MlConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(invalid(
                "ml.contamination",
                format!("must be in (0, 0.5], got {}", self.contamination),
            ));
        }
        if self.trees == 0 {
            return Err(invalid("ml.trees", "must be at least 1"));
        }
        if self.sample_size < 2 {
            return Err(invalid("ml.sample_size", "must be at least 2"));
        }
        if self.clusters == 0 {
            return Err(invalid("ml.clusters", "must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(invalid("ml.max_iterations", "must be at least 1"));
        }
        if self.restarts == 0 {
            return Err(invalid("ml.restarts", "must be at least 1"));
        }
        fraction("ml.suspicious_error_rate", self.suspicious_error_rate)
    }
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    /// Batches parsing below this success rate get their profiles flagged.
    pub min_parse_rate: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            min_parse_rate: 0.5,
        }
    }
}

/// Weights of the composite risk factors. Each factor is normalized to
/// 0..=100 before weighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub threat: f64,
    pub anomaly: f64,
    pub auth_failure: f64,
    pub geo: f64,
    pub archetype: f64,
    pub volume: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            threat: 0.25,
            anomaly: 0.25,
            auth_failure: 0.20,
            geo: 0.10,
            archetype: 0.10,
            volume: 0.10,
        }
    }
}

impl RiskWeights {
    pub fn as_pairs(&self) -> [(&'static str, f64); 6] {
        [
            ("threat", self.threat),
            ("anomaly", self.anomaly),
            ("auth_failure", self.auth_failure),
            ("geo", self.geo),
            ("archetype", self.archetype),
            ("volume", self.volume),
        ]
    }
}

impl RiskConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut total = 0.0;
        for (name, w) in self.weights.as_pairs() {
            if !w.is_finite() || w < 0.0 {
                return Err(invalid(
                    "risk.weights",
                    format!("weight `{}` must be finite and non-negative, got {}", name, w),
                ));
            }
            total += w;
        }
        if total <= 0.0 {
            return Err(invalid("risk.weights", "at least one weight must be positive"));
        }
        fraction("risk.min_parse_rate", self.min_parse_rate)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub sla_p95_ms: f64,
    pub sla_p99_ms: f64,
    /// Error rate (fraction) above which the SLA is breached.
    pub sla_error_rate: f64,
    /// Availability (fraction) below which the SLA is breached.
    pub sla_availability: f64,
    /// Error rate mapped to an error score of zero.
    pub max_error_rate: f64,
    /// p95 above this multiple of the service's own median flags a bottleneck.
    pub bottleneck_multiple: f64,
    pub bottleneck_penalty: f64,
    pub error_weight: f64,
    pub latency_weight: f64,
    pub green_threshold: f64,
    pub amber_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sla_p95_ms: 500.0,
            sla_p99_ms: 1000.0,
            sla_error_rate: 0.05,
            sla_availability: 0.995,
            max_error_rate: 0.10,
            bottleneck_multiple: 3.0,
            bottleneck_penalty: 10.0,
            error_weight: 0.6,
            latency_weight: 0.4,
            green_threshold: 85.0,
            amber_threshold: 60.0,
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("health.sla_p95_ms", self.sla_p95_ms)?;
        positive("health.sla_p99_ms", self.sla_p99_ms)?;
        fraction("health.sla_error_rate", self.sla_error_rate)?;
        fraction("health.sla_availability", self.sla_availability)?;
        if !(self.max_error_rate > 0.0 && self.max_error_rate <= 1.0) {
            return Err(invalid("health.max_error_rate", "must be in (0, 1]"));
        }
        if !(self.bottleneck_multiple > 1.0) {
            return Err(invalid("health.bottleneck_multiple", "must be greater than 1"));
        }
        if !(self.bottleneck_penalty >= 0.0 && self.bottleneck_penalty <= 100.0) {
            return Err(invalid("health.bottleneck_penalty", "must be in [0, 100]"));
        }
        for (field, w) in [
            ("health.error_weight", self.error_weight),
            ("health.latency_weight", self.latency_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(invalid(field, "must be finite and non-negative"));
            }
        }
        if self.error_weight + self.latency_weight <= 0.0 {
            return Err(invalid("health.error_weight", "weights must not both be zero"));
        }
        if !(self.amber_threshold < self.green_threshold && self.green_threshold <= 100.0) {
            return Err(invalid(
                "health.green_threshold",
                "expected amber_threshold < green_threshold <= 100",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Usage and trend analytics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// How many endpoints the usage report ranks.
    pub top_endpoints: usize,
    /// Fitted slope (units per hour) beyond which a trend is rising or falling.
    pub trend_slope: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            top_endpoints: 10,
            trend_slope: 0.5,
        }
    }
}

impl AnalyticsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.top_endpoints == 0 {
            return Err(invalid("analytics.top_endpoints", "must be at least 1"));
        }
        if !(self.trend_slope.is_finite() && self.trend_slope >= 0.0) {
            return Err(invalid(
                "analytics.trend_slope",
                format!("must be a non-negative number, got {}", self.trend_slope),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn positive(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be a positive number, got {}", v)))
    }
}

fn bucket_secs(field: &'static str, v: i64) -> Result<(), ConfigError> {
    if (1..=MAX_WINDOW_SECS).contains(&v) {
        Ok(())
    } else {
        Err(invalid(
            field,
            format!("must be between 1 and {} seconds, got {}", MAX_WINDOW_SECS, v),
        ))
    }
}

fn fraction(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be in [0, 1], got {}", v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = EngineConfig::from_toml("").unwrap();
        assert_eq!(cfg.window.size_secs, 300);
        assert_eq!(cfg.detection.brute_force_threshold, 10);
        assert_eq!(cfg.risk.weights, RiskWeights::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg = EngineConfig::from_toml(
            r#"
            [ml]
            clusters = 6

            [detection]
            brute_force_threshold = 25
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ml.clusters, 6);
        assert_eq!(cfg.ml.contamination, 0.05);
        assert_eq!(cfg.detection.brute_force_threshold, 25);
        assert_eq!(cfg.detection.stuffing_min_users, 10);
    }

    #[test]
    fn oversized_window_is_rejected() {
        let err = EngineConfig::from_toml("[window]\nsize_secs = 9223372036854775\n").unwrap_err();
        assert!(format!("{:#}", err).contains("window.size_secs"));

        let mut cfg = EngineConfig::default();
        cfg.window.size_secs = MAX_WINDOW_SECS;
        cfg.validate().unwrap();
        cfg.window.series_bucket_secs = MAX_WINDOW_SECS + 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "window.series_bucket_secs", .. })
        ));
    }

    #[test]
    fn negative_weight_is_rejected_not_clamped() {
        let mut cfg = EngineConfig::default();
        cfg.risk.weights.anomaly = -0.1;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "risk.weights", .. }));
    }

    #[test]
    fn zero_weights_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.risk.weights = RiskWeights {
            threat: 0.0,
            anomaly: 0.0,
            auth_failure: 0.0,
            geo: 0.0,
            archetype: 0.0,
            volume: 0.0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn contamination_out_of_range_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.ml.contamination = 0.0;
        assert!(cfg.validate().is_err());
        cfg.ml.contamination = 0.7;
        assert!(cfg.validate().is_err());
        cfg.ml.contamination = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.detection.brute_force_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_file_content_fails_load() {
        let err = EngineConfig::from_toml("[window]\nsize_secs = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("window.size_secs"));
    }

    #[test]
    fn malformed_geo_range_is_rejected() {
        let err = EngineConfig::from_toml("[normalizer.geo_ranges]\n\"10.0.0.0/33\" = \"US\"\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("normalizer.geo_ranges"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logintel.toml");
        std::fs::write(&path, "workers = 4\n[health]\nsla_p95_ms = 250.0\n").unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.worker_count(), 4);
        assert_eq!(cfg.health.sla_p95_ms, 250.0);
    }
}

//! Single-pass batch pipeline.
//!
//! Stages run in strict dependency order over a batch held in memory:
//! normalize, aggregate, detect, ML, score, alert. The abort signal is
//! checked between stages, never inside one. A failed ML stage is reported
//! in [`AnalysisReport::ml_status`] and every other artifact is still built.

use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alerts::{self, Alert, AlertSummary};
use crate::analysis::series::{service_latency_spikes, traffic_series, TrafficSeries};
use crate::analysis::service::service_stats;
use crate::analysis::trend::trend_report;
use crate::analysis::usage::usage_report;
use crate::analysis::{EntityWindow, FeatureAggregator, ServiceSpikes, ServiceStats, TrendReport, UsageReport};
use crate::config::{ConfigError, EngineConfig};
use crate::detect::{DetectionEngine, ThreatFinding};
use crate::ml::{self, BehaviorReport};
use crate::normalize::{normalize_batch, FormatHint, GeoResolver, LogEvent, ParseStats, StaticGeoResolver};
use crate::score::health::{overall_health, score_services};
use crate::score::reputation::ip_reputation;
use crate::score::risk::score_entities;
use crate::score::{HealthScore, IpReputation, RiskProfile};

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("analysis aborted before the {stage} stage")]
    Aborted { stage: &'static str },
}

/// Outcome of the ML stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MlStatus {
    Completed,
    Failed { reason: String },
}

/// Every artifact of one run. Immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub engine_version: &'static str,
    pub parse: ParseStats,
    pub parse_success_rate: f64,
    pub events: usize,
    pub windows: Vec<EntityWindow>,
    pub services: Vec<ServiceStats>,
    pub series: TrafficSeries,
    /// Latency spikes of individual services, only those with a spike.
    pub service_spikes: Vec<ServiceSpikes>,
    pub trends: TrendReport,
    pub usage: UsageReport,
    pub findings: Vec<ThreatFinding>,
    pub ml_status: MlStatus,
    pub behavior: Option<BehaviorReport>,
    pub risk: Vec<RiskProfile>,
    pub reputation: Vec<IpReputation>,
    pub health: Vec<HealthScore>,
    pub overall_health: f64,
    pub alerts: Vec<Alert>,
    pub alert_summary: AlertSummary,
}

pub struct Pipeline<'a> {
    config: &'a EngineConfig,
    cancel: CancellationToken,
    resolver: Option<&'a dyn GeoResolver>,
}

impl<'a> Pipeline<'a> {
    /// Validates `config` once; every stage then borrows it.
    pub fn new(config: &'a EngineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            resolver: None,
        })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the resolver built from `normalizer.geo_ranges`.
    pub fn with_resolver(mut self, resolver: &'a dyn GeoResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn checkpoint(&self, stage: &'static str) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            warn!(stage, "abort requested, stopping at stage boundary");
            return Err(PipelineError::Aborted { stage });
        }
        Ok(())
    }

    /// Analyze a whole input text, one record per line.
    pub fn run_text(&self, input: &str, hint: FormatHint) -> Result<AnalysisReport, PipelineError> {
        self.run(input.lines(), hint)
    }

    pub fn run<'l, I>(&self, lines: I, hint: FormatHint) -> Result<AnalysisReport, PipelineError>
    where
        I: IntoIterator<Item = &'l str>,
    {
        let started = Instant::now();
        let cfg = self.config;
        let workers = cfg.worker_count();

        self.checkpoint("normalize")?;
        let table = StaticGeoResolver::from_table(&cfg.normalizer.geo_ranges).map_err(|e| {
            ConfigError::Invalid {
                field: "normalizer.geo_ranges",
                reason: e.to_string(),
            }
        })?;
        let resolver: Option<&dyn GeoResolver> = match self.resolver {
            Some(r) => Some(r),
            None if !table.is_empty() => Some(&table),
            None => None,
        };
        let batch = normalize_batch(lines, hint, &cfg.normalizer, resolver);
        let parse_rate = batch.stats.success_rate();
        let events: Vec<LogEvent> = batch.events;

        self.checkpoint("aggregate")?;
        let windows = FeatureAggregator::new(&cfg.window, workers).aggregate_all(&events);
        let services = service_stats(&events);
        let series = traffic_series(&events, &cfg.window);
        let service_spikes = service_latency_spikes(&events, &cfg.window);
        let trends = trend_report(&events, &cfg.analytics);
        let usage = usage_report(&events, &cfg.analytics);
        info!(
            windows = windows.len(),
            services = services.len(),
            spikes = series.spikes.len(),
            sessions = usage.session_summary.total_sessions,
            "aggregation complete"
        );

        self.checkpoint("detect")?;
        let findings = DetectionEngine::new(&cfg.detection, &cfg.window, workers).detect(&windows, &events);

        self.checkpoint("ml")?;
        let (ml_status, behavior) = match ml::analyze(&windows, &cfg.ml) {
            Ok(report) => (MlStatus::Completed, Some(report)),
            Err(e) => {
                warn!(error = %e, "behavior analysis failed, continuing without anomaly scores");
                (MlStatus::Failed { reason: e.to_string() }, None)
            }
        };

        self.checkpoint("score")?;
        let risk = score_entities(&windows, &findings, behavior.as_ref(), parse_rate, &cfg.risk);
        let reputation = ip_reputation(&events);
        let health = score_services(&services, parse_rate, cfg.risk.min_parse_rate, &cfg.health);

        self.checkpoint("alert")?;
        let alerts = alerts::generate(&findings, &health, &series.spikes, &risk);
        let alert_summary = AlertSummary::of(&alerts);

        info!(
            events = events.len(),
            findings = findings.len(),
            alerts = alerts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );
        Ok(AnalysisReport {
            engine_version: env!("CARGO_PKG_VERSION"),
            parse: batch.stats,
            parse_success_rate: parse_rate,
            events: events.len(),
            windows,
            services,
            series,
            service_spikes,
            trends,
            usage,
            findings,
            ml_status,
            behavior,
            risk,
            reputation,
            overall_health: overall_health(&health),
            health,
            alerts,
            alert_summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_token_aborts_before_first_stage() {
        let cfg = EngineConfig::default();
        let token = CancellationToken::new();
        token.cancel();
        let err = Pipeline::new(&cfg)
            .unwrap()
            .with_cancel(token)
            .run_text("", FormatHint::Auto)
            .unwrap_err();
        assert_eq!(err, PipelineError::Aborted { stage: "normalize" });
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut cfg = EngineConfig::default();
        cfg.ml.clusters = 0;
        assert!(matches!(Pipeline::new(&cfg), Err(PipelineError::Config(_))));
    }

    #[test]
    fn empty_input_yields_empty_report() {
        let cfg = EngineConfig::default();
        let report = Pipeline::new(&cfg).unwrap().run_text("", FormatHint::Auto).unwrap();
        assert_eq!(report.events, 0);
        assert_eq!(report.parse_success_rate, 1.0);
        assert!(report.findings.is_empty());
        assert!(report.alerts.is_empty());
        assert_eq!(report.ml_status, MlStatus::Completed);
        assert_eq!(report.overall_health, 100.0);
        assert!(report.reputation.is_empty());
        assert!(report.service_spikes.is_empty());
        assert_eq!(report.usage.peak, None);
        assert_eq!(report.trends.latency_trend, None);
    }
}

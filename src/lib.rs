//! logintel -- log intelligence engine.
//!
//! This crate turns raw server and application logs into security and
//! performance intelligence: normalized events, per-entity behavioral
//! windows, rule-based threat findings mapped to MITRE ATT&CK, isolation
//! forest anomaly scores, behavioral clusters, composite risk and service
//! health scores, and alerts.

pub mod alerts;
pub mod analysis;
pub mod config;
pub mod detect;
pub mod evidence;
pub mod ml;
pub mod normalize;
pub mod parallel;
pub mod pipeline;
pub mod score;

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

pub use config::EngineConfig;
pub use pipeline::{AnalysisReport, Pipeline, PipelineError};

/// Read `path` and run the full pipeline on it.
pub fn analyze_file(
    path: &Path,
    hint: normalize::FormatHint,
    config: &EngineConfig,
    cancel: CancellationToken,
) -> Result<AnalysisReport> {
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read log file: {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = input.len(), "analyzing log file");
    let report = Pipeline::new(config)?
        .with_cancel(cancel)
        .run_text(&input, hint)?;
    Ok(report)
}

//! Report export.

use std::path::Path;

use anyhow::{Context, Result};

use crate::pipeline::AnalysisReport;

/// Render the full report as pretty-printed JSON.
pub fn render_json(report: &AnalysisReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to serialize analysis report")
}

/// Write the full report to `path` as pretty-printed JSON.
pub fn export_report(report: &AnalysisReport, path: &Path) -> Result<()> {
    let json = render_json(report)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, json)
        .with_context(|| format!("failed to write report: {}", path.display()))?;
    tracing::info!(path = %path.display(), alerts = report.alerts.len(), "report exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::normalize::FormatHint;
    use crate::pipeline::Pipeline;

    #[test]
    fn exported_report_is_valid_json() {
        let cfg = EngineConfig::default();
        let report = Pipeline::new(&cfg)
            .unwrap()
            .run_text(
                r#"{"timestamp":"2024-05-01T10:00:00Z","ip":"10.0.0.1","endpoint":"/api","status":200,"latency_ms":12}"#,
                FormatHint::Auto,
            )
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");
        export_report(&report, &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["events"], 1);
        assert_eq!(value["ml_status"]["status"], "completed");
        assert_eq!(value["windows"][0]["id"], "ip:10.0.0.1@5715192");
    }
}

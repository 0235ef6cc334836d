//! Brute force: repeated failed authentication against a single target.
//!
//! "Focused" failures are the largest per-target failure count in a window,
//! so one IP spraying many accounts once each never counts here.

use crate::analysis::{EntityKind, EntityWindow};
use crate::detect::{DetectContext, EntityHistory, EntityRule, RuleHit, Severity, Technique};

pub struct BruteForceRule;

impl BruteForceRule {
    /// True when `threshold` failed auth events fall within `span_secs`.
    fn has_burst(window: &EntityWindow, ctx: &DetectContext<'_>) -> bool {
        let threshold = ctx.config.brute_force_threshold as usize;
        let times: Vec<i64> = ctx
            .window_events(window)
            .into_iter()
            .filter(|e| e.is_failed_auth())
            .map(|e| e.timestamp.timestamp_millis())
            .collect();
        if times.len() < threshold {
            return false;
        }
        let span_ms = ctx.config.burst_secs * 1000;
        times
            .windows(threshold)
            .any(|w| w[threshold - 1] - w[0] <= span_ms)
    }
}

impl EntityRule for BruteForceRule {
    fn technique(&self) -> Technique {
        Technique::BruteForce
    }

    fn applies_to(&self, _kind: EntityKind) -> bool {
        true
    }

    fn scan(&self, history: &EntityHistory<'_>, ctx: &DetectContext<'_>) -> Vec<RuleHit> {
        let cfg = ctx.config;
        let threshold = cfg.brute_force_threshold as f64;
        let mut hits = Vec::new();

        for window in &history.windows {
            let focused = window.max_failures_per_target() as f64;
            if focused < threshold {
                continue;
            }
            let mut severity = Severity::from_ratio(focused, threshold, &cfg.tiers);
            let burst = Self::has_burst(window, ctx);
            if burst {
                severity = severity.escalate();
            }
            hits.push(
                RuleHit::for_window(Technique::BruteForce, window, severity)
                    .metric("focused_failures", focused)
                    .metric("failed_auth", window.features.failed_auth)
                    .metric("targets", window.failed_auth_by_target.len() as f64)
                    .metric("burst", if burst { 1.0 } else { 0.0 }),
            );
        }

        // Sustained variant: a run of consecutive windows each above the
        // lower per-window floor.
        for run in history.consecutive_runs() {
            let mut start = 0;
            while start < run.len() {
                let mut end = start;
                while end < run.len()
                    && run[end].max_failures_per_target() >= cfg.sustained_min_failures
                {
                    end += 1;
                }
                if end - start >= cfg.sustained_windows {
                    let span = &run[start..end];
                    let total: u32 = span.iter().map(|w| w.max_failures_per_target()).sum();
                    let severity = Severity::from_ratio(total as f64, threshold, &cfg.tiers);
                    if let Some(hit) = RuleHit::for_run(Technique::BruteForce, span, severity) {
                        hits.push(
                            hit.metric("sustained_windows", span.len() as f64)
                                .metric("sustained_failures", total as f64),
                        );
                    }
                }
                start = end.max(start + 1);
            }
        }
        hits
    }
}

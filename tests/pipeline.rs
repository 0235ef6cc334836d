//! End-to-end pipeline properties.

use std::collections::BTreeSet;

use logintel::analysis::EntityKind;
use logintel::detect::Technique;
use logintel::normalize::{FormatHint, LogFormat};
use logintel::score::RiskFlag;
use logintel::{AnalysisReport, EngineConfig, Pipeline};

fn json_line(secs: i64, ip: &str, user: Option<&str>, endpoint: &str, status: u16, latency: f64) -> String {
    let ts = chrono::DateTime::from_timestamp(1_714_557_600 + secs, 0)
        .unwrap()
        .to_rfc3339();
    let user = user
        .map(|u| format!(r#","user":"{}""#, u))
        .unwrap_or_default();
    format!(
        r#"{{"timestamp":"{}","ip":"{}"{},"endpoint":"{}","status":{},"latency_ms":{}}}"#,
        ts, ip, user, endpoint, status, latency
    )
}

fn run(lines: &[String], config: &EngineConfig) -> AnalysisReport {
    Pipeline::new(config)
        .unwrap()
        .run(lines.iter().map(String::as_str), FormatHint::Auto)
        .unwrap()
}

fn failed_logins(count: usize, user: &str) -> Vec<String> {
    (0..count)
        .map(|i| json_line(i as i64 * 10, "198.51.100.7", Some(user), "/login", 401, 40.0))
        .collect()
}

#[test]
fn twenty_failed_logins_raise_brute_force() {
    let report = run(&failed_logins(20, "admin"), &EngineConfig::default());
    let brute: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.technique == Technique::BruteForce)
        .collect();
    assert!(!brute.is_empty());
    let by_user = brute
        .iter()
        .find(|f| f.entity_kind == EntityKind::User && f.entity == "admin")
        .expect("user-level brute force finding");
    assert_eq!(by_user.evidence.len(), 1);
    assert_eq!(by_user.mitre.technique_id, "T1110");
    assert!(report.alerts.iter().any(|a| a.subjects.contains(&"admin".to_string())));
}

#[test]
fn nine_failed_logins_raise_nothing() {
    let report = run(&failed_logins(9, "admin"), &EngineConfig::default());
    assert!(report
        .findings
        .iter()
        .all(|f| f.technique != Technique::BruteForce));
}

#[test]
fn low_rate_failures_over_consecutive_windows_coalesce_into_one_finding() {
    // Four failures per five-minute window, four windows in a row: below the
    // per-window threshold, above the sustained floor.
    let lines: Vec<String> = (0..4)
        .flat_map(|w| (0..4).map(move |k| w * 300 + k * 20))
        .map(|secs| json_line(secs, "198.51.100.9", Some("svc"), "/login", 401, 25.0))
        .collect();
    let report = run(&lines, &EngineConfig::default());

    let by_ip: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.technique == Technique::BruteForce && f.entity_kind == EntityKind::Ip)
        .collect();
    assert_eq!(by_ip.len(), 1);
    let finding = by_ip[0];
    assert_eq!(finding.entity, "198.51.100.9");
    assert_eq!(finding.evidence.len(), 4);
    assert_eq!(finding.metrics["sustained_windows"], 4.0);
    assert_eq!(finding.end - finding.start, chrono::Duration::minutes(20));
}

#[test]
fn many_accounts_once_each_is_credential_stuffing() {
    let lines: Vec<String> = (0..50)
        .map(|i| json_line(i * 4, "203.0.113.50", Some(&format!("user{:02}", i)), "/login", 401, 35.0))
        .collect();
    let report = run(&lines, &EngineConfig::default());
    let from_ip: Vec<Technique> = report
        .findings
        .iter()
        .filter(|f| f.entity == "203.0.113.50")
        .map(|f| f.technique)
        .collect();
    assert_eq!(from_ip, vec![Technique::CredentialStuffing]);
    assert_eq!(report.findings[0].mitre.technique_id, "T1110.004");
}

#[test]
fn clustering_reduces_to_entity_count() {
    let config = EngineConfig::from_toml("[ml]\nclusters = 5\n").unwrap();
    let mut lines = Vec::new();
    for (ip, requests) in [("10.0.0.1", 1), ("10.0.0.2", 4), ("10.0.0.3", 12)] {
        for r in 0..requests {
            lines.push(json_line(r * 7, ip, None, "/home", 200, 20.0 + r as f64));
        }
    }
    let report = run(&lines, &config);
    let behavior = report.behavior.expect("ml stage completed");
    let ip = behavior
        .kinds
        .iter()
        .find(|k| k.kind == EntityKind::Ip)
        .unwrap();
    assert_eq!(ip.clusters.len(), 3);
    assert_eq!(ip.assignments.len(), 3);
}

#[test]
fn reruns_produce_identical_findings_and_health() {
    let mut lines = failed_logins(25, "root");
    for i in 0..200 {
        let ip = format!("192.0.2.{}", i % 17);
        let status = if i % 23 == 0 { 503 } else { 200 };
        let endpoint = ["/api/items", "/api/cart", "/home"][i % 3];
        lines.push(json_line(i as i64 * 13, &ip, Some(&format!("u{}", i % 11)), endpoint, status, 50.0 + (i % 40) as f64 * 9.0));
    }
    let config = EngineConfig::default();
    let a = run(&lines, &config);
    let b = run(&lines, &config);
    assert_eq!(a.findings, b.findings);
    assert_eq!(a.health, b.health);
    assert_eq!(a.alerts, b.alerts);

    let members = |r: &AnalysisReport| -> BTreeSet<Vec<String>> {
        r.behavior
            .as_ref()
            .unwrap()
            .kinds
            .iter()
            .flat_map(|k| k.clusters.iter().map(|c| c.members.clone()))
            .collect()
    };
    assert_eq!(members(&a), members(&b));
}

#[test]
fn low_parse_rate_is_flagged_on_scores() {
    let mut lines: Vec<String> = (0..6).map(|i| format!("garbage line {}", i)).collect();
    lines.push(json_line(0, "10.1.1.1", None, "/api", 200, 10.0));
    let report = run(&lines, &EngineConfig::default());
    assert_eq!(report.parse.format, Some(LogFormat::Json));
    assert!(report.parse_success_rate < 0.5);
    assert!(report.risk.iter().all(|p| p.flags.contains(&RiskFlag::LowParseRate)));
    assert!(!report.health.is_empty());
    assert!(report.health.iter().all(|h| !h.flags.is_empty()));
}

#[test]
fn usage_trends_and_reputation_are_reported() {
    let mut lines = Vec::new();
    for hour in 0..4i64 {
        for i in 0..5i64 {
            lines.push(json_line(
                hour * 3600 + i * 60,
                "192.0.2.10",
                Some("erin"),
                "/api/orders",
                200,
                100.0 + hour as f64 * 50.0,
            ));
        }
    }
    for i in 0..8i64 {
        lines.push(json_line(i * 30, "203.0.113.66", Some(&format!("acct{}", i)), "/login", 401, 20.0));
    }
    let report = run(&lines, &EngineConfig::default());

    let trend = report.trends.latency_trend.expect("latency trend");
    assert_eq!(trend.direction, logintel::analysis::TrendDirection::Increasing);
    assert_eq!(report.trends.hourly_latency.len(), 4);
    assert_eq!(report.usage.top_endpoints[0].endpoint, "/api/orders");
    assert_eq!(report.usage.top_endpoints[0].requests, 20);
    assert_eq!(report.reputation[0].ip.to_string(), "203.0.113.66");
    assert_eq!(report.reputation[0].unique_users, 8);
}

#[test]
fn common_log_format_end_to_end() {
    let lines: Vec<String> = (0..12)
        .map(|i| {
            format!(
                r#"203.0.113.9 - bob [01/May/2024:10:00:{:02} +0000] "POST /login HTTP/1.1" 401 128 "-" "curl/8.0""#,
                i * 4
            )
        })
        .collect();
    let report = run(&lines, &EngineConfig::default());
    assert_eq!(report.parse.format, Some(LogFormat::CommonLog));
    assert_eq!(report.events, 12);
    assert!(report
        .findings
        .iter()
        .any(|f| f.technique == Technique::BruteForce && f.entity == "203.0.113.9"));
}

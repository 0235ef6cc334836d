use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use logintel::config::{EngineConfig, LoggingConfig};
use logintel::detect::{Severity, Technique};
use logintel::normalize::{FormatHint, LogFormat};
use logintel::AnalysisReport;

#[derive(Parser)]
#[command(
    name = "logintel",
    about = "Log intelligence engine: threat detection, behavioral analytics and health scoring",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a log file and report findings, risk and service health
    Analyze {
        /// Log file, one record per line
        file: PathBuf,

        /// Input format: auto, json, clf, syslog or delimited
        #[arg(long, default_value = "auto")]
        format: String,

        /// Config file (defaults to $LOGINTEL_CONFIG, then ./logintel.toml)
        #[arg(long, env = "LOGINTEL_CONFIG")]
        config: Option<PathBuf>,

        /// Print the full report as JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Also write the full JSON report to this path
        #[arg(long)]
        output: Option<PathBuf>,

        /// Emit logs as JSON lines
        #[arg(long)]
        log_json: bool,
    },

    /// List detection techniques and their MITRE ATT&CK mapping
    Techniques,

    /// Print the effective default configuration as TOML
    Config,
}

fn parse_format(format: &str) -> Result<FormatHint> {
    if format.eq_ignore_ascii_case("auto") {
        return Ok(FormatHint::Auto);
    }
    let declared: LogFormat = format.parse().map_err(anyhow::Error::msg)?;
    Ok(FormatHint::Declared(declared))
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json || force_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_summary(report: &AnalysisReport) {
    println!("\n=== logintel Analysis Report ===");
    println!(
        "Lines:        {} parsed, {} failed ({:.1}% success)",
        report.parse.parsed,
        report.parse.failed,
        report.parse_success_rate * 100.0
    );
    println!("Windows:      {}", report.windows.len());
    println!("Findings:     {}", report.findings.len());
    println!("ML:           {:?}", report.ml_status);
    println!("Health:       {:.1}", report.overall_health);
    if let Some(t) = &report.trends.latency_trend {
        println!("Latency:      {:?} ({:+.2} ms/hour, r2 {:.2})", t.direction, t.slope, t.r_squared);
    }
    let sessions = &report.usage.session_summary;
    if sessions.total_sessions > 0 {
        println!(
            "Sessions:     {} ({:.1}% with errors, {:.1}% drop-off)",
            sessions.total_sessions, sessions.sessions_with_errors_pct, sessions.drop_off_rate_pct
        );
    }

    if !report.findings.is_empty() {
        println!("\n{:<10} | {:<20} | {:<10} | Entity", "Severity", "Technique", "MITRE");
        println!("{:-<10}-|-{:-<20}-|-{:-<10}-|-{:-<30}", "", "", "", "");
        for f in &report.findings {
            println!(
                "{:<10} | {:<20} | {:<10} | {} {}",
                f.severity, f.technique, f.mitre.technique_id, f.entity_kind, f.entity
            );
        }
    }

    let risky: Vec<_> = report.risk.iter().take(10).filter(|p| p.score > 0.0).collect();
    if !risky.is_empty() {
        println!("\n=== Top Risk ===");
        for p in risky {
            println!("{:>5.1}  {:<8}  {} {}", p.score, p.tier, p.kind, p.entity);
        }
    }

    let suspect: Vec<_> = report
        .reputation
        .iter()
        .filter(|r| r.tier >= Severity::High)
        .take(10)
        .collect();
    if !suspect.is_empty() {
        println!("\n=== IP Reputation ===");
        for r in suspect {
            println!(
                "{:>5.1}  {:<8}  {} ({} requests, {:.0}% failed, {} accounts)",
                r.score,
                r.tier,
                r.ip,
                r.requests,
                r.failure_ratio * 100.0,
                r.unique_users
            );
        }
    }

    if !report.health.is_empty() {
        println!("\n=== Service Health ===");
        for h in &report.health {
            println!(
                "{:>5.1}  {:<6}  {}{}",
                h.score,
                format!("{:?}", h.status).to_uppercase(),
                h.service,
                if h.bottleneck { "  (bottleneck)" } else { "" }
            );
        }
    }

    if !report.alerts.is_empty() {
        println!("\n=== Alerts ({}) ===", report.alert_summary.total);
        for a in &report.alerts {
            println!(" - [{}] {}: {}", a.severity, a.title, a.description);
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            file,
            format,
            config,
            json,
            output,
            log_json,
        } => {
            let hint = parse_format(&format)?;
            let (config, skipped) = match &config {
                Some(path) => (EngineConfig::load(path)?, Vec::new()),
                None => EngineConfig::discover(),
            };
            init_tracing(&config.logging, log_json);
            for fallback in &skipped {
                fallback.log();
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, aborting at next stage boundary");
                    on_signal.cancel();
                }
            });

            let report = tokio::task::spawn_blocking(move || {
                logintel::analyze_file(&file, hint, &config, cancel)
            })
            .await
            .context("analysis task panicked")??;

            if let Some(path) = &output {
                logintel::evidence::export_report(&report, path)?;
            }
            if json {
                println!("{}", logintel::evidence::render_json(&report)?);
            } else {
                print_summary(&report);
            }
        }
        Commands::Techniques => {
            println!("{:<20} | {:<10} | {:<30} | Tactic", "Technique", "MITRE", "Name");
            println!("{:-<20}-|-{:-<10}-|-{:-<30}-|-{:-<25}", "", "", "", "");
            for t in Technique::ALL {
                let m = t.mitre();
                println!(
                    "{:<20} | {:<10} | {:<30} | {} {}",
                    t.id(),
                    m.technique_id,
                    m.technique_name,
                    m.tactic.id(),
                    m.tactic.name()
                );
            }
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&EngineConfig::default())
                .context("failed to render default config")?;
            println!("{}", text);
        }
    }

    Ok(())
}

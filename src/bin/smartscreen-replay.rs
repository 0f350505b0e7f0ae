//! smartscreen-replay — check recorded display transcripts.
//!
//! ```text
//! smartscreen-replay session.jsonl            Replay one transcript
//! smartscreen-replay --strict captures/*.jsonl
//! smartscreen-replay --config engine.yaml --json session.jsonl
//! ```
//!
//! Exits non-zero if any transcript diverges or fails the strict checks.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use smartscreen::{EngineConfig, ReplayAnalyzer, SessionConfig, Transcript};

#[derive(Parser, Debug)]
#[command(name = "smartscreen-replay", about = "Replay smart screen transcripts against the session state machine")]
struct Cli {
    /// Transcript files (JSON Lines).
    #[arg(required = true)]
    transcripts: Vec<PathBuf>,

    /// Engine configuration YAML; only its `session` section is used.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Panel width override.
    #[arg(long)]
    width: Option<u16>,

    /// Panel height override.
    #[arg(long)]
    height: Option<u16>,

    /// Bytes per pixel write.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Also fail transcripts missing hello, orientation or window commands.
    #[arg(long)]
    strict: bool,

    /// Accept a display that never answers HELLO.
    #[arg(long)]
    lenient: bool,

    /// Print one JSON report per transcript instead of text.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut session = match &self.config {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                EngineConfig::from_yaml_str(&text)?.session
            }
            None => SessionConfig::default(),
        };
        if let Some(width) = self.width {
            session.panel_width = width;
        }
        if let Some(height) = self.height {
            session.panel_height = height;
        }
        if let Some(chunk_size) = self.chunk_size {
            session.chunk_size = chunk_size;
        }
        session.accept_silent_hello |= self.lenient;
        session.validate()?;
        Ok(session)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let analyzer = ReplayAnalyzer::new(cli.session_config()?)?;
    let mut failures = 0usize;

    for path in &cli.transcripts {
        let transcript = Transcript::load(path).with_context(|| format!("loading {}", path.display()))?;
        let report = analyzer.replay_recorded(&transcript).await?;

        let strict_errors = if cli.strict { report.summary.strict_errors() } else { Vec::new() };
        let passed = report.passed() && strict_errors.is_empty();
        if !passed {
            failures += 1;
        }

        if cli.json {
            let line = serde_json::json!({
                "file": path.display().to_string(),
                "passed": passed,
                "strict_errors": strict_errors,
                "report": report,
            });
            println!("{line}");
            continue;
        }

        let verdict = if passed { "PASS" } else { "FAIL" };
        println!(
            "{verdict} {} ({} entries, {} frames, {} divergences)",
            path.display(),
            report.summary.entries,
            report.frames_sent,
            report.divergences.len()
        );
        if let Some(error) = &report.connect_error {
            println!("  connect: {} ({})", error.message, error.code);
        }
        if let Some(divergence) = report.first_divergence() {
            println!(
                "  first divergence: entry {} (line {}), offset {}: expected {} got {}",
                divergence.entry,
                divergence.line,
                divergence.offset,
                hex::encode(&divergence.expected),
                hex::encode(&divergence.actual)
            );
        }
        for error in &strict_errors {
            println!("  strict: {error}");
        }
    }

    if failures > 0 {
        warn!(failures, total = cli.transcripts.len(), "Replay failures");
        return Ok(ExitCode::FAILURE);
    }
    info!(total = cli.transcripts.len(), "All transcripts replayed cleanly");
    Ok(ExitCode::SUCCESS)
}

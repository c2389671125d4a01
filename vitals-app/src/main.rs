//! Vitals analysis engine binary.

mod simulate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use vitals_app::EngineConfig;

#[derive(Debug, Parser)]
#[command(name = "vitals", version, about = "Vitals analysis scheduling engine")]
struct Cli {
    /// Config file; defaults to ~/.vitals/config.toml when present.
    #[arg(long, global = true, env = "VITALS_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate config and report the effective limits.
    Doctor,
    /// Feed a synthetic conversation through the scheduler and orchestrator.
    Simulate {
        #[arg(long, default_value = "sim-conversation")]
        conversation: String,
        #[arg(long, default_value = "sim-patient")]
        patient: String,
        /// Number of messages to append.
        #[arg(long, default_value_t = 12)]
        messages: u32,
        /// Delay between appended messages.
        #[arg(long, default_value_t = 750)]
        interval_ms: u64,
        /// Force a manual analysis after this many messages.
        #[arg(long)]
        manual_at: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Doctor);

    match command {
        Command::Doctor => doctor(cli.config).await,
        Command::Simulate {
            conversation,
            patient,
            messages,
            interval_ms,
            manual_at,
        } => {
            let cfg = EngineConfig::load(cli.config).await?;
            simulate::run(
                cfg,
                simulate::SimulationPlan {
                    conversation: conversation.into(),
                    patient: patient.into(),
                    messages,
                    interval: std::time::Duration::from_millis(interval_ms),
                    manual_at,
                },
            )
            .await
        }
    }
}

async fn doctor(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let cfg = EngineConfig::load(config_path).await?;
    let limits = &cfg.scheduler;
    tracing::info!(
        max_concurrent = limits.max_concurrent,
        min_interval_ms = limits.min_interval_ms,
        max_attempts_per_hour = limits.max_attempts_per_hour,
        window_seconds = limits.window_seconds,
        regular_interval = cfg.orchestrator.regular_interval,
        deep_interval = cfg.orchestrator.deep_interval,
        "config ok"
    );
    match cfg.http_analyzer_config() {
        Some(http) => {
            vitals_analysis::HttpAnalyzer::new(http.clone())?;
            tracing::info!(
                base_url = %http.base_url,
                has_api_key = http.api_key.is_some(),
                timeout_seconds = http.timeout.as_secs(),
                "analysis service configured"
            );
        }
        None => {
            tracing::warn!("no analysis service configured; simulate will use the dry-run analyzer");
        }
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,vitals=debug,vitals_app=debug,vitals_scheduler=debug,vitals_analysis=debug",
        ),
    };
    let log_format = std::env::var("VITALS_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported VITALS_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::debug!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

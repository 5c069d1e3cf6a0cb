use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use cadence_core::{AppConfig, ConfigStore, RunPoller, DEFAULT_MAX_RETRIES};
use cadence_observability::{
    canonical_logs_dir_from_root, emit_run_event, init_process_logging, PerformanceMonitor,
    ProcessKind, RunEvent, WorkerGuard,
};
use cadence_providers::AssistantBackend;
use cadence_types::TurnRequest;

#[derive(Parser, Debug)]
#[command(name = "cadence-engine")]
#[command(about = "Headless assistant-run driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive one conversational turn to completion and print the result.
    Run {
        #[arg(long)]
        message: String,
        #[arg(long)]
        thread: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        assistant: Option<String>,
        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        retries: u32,
        /// Also print the monitor's performance summary for the turn.
        #[arg(long, default_value_t = false)]
        summary: bool,
    },
    /// Poll an existing run until it reaches a terminal state.
    Poll {
        #[arg(long)]
        thread: String,
        #[arg(long)]
        run: String,
        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        assistant: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            message,
            thread,
            model,
            assistant,
            api_key,
            base_url,
            config,
            retries,
            summary,
        } => {
            let overrides = build_cli_overrides(api_key, base_url, assistant)?;
            let engine = build_engine(config, overrides, ProcessKind::Engine).await?;

            let mut request = TurnRequest::new(message);
            request.thread_id = thread;
            request.model = model;

            let result = engine
                .poller
                .run_turn_with_retry(&request, &engine.config.polling, retries)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if summary {
                let report = engine.poller.monitor().performance_summary(Some("run_turn"));
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            if !result.polling.success {
                anyhow::bail!("turn did not complete: status={}", result.polling.status);
            }
        }
        Command::Poll {
            thread,
            run,
            api_key,
            base_url,
            assistant,
            config,
            retries,
        } => {
            let overrides = build_cli_overrides(api_key, base_url, assistant)?;
            let engine = build_engine(config, overrides, ProcessKind::Cli).await?;
            let result = engine
                .poller
                .poll_with_retry(&thread, &run, &engine.config.polling, retries)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("run did not complete: status={}", result.status);
            }
        }
    }

    Ok(())
}

struct Engine {
    poller: RunPoller,
    config: AppConfig,
    // dropped on exit; buffered log lines are flushed by the guard
    _log_guard: WorkerGuard,
}

async fn build_engine(
    config_path: Option<String>,
    cli_overrides: Option<serde_json::Value>,
    process: ProcessKind,
) -> anyhow::Result<Engine> {
    let config_path = resolve_config_path(config_path);
    let store = ConfigStore::new(&config_path, cli_overrides).await?;
    let config = store.get().await;

    let logs_root = config
        .logs_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".cadence"));
    let logs_dir = canonical_logs_dir_from_root(&logs_root);
    let (log_guard, log_info) = init_process_logging(process, &logs_dir, 14)?;

    let startup_attempt_id = Uuid::new_v4().to_string();
    emit_run_event(
        tracing::Level::INFO,
        process,
        RunEvent {
            event: "logging.initialized",
            component: "engine.main",
            correlation_id: Some(&startup_attempt_id),
            thread_id: None,
            run_id: None,
            status: Some("ok"),
            attempts: None,
            error_code: None,
            detail: Some(&format!("config_path={}", config_path.display())),
        },
    );
    info!("engine logging initialized: {:?}", log_info);

    config
        .polling
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid polling config: {reason}"))?;

    let backend = Arc::new(AssistantBackend::new(&config.backend)?);
    let poller = RunPoller::new(backend, PerformanceMonitor::new());
    Ok(Engine {
        poller,
        config,
        _log_guard: log_guard,
    })
}

fn resolve_config_path(flag: Option<String>) -> PathBuf {
    if let Some(path) = flag {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("CADENCE_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("cadence.json")
}

fn build_cli_overrides(
    api_key: Option<String>,
    base_url: Option<String>,
    assistant: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    if api_key.is_none() && base_url.is_none() && assistant.is_none() {
        return Ok(None);
    }
    let mut backend = serde_json::Map::new();
    if let Some(key) = api_key {
        if key.trim().is_empty() {
            anyhow::bail!("api key cannot be empty");
        }
        backend.insert("api_key".to_string(), serde_json::Value::String(key));
    }
    if let Some(url) = base_url {
        if url.trim().is_empty() {
            anyhow::bail!("base url cannot be empty");
        }
        backend.insert("url".to_string(), serde_json::Value::String(url));
    }
    if let Some(assistant) = assistant {
        if assistant.trim().is_empty() {
            anyhow::bail!("assistant id cannot be empty");
        }
        backend.insert(
            "assistant_id".to_string(),
            serde_json::Value::String(assistant),
        );
    }

    let mut root = serde_json::Map::new();
    root.insert("backend".to_string(), serde_json::Value::Object(backend));
    Ok(Some(serde_json::Value::Object(root)))
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tether_core::{CliTool, ConversationId, ExecutionId, ExecutionStatus};
use tether_engine::{EngineConfig, ExecuteRequest, Executor, OutputChunk, OutputStream};
use tether_settings::TetherSettings;
use tether_store::{Database, ExecutionRepo, HistoryFilter};
use tether_telemetry::{init_telemetry, LogQuery, SqliteLogSink, TelemetryConfig};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Run assistant CLIs and keep track of their resumable sessions.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// Execution store (overrides settings).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file (defaults to ~/.tether/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Project root that relative store and log paths resolve against.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a fresh session.
    Exec(LaunchArgs),
    /// Continue the conversation's last resumable session.
    Resume(LaunchArgs),
    /// List recorded executions, newest first.
    History(HistoryArgs),
    /// Remove recorded executions.
    Delete(DeleteArgs),
    /// Show persisted warnings and errors, newest first.
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct LaunchArgs {
    #[arg(long)]
    tool: CliTool,
    #[arg(long)]
    conversation: ConversationId,
    /// Working directory for the tool (defaults to the workspace).
    #[arg(long)]
    cwd: Option<PathBuf>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Prompt text; `-` or nothing reads stdin.
    prompt: Option<String>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    tool: Option<CliTool>,
    #[arg(long)]
    conversation: Option<ConversationId>,
    #[arg(long)]
    status: Option<ExecutionStatus>,
    /// RFC 3339 lower bound on start time.
    #[arg(long)]
    since: Option<String>,
    #[arg(long, default_value_t = 100)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct DeleteArgs {
    #[arg(long)]
    id: Option<ExecutionId>,
    #[arg(long)]
    tool: Option<CliTool>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Args)]
struct LogsArgs {
    #[arg(long)]
    execution: Option<ExecutionId>,
    #[arg(long)]
    conversation: Option<ConversationId>,
    #[arg(long)]
    transaction: Option<String>,
    #[arg(long)]
    tool: Option<CliTool>,
    /// Skip warnings.
    #[arg(long)]
    errors_only: bool,
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };

    let settings = match &cli.settings {
        Some(path) => tether_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => tether_settings::load_settings().context("loading settings")?,
    };

    let log_db_path = resolve(&workspace, Path::new(&settings.logging.log_db_path));
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: level(&settings),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: log_db_path.clone(),
        ..Default::default()
    });

    if let Command::Logs(args) = &cli.command {
        let opened;
        let sink = match telemetry.logs() {
            Some(sink) => sink,
            None => {
                opened = SqliteLogSink::open(&log_db_path)
                    .with_context(|| format!("opening log store {}", log_db_path.display()))?;
                &opened
            }
        };
        let entries = sink.query(&LogQuery {
            min_level: Some(if args.errors_only {
                tracing::Level::ERROR
            } else {
                tracing::Level::WARN
            }),
            execution_id: args.execution.as_ref().map(|id| id.to_string()),
            conversation_id: args.conversation.as_ref().map(|id| id.to_string()),
            transaction_id: args.transaction.clone(),
            tool: args.tool.map(|t| t.to_string()),
            since: None,
            limit: Some(args.limit),
        })?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }

    let db_path = match &cli.db {
        Some(path) => resolve(&workspace, path),
        None => resolve(&workspace, Path::new(&settings.database.path)),
    };
    let db = Database::open(&db_path)
        .with_context(|| format!("opening execution store {}", db_path.display()))?;
    tracing::debug!(path = %db_path.display(), "execution store opened");

    let executor = Executor::new(ExecutionRepo::new(db), EngineConfig::from_settings(&settings));

    match cli.command {
        Command::Exec(args) => launch(&executor, &workspace, args, false).await,
        Command::Resume(args) => launch(&executor, &workspace, args, true).await,
        Command::History(args) => {
            let records = executor
                .list_history(HistoryFilter {
                    tool: args.tool,
                    conversation_id: args.conversation,
                    status: args.status,
                    since: args.since,
                    limit: Some(args.limit),
                    offset: args.offset,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete(args) => {
            let removed = if let Some(id) = args.id {
                usize::from(executor.delete_execution(&id).await?)
            } else if let Some(tool) = args.tool {
                executor.delete_by_tool(tool).await?
            } else {
                executor.delete_all().await?
            };
            println!("{}", serde_json::json!({ "removed": removed }));
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs(_) => Ok(ExitCode::SUCCESS),
    }
}

async fn launch(
    executor: &Executor,
    workspace: &Path,
    args: LaunchArgs,
    resume: bool,
) -> Result<ExitCode> {
    let prompt = match args.prompt {
        Some(p) if p != "-" => p,
        _ => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("reading prompt from stdin")?;
            buf
        }
    };
    let cwd = args
        .cwd
        .map(|dir| resolve(workspace, &dir))
        .unwrap_or_else(|| workspace.to_path_buf());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<OutputChunk>();
    let echo = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => eprintln!("{}", chunk.line),
                OutputStream::Stderr => eprintln!("[stderr] {}", chunk.line),
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    }));

    let mut req = ExecuteRequest::new(args.tool, args.conversation, prompt, cwd)
        .observer(tx)
        .cancel_token(cancel);
    if let Some(ms) = args.timeout_ms {
        req = req.timeout(std::time::Duration::from_millis(ms));
    }

    let outcome = if resume {
        executor.resume(req).await
    } else {
        executor.execute(req).await
    };
    let _ = echo.await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "launch failed");
            eprintln!("tether: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn level(settings: &TetherSettings) -> tracing::Level {
    settings
        .logging
        .level
        .as_filter_str()
        .parse()
        .unwrap_or(tracing::Level::INFO)
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

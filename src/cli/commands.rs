//! CLI commands implementation.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalService;
use crate::config::Config;
use crate::dispatch::supervisor::Supervisor;
use crate::dispatch::DispatchCore;
use crate::error::ApprovalError;
use crate::handler::builtin::{JobExecutorStub, LlmConfigManagerStub, RuleEngineStub};
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::queue::InMemoryQueueAdapter;
use crate::registry::Registry;
use crate::router::HandlerRouter;

#[derive(Parser)]
#[command(name = "dispatchd")]
#[command(about = "Workflow dispatch core for the self-evolution platform's background queues")]
#[command(version)]
pub struct Cli {
    /// Path to a dispatcher.toml configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatch loop and run until interrupted
    Run,

    /// Issue or validate approval tokens
    Approve {
        #[command(subcommand)]
        command: ApproveCommands,
    },

    /// Print the effective configuration and queue table
    Status,
}

#[derive(Subcommand)]
enum ApproveCommands {
    /// Issue a fresh approval token for a subject (e.g. a workflow id)
    Issue {
        subject: String,
        /// Override the default token TTL, in seconds
        #[arg(long)]
        ttl_seconds: Option<u64>,
    },
    /// Validate and consume a token against the expected subject
    Validate { token: String, subject: String },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Approve { command } => match command {
            ApproveCommands::Issue { subject, ttl_seconds } => {
                cmd_approve_issue(&config, &subject, ttl_seconds).await
            }
            ApproveCommands::Validate { token, subject } => {
                cmd_approve_validate(&config, &token, &subject).await
            }
        },
        Commands::Status => cmd_status(&config).await,
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let queue = Arc::new(InMemoryQueueAdapter::new());
    let metrics = Arc::new(Metrics::default());
    let approval = Arc::new(ApprovalService::new(Duration::from_secs(config.approval.default_ttl_seconds)));

    let mut router = HandlerRouter::new();
    let builtin_handlers: [(&str, &str, Arc<dyn crate::handler::Handler>); 3] = [
        ("rule_updates", "rule_update", Arc::new(RuleEngineStub)),
        ("llm_config_updates", "llm_config_update", Arc::new(LlmConfigManagerStub)),
        ("job_requests", "code_execution_request", Arc::new(JobExecutorStub)),
    ];
    for (queue_name, message_type, handler) in builtin_handlers {
        let Some(queue_cfg) = config.queues.iter().find(|q| q.logical_name == queue_name) else {
            tracing::warn!(queue = queue_name, "no queue configuration entry, skipping handler registration");
            continue;
        };
        router.register(queue_name, message_type, handler, queue_cfg);
    }

    let shutdown = CancellationToken::new();
    let registry = Registry::spawn(
        Duration::from_secs(config.registry.terminal_retention_seconds),
        shutdown.clone(),
    );
    let pool = Arc::new(WorkerPool::new(config.pool.workers));

    let core = Arc::new(DispatchCore {
        queue,
        router: Arc::new(router),
        pool,
        registry,
        approval: approval.clone(),
        metrics,
        config: config.clone(),
        abandoned: AtomicBool::new(false),
    });

    let supervisor = Supervisor::new(core, approval, config);
    let run_handle = tokio::spawn(supervisor.run(shutdown.clone()));

    wait_for_shutdown_signal().await;
    println!("{}", style("shutting down...").dim());
    shutdown.cancel();
    let abandoned = run_handle.await.unwrap_or(true);

    if abandoned {
        eprintln!("{}", style("shut down with in-flight work abandoned").yellow());
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn cmd_approve_issue(config: &Config, subject: &str, ttl_seconds: Option<u64>) -> anyhow::Result<()> {
    let svc = ApprovalService::new(Duration::from_secs(config.approval.default_ttl_seconds));
    let token = svc.issue(subject, ttl_seconds.map(Duration::from_secs)).await;
    println!("{}", token);
    Ok(())
}

async fn cmd_approve_validate(config: &Config, token: &str, subject: &str) -> anyhow::Result<()> {
    // A fresh, empty service can never validate a token issued by a different
    // process; this command exists to exercise the validation path against a
    // locally-issued token (see `approve issue`) in the same invocation chain as
    // tests and local smoke checks, not as a client of a running dispatcher.
    let svc = ApprovalService::new(Duration::from_secs(config.approval.default_ttl_seconds));
    match svc.validate_and_consume(token, subject).await {
        Ok(()) => {
            println!("{}", style("valid").green());
            Ok(())
        }
        Err(ApprovalError::Unknown) => {
            println!("{}", style("unknown token").red());
            std::process::exit(1);
        }
        Err(e) => {
            println!("{} {e}", style("rejected:").red());
            std::process::exit(1);
        }
    }
}

async fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("\n{}", style("Dispatch Core Status").bold());
    println!("{}", "-".repeat(40));
    println!("{:<22} {}", "Workers:", config.pool.workers);
    println!("{:<22} {}", "Batch size:", config.pool.batch_size);
    println!("{:<22} {}", "Poll interval (ms):", config.pool.poll_interval_ms);
    println!("{:<22} {}", "Visibility (s):", config.pool.visibility_seconds);
    println!("{:<22} {}", "Approval TTL (s):", config.approval.default_ttl_seconds);
    println!("{:<22} {}", "Registry retention (s):", config.registry.terminal_retention_seconds);
    println!();
    println!("{}", style("Queue Table").bold());
    for q in &config.queues {
        println!(
            "  {:<20} -> {:<28} [{}]  max_attempts={} timeout={}s",
            q.logical_name, q.result_queue_name, q.handler_name, q.max_attempts, q.timeout_secs
        );
    }
    Ok(())
}

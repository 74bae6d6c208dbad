use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_agent::channels::{EmailConfig, ImapMailSource, MailPoller, spawn_mail_poller};
use inbox_agent::config::AgentConfig;
use inbox_agent::journal::ResponseJournal;
use inbox_agent::notify::build_sink;
use inbox_agent::pipeline::derive::{
    absolute_dir, find_issue_ref, normalize_subject, resolve_working_dir,
};
use inbox_agent::pipeline::policy::PRECONDITION_EXIT_CODE;
use inbox_agent::pipeline::{TaskContext, TaskPipeline, preflight};
use inbox_agent::process::{ProcessRunner, TokioProcessRunner};
use inbox_agent::service::Dispatcher;

/// Execution log written next to the response journal.
const EXECUTION_LOG: &str = "agent-execution.log";

#[derive(Parser)]
#[command(name = "inbox-agent", version, about = "Turns allowed emails into coding-assistant runs and pull requests")]
struct Cli {
    /// Environment file loaded before reading configuration.
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the mailbox until interrupted (default).
    Poll,
    /// Poll once, wait for the dispatched runs, and exit.
    Once,
    /// Run a single task without the mailbox.
    Run {
        #[arg(long)]
        subject: String,
        /// Working directory; derived from the repository when omitted.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Originating issue or pull request URL.
        #[arg(long)]
        issue_url: Option<String>,
        /// Repository as `owner/repo`.
        #[arg(long)]
        repo: Option<String>,
        /// Print the outcome as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Check that the required tools are installed and authenticated.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => exit_code(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let env_loaded = dotenvy::from_path(&cli.env_file);

    let config = Arc::new(AgentConfig::from_env().context("invalid agent configuration")?);
    let email = EmailConfig::from_env().context("invalid mail configuration")?;

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("cannot create log directory {}", config.log_dir.display()))?;
    let journal = Arc::new(ResponseJournal::in_dir(&config.log_dir));
    if config.clear_logs {
        clear_logs(&config, &journal).await;
    }

    // Keep the guard alive so buffered lines reach the file on exit.
    let file_appender = tracing_appender::rolling::never(&config.log_dir, EXECUTION_LOG);
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    if let Err(e) = env_loaded {
        warn!(path = %cli.env_file.display(), "No environment file loaded: {e}");
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    eprintln!("📬 Inbox Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Assistant: {} ({})",
        config.assistant.command,
        config.assistant.allowed_tools.join(",")
    );
    eprintln!(
        "   Timeouts: assistant {}s, commit {}s, grace {}s",
        config.assistant.timeout.as_secs(),
        config.host.commit_timeout.as_secs(),
        config.grace_period.as_secs()
    );
    eprintln!("   Logs: {}", config.log_dir.display());

    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner::new(config.grace_period));

    if let Err(e) = preflight::check(&config, runner.as_ref()).await {
        eprintln!("Error: {e}");
        return Ok(PRECONDITION_EXIT_CODE);
    }

    let command = cli.command.unwrap_or(Command::Poll);
    if matches!(command, Command::Check) {
        eprintln!("   Preflight: ok");
        return Ok(0);
    }

    let notifier = build_sink(Arc::clone(&config), email.clone(), Arc::clone(&runner));
    let pipeline = TaskPipeline::new(Arc::clone(&config), Arc::clone(&runner), notifier)
        .with_journal(journal);
    let dispatcher = Dispatcher::new(pipeline);

    match command {
        Command::Run {
            subject,
            dir,
            issue_url,
            repo,
            json,
        } => {
            let ctx = task_from_args(&config, subject, dir, issue_url, repo);
            let outcome = dispatcher.run(ctx).await;
            if json {
                let rendered =
                    serde_json::to_string_pretty(&outcome).context("cannot serialize outcome")?;
                println!("{rendered}");
            }
            Ok(outcome.exit_code())
        }
        Command::Once => {
            let poller = mail_poller(email, &config, dispatcher.clone())?;
            let report = poller.poll_once().await.context("mail poll failed")?;
            info!(fetched = report.fetched, dispatched = report.dispatched, "Poll finished");
            let outcomes = dispatcher.wait_idle().await;
            info!(runs = outcomes.len(), "All runs finished");
            Ok(0)
        }
        Command::Poll => {
            let poller = Arc::new(mail_poller(email, &config, dispatcher.clone())?);
            eprintln!("   Polling every {}s. Ctrl-C to stop.\n", poller.poll_interval().as_secs());
            let (handle, shutdown) = spawn_mail_poller(poller);

            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
            info!("Shutdown requested; finishing the current poll cycle");
            // The receiver only goes away when the poller task already ended.
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!("Mail poller task failed: {e}");
            }
            info!("Waiting for running tasks");
            let outcomes = dispatcher.wait_idle().await;
            info!(runs = outcomes.len(), "Stopped");
            Ok(0)
        }
        Command::Check => Ok(0),
    }
}

fn mail_poller(
    email: Option<EmailConfig>,
    config: &Arc<AgentConfig>,
    dispatcher: Dispatcher,
) -> anyhow::Result<MailPoller> {
    let email = email.ok_or_else(|| anyhow!("IMAP_HOST is not set; the mail source is disabled"))?;
    let source = Arc::new(ImapMailSource::new(email.clone()));
    Ok(MailPoller::new(source, email, Arc::clone(config), dispatcher))
}

fn task_from_args(
    config: &AgentConfig,
    subject: String,
    dir: Option<PathBuf>,
    issue_url: Option<String>,
    repo: Option<String>,
) -> TaskContext {
    let issue = issue_url.as_deref().and_then(|url| find_issue_ref("", url));
    let repository = repo.or_else(|| issue.as_ref().map(|i| i.repository.clone()));
    let working_dir = match dir {
        Some(dir) => absolute_dir(dir),
        None => resolve_working_dir(config, repository.as_deref()),
    };

    let mut ctx = TaskContext::new(normalize_subject(&subject), working_dir);
    if let Some(url) = issue_url {
        ctx = ctx.with_origin(url);
    }
    if let Some(repository) = repository {
        ctx = ctx.with_repository(repository);
    }
    ctx
}

async fn clear_logs(config: &AgentConfig, journal: &ResponseJournal) {
    if let Err(e) = journal.clear().await {
        eprintln!("Warning: could not clear {}: {e}", journal.path().display());
    }
    let log = config.log_dir.join(EXECUTION_LOG);
    match tokio::fs::remove_file(&log).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("Warning: could not clear {}: {e}", log.display()),
    }
}

/// Map an outcome exit code onto the process exit status.
fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}

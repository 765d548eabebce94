//! devtrace - record the commands run in an interactive shell
//!
//! `devtrace shell` starts a bridged session on the current terminal and
//! exits with the shell's exit code. The other subcommands inspect what was
//! recorded.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devtrace::bridge::{BridgeOptions, EnvOverrides, SessionBridge, ShellCommand};
use devtrace::config::{expand_path, AppConfig, LoadedConfig};
use devtrace::events::{CommandEvent, EventStatus};
use devtrace::git::GitMetricsSink;
use devtrace::hooks::ShellKind;
use devtrace::logging::{init_logging, LogTarget};
use devtrace::sink::EventSink;
use devtrace::storage::{EventStore, ExportFormat, SessionRecord, SessionStatus};
use devtrace::terminal::{is_tty, terminal_size, RawModeGuard};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Command line
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "devtrace",
    about = "Record the commands run in an interactive shell",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the event store
    Init {
        /// Storage directory (default: <data dir>/devtrace)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Start a recorded shell session on this terminal
    Shell {
        /// Shell to run (default: config, then $SHELL, then /bin/sh)
        #[arg(long)]
        shell: Option<String>,

        /// Operator or agent label stored with the session
        #[arg(long)]
        agent: Option<String>,

        /// Working directory for the shell
        #[arg(long)]
        cwd: Option<PathBuf>,

        #[arg(long)]
        path: Option<PathBuf>,

        /// Extra arguments passed to the shell
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// List recorded command events
    Events {
        /// Only events from this session
        #[arg(long)]
        session: Option<Uuid>,

        /// Show only the newest N events
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// One JSON object per line
        #[arg(long)]
        json: bool,

        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// List recorded sessions
    Sessions {
        #[arg(long)]
        json: bool,

        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Write recorded events to a file
    Export {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// csv or jsonl
        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        /// Only events from this session
        #[arg(long)]
        session: Option<Uuid>,

        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Print the hook script for a shell, for sourcing by hand
    Hook {
        /// bash or zsh
        shell: ShellKind,
    },
}

fn main() {
    let cli = Cli::parse();

    let loaded = AppConfig::load().unwrap_or_else(|e| {
        eprintln!("devtrace: ignoring configuration: {e}");
        LoadedConfig {
            config: AppConfig::default(),
            sources: Vec::new(),
            skipped: Vec::new(),
        }
    });

    let target = match cli.command {
        Command::Shell { .. } => LogTarget::FileOnly,
        _ => LogTarget::Console,
    };
    init_logging(&loaded.config.logging, target);
    report_config(&loaded, target);
    let config = loaded.config;

    match run(cli.command, &config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("devtrace: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Config loading runs before logging exists, so its outcome is logged here.
fn report_config(loaded: &LoadedConfig, target: LogTarget) {
    for path in &loaded.sources {
        debug!(path = %path.display(), "Loaded config");
    }
    for (path, error) in &loaded.skipped {
        warn!(path = %path.display(), error = %error, "Skipping config file");
        if target == LogTarget::FileOnly {
            eprintln!("devtrace: skipping config {}: {error}", path.display());
        }
    }
}

fn run(command: Command, config: &AppConfig) -> Result<i32> {
    match command {
        Command::Init { path } => {
            let store = open_store(config, path.as_deref());
            store
                .ensure_storage()
                .with_context(|| format!("Failed to create {}", store.base_path().display()))?;
            println!("Initialized devtrace storage at {}", store.base_path().display());
            Ok(0)
        }
        Command::Shell {
            shell,
            agent,
            cwd,
            path,
            args,
        } => {
            let program = shell.unwrap_or_else(|| config.shell());
            let mut command = ShellCommand::new(program).args(args);
            if let Some(cwd) = cwd {
                command = command.cwd(expand_path(&cwd));
            }
            if let Some(agent) = agent {
                command = command.label(agent);
            }
            run_shell(config, open_store(config, path.as_deref()), command)
        }
        Command::Events {
            session,
            limit,
            json,
            path,
        } => {
            let store = open_store(config, path.as_deref());
            let events = store.list_events(session, limit)?;
            print_events(&events, json)?;
            Ok(0)
        }
        Command::Sessions { json, path } => {
            let store = open_store(config, path.as_deref());
            print_sessions(&store.list_sessions()?, json)?;
            Ok(0)
        }
        Command::Export {
            out,
            format,
            session,
            path,
        } => {
            let store = open_store(config, path.as_deref());
            let out = expand_path(&out);
            let count = store
                .export_events(&out, format, session)
                .with_context(|| format!("Failed to export events to {}", out.display()))?;
            println!("Exported {count} events to {}", out.display());
            Ok(0)
        }
        Command::Hook { shell } => {
            print!("{}", shell.script());
            Ok(0)
        }
    }
}

fn open_store(config: &AppConfig, path: Option<&Path>) -> EventStore {
    EventStore::new(path.map(expand_path).unwrap_or_else(|| config.data_dir()))
}

// ============================================================================
// Bridged session
// ============================================================================

fn run_shell(config: &AppConfig, store: EventStore, command: ShellCommand) -> Result<i32> {
    store
        .ensure_storage()
        .with_context(|| format!("Failed to prepare storage at {}", store.base_path().display()))?;

    let stdin_fd = io::stdin().as_raw_fd();
    let stdout_fd = io::stdout().as_raw_fd();

    let mut options = BridgeOptions::from_config(config).stop_on_termination(true);
    if let Some(size) = terminal_size(stdout_fd).or_else(|| terminal_size(stdin_fd)) {
        options = options.with_size(size);
    }
    if is_tty(stdout_fd) {
        options = options.follow_resize(stdout_fd);
    }

    let raw_mode = RawModeGuard::enable(stdin_fd).context("Failed to switch terminal to raw mode")?;

    let sink: Box<dyn EventSink> = if config.bridge.git_metrics {
        Box::new(GitMetricsSink::new(store.event_sink()))
    } else {
        Box::new(store.event_sink())
    };

    let program = command.program.clone();
    let mut session = SessionBridge::new(options)
        .start(command, EnvOverrides::new(), io::stdin(), io::stdout(), sink)
        .with_context(|| format!("Failed to start a session for '{program}'"))?;

    let record = SessionRecord::from(session.info());
    if let Err(e) = store.create_session(&record) {
        warn!(session_id = %record.id, error = %e, "Failed to record session");
    }

    let status = session.wait();
    drop(raw_mode);

    if let Some(stats) = session.parser_stats() {
        info!(
            session_id = %record.id,
            completed = stats.completed,
            incomplete = stats.incomplete,
            malformed = stats.malformed,
            "Session events"
        );
    }
    if let Err(e) = store.close_session(record.id, status.clone()) {
        warn!(session_id = %record.id, error = %e, "Failed to close session record");
    }
    info!(session_id = %record.id, status = %status, "Session finished");

    Ok(status.exit_code())
}

// ============================================================================
// Listing
// ============================================================================

fn print_events(events: &[CommandEvent], json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    for event in events {
        if json {
            writeln!(out, "{}", serde_json::to_string(event)?)?;
            continue;
        }

        let outcome = match (&event.status, event.exit_code) {
            (EventStatus::Completed, Some(code)) => format!("exit {code}"),
            (EventStatus::Completed, None) => "done".to_string(),
            (EventStatus::Incomplete { .. }, _) => "incomplete".to_string(),
        };
        let duration = event
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{}  {:<10}  {:>8}  {}",
            event.started_at.format("%Y-%m-%d %H:%M:%S"),
            outcome,
            duration,
            event.command
        )?;
    }
    Ok(())
}

fn print_sessions(sessions: &[SessionRecord], json: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    for session in sessions {
        if json {
            writeln!(out, "{}", serde_json::to_string(session)?)?;
            continue;
        }

        let state = match (&session.status, &session.termination) {
            (SessionStatus::Active, _) => "active".to_string(),
            (SessionStatus::Closed, Some(termination)) => termination.to_string(),
            (SessionStatus::Closed, None) => "closed".to_string(),
        };
        writeln!(
            out,
            "{}  {}  {:<12}  {}  {}",
            session.id,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.label.as_deref().unwrap_or("-"),
            session.shell,
            state
        )?;
    }
    Ok(())
}

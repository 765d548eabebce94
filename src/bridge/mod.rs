//! Session Bridge
//!
//! Runs a shell on a private PTY and relays bytes between it and an outer
//! terminal, while a separate activity turns the lifecycle lines written by
//! shell hooks into [`CommandEvent`](crate::events::CommandEvent)s.
//!
//! Per session there are up to five threads: the reaper waiting on the
//! child, the outer-input relay, the inner-output relay, the transport
//! parser and the optional signal listener. They share nothing but the
//! [`SessionHandle`].

pub mod relay;
mod session;
mod signals;

pub use relay::{copy_stream, RelayEnd, RelayOutcome};
pub use session::{Session, SessionHandle};
pub use signals::SignalPolicy;

use crate::config::AppConfig;
use crate::error::BridgeResult;
use crate::sink::EventSink;
use crate::terminal::TerminalSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::fmt;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Program to run inside the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; the current directory when unset
    pub cwd: Option<PathBuf>,
    /// Operator or agent label recorded with the session
    pub label: Option<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            label: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Environment variables set on the child in addition to the inherited
/// environment. The transport path is added here at start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    vars: BTreeMap<String, String>,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// How the shell ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStatus {
    Exited(i32),
    Signaled {
        signal: Option<i32>,
        description: String,
    },
}

impl TerminationStatus {
    /// Process exit code to report for this status; signal deaths map to
    /// `128 + signo` like a shell does.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationStatus::Exited(code) => *code,
            TerminationStatus::Signaled {
                signal: Some(signal),
                ..
            } => 128 + signal,
            TerminationStatus::Signaled { signal: None, .. } => 1,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, TerminationStatus::Exited(0))
    }
}

impl From<&portable_pty::ExitStatus> for TerminationStatus {
    fn from(status: &portable_pty::ExitStatus) -> Self {
        if status.success() {
            return TerminationStatus::Exited(0);
        }
        // The signal name is only exposed through the Display text.
        let text = status.to_string();
        match text.strip_prefix(SIGNALED_PREFIX) {
            Some(description) => TerminationStatus::Signaled {
                signal: signal_number(description),
                description: description.to_string(),
            },
            None => TerminationStatus::Exited(status.exit_code() as i32),
        }
    }
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationStatus::Exited(code) => write!(f, "exited with code {code}"),
            TerminationStatus::Signaled {
                signal: Some(signal),
                description,
            } => write!(f, "killed by signal {signal} ({description})"),
            TerminationStatus::Signaled {
                signal: None,
                description,
            } => write!(f, "killed by signal ({description})"),
        }
    }
}

const SIGNALED_PREFIX: &str = "Terminated by ";

/// Recover the signal number from the text portable-pty reports, which is
/// either `strsignal(n)` or `Signal n`.
fn signal_number(description: &str) -> Option<i32> {
    if let Some(n) = description
        .strip_prefix("Signal ")
        .and_then(|n| n.trim().parse().ok())
    {
        return Some(n);
    }
    (1..32).find(|&n| {
        let name = unsafe { libc::strsignal(n) };
        !name.is_null() && unsafe { CStr::from_ptr(name) }.to_string_lossy() == description
    })
}

/// Identity of a started session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cwd: PathBuf,
    pub label: Option<String>,
    pub shell: String,
    pub transport_path: PathBuf,
}

/// Knobs for [`SessionBridge::start`]
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Initial inner PTY size
    pub size: TerminalSize,
    /// Where transports and generated hook files are created
    pub transport_dir: PathBuf,
    /// `TERM` for the child when the environment has none
    pub term: String,
    pub stop_grace: Duration,
    /// Bound on each teardown wait (output drain, parser drain)
    pub teardown_timeout: Duration,
    pub duration_tolerance_ms: u64,
    pub install_hooks: bool,
    pub resize_from: Option<RawFd>,
    pub stop_on_termination: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl BridgeOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            size: TerminalSize::new(config.pty.default_rows, config.pty.default_cols),
            transport_dir: config.bridge.resolved_transport_dir(),
            term: config.pty.term.clone(),
            stop_grace: config.bridge.stop_grace(),
            teardown_timeout: config.bridge.teardown_timeout(),
            duration_tolerance_ms: config.bridge.duration_tolerance_ms,
            install_hooks: config.bridge.install_hooks,
            resize_from: None,
            stop_on_termination: false,
        }
    }

    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_transport_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transport_dir = dir.into();
        self
    }

    pub fn with_hooks(mut self, install: bool) -> Self {
        self.install_hooks = install;
        self
    }

    /// Follow SIGWINCH by reading the outer size from `fd`
    pub fn follow_resize(mut self, fd: RawFd) -> Self {
        self.resize_from = Some(fd);
        self
    }

    /// Stop the session when this process receives SIGTERM or SIGHUP
    pub fn stop_on_termination(mut self, enabled: bool) -> Self {
        self.stop_on_termination = enabled;
        self
    }
}

/// Starts bridged sessions
#[derive(Debug, Clone, Default)]
pub struct SessionBridge {
    options: BridgeOptions,
}

impl SessionBridge {
    pub fn new(options: BridgeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Allocate a PTY, create the transport, spawn `shell` on the PTY with
    /// the transport path in its environment and start the relay, parser and
    /// signal activities.
    ///
    /// Fails only while acquiring resources; the error says which one.
    pub fn start<I, O, S>(
        &self,
        shell: ShellCommand,
        env: EnvOverrides,
        outer_input: I,
        outer_output: O,
        sink: S,
    ) -> BridgeResult<Session>
    where
        I: Read + Send + 'static,
        O: Write + Send + 'static,
        S: EventSink + 'static,
    {
        Session::launch(&self.options, shell, env, outer_input, outer_output, sink)
    }
}

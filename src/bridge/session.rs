//! A running bridged session and its teardown

use super::relay::{copy_stream, RelayEnd, RelayOutcome};
use super::signals::{SignalActivity, SignalPolicy};
use super::{BridgeOptions, EnvOverrides, SessionInfo, ShellCommand, TerminationStatus};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventParser, ParserStats};
use crate::hooks::{self, HookInstall};
use crate::sink::EventSink;
use crate::terminal::{ControllingTerminal, PseudoTerminalPair, SpawnedShell, TerminalSize};
use crate::transport::{EventTransport, TRANSPORT_ENV_VAR};
use chrono::Utc;
use portable_pty::{Child, ChildKiller, CommandBuilder};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    id: Uuid,
    terminal: Mutex<Option<ControllingTerminal>>,
    // Dropping the PTY writer sends newline + VEOF to the shell, so after
    // outer-input EOF it is held here until the terminal is closed.
    idle_writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    status: Mutex<Option<TerminationStatus>>,
    exited: Condvar,
    stopping: AtomicBool,
    stop_grace: Duration,
}

/// Cloneable control handle for a session.
///
/// Safe to use from any thread, including after the session has ended, in
/// which case control operations become no-ops or report an error.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    fn new(
        id: Uuid,
        terminal: ControllingTerminal,
        killer: Box<dyn ChildKiller + Send + Sync>,
        pid: Option<u32>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                terminal: Mutex::new(Some(terminal)),
                idle_writer: Mutex::new(None),
                killer: Mutex::new(killer),
                pid,
                status: Mutex::new(None),
                exited: Condvar::new(),
                stopping: AtomicBool::new(false),
                stop_grace,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// Apply a new size to the inner PTY. This goes through the terminal
    /// control path and never interleaves with relayed data.
    pub fn resize(&self, size: TerminalSize) -> BridgeResult<()> {
        let terminal = lock(&self.shared.terminal);
        let terminal = terminal.as_ref().ok_or_else(|| BridgeError::Resize {
            reason: "session has ended".to_string(),
        })?;
        terminal.resize(size)?;
        debug!(session_id = %self.shared.id, rows = size.rows, cols = size.cols, "Inner PTY resized");
        Ok(())
    }

    /// Size as reported by the inner PTY
    pub fn size(&self) -> BridgeResult<TerminalSize> {
        let terminal = lock(&self.shared.terminal);
        terminal
            .as_ref()
            .ok_or_else(|| BridgeError::Resize {
                reason: "session has ended".to_string(),
            })?
            .size()
    }

    /// Termination status, if the shell has already exited
    pub fn try_status(&self) -> Option<TerminationStatus> {
        lock(&self.shared.status).clone()
    }

    pub fn is_running(&self) -> bool {
        self.try_status().is_none()
    }

    /// Ask the shell to terminate.
    ///
    /// SIGHUP goes to the shell's process group first, as when its terminal
    /// goes away. If the shell is still alive after the grace period it is
    /// killed. Returns once the shell has exited or the kill was sent.
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.shared.id, "Stop already in progress");
            return;
        }

        info!(session_id = %self.shared.id, "Stopping session");
        self.signal_group(libc::SIGHUP);
        self.signal_group(libc::SIGCONT);

        if self.wait_status(Some(self.shared.stop_grace)).is_some() {
            return;
        }

        warn!(
            session_id = %self.shared.id,
            grace_ms = self.shared.stop_grace.as_millis() as u64,
            "Shell still running after grace period, killing"
        );
        if !self.signal_group(libc::SIGKILL) {
            if let Err(e) = lock(&self.shared.killer).kill() {
                error!(session_id = %self.shared.id, error = %e, "Failed to kill shell");
            }
        }
    }

    fn signal_group(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.shared.pid else {
            return false;
        };
        if !self.is_running() {
            return true;
        }
        let pid = pid as libc::pid_t;
        // The shell leads its own session, so its pid is also its group id.
        let rc = unsafe { libc::killpg(pid, signal) };
        if rc == 0 {
            return true;
        }
        unsafe { libc::kill(pid, signal) == 0 }
    }

    fn set_status(&self, status: TerminationStatus) {
        *lock(&self.shared.status) = Some(status);
        self.shared.exited.notify_all();
    }

    fn wait_status(&self, timeout: Option<Duration>) -> Option<TerminationStatus> {
        let guard = lock(&self.shared.status);
        match timeout {
            None => self
                .shared
                .exited
                .wait_while(guard, |status| status.is_none())
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            Some(timeout) => self
                .shared
                .exited
                .wait_timeout_while(guard, timeout, |status| status.is_none())
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                .clone(),
        }
    }

    /// Keep the input writer open once the outer input is exhausted. After
    /// the terminal is closed the writer is dropped right away.
    fn park_writer(&self, writer: Box<dyn Write + Send>) {
        let terminal = lock(&self.shared.terminal);
        if terminal.is_some() {
            *lock(&self.shared.idle_writer) = Some(writer);
            debug!(session_id = %self.shared.id, "Outer input done, inner input left open");
        }
    }

    fn close_terminal(&self) {
        let mut terminal = lock(&self.shared.terminal);
        lock(&self.shared.idle_writer).take();
        if terminal.take().is_some() {
            debug!(session_id = %self.shared.id, "Controlling terminal closed");
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("pid", &self.shared.pid)
            .finish_non_exhaustive()
    }
}

/// A running bridged shell.
///
/// Dropping a session that was never waited on stops the shell and runs the
/// same teardown as [`Session::wait`].
pub struct Session {
    info: SessionInfo,
    handle: SessionHandle,
    transport: EventTransport,
    hooks: Option<HookInstall>,
    signals: Option<SignalActivity>,
    output_done: Option<Receiver<RelayOutcome>>,
    parser_done: Option<Receiver<ParserStats>>,
    teardown_timeout: Duration,
    termination: Option<TerminationStatus>,
    parser_stats: Option<ParserStats>,
}

impl Session {
    #[instrument(skip_all, fields(program = %shell.program))]
    pub(super) fn launch<I, O, S>(
        options: &BridgeOptions,
        shell: ShellCommand,
        mut env: EnvOverrides,
        outer_input: I,
        outer_output: O,
        sink: S,
    ) -> BridgeResult<Self>
    where
        I: Read + Send + 'static,
        O: Write + Send + 'static,
        S: EventSink + 'static,
    {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let cwd = shell
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        let pair = PseudoTerminalPair::open(options.size)?;

        let mut transport = EventTransport::create(&options.transport_dir, id)
            .map_err(BridgeError::TransportCreate)?;
        let transport_reader = transport
            .open_for_reading()
            .map_err(BridgeError::TransportCreate)?;
        env.set(TRANSPORT_ENV_VAR, transport.path().to_string_lossy());

        let hooks = if options.install_hooks {
            match hooks::prepare(&shell.program, &options.transport_dir, id) {
                Ok(hooks) => hooks,
                Err(e) => {
                    warn!(error = %e, "Failed to install shell hooks, running uninstrumented");
                    None
                }
            }
        } else {
            None
        };

        let mut cmd = CommandBuilder::new(&shell.program);
        if let Some(hooks) = &hooks {
            cmd.args(hooks.args());
            for (key, value) in hooks.env() {
                cmd.env(key, value);
            }
        }
        cmd.args(&shell.args);
        cmd.cwd(&cwd);
        if std::env::var_os("TERM").is_none() && env.get("TERM").is_none() {
            cmd.env("TERM", &options.term);
        }
        for (key, value) in env.iter() {
            cmd.env(key, value);
        }

        let SpawnedShell { terminal, child } = pair.spawn(cmd)?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let info = SessionInfo {
            id,
            started_at,
            cwd,
            label: shell.label.clone(),
            shell: shell.program.clone(),
            transport_path: transport.path().to_path_buf(),
        };
        info!(
            session_id = %id,
            pid = pid.unwrap_or_default(),
            transport = %info.transport_path.display(),
            "Session started"
        );

        let output_reader = terminal.reader();
        let input_writer = terminal.take_writer();
        let handle = SessionHandle::new(id, terminal, killer, pid, options.stop_grace);

        let started = Self::start_activities(
            options,
            &handle,
            child,
            output_reader,
            input_writer,
            outer_input,
            outer_output,
            EventParser::new(id, sink).with_duration_tolerance(options.duration_tolerance_ms),
            transport_reader,
        );
        let (output_done, parser_done, signals) = match started {
            Ok(started) => started,
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to start session activities");
                handle.stop();
                handle.close_terminal();
                return Err(e);
            }
        };

        Ok(Self {
            info,
            handle,
            transport,
            hooks,
            signals,
            output_done: Some(output_done),
            parser_done: Some(parser_done),
            teardown_timeout: options.teardown_timeout,
            termination: None,
            parser_stats: None,
        })
    }

    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    fn start_activities<I, O, S, T>(
        options: &BridgeOptions,
        handle: &SessionHandle,
        mut child: Box<dyn Child + Send + Sync>,
        output_reader: BridgeResult<Box<dyn Read + Send>>,
        input_writer: BridgeResult<Box<dyn Write + Send>>,
        mut outer_input: I,
        mut outer_output: O,
        mut parser: EventParser<S>,
        mut transport_reader: T,
    ) -> BridgeResult<(
        Receiver<RelayOutcome>,
        Receiver<ParserStats>,
        Option<SignalActivity>,
    )>
    where
        I: Read + Send + 'static,
        O: Write + Send + 'static,
        S: EventSink + 'static,
        T: std::io::BufRead + Send + 'static,
    {
        let reaper = handle.clone();
        thread::Builder::new()
            .name("devtrace-reaper".to_string())
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => TerminationStatus::from(&status),
                    Err(e) => {
                        error!(session_id = %reaper.id(), error = %e, "Failed to wait for shell");
                        TerminationStatus::Exited(-1)
                    }
                };
                info!(session_id = %reaper.id(), status = %status, "Shell exited");
                reaper.set_status(status);
            })
            .map_err(|source| BridgeError::Thread {
                activity: "reaper",
                source,
            })?;

        let mut output_reader = output_reader?;
        let mut input_writer = input_writer?;

        let (output_tx, output_rx) = mpsc::channel();
        let relay = handle.clone();
        thread::Builder::new()
            .name("devtrace-relay-out".to_string())
            .spawn(move || {
                let outcome = copy_stream("output", &mut output_reader, &mut outer_output);
                if matches!(outcome.end, RelayEnd::WriterFailed(_)) {
                    warn!(session_id = %relay.id(), "Outer output failed, stopping session");
                    relay.stop();
                }
                let _ = output_tx.send(outcome);
            })
            .map_err(|source| BridgeError::Thread {
                activity: "output relay",
                source,
            })?;

        // Blocked on the outer input, this thread may outlive the session; it
        // ends on its next read.
        let relay = handle.clone();
        thread::Builder::new()
            .name("devtrace-relay-in".to_string())
            .spawn(move || {
                let outcome = copy_stream("input", &mut outer_input, &mut input_writer);
                match outcome.end {
                    RelayEnd::ReaderFailed(_) if relay.is_running() => {
                        warn!(session_id = %relay.id(), "Outer input failed, stopping session");
                        relay.stop();
                    }
                    RelayEnd::ReaderEof => relay.park_writer(input_writer),
                    _ => {}
                }
            })
            .map_err(|source| BridgeError::Thread {
                activity: "input relay",
                source,
            })?;

        let (parser_tx, parser_rx) = mpsc::channel();
        thread::Builder::new()
            .name("devtrace-events".to_string())
            .spawn(move || {
                let stats = parser.run(&mut transport_reader);
                info!(
                    session_id = %parser.session_id(),
                    completed = stats.completed,
                    incomplete = stats.incomplete,
                    malformed = stats.malformed,
                    "Event parser finished"
                );
                let _ = parser_tx.send(stats);
            })
            .map_err(|source| BridgeError::Thread {
                activity: "event parser",
                source,
            })?;

        let policy = SignalPolicy {
            resize_from: options.resize_from,
            stop_on_termination: options.stop_on_termination,
        };
        let signals = SignalActivity::start(policy, handle.clone()).map_err(|source| {
            BridgeError::Thread {
                activity: "signal",
                source,
            }
        })?;

        Ok((output_rx, parser_rx, signals))
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    /// A cloneable handle for resizing or stopping from other threads
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> BridgeResult<()> {
        self.handle.resize(TerminalSize::new(rows, cols))
    }

    pub fn size(&self) -> BridgeResult<TerminalSize> {
        self.handle.size()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Counters from the event parser, available after [`Session::wait`]
    pub fn parser_stats(&self) -> Option<ParserStats> {
        self.parser_stats
    }

    /// Block until the shell exits, then tear the session down.
    ///
    /// Teardown drains the shell's remaining output, closes the controlling
    /// terminal, lets the parser consume every line still in the transport
    /// (emitting an open command as incomplete) and removes the transport.
    /// Calling this again returns the same status.
    pub fn wait(&mut self) -> TerminationStatus {
        if let Some(status) = &self.termination {
            return status.clone();
        }

        let status = self
            .handle
            .wait_status(None)
            .unwrap_or(TerminationStatus::Exited(-1));
        self.teardown();
        self.termination = Some(status.clone());
        status
    }

    fn teardown(&mut self) {
        let id = self.info.id;

        if let Some(output_done) = self.output_done.take() {
            match output_done.recv_timeout(self.teardown_timeout) {
                Ok(outcome) => debug!(session_id = %id, bytes = outcome.bytes, "Output relay drained"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(session_id = %id, "Output relay still open, closing terminal anyway")
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(session_id = %id, "Output relay ended without reporting")
                }
            }
        }

        if let Some(mut signals) = self.signals.take() {
            signals.close();
        }
        self.handle.close_terminal();
        self.transport.close_writer();

        let mut reader_detached = false;
        if let Some(parser_done) = self.parser_done.take() {
            match parser_done.recv_timeout(self.teardown_timeout) {
                Ok(stats) => self.parser_stats = Some(stats),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(session_id = %id, "Transport still held open by a writer, detaching parser");
                    reader_detached = true;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(session_id = %id, "Event parser ended without reporting")
                }
            }
        }

        // Unlinking only removes the name; a detached parser keeps its open
        // descriptor and ends when the last writer closes.
        if reader_detached {
            warn!(
                session_id = %id,
                transport = %self.transport.path().display(),
                "Removing transport while its reader is still open"
            );
        }
        if let Err(e) = self.transport.destroy() {
            warn!(session_id = %id, error = %e, "Failed to remove event transport");
        }
        self.hooks = None;
        info!(session_id = %id, "Session torn down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.termination.is_none() {
            self.handle.stop();
            self.wait();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

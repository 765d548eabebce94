//! Signal activity
//!
//! Follows the outer terminal's SIGWINCH into the inner PTY and turns
//! SIGTERM/SIGHUP delivered to this process into a session stop.

use super::session::SessionHandle;
use crate::terminal::terminal_size;
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::os::unix::io::RawFd;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Which signals the activity listens for
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalPolicy {
    /// Read the new outer size from this descriptor on SIGWINCH
    pub resize_from: Option<RawFd>,
    pub stop_on_termination: bool,
}

impl SignalPolicy {
    fn signals(&self) -> Vec<libc::c_int> {
        let mut signals = Vec::new();
        if self.resize_from.is_some() {
            signals.push(libc::SIGWINCH);
        }
        if self.stop_on_termination {
            signals.push(libc::SIGTERM);
            signals.push(libc::SIGHUP);
        }
        signals
    }
}

/// Running signal thread; closed and joined on drop.
pub struct SignalActivity {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalActivity {
    /// Start listening. Returns `Ok(None)` when the policy asks for nothing.
    pub fn start(policy: SignalPolicy, session: SessionHandle) -> io::Result<Option<Self>> {
        let wanted = policy.signals();
        if wanted.is_empty() {
            return Ok(None);
        }

        let mut signals = Signals::new(&wanted)?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("devtrace-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        libc::SIGWINCH => forward_resize(&policy, &session),
                        libc::SIGTERM | libc::SIGHUP => {
                            info!(signal, "Termination signal received, stopping session");
                            session.stop();
                        }
                        other => debug!(signal = other, "Ignoring signal"),
                    }
                }
                debug!("Signal activity finished");
            })?;

        Ok(Some(Self {
            handle,
            thread: Some(thread),
        }))
    }

    pub fn close(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal thread panicked");
            }
        }
    }
}

impl Drop for SignalActivity {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward_resize(policy: &SignalPolicy, session: &SessionHandle) {
    let Some(fd) = policy.resize_from else {
        return;
    };
    match terminal_size(fd) {
        Some(size) => {
            if let Err(e) = session.resize(size) {
                debug!(error = %e, "Resize after SIGWINCH failed");
            }
        }
        None => debug!(fd, "Outer terminal size unavailable"),
    }
}

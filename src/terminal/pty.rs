//! PTY (Pseudo-Terminal) management
//!
//! A [`PseudoTerminalPair`] owns both ends of a freshly allocated PTY until a
//! child is spawned onto it. Spawning consumes the pair: the subordinate end
//! goes to the child and the parent's copy is closed immediately, leaving the
//! session with only the [`ControllingTerminal`].

use crate::error::{BridgeError, BridgeResult};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use std::io::{Read, Write};
use tracing::{debug, error, instrument};

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<PtySize> for TerminalSize {
    fn from(size: PtySize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// A freshly allocated PTY pair with no child attached yet
pub struct PseudoTerminalPair {
    master: Box<dyn MasterPty + Send>,
    slave: Box<dyn SlavePty + Send>,
}

/// Result of spawning a child onto a [`PseudoTerminalPair`]
pub struct SpawnedShell {
    pub terminal: ControllingTerminal,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PseudoTerminalPair {
    /// Allocate a PTY pair with the given initial size.
    #[instrument(skip_all, fields(rows = size.rows, cols = size.cols))]
    pub fn open(size: TerminalSize) -> BridgeResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size.into()).map_err(|e| {
            error!(error = %e, "Failed to open PTY");
            BridgeError::TerminalAllocation {
                reason: e.to_string(),
            }
        })?;
        debug!("PTY pair allocated");

        Ok(Self {
            master: pair.master,
            slave: pair.slave,
        })
    }

    /// Spawn `cmd` with its stdio attached to the subordinate end.
    ///
    /// The parent's subordinate handle is dropped before returning, whether or
    /// not the spawn succeeded.
    pub fn spawn(self, cmd: CommandBuilder) -> BridgeResult<SpawnedShell> {
        let program = cmd
            .get_argv()
            .first()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Self { master, slave } = self;
        let spawned = slave.spawn_command(cmd);
        drop(slave);

        let child = spawned.map_err(|e| {
            error!(program = %program, error = %e, "Failed to spawn shell command");
            BridgeError::Spawn {
                program,
                reason: e.to_string(),
            }
        })?;

        Ok(SpawnedShell {
            terminal: ControllingTerminal { master },
            child,
        })
    }
}

/// The controlling end of a PTY whose subordinate end belongs to a child.
///
/// Data flows through the independent reader and writer handles returned by
/// [`ControllingTerminal::reader`] and [`ControllingTerminal::take_writer`].
/// Resizing goes through the terminal-control path (an ioctl on the master)
/// and never touches those data handles.
pub struct ControllingTerminal {
    master: Box<dyn MasterPty + Send>,
}

impl ControllingTerminal {
    /// Clone a reader for the child's output
    pub fn reader(&self) -> BridgeResult<Box<dyn Read + Send>> {
        self.master.try_clone_reader().map_err(|e| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))
        })
    }

    /// Take the writer for the child's input. Only one writer can be taken.
    pub fn take_writer(&self) -> BridgeResult<Box<dyn Write + Send>> {
        self.master.take_writer().map_err(|e| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))
        })
    }

    pub fn resize(&self, size: TerminalSize) -> BridgeResult<()> {
        self.master
            .resize(size.into())
            .map_err(|e| BridgeError::Resize {
                reason: e.to_string(),
            })
    }

    /// Size as currently reported by the kernel
    pub fn size(&self) -> BridgeResult<TerminalSize> {
        self.master
            .get_size()
            .map(TerminalSize::from)
            .map_err(|e| BridgeError::Resize {
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for ControllingTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllingTerminal").finish_non_exhaustive()
    }
}

//! Terminal module for devtrace
//!
//! Provides the inner PTY pair owned by a bridged session and the raw-mode
//! handling for the outer terminal the user is sitting at.

pub mod pty;
pub mod raw_mode;

pub use pty::{ControllingTerminal, PseudoTerminalPair, SpawnedShell, TerminalSize};
pub use raw_mode::{is_tty, terminal_size, RawModeGuard};

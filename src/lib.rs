//! devtrace library
//!
//! Records what happens in an interactive shell session without changing how
//! it feels:
//! - Session Bridge: the shell runs on a private PTY with bytes relayed
//!   verbatim to and from the outer terminal
//! - Event Transport: a per-session named pipe written by shell hooks
//! - Event Parser: pairs CMD/EXIT lines into command events
//! - Event Store: JSONL persistence for sessions and events, with CSV/JSONL
//!   export

#[cfg(not(unix))]
compile_error!("devtrace requires a Unix platform");

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod hooks;
pub mod logging;
pub mod sink;
pub mod storage;
pub mod terminal;
pub mod transport;

pub use bridge::{
    BridgeOptions, EnvOverrides, Session, SessionBridge, SessionHandle, SessionInfo, ShellCommand,
    TerminationStatus,
};
pub use error::{DevtraceError, Result};
pub use events::{CommandEvent, EventParser, EventStatus, IncompleteReason};
pub use sink::{EventSink, MemorySink};
pub use storage::EventStore;

//! Lifecycle lines in, command events out

pub mod line;
pub mod model;
pub mod parser;

pub use line::{parse_line, LineError, RawLifecycleLine};
pub use model::{command_hash, CommandEvent, EventStatus, IncompleteReason};
pub use parser::{EventParser, ParserState, ParserStats};

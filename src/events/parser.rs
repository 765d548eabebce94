//! CMD/EXIT pairing state machine
//!
//! One parser per session, driven by the single transport-read activity.
//! Every started command reaches the sink exactly once: completed on its
//! EXIT, or incomplete when superseded by a newer CMD or when the session
//! ends first.

use super::line::{parse_line, RawLifecycleLine};
use super::model::{command_hash, CommandEvent, EventStatus, IncompleteReason};
use crate::sink::EventSink;
use crate::transport::{read_frame, Frame};
use chrono::{DateTime, Utc};
use std::io::{self, BufRead};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Largest accepted gap, in milliseconds, between the hook-reported duration
/// and the wall-clock delta of the CMD/EXIT timestamps. Timestamps have
/// one-second granularity.
pub const DEFAULT_DURATION_TOLERANCE_MS: u64 = 1000;

/// A command whose CMD line has been seen but not its EXIT line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCommand {
    pub sequence: u64,
    pub command: String,
    pub started_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParserState {
    #[default]
    Idle,
    Open(OpenCommand),
}

/// Counters for one parser's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParserStats {
    pub lines: u64,
    pub completed: u64,
    pub incomplete: u64,
    pub malformed: u64,
    pub orphaned_exits: u64,
    pub sink_failures: u64,
}

pub struct EventParser<S: EventSink> {
    session_id: Uuid,
    sink: S,
    state: ParserState,
    next_sequence: u64,
    duration_tolerance_ms: u64,
    stats: ParserStats,
}

impl<S: EventSink> EventParser<S> {
    pub fn new(session_id: Uuid, sink: S) -> Self {
        Self {
            session_id,
            sink,
            state: ParserState::Idle,
            next_sequence: 1,
            duration_tolerance_ms: DEFAULT_DURATION_TOLERANCE_MS,
            stats: ParserStats::default(),
        }
    }

    pub fn with_duration_tolerance(mut self, tolerance_ms: u64) -> Self {
        self.duration_tolerance_ms = tolerance_ms;
        self
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Feed one complete line (terminator stripped).
    pub fn feed_line(&mut self, line: &str) {
        self.stats.lines += 1;
        trace!(session_id = %self.session_id, line, "Transport line");

        match parse_line(line) {
            Ok(RawLifecycleLine::Cmd { timestamp, command }) => self.on_cmd(timestamp, command),
            Ok(RawLifecycleLine::Exit {
                timestamp,
                exit_code,
                duration_ms,
                cwd,
            }) => self.on_exit(timestamp, exit_code, duration_ms, cwd),
            Err(e) => {
                self.stats.malformed += 1;
                warn!(session_id = %self.session_id, error = %e, line, "Discarding malformed line");
            }
        }
    }

    /// Feed one transport frame. Returns `false` once the stream has ended.
    pub fn feed_frame(&mut self, frame: Frame) -> bool {
        match frame {
            Frame::Line(line) => {
                self.feed_line(&line);
                true
            }
            Frame::Oversized { len } => {
                self.stats.lines += 1;
                self.stats.malformed += 1;
                warn!(session_id = %self.session_id, len, "Discarding oversized line");
                true
            }
            Frame::Partial(fragment) => {
                self.stats.lines += 1;
                self.stats.malformed += 1;
                warn!(
                    session_id = %self.session_id,
                    line = %fragment,
                    "Discarding unterminated line"
                );
                true
            }
            Frame::Eof => false,
        }
    }

    /// Consume `reader` until EOF, then finish. A read error ends the stream
    /// the same way EOF does.
    pub fn run<R: BufRead>(&mut self, reader: &mut R) -> ParserStats {
        let mut buf = Vec::new();
        loop {
            match read_frame(reader, &mut buf) {
                Ok(frame) => {
                    if !self.feed_frame(frame) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Transport read failed");
                    break;
                }
            }
        }
        self.finish();
        self.stats
    }

    /// End of stream: an open command becomes an incomplete event.
    pub fn finish(&mut self) {
        if let ParserState::Open(open) = std::mem::take(&mut self.state) {
            warn!(
                session_id = %self.session_id,
                sequence = open.sequence,
                command = %open.command,
                "Session ended with command still open"
            );
            self.emit_incomplete(open, IncompleteReason::SessionEnded);
        }
    }

    fn on_cmd(&mut self, timestamp: i64, command: String) {
        if let ParserState::Open(previous) = std::mem::take(&mut self.state) {
            warn!(
                session_id = %self.session_id,
                sequence = previous.sequence,
                command = %previous.command,
                "Command superseded before its EXIT arrived"
            );
            self.emit_incomplete(previous, IncompleteReason::Superseded);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(session_id = %self.session_id, sequence, command = %command, "Command started");
        self.state = ParserState::Open(OpenCommand {
            sequence,
            command,
            started_at: timestamp,
        });
    }

    fn on_exit(&mut self, timestamp: i64, exit_code: i32, reported_ms: i64, cwd: String) {
        let open = match std::mem::take(&mut self.state) {
            ParserState::Open(open) => open,
            ParserState::Idle => {
                self.stats.orphaned_exits += 1;
                warn!(
                    session_id = %self.session_id,
                    exit_code,
                    cwd = %cwd,
                    "Discarding EXIT without a matching CMD"
                );
                return;
            }
        };

        let duration_ms = reconcile_duration(
            open.started_at,
            timestamp,
            reported_ms,
            self.duration_tolerance_ms,
        );
        debug!(
            session_id = %self.session_id,
            sequence = open.sequence,
            exit_code,
            duration_ms,
            "Command finished"
        );

        let event = CommandEvent {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            sequence: open.sequence,
            command_hash: command_hash(&open.command),
            command: open.command,
            started_at: to_datetime(open.started_at),
            exit_code: Some(exit_code),
            duration_ms: Some(duration_ms),
            cwd: Some(cwd),
            status: EventStatus::Completed,
            git: None,
        };
        self.stats.completed += 1;
        self.deliver(&event);
    }

    fn emit_incomplete(&mut self, open: OpenCommand, reason: IncompleteReason) {
        let event = CommandEvent {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            sequence: open.sequence,
            command_hash: command_hash(&open.command),
            command: open.command,
            started_at: to_datetime(open.started_at),
            exit_code: None,
            duration_ms: None,
            cwd: None,
            status: EventStatus::Incomplete { reason },
            git: None,
        };
        self.stats.incomplete += 1;
        self.deliver(&event);
    }

    fn deliver(&mut self, event: &CommandEvent) {
        if let Err(e) = self.sink.deliver(event) {
            self.stats.sink_failures += 1;
            warn!(
                session_id = %self.session_id,
                sequence = event.sequence,
                error = %e,
                "Event sink rejected event"
            );
        }
    }
}

fn to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}

/// Pick the duration to record for a command.
///
/// The wall-clock delta between the two timestamps is authoritative; the
/// hook-reported value is kept only when it is non-negative and within
/// `tolerance_ms` of that delta.
pub fn reconcile_duration(started_at: i64, ended_at: i64, reported_ms: i64, tolerance_ms: u64) -> u64 {
    let wall_ms = (ended_at.saturating_sub(started_at)).max(0) as u64;
    let wall_ms = wall_ms.saturating_mul(1000);

    if reported_ms < 0 {
        return wall_ms;
    }
    let reported_ms = reported_ms as u64;
    if reported_ms.abs_diff(wall_ms) <= tolerance_ms {
        reported_ms
    } else {
        wall_ms
    }
}

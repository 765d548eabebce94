//! Event Store
//!
//! Append-only JSONL files under a data directory:
//!
//! - `sessions.jsonl`: one [`SessionRecord`] per line, rewritten when a
//!   session closes
//! - `events.jsonl`: one [`CommandEvent`] per line, appended by
//!   [`JsonlEventSink`]
//!
//! Lines that fail to parse are skipped with a warning.

mod export;

pub use export::{write_events, ExportFormat};

use crate::bridge::{SessionInfo, TerminationStatus};
use crate::error::{SinkError, StorageError, StorageResult};
use crate::events::CommandEvent;
use crate::sink::EventSink;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SESSIONS_FILE: &str = "sessions.jsonl";
pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// A recorded session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub label: Option<String>,
    pub shell: String,
    pub cwd: PathBuf,
    pub transport_path: Option<PathBuf>,
    pub status: SessionStatus,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub termination: Option<TerminationStatus>,
}

impl From<&SessionInfo> for SessionRecord {
    fn from(info: &SessionInfo) -> Self {
        Self {
            id: info.id,
            started_at: info.started_at,
            label: info.label.clone(),
            shell: info.shell.clone(),
            cwd: info.cwd.clone(),
            transport_path: Some(info.transport_path.clone()),
            status: SessionStatus::Active,
            ended_at: None,
            termination: None,
        }
    }
}

/// JSONL-backed session and event storage
#[derive(Debug, Clone)]
pub struct EventStore {
    base_path: PathBuf,
    sessions_path: PathBuf,
    events_path: PathBuf,
}

impl EventStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            sessions_path: base_path.join(SESSIONS_FILE),
            events_path: base_path.join(EVENTS_FILE),
            base_path,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Create the directory and empty files if missing
    pub fn ensure_storage(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).map_err(|e| write_failed(&self.base_path, e))?;
        for path in [&self.sessions_path, &self.events_path] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| write_failed(path, e))?;
        }
        debug!(path = %self.base_path.display(), "Storage ready");
        Ok(())
    }

    pub fn create_session(&self, record: &SessionRecord) -> StorageResult<()> {
        let line = serde_json::to_string(record)?;
        append_line(&self.sessions_path, &line)?;
        info!(session_id = %record.id, "Session recorded");
        Ok(())
    }

    /// Mark a session closed with its termination status.
    pub fn close_session(
        &self,
        id: Uuid,
        termination: TerminationStatus,
    ) -> StorageResult<SessionRecord> {
        let mut sessions = self.list_sessions()?;
        let record = sessions
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(StorageError::SessionNotFound { id })?;
        record.status = SessionStatus::Closed;
        record.ended_at = Some(Utc::now());
        record.termination = Some(termination);
        let closed = record.clone();

        self.rewrite_sessions(&sessions)?;
        info!(session_id = %id, "Session closed");
        Ok(closed)
    }

    pub fn get_session(&self, id: Uuid) -> StorageResult<SessionRecord> {
        self.list_sessions()?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or(StorageError::SessionNotFound { id })
    }

    pub fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        read_jsonl(&self.sessions_path)
    }

    /// Events in file order, optionally for one session, keeping only the
    /// newest `limit`.
    pub fn list_events(
        &self,
        session_id: Option<Uuid>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<CommandEvent>> {
        let mut events: Vec<CommandEvent> = read_jsonl(&self.events_path)?;
        if let Some(session_id) = session_id {
            events.retain(|event| event.session_id == session_id);
        }
        if let Some(limit) = limit.filter(|&limit| limit > 0) {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }
        Ok(events)
    }

    pub fn append_event(&self, event: &CommandEvent) -> StorageResult<()> {
        let line = serde_json::to_string(event)?;
        append_line(&self.events_path, &line)
    }

    /// A sink that appends delivered events to `events.jsonl`
    pub fn event_sink(&self) -> JsonlEventSink {
        JsonlEventSink::new(self.events_path.clone())
    }

    fn rewrite_sessions(&self, sessions: &[SessionRecord]) -> StorageResult<()> {
        let mut content = String::new();
        for session in sessions {
            content.push_str(&serde_json::to_string(session)?);
            content.push('\n');
        }

        let tmp = self.sessions_path.with_extension("jsonl.tmp");
        fs::write(&tmp, content).map_err(|e| write_failed(&tmp, e))?;
        fs::rename(&tmp, &self.sessions_path).map_err(|e| write_failed(&self.sessions_path, e))
    }
}

/// Appends events to a JSONL file, one `write` per event
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "event file not open"))
    }
}

impl EventSink for JsonlEventSink {
    fn deliver(&mut self, event: &CommandEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let file = self.file()?;
        if let Err(e) = file.write_all(line.as_bytes()) {
            // Reopen on the next event.
            self.file = None;
            return Err(SinkError::Io(e));
        }
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> StorageResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| write_failed(path, e))?;
    file.write_all(format!("{line}\n").as_bytes())
        .map_err(|e| write_failed(path, e))
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(read_failed(path, e)),
    };

    let mut items = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| read_failed(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping unreadable record"
            ),
        }
    }
    Ok(items)
}

fn read_failed(path: &Path, e: io::Error) -> StorageError {
    StorageError::FileReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn write_failed(path: &Path, e: io::Error) -> StorageError {
    StorageError::FileWriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{command_hash, EventStatus, IncompleteReason};
    use pretty_assertions::assert_eq;

    fn record(label: &str) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            label: Some(label.to_string()),
            shell: "/bin/bash".to_string(),
            cwd: PathBuf::from("/tmp"),
            transport_path: None,
            status: SessionStatus::Active,
            ended_at: None,
            termination: None,
        }
    }

    fn event(session_id: Uuid, sequence: u64, command: &str) -> CommandEvent {
        CommandEvent {
            id: Uuid::new_v4(),
            session_id,
            sequence,
            command: command.to_string(),
            command_hash: command_hash(command),
            started_at: Utc::now(),
            exit_code: Some(0),
            duration_ms: Some(5),
            cwd: Some("/tmp".to_string()),
            status: EventStatus::Completed,
            git: None,
        }
    }

    #[test]
    fn test_ensure_storage_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path().join("data"));
        store.ensure_storage().unwrap();
        assert!(store.base_path().join(SESSIONS_FILE).is_file());
        assert!(store.base_path().join(EVENTS_FILE).is_file());
        assert!(store.list_sessions().unwrap().is_empty());

        // Idempotent, and keeps existing content.
        store.create_session(&record("a")).unwrap();
        store.ensure_storage().unwrap();
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[test]
    fn test_close_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.ensure_storage().unwrap();

        let first = record("first");
        let second = record("second");
        store.create_session(&first).unwrap();
        store.create_session(&second).unwrap();

        let closed = store
            .close_session(first.id, TerminationStatus::Exited(2))
            .unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.termination, Some(TerminationStatus::Exited(2)));

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].status, SessionStatus::Closed);
        assert_eq!(sessions[1], second);
    }

    #[test]
    fn test_close_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.ensure_storage().unwrap();
        let result = store.close_session(Uuid::new_v4(), TerminationStatus::Exited(0));
        assert!(matches!(result, Err(StorageError::SessionNotFound { .. })));
    }

    #[test]
    fn test_event_sink_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.ensure_storage().unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut sink = store.event_sink();
        sink.deliver(&event(a, 1, "ls")).unwrap();
        sink.deliver(&event(b, 1, "pwd")).unwrap();
        sink.deliver(&event(a, 2, "make")).unwrap();
        let mut anomaly = event(a, 3, "sleep 100");
        anomaly.exit_code = None;
        anomaly.duration_ms = None;
        anomaly.status = EventStatus::Incomplete {
            reason: IncompleteReason::SessionEnded,
        };
        sink.deliver(&anomaly).unwrap();

        assert_eq!(store.list_events(None, None).unwrap().len(), 4);

        let for_a: Vec<String> = store
            .list_events(Some(a), None)
            .unwrap()
            .into_iter()
            .map(|e| e.command)
            .collect();
        assert_eq!(for_a, vec!["ls", "make", "sleep 100"]);

        let newest: Vec<String> = store
            .list_events(Some(a), Some(2))
            .unwrap()
            .into_iter()
            .map(|e| e.command)
            .collect();
        assert_eq!(newest, vec!["make", "sleep 100"]);

        let stored = store.list_events(Some(a), Some(1)).unwrap();
        assert_eq!(stored[0], anomaly);
    }

    #[test]
    fn test_unreadable_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.ensure_storage().unwrap();

        let session = Uuid::new_v4();
        store.append_event(&event(session, 1, "ls")).unwrap();
        append_line(store.events_path(), "{not json").unwrap();
        store.append_event(&event(session, 2, "pwd")).unwrap();

        assert_eq!(store.list_events(None, None).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path().join("never-created"));
        assert!(store.list_events(None, Some(10)).unwrap().is_empty());
        assert!(matches!(
            store.get_session(Uuid::new_v4()),
            Err(StorageError::SessionNotFound { .. })
        ));
    }
}

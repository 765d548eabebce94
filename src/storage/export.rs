//! Event export for analysis outside devtrace

use super::{write_failed, EventStore};
use crate::error::StorageResult;
use crate::events::{CommandEvent, EventStatus, IncompleteReason};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

const CSV_HEADER: &str = "id,session_id,sequence,command,command_hash,started_at,exit_code,duration_ms,cwd,status,incomplete_reason,files_touched,lines_added,lines_deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Jsonl,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jsonl" => Ok(ExportFormat::Jsonl),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unsupported format '{other}' (expected csv or jsonl)")),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Jsonl => "jsonl",
            ExportFormat::Csv => "csv",
        })
    }
}

impl EventStore {
    /// Write the stored events (optionally one session's) to `out`.
    /// Returns the number of events written.
    pub fn export_events(
        &self,
        out: &Path,
        format: ExportFormat,
        session_id: Option<Uuid>,
    ) -> StorageResult<usize> {
        let events = self.list_events(session_id, None)?;
        let file = File::create(out).map_err(|e| write_failed(out, e))?;
        let mut writer = BufWriter::new(file);
        write_events(&events, format, &mut writer).map_err(|e| write_failed(out, e))?;
        writer.flush().map_err(|e| write_failed(out, e))?;

        info!(path = %out.display(), format = %format, count = events.len(), "Events exported");
        Ok(events.len())
    }
}

pub fn write_events<W: Write>(
    events: &[CommandEvent],
    format: ExportFormat,
    writer: &mut W,
) -> io::Result<()> {
    match format {
        ExportFormat::Jsonl => {
            for event in events {
                serde_json::to_writer(&mut *writer, event)?;
                writer.write_all(b"\n")?;
            }
        }
        ExportFormat::Csv => {
            writeln!(writer, "{CSV_HEADER}")?;
            for event in events {
                writeln!(writer, "{}", csv_row(event))?;
            }
        }
    }
    Ok(())
}

fn csv_row(event: &CommandEvent) -> String {
    let optional = |value: Option<String>| value.unwrap_or_default();
    let (status, reason) = match event.status {
        EventStatus::Completed => ("completed", ""),
        EventStatus::Incomplete { reason } => (
            "incomplete",
            match reason {
                IncompleteReason::Superseded => "superseded",
                IncompleteReason::SessionEnded => "session_ended",
            },
        ),
    };
    let git = event.git.unwrap_or_default();
    let git_field = |n: u64| {
        if event.git.is_some() {
            n.to_string()
        } else {
            String::new()
        }
    };

    [
        event.id.to_string(),
        event.session_id.to_string(),
        event.sequence.to_string(),
        csv_field(&event.command),
        event.command_hash.clone(),
        event.started_at.to_rfc3339(),
        optional(event.exit_code.map(|c| c.to_string())),
        optional(event.duration_ms.map(|d| d.to_string())),
        csv_field(event.cwd.as_deref().unwrap_or_default()),
        status.to_string(),
        reason.to_string(),
        git_field(git.files_touched),
        git_field(git.lines_added),
        git_field(git.lines_deleted),
    ]
    .join(",")
}

/// Quote a field when it holds a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::command_hash;
    use crate::git::DiffMetrics;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;

    fn event(command: &str, status: EventStatus) -> CommandEvent {
        CommandEvent {
            id: Uuid::nil(),
            session_id: Uuid::nil(),
            sequence: 1,
            command: command.to_string(),
            command_hash: command_hash(command),
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            exit_code: status.eq(&EventStatus::Completed).then_some(2),
            duration_ms: status.eq(&EventStatus::Completed).then_some(40),
            cwd: status.eq(&EventStatus::Completed).then(|| "/src".to_string()),
            status,
            git: None,
        }
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("CSV".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert_eq!("jsonl".parse::<ExportFormat>(), Ok(ExportFormat::Jsonl));
        assert!("parquet".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_csv_quotes_only_when_needed() {
        assert_eq!(csv_field("make test"), "make test");
        assert_eq!(csv_field("echo \"a,b\""), "\"echo \"\"a,b\"\"\"");
        assert_eq!(csv_field("printf 'x\ny'"), "\"printf 'x\ny'\"");
    }

    #[test]
    fn test_csv_rows() {
        let mut completed = event("grep -c a,b", EventStatus::Completed);
        completed.git = Some(DiffMetrics {
            files_touched: 1,
            lines_added: 4,
            lines_deleted: 2,
        });
        let incomplete = event(
            "sleep 100",
            EventStatus::Incomplete {
                reason: IncompleteReason::SessionEnded,
            },
        );

        let mut out = Vec::new();
        write_events(&[completed.clone(), incomplete], ExportFormat::Csv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], CSV_HEADER);
        let nil = Uuid::nil();
        assert_eq!(
            lines[1],
            format!(
                "{nil},{nil},1,\"grep -c a,b\",{},2023-11-14T22:13:20+00:00,2,40,/src,completed,,1,4,2",
                completed.command_hash
            )
        );
        assert!(lines[2].ends_with(",,,,incomplete,session_ended,,,"), "{}", lines[2]);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_export_jsonl_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path());
        store.ensure_storage().unwrap();
        let first = event("ls", EventStatus::Completed);
        let mut other = event("pwd", EventStatus::Completed);
        other.session_id = Uuid::new_v4();
        store.append_event(&first).unwrap();
        store.append_event(&other).unwrap();

        let out = dir.path().join("export.jsonl");
        let count = store
            .export_events(&out, ExportFormat::Jsonl, Some(Uuid::nil()))
            .unwrap();
        assert_eq!(count, 1);

        let text = std::fs::read_to_string(&out).unwrap();
        let exported: CommandEvent = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(exported, first);
    }
}

//! Event store fed by live sessions
//!
//! Run with: cargo test --test storage_test

use devtrace::bridge::{BridgeOptions, EnvOverrides, SessionBridge, ShellCommand, TerminationStatus};
use devtrace::events::{EventParser, EventStatus};
use devtrace::storage::{EventStore, SessionRecord, SessionStatus};
use pretty_assertions::assert_eq;
use std::io;
use uuid::Uuid;

#[test]
fn test_session_and_events_are_persisted() {
    let data = tempfile::tempdir().unwrap();
    let runtime = tempfile::tempdir().unwrap();
    let store = EventStore::new(data.path());
    store.ensure_storage().unwrap();

    let bridge = SessionBridge::new(
        BridgeOptions::default()
            .with_transport_dir(runtime.path())
            .with_hooks(false),
    );
    let script = r#"
        pipe="$DEVTRACE_EVENT_PIPE"
        printf 'CMD 1700000000 make test\n' >> "$pipe"
        printf 'EXIT 1700000001 2 800 /src/my project\n' >> "$pipe"
        printf 'CMD 1700000002 echo multi%%0Aline\n' >> "$pipe"
        printf 'EXIT 1700000002 0 3 /src\n' >> "$pipe"
        exit 5
    "#;
    let mut session = bridge
        .start(
            ShellCommand::new("/bin/sh")
                .args(["-c", script])
                .label("ci-agent"),
            EnvOverrides::new(),
            io::empty(),
            io::sink(),
            store.event_sink(),
        )
        .unwrap();

    let record = SessionRecord::from(session.info());
    store.create_session(&record).unwrap();
    let status = session.wait();
    assert_eq!(status, TerminationStatus::Exited(5));
    store.close_session(record.id, status).unwrap();

    let sessions = store.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].label.as_deref(), Some("ci-agent"));
    assert_eq!(sessions[0].status, SessionStatus::Closed);
    assert_eq!(sessions[0].termination, Some(TerminationStatus::Exited(5)));

    let events = store.list_events(Some(record.id), None).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].command, "make test");
    assert_eq!(events[0].exit_code, Some(2));
    assert_eq!(events[0].cwd.as_deref(), Some("/src/my project"));
    assert_eq!(events[1].command, "echo multi\nline");
    assert!(events.iter().all(|e| e.status == EventStatus::Completed));
}

#[test]
fn test_parser_writes_through_jsonl_sink() {
    let data = tempfile::tempdir().unwrap();
    let store = EventStore::new(data.path());
    store.ensure_storage().unwrap();

    let session_id = Uuid::new_v4();
    let mut parser = EventParser::new(session_id, store.event_sink());
    parser.feed_line("CMD 10 git status");
    parser.feed_line("EXIT 10 0 40 /repo");
    parser.feed_line("CMD 11 git push");
    parser.finish();

    let events = store.list_events(Some(session_id), None).unwrap();
    let commands: Vec<&str> = events.iter().map(|e| e.command.as_str()).collect();
    assert_eq!(commands, vec!["git status", "git push"]);
    assert!(events[0].is_completed());
    assert!(!events[1].is_completed());

    assert!(store.list_events(Some(Uuid::new_v4()), None).unwrap().is_empty());
}

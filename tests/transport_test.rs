//! Event transport and parser over a real named pipe
//!
//! Run with: cargo test --test transport_test

use devtrace::events::{EventParser, IncompleteReason};
use devtrace::sink::MemorySink;
use devtrace::transport::{EventTransport, Frame};
use pretty_assertions::assert_eq;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

fn append(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

#[test]
fn test_parser_pairs_lines_split_across_writes() {
    let dir = tempfile::tempdir().unwrap();
    let session_id = Uuid::new_v4();
    let mut transport = EventTransport::create(dir.path(), session_id).unwrap();
    let mut reader = transport.open_for_reading().unwrap();
    let path = transport.path().to_path_buf();

    let writer = thread::spawn(move || {
        append(&path, b"CMD 100 cargo ");
        thread::sleep(Duration::from_millis(20));
        append(&path, b"build --release\nEXIT 1");
        thread::sleep(Duration::from_millis(20));
        append(&path, b"02 0 2100 /work/repo\n");
        append(&path, b"CMD 200 vim\n");
    });

    let sink = MemorySink::new();
    let parser_sink = sink.clone();
    let parser = thread::spawn(move || {
        let mut parser = EventParser::new(session_id, parser_sink);
        parser.run(&mut reader)
    });

    writer.join().unwrap();
    transport.close_writer();
    let stats = parser.join().unwrap();
    transport.destroy().unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(stats.incomplete, 1);

    let events = sink.events();
    assert_eq!(events[0].command, "cargo build --release");
    assert_eq!(events[0].duration_ms, Some(2100));
    assert_eq!(events[0].cwd.as_deref(), Some("/work/repo"));
    assert_eq!(events[1].command, "vim");
    assert_eq!(
        events[1].incomplete_reason(),
        Some(IncompleteReason::SessionEnded)
    );
}

#[test]
fn test_concurrent_writers_never_interleave_small_lines() {
    const WRITERS: usize = 4;
    const LINES: usize = 200;

    let dir = tempfile::tempdir().unwrap();
    let mut transport = EventTransport::create(dir.path(), Uuid::new_v4()).unwrap();
    let mut reader = transport.open_for_reading().unwrap();

    let writers: Vec<_> = (0..WRITERS)
        .map(|id| {
            let path: PathBuf = transport.path().to_path_buf();
            thread::spawn(move || {
                let padding = "x".repeat(900);
                for n in 0..LINES {
                    // One open and one write per line, like a hook invocation.
                    append(&path, format!("W{id} {n} {padding}\n").as_bytes());
                }
            })
        })
        .collect();

    let consumer = thread::spawn(move || {
        let mut seen = vec![0usize; WRITERS];
        let mut buf = Vec::new();
        loop {
            match reader.next_frame(&mut buf).unwrap() {
                Frame::Line(line) => {
                    let mut fields = line.splitn(3, ' ');
                    let id: usize = fields.next().unwrap()[1..].parse().unwrap();
                    let n: usize = fields.next().unwrap().parse().unwrap();
                    assert_eq!(fields.next().unwrap().len(), 900);
                    // Order per writer is preserved.
                    assert_eq!(n, seen[id]);
                    seen[id] += 1;
                }
                Frame::Eof => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        seen
    });

    for writer in writers {
        writer.join().unwrap();
    }
    transport.close_writer();
    let seen = consumer.join().unwrap();
    assert_eq!(seen, vec![LINES; WRITERS]);
}

#[test]
fn test_reader_sees_eof_only_after_close_writer() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = EventTransport::create(dir.path(), Uuid::new_v4()).unwrap();
    let mut reader = transport.open_for_reading().unwrap();

    // A writer coming and going does not end the stream.
    append(transport.path(), b"CMD 1 true\n");
    let mut buf = Vec::new();
    assert_eq!(
        reader.next_frame(&mut buf).unwrap(),
        Frame::Line("CMD 1 true".to_string())
    );

    append(transport.path(), b"EXIT 1 0 0 /\n");
    transport.close_writer();
    assert_eq!(
        reader.next_frame(&mut buf).unwrap(),
        Frame::Line("EXIT 1 0 0 /".to_string())
    );
    assert_eq!(reader.next_frame(&mut buf).unwrap(), Frame::Eof);

    drop(reader);
    transport.destroy().unwrap();
    transport.destroy().unwrap();
    assert!(!transport.path().exists());
}

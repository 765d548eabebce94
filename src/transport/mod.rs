//! Event transport
//!
//! A per-session named pipe that shell-side hooks append lifecycle lines to.
//! It is completely separate from the interactive byte relay.
//!
//! The reader end is opened non-blocking, a keepalive writer is opened
//! against it, and the reader is then switched back to blocking mode. Holding
//! the keepalive means the reader never sees EOF between two short-lived hook
//! writers; releasing it (see [`EventTransport::close_writer`]) lets the
//! reader drain whatever is left and then observe EOF.

use crate::error::{TransportError, TransportResult};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Environment variable carrying the transport path into the child shell
pub const TRANSPORT_ENV_VAR: &str = "DEVTRACE_EVENT_PIPE";

/// Longest line accepted from the transport. Matches the Linux `PIPE_BUF`,
/// the largest write the kernel guarantees not to interleave.
pub const MAX_LINE_BYTES: usize = 4096;

/// A session-scoped named pipe.
#[derive(Debug)]
pub struct EventTransport {
    path: PathBuf,
    keepalive: Option<File>,
    reader_opened: bool,
    destroyed: bool,
}

impl EventTransport {
    /// Create the pipe in `dir`. The name embeds the process id and session
    /// id; an existing object at that path is reported as a collision and
    /// never reused.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn create(dir: &Path, session_id: Uuid) -> TransportResult<Self> {
        let path = dir.join(transport_file_name(session_id));

        fs::create_dir_all(dir).map_err(|source| TransportError::Create {
            path: path.clone(),
            source,
        })?;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
            TransportError::Create {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            }
        })?;

        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => TransportError::Collision { path },
                Some(libc::EACCES) | Some(libc::EPERM) => {
                    TransportError::PermissionDenied { path }
                }
                _ => TransportError::Create { path, source: err },
            });
        }

        info!(path = %path.display(), "Event transport created");
        Ok(Self {
            path,
            keepalive: None,
            reader_opened: false,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the single reader for this transport.
    pub fn open_for_reading(&mut self) -> TransportResult<TransportReader> {
        if self.reader_opened {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transport reader already opened",
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)?;
        // A reader exists now, so opening for write completes immediately.
        let keepalive = OpenOptions::new().write(true).open(&self.path)?;
        set_blocking(&file)?;

        self.keepalive = Some(keepalive);
        self.reader_opened = true;
        debug!(path = %self.path.display(), "Transport opened for reading");

        Ok(TransportReader {
            inner: BufReader::new(file),
        })
    }

    /// Release the keepalive writer so the reader reaches EOF once every
    /// hook writer has closed.
    pub fn close_writer(&mut self) {
        if self.keepalive.take().is_some() {
            debug!(path = %self.path.display(), "Transport keepalive released");
        }
    }

    /// Remove the pipe from the file system. Idempotent.
    ///
    /// Call only after the reader has been dropped; unlinking does not cut off
    /// a reader, but lines written after the unlink can no longer arrive.
    pub fn destroy(&mut self) -> TransportResult<()> {
        self.close_writer();
        if self.destroyed {
            return Ok(());
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransportError::Io(e)),
        }
        self.destroyed = true;
        info!(path = %self.path.display(), "Event transport destroyed");
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for EventTransport {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(path = %self.path.display(), error = %e, "Failed to remove event transport");
        }
    }
}

fn transport_file_name(session_id: Uuid) -> String {
    format!("devtrace-{}-{}.pipe", std::process::id(), session_id.simple())
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Blocking, buffered reader over the transport.
pub struct TransportReader {
    inner: BufReader<File>,
}

impl TransportReader {
    /// Read the next frame, blocking until a full line, EOF or an error.
    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> io::Result<Frame> {
        read_frame(&mut self.inner, buf)
    }
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for TransportReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

/// One unit read off the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A newline-terminated line, terminator stripped
    Line(String),
    /// A line longer than [`MAX_LINE_BYTES`]; its content was discarded
    Oversized { len: usize },
    /// Bytes left without a terminator when the stream ended
    Partial(String),
    Eof,
}

/// Read one frame from `reader`.
///
/// Lines may arrive split across any number of reads; only the terminator
/// delimits them. Memory use is bounded by [`MAX_LINE_BYTES`].
pub fn read_frame<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Frame> {
    buf.clear();
    let limit = (MAX_LINE_BYTES + 1) as u64;
    let n = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(Frame::Line(String::from_utf8_lossy(buf).into_owned()));
    }

    if buf.len() > MAX_LINE_BYTES {
        let skipped = skip_to_line_end(reader)?;
        return Ok(Frame::Oversized {
            len: buf.len() + skipped,
        });
    }

    Ok(Frame::Partial(String::from_utf8_lossy(buf).into_owned()))
}

/// Discard input up to and including the next newline.
fn skip_to_line_end<R: BufRead>(reader: &mut R) -> io::Result<usize> {
    let mut skipped = 0;
    loop {
        let (done, used) = {
            let available = match reader.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (true, pos + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped.saturating_sub(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{Cursor, Write};

    /// Hands out at most `chunk` bytes per read to simulate split writes.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn collect_frames<R: BufRead>(mut reader: R) -> Vec<Frame> {
        let mut buf = Vec::new();
        let mut frames = Vec::new();
        loop {
            let frame = read_frame(&mut reader, &mut buf).unwrap();
            if frame == Frame::Eof {
                return frames;
            }
            frames.push(frame);
        }
    }

    #[test]
    fn test_lines_split_across_reads() {
        let data = b"CMD 100 ls -la\nEXIT 101 0 900 /tmp\n";
        let reader = BufReader::with_capacity(3, Trickle { data, chunk: 2 });

        assert_eq!(
            collect_frames(reader),
            vec![
                Frame::Line("CMD 100 ls -la".to_string()),
                Frame::Line("EXIT 101 0 900 /tmp".to_string()),
            ]
        );
    }

    #[test]
    fn test_crlf_is_stripped() {
        let frames = collect_frames(Cursor::new(b"CMD 1 x\r\n".to_vec()));
        assert_eq!(frames, vec![Frame::Line("CMD 1 x".to_string())]);
    }

    #[test]
    fn test_trailing_fragment_is_partial() {
        let frames = collect_frames(Cursor::new(b"CMD 1 a\nEXIT 2 0".to_vec()));
        assert_eq!(
            frames,
            vec![
                Frame::Line("CMD 1 a".to_string()),
                Frame::Partial("EXIT 2 0".to_string()),
            ]
        );
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut data = b"CMD 1 ".to_vec();
        data.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 10));
        data.extend_from_slice(b"\nCMD 2 ok\n");

        let frames = collect_frames(Cursor::new(data));
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            Frame::Oversized {
                len: MAX_LINE_BYTES + 16
            }
        );
        assert_eq!(frames[1], Frame::Line("CMD 2 ok".to_string()));
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let mut data = vec![b'y'; MAX_LINE_BYTES];
        data.push(b'\n');
        let frames = collect_frames(Cursor::new(data));
        assert_eq!(frames, vec![Frame::Line("y".repeat(MAX_LINE_BYTES))]);
    }

    #[test]
    fn test_create_names_pipe_after_session() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let transport = EventTransport::create(dir.path(), id).unwrap();

        let name = transport.path().file_name().unwrap().to_string_lossy();
        assert!(name.contains(&id.simple().to_string()));
        assert!(name.contains(&std::process::id().to_string()));
        assert!(transport.path().exists());
    }

    #[test]
    fn test_create_collision_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let _first = EventTransport::create(dir.path(), id).unwrap();

        let second = EventTransport::create(dir.path(), id);
        assert!(matches!(second, Err(TransportError::Collision { .. })));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = EventTransport::create(dir.path(), Uuid::new_v4()).unwrap();
        let path = transport.path().to_path_buf();

        transport.destroy().unwrap();
        assert!(!path.exists());
        transport.destroy().unwrap();
        assert!(transport.is_destroyed());
        assert!(!path.exists());
    }

    #[test]
    fn test_reader_sees_writes_then_eof_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = EventTransport::create(dir.path(), Uuid::new_v4()).unwrap();
        let mut reader = transport.open_for_reading().unwrap();

        for line in ["CMD 10 echo one", "EXIT 11 0 5 /home/x"] {
            let mut writer = OpenOptions::new()
                .append(true)
                .open(transport.path())
                .unwrap();
            writeln!(writer, "{line}").unwrap();
        }
        transport.close_writer();

        let mut buf = Vec::new();
        assert_eq!(
            reader.next_frame(&mut buf).unwrap(),
            Frame::Line("CMD 10 echo one".to_string())
        );
        assert_eq!(
            reader.next_frame(&mut buf).unwrap(),
            Frame::Line("EXIT 11 0 5 /home/x".to_string())
        );
        assert_eq!(reader.next_frame(&mut buf).unwrap(), Frame::Eof);
    }

    #[test]
    fn test_second_reader_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = EventTransport::create(dir.path(), Uuid::new_v4()).unwrap();
        let _reader = transport.open_for_reading().unwrap();
        assert!(transport.open_for_reading().is_err());
    }
}

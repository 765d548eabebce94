//! Byte relay loops
//!
//! Bytes are copied verbatim in both directions. Nothing is buffered by line
//! and no escape sequence is interpreted; the child shell negotiates its own
//! terminal modes on the inner PTY.

use std::io::{self, Read, Write};
use tracing::{debug, trace, warn};

/// Chunk size for one read
pub const RELAY_CHUNK_SIZE: usize = 8192;

/// Why a relay loop stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// The source returned EOF
    ReaderEof,
    /// The source failed; for the PTY side this is how a closed handle is
    /// reported once the child has exited
    ReaderFailed(io::Error),
    WriterFailed(io::Error),
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes: u64,
    pub end: RelayEnd,
}

/// Copy `reader` into `writer` until either side stops, flushing after every
/// chunk so interactive output is never held back.
pub fn copy_stream<R, W>(name: &'static str, reader: &mut R, writer: &mut W) -> RelayOutcome
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = [0u8; RELAY_CHUNK_SIZE];
    let mut bytes: u64 = 0;

    let end = loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break RelayEnd::ReaderEof,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break RelayEnd::ReaderFailed(e),
        };

        if let Err(e) = writer.write_all(&buf[..n]).and_then(|()| writer.flush()) {
            break RelayEnd::WriterFailed(e);
        }
        bytes += n as u64;
        trace!(relay = name, bytes = n, "Relayed chunk");
    };

    match &end {
        RelayEnd::ReaderEof => debug!(relay = name, bytes, "Relay source reached EOF"),
        RelayEnd::ReaderFailed(e) => debug!(relay = name, bytes, error = %e, "Relay source closed"),
        RelayEnd::WriterFailed(e) => warn!(relay = name, bytes, error = %e, "Relay sink failed"),
    }

    RelayOutcome { bytes, end }
}

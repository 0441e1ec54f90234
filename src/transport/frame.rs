//! Wire frames.
//!
//! Layout of one frame:
//!
//! ```text
//! +------------+----------------------+------------+
//! | len: u32le | body: MessagePack    | crc: u32le |
//! +------------+----------------------+------------+
//! ```
//!
//! `crc` is the CRC32 of `body`.

use crate::error::{Result, Status, StreamError};
use crate::types::{Book, BookFilter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Method name of the search operation.
pub const SEARCH_BOOKS: &str = "SearchBooks";

/// Identifies one call on a connection. Assigned by the client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client -> server: start a call. `window` is the number of `Message`
    /// frames the server may send before it needs more credit.
    Request {
        call_id: CallId,
        method: String,
        filter: BookFilter,
        window: u64,
    },
    /// Server -> client: one data event.
    Message { call_id: CallId, book: Book },
    /// Server -> client: successful end of a call.
    Completed { call_id: CallId },
    /// Server -> client: failed end of a call.
    Error { call_id: CallId, status: Status },
    /// Client -> server: the caller stopped consuming.
    Cancel { call_id: CallId },
    /// Client -> server: the caller drained `n` more results.
    Credit { call_id: CallId, n: u64 },
}

impl Frame {
    pub fn call_id(&self) -> CallId {
        match self {
            Frame::Request { call_id, .. }
            | Frame::Message { call_id, .. }
            | Frame::Completed { call_id }
            | Frame::Error { call_id, .. }
            | Frame::Cancel { call_id }
            | Frame::Credit { call_id, .. } => *call_id,
        }
    }
}

/// Encode `frame` and write it with a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame, max_frame_bytes: usize) -> Result<()> {
    let body = rmp_serde::to_vec_named(frame)?;
    if body.len() > max_frame_bytes {
        return Err(StreamError::Serialization(format!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            max_frame_bytes
        )));
    }

    let mut buf = Vec::with_capacity(body.len() + 8);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read the next frame.
///
/// Returns `Ok(None)` on a clean end of stream between frames. A stream that
/// ends inside a frame is an `UnexpectedEof` I/O error.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    if !read_prefix(reader, &mut len_bytes)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_frame_bytes {
        return Err(StreamError::Corruption(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    let computed_checksum = crc32fast::hash(&body);
    if stored_checksum != computed_checksum {
        return Err(StreamError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Fill `buf`, or return `false` if the stream ended before its first byte.
fn read_prefix<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

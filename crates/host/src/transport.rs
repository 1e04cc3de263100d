//! Content-Length framing.
//!
//! Each message is a block of header lines, a blank line, then exactly
//! `Content-Length` bytes of body:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"shutdown"}
//! ```
//!
//! Header names are case-insensitive and headers other than
//! `Content-Length` are ignored. Any framing failure is fatal to the
//! connection: there is no way to resynchronize on a byte stream.

use std::io::{self, BufRead, Read, Write};

use parking_lot::Mutex;
use thiserror::Error;

/// Default body size limit (64 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Header lines longer than this are rejected before the body is read.
const MAX_HEADER_LINE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("malformed header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidLength(String),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("stream ended inside a message")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reads framed message bodies from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_size: usize,
    line: Vec<u8>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_size(inner, DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_max_size(inner: R, max_size: usize) -> Self {
        Self {
            inner,
            max_size,
            line: Vec::new(),
        }
    }

    /// Next message body. `Ok(None)` means the stream ended cleanly between
    /// frames.
    pub fn read_message(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let mut content_length: Option<usize> = None;
        let mut in_header = false;

        loop {
            self.line.clear();
            let n = (&mut self.inner)
                .take(MAX_HEADER_LINE as u64 + 1)
                .read_until(b'\n', &mut self.line)?;
            if n == 0 {
                return if in_header {
                    Err(FramingError::UnexpectedEof)
                } else {
                    Ok(None)
                };
            }
            if self.line.last() != Some(&b'\n') {
                if self.line.len() > MAX_HEADER_LINE {
                    return Err(FramingError::InvalidHeader(lossy_prefix(&self.line)));
                }
                return Err(FramingError::UnexpectedEof);
            }

            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }

            if self.line.is_empty() {
                if in_header {
                    break;
                }
                // Stray line break between frames.
                continue;
            }

            in_header = true;
            let text = std::str::from_utf8(&self.line)
                .map_err(|_| FramingError::InvalidHeader(lossy_prefix(&self.line)))?;
            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| FramingError::InvalidHeader(text.to_string()))?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                let value = value.trim();
                let len = value
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidLength(value.to_string()))?;
                content_length = Some(len);
            }
        }

        let size = content_length.ok_or(FramingError::MissingContentLength)?;
        if size > self.max_size {
            return Err(FramingError::TooLarge {
                size,
                max: self.max_size,
            });
        }

        let mut body = vec![0u8; size];
        self.inner.read_exact(&mut body).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FramingError::UnexpectedEof
            } else {
                FramingError::Io(e)
            }
        })?;
        Ok(Some(body))
    }
}

fn lossy_prefix(bytes: &[u8]) -> String {
    let end = bytes.len().min(80);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Writes framed messages. Shared by every thread that talks to the client;
/// one lock acquisition covers header, body and flush.
pub struct FrameWriter {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl FrameWriter {
    pub fn new(inner: impl Write + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Box::new(inner)),
        }
    }

    pub fn write_message(&self, body: &[u8]) -> io::Result<()> {
        let mut out = self.inner.lock();
        write!(out, "Content-Length: {}\r\n\r\n", body.len())?;
        out.write_all(body)?;
        out.flush()
    }
}

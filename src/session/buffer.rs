//! NNTP response framing
//!
//! Bytes read from the socket accumulate in a [`ResponseBuffer`] until one
//! complete response (status line plus, when expected, a dot-terminated body)
//! is available. The buffer starts small and doubles on demand up to a fixed
//! cap; a response that does not fit under the cap is a protocol fault.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ConnectionError;

/// Starting size of a response buffer (8 KiB)
pub const INITIAL_CAPACITY: usize = 8 * 1024;

/// One complete NNTP response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Three digit status code
    pub code: u16,
    /// Status line text after the code
    pub text: String,
    /// Dot-unstuffed multi-line body, without the terminating `.` line
    pub body: Option<Vec<u8>>,
}

impl Response {
    /// Single-line response
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            body: None,
        }
    }

    /// Multi-line response
    pub fn with_body(code: u16, text: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            code,
            text: text.into(),
            body: Some(body),
        }
    }
}

/// Growable receive buffer that frames NNTP responses
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Vec<u8>,
    filled: usize,
    max_size: usize,
    // resume offset for the body terminator search
    scanned: usize,
}

impl ResponseBuffer {
    /// Create an empty buffer capped at `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        let initial = INITIAL_CAPACITY.min(max_size.max(1));
        Self {
            data: vec![0; initial],
            filled: 0,
            max_size: max_size.max(initial),
            scanned: 0,
        }
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.filled
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Current allocated size
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Append raw bytes, growing as needed
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let needed = self.filled + bytes.len();
        while self.data.len() < needed {
            self.grow()?;
        }
        self.data[self.filled..needed].copy_from_slice(bytes);
        self.filled = needed;
        Ok(())
    }

    /// Read more bytes from `reader`
    ///
    /// Returns the number of bytes read; zero means the peer closed the stream.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<usize, ConnectionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.filled == self.data.len() {
            self.grow()?;
        }
        let n = reader
            .read(&mut self.data[self.filled..])
            .await
            .map_err(|e| ConnectionError::from_io(&e))?;
        self.filled += n;
        Ok(n)
    }

    fn grow(&mut self) -> Result<(), ConnectionError> {
        let current = self.data.len();
        if current >= self.max_size {
            return Err(ConnectionError::protocol(format!(
                "response exceeds {} bytes",
                self.max_size
            )));
        }
        let next = (current * 2).min(self.max_size);
        self.data.resize(next, 0);
        Ok(())
    }

    /// Try to frame the next complete response
    ///
    /// `multiline` decides, given the status code, whether a dot-terminated
    /// body follows the status line. Returns `Ok(None)` when more bytes are
    /// needed.
    pub fn next_response(
        &mut self,
        multiline: impl Fn(u16) -> bool,
    ) -> Result<Option<Response>, ConnectionError> {
        let buffered = &self.data[..self.filled];
        let Some(line_end) = find(buffered, b"\r\n", 0) else {
            return Ok(None);
        };
        let (code, text) = parse_status_line(&buffered[..line_end])?;
        let body_start = line_end + 2;

        if !multiline(code) {
            self.consume(body_start);
            return Ok(Some(Response::new(code, text)));
        }

        let body = &buffered[body_start..];
        if body.starts_with(b".\r\n") {
            self.consume(body_start + 3);
            return Ok(Some(Response::with_body(code, text, Vec::new())));
        }

        // the terminator may straddle the previous scan boundary
        let from = self.scanned.saturating_sub(4).max(body_start);
        match find(buffered, b"\r\n.\r\n", from) {
            Some(pos) => {
                let raw = &buffered[body_start..pos + 2];
                let body = unstuff(raw);
                self.consume(pos + 5);
                Ok(Some(Response::with_body(code, text, body)))
            }
            None => {
                self.scanned = self.filled;
                Ok(None)
            }
        }
    }

    fn consume(&mut self, n: usize) {
        self.data.copy_within(n..self.filled, 0);
        self.filled -= n;
        self.scanned = 0;
    }
}

fn parse_status_line(line: &[u8]) -> Result<(u16, String), ConnectionError> {
    let line = String::from_utf8_lossy(line);
    let digits = line.get(..3).unwrap_or_default();
    let code = digits
        .parse::<u16>()
        .ok()
        .filter(|_| digits.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| ConnectionError::protocol(format!("malformed status line: {line:?}")))?;
    let text = line.get(3..).unwrap_or_default().trim().to_string();
    Ok((code, text))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Remove NNTP dot-stuffing: a line starting with `..` loses its first dot
pub fn unstuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut at_line_start = true;
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if at_line_start && b == b'.' && raw.get(i + 1) == Some(&b'.') {
            i += 1;
            continue;
        }
        out.push(b);
        at_line_start = b == b'\n';
        i += 1;
    }
    out
}

/// Apply NNTP dot-stuffing to outgoing multi-line data
pub fn stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 16);
    let mut at_line_start = true;
    for &b in raw {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }
    out
}

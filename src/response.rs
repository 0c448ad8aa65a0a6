use std::io::{self, Read};

use crate::error::{ConnectError, Result};

pub const MAX_LINE_LEN: usize = 8 * 1024;
pub const MAX_HEADER_LINES: usize = 128;

/// Status code assumed when the status line cannot be parsed.
pub const MALFORMED_STATUS: u16 = 400;

/// First line of the proxy's reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

impl StatusLine {
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let version = tokens.next().unwrap_or_default().to_string();
        let code = tokens
            .next()
            .and_then(|t| t.parse::<u16>().ok())
            .unwrap_or(MALFORMED_STATUS);
        let reason = tokens.collect::<Vec<_>>().join(" ");
        Self { version, code, reason }
    }

    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }
}

/// Proxy reply to a CONNECT request; only lives for the handshake.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusLine,
    pub headers: Vec<String>,
}

/// Reads one line one byte at a time, so nothing past the terminator is
/// taken off the stream. CRLF and bare LF both terminate; neither is kept.
pub fn read_line<R: Read + ?Sized>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(ConnectError::UnexpectedEof),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ConnectError::from_handshake_io(e)),
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if line.len() >= MAX_LINE_LEN {
            return Err(ConnectError::ResponseTooLarge);
        }
        line.push(byte[0]);
    }
}

pub fn read_status_line<R: Read + ?Sized>(reader: &mut R) -> Result<StatusLine> {
    read_line(reader).map(|line| StatusLine::parse(&line))
}

/// Consumes header lines up to and including the blank line.
pub fn drain_headers<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<String>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_LINES {
            return Err(ConnectError::ResponseTooLarge);
        }
        headers.push(line);
    }
}

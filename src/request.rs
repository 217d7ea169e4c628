//! Incremental HTTP/1.x request parsing.
//!
//! A [`Request`] owns every byte received for it. Each call to [`Request::parse`] appends a
//! chunk and advances the state machine as far as the buffered bytes allow, so a request can be
//! fed one `recv()` at a time without ever blocking the event loop.

use std::collections::HashMap;
use std::fmt;

/// Maximum size of the request line plus header block.
pub const MAX_HEADER_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
    Put,
    Head,
    Unknown,
}

impl Method {
    /// Method tokens are case-sensitive.
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "DELETE" => Self::Delete,
            "PUT" => Self::Put,
            "HEAD" => Self::Head,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Put => "PUT",
            Self::Head => "HEAD",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
    Error,
}

/// Outcome of a single [`Request::parse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Incomplete,
    Complete,
    Error(u16),
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Path only; the query string lives in `query`.
    pub uri: String,
    pub query: String,
    pub version: String,
    /// Header names are lowercased. A repeated header keeps its last value.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_length: usize,
    pub boundary: Option<String>,
    /// Largest body accepted; a larger `Content-Length` fails with 413 before any body is read.
    body_limit: usize,
    state: ParseState,
    error_code: u16,
    /// Raw bytes of this request, followed by any pipelined bytes received after it.
    buf: Vec<u8>,
    /// Number of bytes of `buf` consumed by this request so far.
    consumed: usize,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self::with_body_limit(usize::MAX)
    }

    pub fn with_body_limit(body_limit: usize) -> Self {
        Self {
            method: Method::Unknown,
            uri: String::new(),
            query: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: 0,
            boundary: None,
            body_limit,
            state: ParseState::RequestLine,
            error_code: 0,
            buf: Vec::new(),
            consumed: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Zero unless the parser is in the error state.
    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|value| value.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the client asked for the connection to be closed after this request.
    pub fn wants_close(&self) -> bool {
        match self.header("Connection").map(str::to_ascii_lowercase) {
            Some(connection) if connection == "close" => true,
            Some(connection) if connection == "keep-alive" => false,
            _ => self.version == "HTTP/1.0",
        }
    }

    /// True when bytes past the previous request are waiting to be parsed.
    pub fn has_buffered_input(&self) -> bool {
        self.buf.len() > self.consumed
    }

    /// Clear all parsed fields so the next request on the connection can be parsed.
    ///
    /// Bytes received after a completed request are kept. After an error the stream can no
    /// longer be framed, so everything buffered is dropped.
    pub fn reset(&mut self) {
        if self.state == ParseState::Error {
            self.buf.clear();
        } else {
            self.buf.drain(..self.consumed);
        }
        let buf = std::mem::take(&mut self.buf);
        *self = Self {
            buf,
            ..Self::with_body_limit(self.body_limit)
        };
    }

    fn progress(&self) -> Progress {
        match self.state {
            ParseState::Complete => Progress::Complete,
            ParseState::Error => Progress::Error(self.error_code),
            _ => Progress::Incomplete,
        }
    }

    fn fail(&mut self, code: u16) {
        self.error_code = code;
        self.state = ParseState::Error;
    }

    /// Feed another chunk of bytes and make as much progress as possible.
    ///
    /// A complete or failed request ignores further input until [`Request::reset`].
    pub fn parse(&mut self, chunk: &[u8]) -> Progress {
        if matches!(self.state, ParseState::Complete | ParseState::Error) {
            return self.progress();
        }
        self.buf.extend_from_slice(chunk);

        loop {
            match self.state {
                ParseState::RequestLine | ParseState::Headers => {
                    let line = match self.next_line() {
                        Some(line) => line,
                        None => {
                            if self.buf.len() > MAX_HEADER_BYTES {
                                self.fail(431);
                            }
                            return self.progress();
                        }
                    };
                    if self.consumed > MAX_HEADER_BYTES {
                        self.fail(431);
                    } else if self.state == ParseState::RequestLine {
                        self.parse_request_line(&line);
                    } else if line.is_empty() {
                        self.finish_headers();
                    } else {
                        self.parse_header(&line);
                    }
                }
                ParseState::Body => {
                    if self.is_chunked() {
                        self.fail(501);
                        continue;
                    }
                    let available = self.buf.len() - self.consumed;
                    if available < self.content_length {
                        return Progress::Incomplete;
                    }
                    let start = self.consumed;
                    self.body = self.buf[start..start + self.content_length].to_vec();
                    self.consumed += self.content_length;
                    self.state = ParseState::Complete;
                }
                ParseState::Complete | ParseState::Error => return self.progress(),
            }
        }
    }

    /// Take the next line out of the buffer, without its terminator.
    ///
    /// Lines end with CRLF; a bare LF is tolerated.
    fn next_line(&mut self) -> Option<String> {
        let remaining = &self.buf[self.consumed..];
        let newline = remaining.iter().position(|&b| b == b'\n')?;
        let mut line = &remaining[..newline];
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        let line = String::from_utf8_lossy(line).into_owned();
        self.consumed += newline + 1;
        Some(line)
    }

    fn parse_request_line(&mut self, line: &str) {
        // Tolerate empty lines ahead of a request (RFC 7230, section 3.5).
        if line.trim().is_empty() {
            return;
        }

        let mut parts = line.split_whitespace();
        self.method = Method::from_token(parts.next().unwrap_or(""));
        let uri = parts.next().unwrap_or("");
        self.version = parts.next().unwrap_or("").to_string();

        if self.method == Method::Unknown {
            return self.fail(405);
        }
        if uri.is_empty() || self.version.is_empty() {
            return self.fail(400);
        }
        if self.version != "HTTP/1.1" && self.version != "HTTP/1.0" {
            return self.fail(505);
        }

        match uri.find('?') {
            Some(pos) => {
                self.uri = uri[..pos].to_string();
                self.query = uri[pos + 1..].to_string();
            }
            None => self.uri = uri.to_string(),
        }
        self.state = ParseState::Headers;
    }

    fn parse_header(&mut self, line: &str) {
        let (key, value) = match line.find(':') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => return self.fail(400),
        };
        let trim = |s: &str| s.trim_matches(|c: char| c.is_ascii_whitespace()).to_string();
        self.headers
            .insert(trim(key).to_ascii_lowercase(), trim(value));
    }

    fn finish_headers(&mut self) {
        self.content_length = self
            .header("Content-Length")
            .and_then(|length| length.parse().ok())
            .unwrap_or(0);
        if self.content_length > self.body_limit {
            return self.fail(413);
        }

        self.boundary = self
            .header("Content-Type")
            .filter(|content_type| content_type.contains("multipart/form-data"))
            .and_then(parse_boundary);

        self.state = if self.content_length > 0 || self.is_chunked() {
            ParseState::Body
        } else {
            ParseState::Complete
        };
    }
}

/// Extract the `boundary=` parameter of a multipart content type.
fn parse_boundary(content_type: &str) -> Option<String> {
    let start = content_type.find("boundary=")? + "boundary=".len();
    let boundary = content_type[start..].split(';').next()?.trim();
    let boundary = boundary
        .strip_prefix('"')
        .and_then(|b| b.strip_suffix('"'))
        .unwrap_or(boundary);
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

//! HTTP responses and their wire format.

use std::collections::BTreeMap;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Reason phrase for a status code.
pub fn status_message(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    /// Header names as they go on the wire. `Content-Length` is always derived from `body`.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: status_message(code).to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Replace any header with the same name, compared case-insensitively.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>, content_type: &str) {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
    }

    /// 200 with the given body.
    pub fn ok(body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        let mut response = Self::new(200);
        response.set_body(body, content_type);
        response
    }

    pub fn html(code: u16, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Self::new(code);
        response.set_body(body, "text/html; charset=UTF-8");
        response
    }

    pub fn redirect(code: u16, location: &str) -> Self {
        let body = format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            Moved to: <a href=\"{}\">{}</a>\n\
            </body></html>\n",
            code,
            status_message(code),
            status_message(code),
            HtmlEscaped(location),
            HtmlEscaped(location),
        );
        let mut response = Self::html(code, body);
        response.set_header("Location", location);
        response
    }

    /// A default reply for any (erroneous) occasion.
    pub fn error(code: u16, reason: &str) -> Self {
        let errname = status_message(code);
        let body = format!(
            "<html><head><title>{} {}</title></head><body>\n\
            <h1>{}</h1>\n\
            {}\n\
            </body></html>\n",
            code,
            errname,
            errname,
            HtmlEscaped(reason),
        );
        Self::html(code, body)
    }

    fn head_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.code, self.reason);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        head.into_bytes()
    }

    /// Serialize status line, headers and body.
    pub fn build(&self) -> Vec<u8> {
        let mut bytes = self.head_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Serialize for a HEAD request: identical headers, no body.
    pub fn build_head(&self) -> Vec<u8> {
        self.head_bytes()
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

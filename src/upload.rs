//! multipart/form-data uploads.

use std::io::Write;
use std::path::PathBuf;

use tracing::warn;

use crate::request::{Method, Request};
use crate::response::{HtmlEscaped, Response};

const PLACEHOLDER_FILENAME: &str = "uploaded_file";
const DEFAULT_PART_TYPE: &str = "application/octet-stream";

/// One file part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Somewhere to persist uploaded files.
pub trait UploadStore {
    /// `name` has already been through [`sanitize_filename`].
    fn save(&self, name: &str, content: &[u8]) -> std::io::Result<()>;
}

/// Stores uploads as files in a directory, creating it on first use.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl UploadStore for DirStore {
    fn save(&self, name: &str, content: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::File::create(self.dir.join(name))?;
        file.write_all(content)
    }
}

/// Reduce a client-supplied filename to a safe basename.
pub fn sanitize_filename(filename: &str) -> String {
    let basename = match filename.rfind(|c| c == '/' || c == '\\') {
        Some(pos) => &filename[pos + 1..],
        None => filename,
    };
    let safe: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() || safe == "." || safe == ".." {
        PLACEHOLDER_FILENAME.to_string()
    } else {
        safe
    }
}

/// Find the first occurrence of `needle` in `haystack` at or after `from`.
fn find(needle: &[u8], haystack: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Value of `name:` in a part's header block, matched case-insensitively.
fn part_header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.split("\r\n").find_map(|line| {
        let colon = line.find(':')?;
        if line[..colon].trim().eq_ignore_ascii_case(name) {
            Some(line[colon + 1..].trim())
        } else {
            None
        }
    })
}

fn disposition_filename(disposition: &str) -> Option<&str> {
    let start = disposition.find("filename=\"")? + "filename=\"".len();
    let len = disposition[start..].find('"')?;
    Some(&disposition[start..start + len])
}

/// Split a multipart body into its file parts.
///
/// Parts without a filename are form fields and are skipped. Decoding stops at the terminal
/// delimiter, or quietly at the first part that isn't followed by another delimiter.
pub fn decode_multipart(body: &[u8], boundary: &str) -> Vec<UploadedFile> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut files = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let boundary_pos = match find(delimiter, body, pos) {
            Some(boundary_pos) => boundary_pos,
            None => break,
        };
        pos = boundary_pos + delimiter.len();
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let headers_end = match find(b"\r\n\r\n", body, pos) {
            Some(headers_end) => headers_end,
            None => break,
        };
        let headers = String::from_utf8_lossy(&body[pos..headers_end]).into_owned();
        pos = headers_end + 4;

        let next_boundary = match find(delimiter, body, pos) {
            Some(next_boundary) => next_boundary,
            None => break,
        };
        // Content ends with the CRLF that precedes the delimiter.
        let content_end = match next_boundary.checked_sub(2) {
            Some(content_end) if content_end >= pos => content_end,
            _ => break,
        };

        let filename = part_header(&headers, "Content-Disposition").and_then(disposition_filename);
        if let Some(filename) = filename.filter(|name| !name.is_empty()) {
            files.push(UploadedFile {
                filename: filename.to_string(),
                content_type: part_header(&headers, "Content-Type")
                    .filter(|value| !value.is_empty())
                    .unwrap_or(DEFAULT_PART_TYPE)
                    .to_string(),
                content: body[pos..content_end].to_vec(),
            });
        }
        pos = next_boundary;
    }
    files
}

/// Decode the request's multipart body and save every file part to `store`.
pub fn handle_upload(request: &Request, max_body_size: usize, store: &dyn UploadStore) -> Response {
    if request.method != Method::Post {
        return Response::error(405, "Only POST is allowed for uploads.");
    }
    if request.content_length > max_body_size {
        return Response::error(
            413,
            &format!(
                "Upload size exceeds maximum allowed size of {} bytes.",
                max_body_size
            ),
        );
    }
    let boundary = match &request.boundary {
        Some(boundary) => boundary,
        None => return Response::error(400, "Missing boundary in multipart/form-data."),
    };

    let files = decode_multipart(&request.body, boundary);
    if files.is_empty() {
        return Response::error(400, "Failed to parse multipart/form-data.");
    }

    let mut saved = Vec::new();
    for file in &files {
        let name = sanitize_filename(&file.filename);
        match store.save(&name, &file.content) {
            Ok(()) => saved.push(name),
            Err(e) => warn!("failed to save upload {}: {}", name, e),
        }
    }
    if saved.is_empty() {
        return Response::error(500, "Failed to save uploaded files.");
    }

    let mut body = format!(
        "<html><body><h1>Upload Successful</h1>\n<p>Uploaded {} file(s):</p>\n<ul>\n",
        saved.len()
    );
    for name in &saved {
        body.push_str(&format!("<li>{}</li>\n", HtmlEscaped(name)));
    }
    body.push_str("</ul></body></html>\n");
    Response::html(200, body)
}

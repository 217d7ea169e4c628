//! Static file serving: GET/HEAD of files and directory listings, DELETE of files.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

use crate::request::{Method, Request};
use crate::response::{HtmlEscaped, Response};
use crate::router::Location;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js",
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "font/ttf                ttf",
    "font/woff               woff",
    "font/woff2              woff2",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt asc",
    "video/mp4               mp4",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
];

#[derive(Debug, Clone)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    pub default_mimetype: String,
}

impl MimeMap {
    /// Add extension map from a file.
    pub fn parse_extension_map_file(&mut self, filename: &OsStr) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.to_string_lossy()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read {}", filename.to_string_lossy()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c: char| c.is_ascii_whitespace())
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_ascii_lowercase(), mimetype.to_string());
        }
    }

    /// Get content type for a path.
    pub fn content_type(&self, path: &str) -> &str {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.rfind('.')
            .and_then(|dot| self.mimetypes.get(&name[dot + 1..].to_ascii_lowercase()))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// Decode %XX escapes. Returns None when the result is not valid UTF-8.
pub fn url_decode(url: &str) -> Option<String> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// True if the path contains `..` anywhere, not only as a whole segment.
pub fn has_traversal(path: &str) -> bool {
    path.contains("..")
}

/// Directory listing entries: name and whether it is a directory.
struct Listing(Vec<(String, bool)>);

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (name, is_dir) in &self.0 {
            let slash = if *is_dir { "/" } else { "" };
            writeln!(
                f,
                "<tr><td><a href=\"{}{}\">{}{}</a></td><td>{}</td></tr>",
                UrlEncoded(name),
                slash,
                HtmlEscaped(name),
                slash,
                if *is_dir { "Directory" } else { "File" },
            )?;
        }
        Ok(())
    }
}

/// HTML listing of `dir`, which is served at `uri`.
pub fn generate_dir_listing(dir: &Path, uri: &str) -> std::io::Result<String> {
    let mut entries: Vec<(String, bool)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let is_dir = entry.path().is_dir();
            (entry.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .filter(|(name, _)| name != "." && name != "..")
        .collect();
    entries.sort();

    let parent = if uri == "/" {
        ""
    } else {
        "<tr><td><a href=\"..\">..</a></td><td>Directory</td></tr>\n"
    };
    Ok(format!(
        "<html>\n<head>\n<title>Index of {}</title>\n\
        <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
        </head>\n<body>\n<h1>Index of {}</h1>\n\
        <table>\n<tr><th>Name</th><th>Type</th></tr>\n\
        {}{}\
        </table>\n</body>\n</html>\n",
        HtmlEscaped(uri),
        HtmlEscaped(uri),
        parent,
        Listing(entries),
    ))
}

/// Serve a GET, HEAD or DELETE against a location's root.
pub fn serve(location: &Location, request: &Request, mime_map: &MimeMap) -> Response {
    let decoded_uri = match url_decode(&request.uri) {
        Some(decoded_uri) => decoded_uri,
        None => return Response::error(400, "You requested an invalid URL."),
    };
    if has_traversal(&decoded_uri) {
        return Response::error(400, "You requested an invalid URL.");
    }

    let target = location.root.join(decoded_uri.trim_start_matches('/'));
    match request.method {
        Method::Delete => delete(location, &decoded_uri, &target),
        Method::Get | Method::Head => get(location, request, &decoded_uri, &target, mime_map),
        _ => Response::error(405, "Only GET, HEAD and DELETE are allowed for static files."),
    }
}

fn delete(location: &Location, uri: &str, target: &Path) -> Response {
    let metadata = match std::fs::metadata(target) {
        Ok(metadata) => metadata,
        Err(_) => return Response::error(404, "The URL you requested was not found."),
    };

    let is_index = target
        .file_name()
        .map_or(true, |name| name == OsStr::new(location.index_name()));
    if uri.trim_end_matches('/').is_empty() || is_index {
        return Response::error(405, "Cannot delete index file.");
    }

    let removed = if metadata.is_dir() {
        std::fs::remove_dir(target)
    } else {
        std::fs::remove_file(target)
    };
    match removed {
        Ok(()) => Response::html(
            200,
            "<html><body><h1>200 OK</h1><p>File deleted successfully</p></body></html>\n",
        ),
        Err(e) => Response::error(405, &format!("Cannot delete file: {}.", e)),
    }
}

fn get(
    location: &Location,
    request: &Request,
    uri: &str,
    target: &Path,
    mime_map: &MimeMap,
) -> Response {
    let metadata = match std::fs::metadata(target) {
        Ok(metadata) => metadata,
        Err(_) => return Response::error(404, "The URL you requested was not found."),
    };

    if metadata.is_dir() {
        // Relative links in listings and index pages resolve against the slashed URL.
        if !uri.ends_with('/') {
            return Response::redirect(301, &format!("{}/", request.uri));
        }
        let index = target.join(location.index_name());
        if index.is_file() {
            return read_file(&index, mime_map.content_type(location.index_name()));
        }
        if !location.autoindex {
            return Response::error(404, "The URL you requested was not found.");
        }
        return match generate_dir_listing(target, uri) {
            Ok(listing) => Response::html(200, listing),
            Err(e) => Response::error(500, &format!("Couldn't list directory: {}", e)),
        };
    }

    read_file(target, mime_map.content_type(uri))
}

fn read_file(path: &Path, mimetype: &str) -> Response {
    match std::fs::read(path) {
        Ok(content) => Response::ok(content, mimetype),
        Err(e) => match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Response::error(403, "You don't have permission to access this URL.")
            }
            std::io::ErrorKind::NotFound => {
                Response::error(404, "The URL you requested was not found.")
            }
            _ => Response::error(
                500,
                &format!("The URL you requested cannot be returned: {}.", e),
            ),
        },
    }
}

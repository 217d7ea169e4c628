//! Location table and request routing.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::request::{Method, Request};
use crate::static_files::{has_traversal, url_decode};

pub const DEFAULT_INDEX_NAME: &str = "index.html";

/// Per-prefix policy: where files live and what may be done with them.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub prefix: String,
    pub root: PathBuf,
    /// Empty means every method is allowed.
    pub methods: Vec<Method>,
    pub upload_dir: Option<PathBuf>,
    /// Extension including the dot (".py") to interpreter.
    pub cgi: HashMap<String, PathBuf>,
    pub autoindex: bool,
    pub index: Option<String>,
    pub redirect: Option<String>,
}

impl Location {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            root: root.into(),
            methods: Vec::new(),
            upload_dir: None,
            cgi: HashMap::new(),
            autoindex: false,
            index: None,
            redirect: None,
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }

    pub fn index_name(&self) -> &str {
        self.index.as_deref().unwrap_or(DEFAULT_INDEX_NAME)
    }

    /// Where POSTed files go when no upload directory is configured.
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.root.join("uploads"))
    }
}

/// Ordered list of locations; read-only once the server is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingTable {
    locations: Vec<Location>,
}

impl RoutingTable {
    pub fn new(locations: Vec<Location>) -> Self {
        Self { locations }
    }

    pub fn push(&mut self, location: Location) {
        self.locations.push(location);
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    /// Longest prefix match. Ties go to the location listed first.
    pub fn find_location(&self, uri: &str) -> Option<&Location> {
        let mut best: Option<&Location> = None;
        for location in &self.locations {
            if uri.starts_with(&location.prefix)
                && best.map_or(true, |b| location.prefix.len() > b.prefix.len())
            {
                best = Some(location);
            }
        }
        best
    }
}

/// Where a completed request should go.
#[derive(Debug, PartialEq)]
pub enum Route<'a> {
    Static(&'a Location),
    Upload(&'a Location),
    Cgi {
        location: &'a Location,
        script: PathBuf,
        interpreter: &'a PathBuf,
    },
    Put,
    Redirect(&'a str),
    BadRequest,
    NotFound,
    MethodNotAllowed,
}

/// Extension of the last path segment, dot included.
fn extension(uri: &str) -> Option<&str> {
    let segment = uri.rsplit('/').next()?;
    segment.rfind('.').map(|dot| &segment[dot..])
}

pub fn route<'a>(table: &'a RoutingTable, request: &Request) -> Route<'a> {
    let location = match table.find_location(&request.uri) {
        Some(location) => location,
        None => return Route::NotFound,
    };

    if let Some(target) = &location.redirect {
        return Route::Redirect(target);
    }

    if !location.allows(request.method) {
        return Route::MethodNotAllowed;
    }

    if let Some(interpreter) = extension(&request.uri).and_then(|ext| location.cgi.get(ext)) {
        let decoded = match url_decode(&request.uri) {
            Some(decoded) if !has_traversal(&decoded) => decoded,
            _ => return Route::BadRequest,
        };
        let script = location.root.join(decoded.trim_start_matches('/'));
        return Route::Cgi {
            location,
            script,
            interpreter,
        };
    }

    match request.method {
        Method::Get | Method::Delete | Method::Head => Route::Static(location),
        Method::Post => Route::Upload(location),
        Method::Put => Route::Put,
        Method::Unknown => Route::BadRequest,
    }
}

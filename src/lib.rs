//! A small non-blocking HTTP/1.x server.
//!
//! Static files, directory listings, multipart uploads and CGI scripts are served from a
//! table of locations. All sockets are driven by a single `select()` loop; CGI scripts run on
//! worker threads so a slow script never stalls other connections.

pub mod cgi;
pub mod config;
pub mod log;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod static_files;
pub mod upload;

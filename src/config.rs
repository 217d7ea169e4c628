//! Command line configuration.

use std::collections::HashMap;
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use crate::cgi::DEFAULT_READ_TIMEOUT;
use crate::log::LogSink;
use crate::request::Method;
use crate::router::{Location, RoutingTable, DEFAULT_INDEX_NAME};
use crate::static_files::{MimeMap, DEFAULT_MIME_TYPE};

pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct Config {
    pub bindaddr: Option<String>,
    pub bindport: u16,
    pub max_connections: Option<usize>,
    /// Idle timeout; `None` disables it.
    pub timeout: Option<Duration>,
    pub log_sink: LogSink,
    pub mime_map: MimeMap,
    pub want_no_server_id: bool,
    pub max_body_size: usize,
    /// Replacement bodies for error responses, by status code.
    pub error_pages: HashMap<u16, PathBuf>,
    pub cgi_timeout: Duration,
    pub routes: RoutingTable,
}

/// A location whose listing setting may still follow the global `--no-listing`.
struct PendingLocation {
    location: Location,
    autoindex: Option<bool>,
}

impl PendingLocation {
    fn new(prefix: String, root: PathBuf) -> Self {
        Self {
            location: Location::new(prefix, root),
            autoindex: None,
        }
    }
}

fn parse_number<T: FromStr>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T> {
    let number = args
        .next()
        .with_context(|| format!("missing number after {}", flag))?;
    number
        .parse()
        .map_err(|_| anyhow!("{} number {} is invalid", flag.trim_start_matches('-'), number))
}

fn parse_methods(list: &str) -> Result<Vec<Method>> {
    list.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match Method::from_token(&token.to_ascii_uppercase()) {
            Method::Unknown => Err(anyhow!("unknown method `{}' in --methods", token)),
            method => Ok(method),
        })
        .collect()
}

impl Config {
    /// Parse `std::env::args()`, printing usage and exiting when there is nothing to parse.
    pub fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let args: Vec<String> = args.collect();
        match args.first().map(String::as_str) {
            None | Some("--help") => {
                usage(&name); // no wwwroot given
                std::process::exit(0);
            }
            Some(_) => Self::from_args(args),
        }
    }

    /// Parse arguments following the program name: the wwwroot, then flags.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut args = args.into_iter();
        let wwwroot = args.next().context("missing wwwroot")?;
        let mut config = Self {
            bindport: DEFAULT_PORT,
            timeout: Some(DEFAULT_TIMEOUT),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            cgi_timeout: DEFAULT_READ_TIMEOUT,
            ..Default::default()
        };

        let mut index_name: Option<String> = None;
        let mut no_listing = false;
        let mut locations = vec![PendingLocation::new("/".to_string(), PathBuf::from(wwwroot))];

        while let Some(arg) = args.next() {
            // Per-location flags apply to the most recent --location.
            let current = locations
                .last_mut()
                .context("no location to configure")?;
            match arg.as_str() {
                "--port" => config.bindport = parse_number(&mut args, "--port")?,
                "--addr" => {
                    config.bindaddr = Some(args.next().context("missing ip after --addr")?);
                }
                "--maxconn" => {
                    config.max_connections = Some(parse_number(&mut args, "--maxconn")?);
                }
                "--timeout" => {
                    config.timeout = match parse_number::<u64>(&mut args, "--timeout")? {
                        0 => None,
                        secs => Some(Duration::from_secs(secs)),
                    };
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    config.log_sink = LogSink::file(Path::new(&filename))?;
                }
                "--syslog" => config.log_sink = LogSink::Syslog,
                "--index" => {
                    index_name = Some(args.next().context("missing filename after --index")?);
                }
                "--no-listing" => no_listing = true,
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    config
                        .mime_map
                        .parse_extension_map_file(&OsString::from(filename))?;
                }
                "--default-mimetype" => {
                    config.mime_map.default_mimetype = args
                        .next()
                        .context("missing string after --default-mimetype")?;
                }
                "--no-server-id" => config.want_no_server_id = true,
                "--max-body-size" => {
                    config.max_body_size = parse_number(&mut args, "--max-body-size")?;
                }
                "--error-page" => {
                    let code: u16 = parse_number(&mut args, "--error-page")?;
                    if !(400..600).contains(&code) {
                        bail!("--error-page code {} is not an error status", code);
                    }
                    let filename = args
                        .next()
                        .context("missing filename after --error-page")?;
                    config.error_pages.insert(code, PathBuf::from(filename));
                }
                "--cgi-timeout" => {
                    let secs: u64 = parse_number(&mut args, "--cgi-timeout")?;
                    if secs == 0 {
                        bail!("--cgi-timeout must be at least one second");
                    }
                    config.cgi_timeout = Duration::from_secs(secs);
                }
                "--location" => {
                    let prefix = args.next().context("missing prefix after --location")?;
                    if !prefix.starts_with('/') {
                        bail!("location prefix `{}' must start with /", prefix);
                    }
                    let root = args.next().context("missing root after --location")?;
                    locations.push(PendingLocation::new(prefix, PathBuf::from(root)));
                }
                "--methods" => {
                    let list = args.next().context("missing list after --methods")?;
                    current.location.methods = parse_methods(&list)?;
                }
                "--upload-dir" => {
                    let dir = args.next().context("missing directory after --upload-dir")?;
                    current.location.upload_dir = Some(PathBuf::from(dir));
                }
                "--cgi" => {
                    let extension = args.next().context("missing extension after --cgi")?;
                    let interpreter = args.next().context("missing interpreter after --cgi")?;
                    let extension = if extension.starts_with('.') {
                        extension
                    } else {
                        format!(".{}", extension)
                    };
                    current
                        .location
                        .cgi
                        .insert(extension, PathBuf::from(interpreter));
                }
                "--autoindex" => current.autoindex = Some(true),
                "--no-autoindex" => current.autoindex = Some(false),
                "--location-index" => {
                    current.location.index = Some(
                        args.next()
                            .context("missing filename after --location-index")?,
                    );
                }
                "--redirect" => {
                    current.location.redirect =
                        Some(args.next().context("missing url after --redirect")?);
                }
                _ => bail!("unknown argument `{}'", arg),
            }
        }

        for pending in locations {
            let mut location = pending.location;
            location.autoindex = pending.autoindex.unwrap_or(!no_listing);
            if location.index.is_none() {
                location.index = index_name.clone();
            }
            config.routes.push(location);
        }
        Ok(config)
    }

    /// Value of the `Server` header, if one should be sent.
    pub fn server_header(&self) -> Option<&'static str> {
        if self.want_no_server_id {
            None
        } else {
            Some(SERVER_SOFTWARE)
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = Ipv4Addr::from_str(self.bindaddr.as_deref().unwrap_or("0.0.0.0"))
            .context("malformed --addr argument")?;
        Ok(SocketAddr::V4(SocketAddrV4::new(addr, self.bindport)))
    }

    /// Initialize the non-blocking TcpListener that connections are accepted from.
    pub fn create_listener(&self) -> Result<TcpListener> {
        let socket_addr = self.socket_addr()?;
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        listener
            .set_nonblocking(true)
            .context("failed to make listening socket non-blocking")?;
        let local_addr = listener
            .local_addr()
            .context("failed to get listening address")?;
        info!("listening on: http://{}/", local_addr);
        Ok(listener)
    }
}

pub fn usage(argv0: &str) {
    print!(
        "usage:\t{} /path/to/wwwroot [flags]\n\n\
        flags:\t--port number (default: {})\n\
        \t\tSpecifies which port to listen on for connections.\n\
        \t\tPass 0 to let the system choose any free port for you.\n\n\
        \t--addr ip (default: all)\n\
        \t\tIf multiple interfaces are present, specifies\n\
        \t\twhich one to bind the listening port to.\n\n\
        \t--maxconn number (default: system maximum)\n\
        \t\tSpecifies how many concurrent connections to accept.\n\
        \t\tSockets numbered FD_SETSIZE (1024) or above are refused.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit will be closed. Set to zero to disable timeouts.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the request log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for request log.\n\n\
        \t--index filename (default: {})\n\
        \t\tDefault file to serve when a directory is requested.\n\n\
        \t--no-listing\n\
        \t\tDo not serve listing if directory is requested.\n\n\
        \t--mimetypes filename (optional)\n\
        \t\tParses specified file for extension-MIME associations.\n\n\
        \t--default-mimetype string (optional, default: {})\n\
        \t\tFiles with unknown extensions are served as this mimetype.\n\n\
        \t--no-server-id\n\
        \t\tDon't identify the server type in headers.\n\n\
        \t--max-body-size bytes (default: {})\n\
        \t\tLargest upload that will be accepted.\n\n\
        \t--error-page code filename\n\
        \t\tServe the file's content as the body of error responses\n\
        \t\twith the given status code.\n\n\
        \t--cgi-timeout secs (default: {})\n\
        \t\tHow long a single read of CGI output may wait.\n\n\
        \t--location prefix root\n\
        \t\tServe URLs starting with prefix from root. The flags below\n\
        \t\tapply to the most recent location, or to / if none is given.\n\n\
        \t--methods list\n\
        \t\tComma-separated methods allowed in the location.\n\n\
        \t--upload-dir dir (default: root/uploads)\n\
        \t\tWhere files POSTed to the location are saved.\n\n\
        \t--cgi extension interpreter\n\
        \t\tRun files with this extension through interpreter.\n\n\
        \t--autoindex, --no-autoindex\n\
        \t\tOverride directory listing for the location.\n\n\
        \t--location-index filename\n\
        \t\tDefault file for directories in the location.\n\n\
        \t--redirect url\n\
        \t\tAnswer every request in the location with a 301 to url.\n\n",
        argv0,
        DEFAULT_PORT,
        DEFAULT_TIMEOUT.as_secs(),
        DEFAULT_INDEX_NAME,
        DEFAULT_MIME_TYPE,
        DEFAULT_MAX_BODY_SIZE,
        DEFAULT_READ_TIMEOUT.as_secs(),
    );
}

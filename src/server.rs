//! The connection multiplexer: one thread, one `select()` loop, every socket non-blocking.

use std::net::{IpAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::socket;
use nix::sys::time::TimeVal;
use tracing::{debug, info, warn};

use crate::cgi::{self, CgiJob, CgiOutcome};
use crate::config::{Config, SERVER_SOFTWARE};
use crate::log::{AccessEntry, LogSink, ServerStats};
use crate::request::{Method, Progress, Request};
use crate::response::{HttpDate, Response};
use crate::router::{route, Route};
use crate::shutdown::{ShutdownToken, Waker};
use crate::static_files;
use crate::upload::{handle_upload, DirStore};

/// Longest a single `select()` may block, so idle connections are swept even when quiet.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUF_SIZE: usize = 8192;

/// Whether `fd` can be added to an `FdSet`. `FD_SET` panics past `FD_SETSIZE`.
pub(crate) fn selectable(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
}

/// What the access log needs to know about a request once its response is ready.
#[derive(Debug, Clone)]
struct RequestSummary {
    method: Method,
    uri: String,
    version: String,
    referer: Option<String>,
    user_agent: Option<String>,
    close: bool,
}

impl RequestSummary {
    fn of(request: &Request) -> Self {
        Self {
            method: request.method,
            uri: request.uri.clone(),
            version: request.version.clone(),
            referer: request.header("Referer").map(str::to_string),
            user_agent: request.header("User-Agent").map(str::to_string),
            close: request.wants_close(),
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    socket: TcpStream,
    client: IpAddr,
    last_active: Instant,
    request: Request,
    outbuf: Vec<u8>,
    sent: usize,
    /// Set while a CGI script runs for this connection; input is left unparsed until it
    /// finishes.
    cgi_pending: Option<RequestSummary>,
    close_after_flush: bool,
}

impl Connection {
    fn new(id: u64, now: Instant, socket: TcpStream, client: IpAddr, body_limit: usize) -> Self {
        Self {
            id,
            socket,
            client,
            last_active: now,
            request: Request::with_body_limit(body_limit),
            outbuf: Vec::new(),
            sent: 0,
            cgi_pending: None,
            close_after_flush: false,
        }
    }

    fn wants_write(&self) -> bool {
        self.sent < self.outbuf.len()
    }

    fn wants_read(&self) -> bool {
        !self.wants_write() && self.cgi_pending.is_none() && !self.close_after_flush
    }
}

/// Result of routing one complete request.
enum Dispatch {
    Respond(Response),
    Cgi(CgiJob),
}

fn dispatch(config: &Config, port: u16, conn_id: u64, request: &Request) -> Dispatch {
    let response = match route(&config.routes, request) {
        Route::Static(location) => static_files::serve(location, request, &config.mime_map),
        Route::Upload(location) => handle_upload(
            request,
            config.max_body_size,
            &DirStore::new(location.upload_dir()),
        ),
        Route::Cgi {
            script,
            interpreter,
            ..
        } => match CgiJob::prepare(conn_id, request, script, interpreter.clone()) {
            Ok(mut job) => {
                job.server_port = port;
                job.server_software = SERVER_SOFTWARE.to_string();
                job.read_timeout = config.cgi_timeout;
                return Dispatch::Cgi(job);
            }
            Err(response) => response,
        },
        Route::Put => Response::html(
            200,
            "<html><body><h1>200 OK</h1><p>PUT request received</p></body></html>\n",
        ),
        Route::Redirect(target) => Response::redirect(301, target),
        Route::BadRequest => Response::error(
            400,
            "You sent a request that the server couldn't understand.",
        ),
        Route::NotFound => Response::error(404, "The URL you requested was not found."),
        Route::MethodNotAllowed => {
            Response::error(405, "The method is not allowed for the requested URL.")
        }
    };
    Dispatch::Respond(response)
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    port: u16,
    connections: Vec<Connection>,
    next_id: u64,
    /// Set when accept() ran out of descriptors; cleared when a connection closes.
    files_exhausted: bool,
    stats: ServerStats,
    waker: Waker,
    shutdown: ShutdownToken,
    completions_tx: Sender<CgiOutcome>,
    completions_rx: Receiver<CgiOutcome>,
}

impl Server {
    /// `listener` must already be non-blocking.
    pub fn new(
        config: Config,
        listener: TcpListener,
        waker: Waker,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let port = listener
            .local_addr()
            .context("failed to get listening address")?
            .port();
        let (completions_tx, completions_rx) = channel();
        Ok(Self {
            config,
            listener,
            port,
            connections: Vec::new(),
            next_id: 0,
            files_exhausted: false,
            stats: ServerStats::default(),
            waker,
            shutdown,
            completions_tx,
            completions_rx,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Poll until the shutdown token is triggered.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown.is_triggered() {
            self.httpd_poll()?;
        }
        info!(
            "shutting down with {} open connections",
            self.connections.len()
        );
        Ok(())
    }

    /// Close every connection and print usage statistics. They go to stdout, so they are
    /// skipped when the access log does too.
    pub fn finish(mut self) -> Result<()> {
        self.connections.clear();
        if !matches!(self.config.log_sink, LogSink::Stdout) {
            self.stats.print()?;
        }
        Ok(())
    }

    fn accept_paused(&self) -> bool {
        self.files_exhausted
            || self
                .config
                .max_connections
                .map_or(false, |max| self.connections.len() >= max)
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.connections.iter().position(|conn| conn.id == id)
    }

    /// One iteration: wait for readiness, then accept, read, write and sweep.
    pub fn httpd_poll(&mut self) -> Result<()> {
        let mut recv_set = FdSet::new();
        let mut send_set = FdSet::new();

        recv_set.insert(self.waker.fd());
        if !self.accept_paused() {
            recv_set.insert(self.listener.as_raw_fd());
        }
        for conn in &self.connections {
            if conn.wants_write() {
                send_set.insert(conn.socket.as_raw_fd());
            } else if conn.wants_read() {
                recv_set.insert(conn.socket.as_raw_fd());
            }
        }

        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: POLL_INTERVAL.as_secs() as libc::time_t,
            tv_usec: 0,
        });
        match select(
            None,
            Some(&mut recv_set),
            Some(&mut send_set),
            None,
            Some(&mut timeout),
        ) {
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e).context("select() failed"),
        }

        // Snapshot readiness before anything below adds or removes connections.
        let mut ready = Vec::new();
        for conn in &self.connections {
            let fd = conn.socket.as_raw_fd();
            let readable = recv_set.contains(fd);
            let writable = send_set.contains(fd);
            if readable || writable {
                ready.push((conn.id, readable, writable));
            }
        }
        let listener_ready = recv_set.contains(self.listener.as_raw_fd());
        if recv_set.contains(self.waker.fd()) {
            self.waker.drain();
        }

        let now = Instant::now();
        self.drain_completions(now);
        self.sweep_idle(now);
        if listener_ready {
            self.accept_connection(now);
        }
        for (id, readable, writable) in ready {
            if writable {
                self.poll_send(id, now);
            }
            if readable {
                self.poll_recv_request(id, now);
            }
        }
        Ok(())
    }

    /// Accept one connection from the listener and try to read from it straight away.
    fn accept_connection(&mut self, now: Instant) {
        let (stream, addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    self.files_exhausted = true;
                }
                warn!("accept() failed: {}", e);
                return;
            }
        };
        if !selectable(stream.as_raw_fd()) {
            warn!(
                "refusing connection from {}: descriptor {} is past FD_SETSIZE",
                addr,
                stream.as_raw_fd()
            );
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("failed to make connection from {} non-blocking: {}", addr, e);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!("accepted connection {} from {}", id, addr);
        let body_limit = self.config.max_body_size;
        self.connections
            .push(Connection::new(id, now, stream, addr.ip(), body_limit));
        self.poll_recv_request(id, now);
    }

    fn poll_recv_request(&mut self, id: u64, now: Instant) {
        let index = match self.index_of(id) {
            Some(index) => index,
            None => return,
        };
        let conn = &mut self.connections[index];
        let mut buf = [0; RECV_BUF_SIZE];
        let recvd = match socket::recv(conn.socket.as_raw_fd(), &mut buf, socket::MsgFlags::empty())
        {
            Ok(recvd) if recvd > 0 => recvd,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return, // would block
            Ok(_) => return self.evict(id, "closed by peer"),
            Err(e) => {
                debug!("recv() on connection {} failed: {}", id, e);
                return self.evict(id, "receive error");
            }
        };
        conn.last_active = now;
        self.stats.total_in += recvd as u64;
        self.process_input(id, &buf[..recvd], now);
    }

    /// Parse and answer as many buffered requests as possible, in order.
    fn process_input(&mut self, id: u64, mut chunk: &[u8], now: Instant) {
        loop {
            let index = match self.index_of(id) {
                Some(index) => index,
                None => return,
            };
            let conn = &mut self.connections[index];
            if conn.cgi_pending.is_some() || conn.close_after_flush {
                break;
            }
            let progress = conn.request.parse(chunk);
            chunk = &[];

            match progress {
                Progress::Incomplete => break,
                Progress::Error(code) => {
                    let mut summary = RequestSummary::of(&conn.request);
                    summary.close = true;
                    conn.request.reset();
                    let response =
                        Response::error(code, "Your request could not be processed.");
                    self.queue_response(index, &summary, response);
                    break;
                }
                Progress::Complete => {
                    let summary = RequestSummary::of(&conn.request);
                    let dispatched = dispatch(&self.config, self.port, id, &conn.request);
                    let conn = &mut self.connections[index];
                    conn.request.reset();
                    match dispatched {
                        Dispatch::Respond(response) => {
                            self.queue_response(index, &summary, response)
                        }
                        Dispatch::Cgi(job) => {
                            match cgi::spawn(job, self.completions_tx.clone(), self.waker.clone())
                            {
                                Ok(_) => conn.cgi_pending = Some(summary),
                                Err(e) => {
                                    warn!("failed to spawn CGI worker: {}", e);
                                    let response =
                                        Response::error(500, "CGI execution failed.");
                                    self.queue_response(index, &summary, response);
                                }
                            }
                        }
                    }
                    if !self.connections[index].request.has_buffered_input() {
                        break;
                    }
                }
            }
        }

        // Try to send right away, instead of going through another iteration of the loop.
        self.poll_send(id, now);
    }

    /// Add server headers, then append the serialized response to the connection's output.
    fn queue_response(&mut self, index: usize, summary: &RequestSummary, mut response: Response) {
        self.finalize(&mut response, summary.close);
        let bytes = if summary.method == Method::Head {
            response.build_head()
        } else {
            response.build()
        };

        let conn = &mut self.connections[index];
        conn.outbuf.extend_from_slice(&bytes);
        if summary.close {
            conn.close_after_flush = true;
        }
        self.stats.num_requests += 1;

        let entry = AccessEntry {
            client: conn.client,
            time: SystemTime::now(),
            method: summary.method.as_str(),
            uri: &summary.uri,
            version: &summary.version,
            code: response.code,
            bytes: bytes.len(),
            referer: summary.referer.as_deref(),
            user_agent: summary.user_agent.as_deref(),
        };
        if let Err(e) = self.config.log_sink.log(&entry.to_string()) {
            warn!("failed to write access log: {}", e);
        }
    }

    fn finalize(&self, response: &mut Response, close: bool) {
        if response.code >= 400 {
            if let Some(path) = self.config.error_pages.get(&response.code) {
                match std::fs::read(path) {
                    Ok(body) => response.set_body(body, "text/html; charset=UTF-8"),
                    Err(e) => warn!("failed to read error page {}: {}", path.display(), e),
                }
            }
        }
        if let Some(server) = self.config.server_header() {
            response.set_header("Server", server);
        }
        response.set_header("Date", HttpDate(SystemTime::now()).to_string());
        if close {
            response.set_header("Connection", "close");
        }
    }

    fn poll_send(&mut self, id: u64, now: Instant) {
        let index = match self.index_of(id) {
            Some(index) => index,
            None => return,
        };
        let conn = &mut self.connections[index];
        if !conn.wants_write() {
            return;
        }
        let sent = match socket::send(
            conn.socket.as_raw_fd(),
            &conn.outbuf[conn.sent..],
            socket::MsgFlags::empty(),
        ) {
            Ok(sent) if sent > 0 => sent,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return, // would block
            Ok(_) => return self.evict(id, "send returned zero"),
            Err(e) => {
                debug!("send() on connection {} failed: {}", id, e);
                return self.evict(id, "send error");
            }
        };
        conn.sent += sent;
        conn.last_active = now;
        self.stats.total_out += sent as u64;

        if !conn.wants_write() {
            conn.outbuf.clear();
            conn.sent = 0;
            if conn.close_after_flush {
                self.evict(id, "response sent");
            }
        }
    }

    /// Deliver finished CGI responses. Results for connections that have gone away are
    /// dropped.
    fn drain_completions(&mut self, now: Instant) {
        loop {
            let outcome = match self.completions_rx.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            };
            let index = match self.index_of(outcome.conn_id) {
                Some(index) => index,
                None => {
                    debug!("discarding CGI result for closed connection {}", outcome.conn_id);
                    continue;
                }
            };
            let summary = match self.connections[index].cgi_pending.take() {
                Some(summary) => summary,
                None => continue,
            };
            self.queue_response(index, &summary, outcome.response);
            self.connections[index].last_active = now;
            // Pick up any requests pipelined behind the CGI one.
            self.process_input(outcome.conn_id, &[], now);
        }
    }

    /// Evict connections idle for longer than the timeout, whatever they are doing.
    fn sweep_idle(&mut self, now: Instant) {
        let timeout = match self.config.timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let idle: Vec<u64> = self
            .connections
            .iter()
            .filter(|conn| now.saturating_duration_since(conn.last_active) > timeout)
            .map(|conn| conn.id)
            .collect();
        for id in idle {
            self.evict(id, "idle timeout");
        }
    }

    /// Close a connection. Evicting one that is already gone does nothing.
    fn evict(&mut self, id: u64, reason: &str) {
        if let Some(index) = self.index_of(id) {
            let conn = self.connections.remove(index);
            debug!("closing connection {} from {}: {}", id, conn.client, reason);
            // Try to resume accepting if we ran out of sockets.
            self.files_exhausted = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpStream;

    use tempfile::{tempdir, TempDir};

    fn server(extra: &[&str]) -> (TempDir, Server) {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), "hello").unwrap();
        let mut args = vec![
            root.path().to_string_lossy().into_owned(),
            "--addr".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            "0".to_string(),
            "--log".to_string(),
            root.path().join("access.log").to_string_lossy().into_owned(),
        ];
        args.extend(extra.iter().map(|arg| arg.to_string()));
        let config = Config::from_args(args).unwrap();
        let listener = config.create_listener().unwrap();
        let waker = Waker::new().unwrap();
        let shutdown = ShutdownToken::new(waker.clone());
        let server = Server::new(config, listener, waker, shutdown).unwrap();
        (root, server)
    }

    fn connect(server: &Server) -> TcpStream {
        TcpStream::connect(server.listener.local_addr().unwrap()).unwrap()
    }

    /// Poll until `done` holds, giving up after a few seconds.
    fn poll_until(server: &mut Server, done: impl Fn(&Server) -> bool) {
        let start = Instant::now();
        while !done(server) {
            assert!(start.elapsed() < Duration::from_secs(5), "gave up polling");
            server.httpd_poll().unwrap();
        }
    }

    #[test]
    fn idle_connection_is_evicted() {
        let (_root, mut server) = server(&["--timeout", "1"]);
        let _client = connect(&server);
        poll_until(&mut server, |server| server.connection_count() == 1);

        let now = Instant::now();
        server.sweep_idle(now);
        assert_eq!(server.connection_count(), 1);
        server.sweep_idle(now + Duration::from_secs(2));
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn timeout_disabled() {
        let (_root, mut server) = server(&["--timeout", "0"]);
        let _client = connect(&server);
        poll_until(&mut server, |server| server.connection_count() == 1);
        server.sweep_idle(Instant::now() + Duration::from_secs(3600));
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn evict_is_idempotent() {
        let (_root, mut server) = server(&[]);
        let _client = connect(&server);
        poll_until(&mut server, |server| server.connection_count() == 1);
        let id = server.connections[0].id;
        server.files_exhausted = true;
        server.evict(id, "test");
        server.evict(id, "test");
        assert_eq!(server.connection_count(), 0);
        assert!(!server.files_exhausted);
    }

    #[test]
    fn max_connections_pauses_accept() {
        let (_root, mut server) = server(&["--maxconn", "1"]);
        let _first = connect(&server);
        let _second = connect(&server);
        poll_until(&mut server, |server| server.connection_count() == 1);
        for _ in 0..3 {
            server.httpd_poll().unwrap();
        }
        assert_eq!(server.connection_count(), 1);
        assert!(server.accept_paused());
    }

    #[test]
    fn serves_request() {
        let (_root, mut server) = server(&[]);
        let mut client = connect(&server);
        client
            .write_all(b"GET /hello.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        poll_until(&mut server, |server| server.stats().num_requests == 1);
        poll_until(&mut server, |server| server.connection_count() == 0);

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
        assert!(reply.ends_with("\r\n\r\nhello"));
        assert_eq!(server.stats().total_out, reply.len() as u64);
    }

    #[test]
    fn oversized_body_is_refused_up_front() {
        let (root, mut server) = server(&["--max-body-size", "10"]);
        let mut client = connect(&server);
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100000000\r\n\r\n")
            .unwrap();
        poll_until(&mut server, |server| server.stats().num_requests == 1);
        poll_until(&mut server, |server| server.connection_count() == 0);

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
        assert!(!root.path().join("uploads").exists());
    }

    #[test]
    fn descriptors_past_fd_setsize() {
        assert!(selectable(0));
        assert!(selectable(libc::FD_SETSIZE as RawFd - 1));
        assert!(!selectable(libc::FD_SETSIZE as RawFd));
        assert!(!selectable(-1));
    }

    #[test]
    fn pending_cgi_result_for_closed_connection() {
        let (_root, mut server) = server(&[]);
        server
            .completions_tx
            .send(CgiOutcome {
                conn_id: 42,
                response: Response::new(200),
            })
            .unwrap();
        server.drain_completions(Instant::now());
        assert_eq!(server.stats().num_requests, 0);
    }
}

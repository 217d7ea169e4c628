//! CGI/1.1 script execution.
//!
//! Scripts run to completion on a worker thread; the response comes back to the event loop
//! over a channel, followed by a wakeup on the loop's self-pipe.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use tracing::{debug, warn};

use crate::request::{Method, Request};
use crate::response::{status_message, Response};
use crate::server::selectable;
use crate::shutdown::Waker;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CGI_CONTENT_TYPE: &str = "text/html";
const DEFAULT_FORM_TYPE: &str = "application/x-www-form-urlencoded";
/// Script headers the server owns: framing and connection handling.
const DROPPED_CGI_HEADERS: &[&str] = &["Content-Length", "Transfer-Encoding", "Connection"];

/// Everything a worker thread needs to run one script.
#[derive(Debug, Clone)]
pub struct CgiJob {
    pub conn_id: u64,
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub method: Method,
    pub uri: String,
    pub query: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub server_port: u16,
    pub server_software: String,
    /// How long a single read of the script's output may wait.
    pub read_timeout: Duration,
}

/// A finished job, addressed to the connection that asked for it.
#[derive(Debug)]
pub struct CgiOutcome {
    pub conn_id: u64,
    pub response: Response,
}

impl CgiJob {
    /// Build a job for `request`, or a 404 if `script` isn't a regular file.
    pub fn prepare(
        conn_id: u64,
        request: &Request,
        script: PathBuf,
        interpreter: PathBuf,
    ) -> Result<Self, Response> {
        if !script.is_file() {
            return Err(Response::error(
                404,
                &format!("CGI script not found: {}", request.uri),
            ));
        }
        Ok(Self {
            conn_id,
            interpreter,
            script,
            method: request.method,
            uri: request.uri.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            content_type: request.header("Content-Type").map(str::to_string),
            server_port: 0,
            server_software: String::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// Variables passed to the script. Nothing else from the server's environment leaks
    /// through except `PATH`.
    pub fn environment(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("REQUEST_METHOD", self.method.to_string()),
            ("SCRIPT_FILENAME", self.script.to_string_lossy().into_owned()),
            ("SCRIPT_NAME", self.uri.clone()),
            ("PATH_INFO", self.uri.clone()),
            ("QUERY_STRING", self.query.clone()),
        ];
        if self.method == Method::Post {
            env.push(("CONTENT_LENGTH", self.body.len().to_string()));
            env.push((
                "CONTENT_TYPE",
                self.content_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FORM_TYPE.to_string()),
            ));
        }
        env.extend(vec![
            ("SERVER_PROTOCOL", "HTTP/1.1".to_string()),
            ("SERVER_NAME", "localhost".to_string()),
            ("SERVER_PORT", self.server_port.to_string()),
            ("GATEWAY_INTERFACE", "CGI/1.1".to_string()),
            ("REDIRECT_STATUS", "200".to_string()),
            ("SERVER_SOFTWARE", self.server_software.clone()),
        ]);
        env
    }
}

/// Run the script and turn its output into a response. Blocks until the script exits, its
/// output hits EOF, or a read waits longer than `read_timeout`.
pub fn execute(job: &CgiJob) -> Response {
    let mut command = Command::new(&job.interpreter);
    command
        .arg(&job.script)
        .env_clear()
        .envs(job.environment())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(
                "failed to run {} {}: {}",
                job.interpreter.display(),
                job.script.display(),
                e
            );
            return Response::error(500, "CGI execution failed.");
        }
    };

    // Scripts may write output before draining stdin, so the body goes in from another
    // thread. Dropping the handle sends EOF.
    let writer = child.stdin.take().map(|mut stdin| {
        let body = job.body.clone();
        std::thread::spawn(move || {
            if let Err(e) = stdin.write_all(&body) {
                debug!("CGI stdin closed early: {}", e);
            }
        })
    });

    let output = match child.stdout.take() {
        Some(mut stdout) => capture(&mut stdout, job.read_timeout),
        None => Vec::new(),
    };
    reap(&mut child);
    if let Some(writer) = writer {
        let _ = writer.join();
    }

    if output.is_empty() {
        return Response::error(500, "CGI produced no output.");
    }
    parse_cgi_output(&output)
}

/// Read until EOF, an error, or a read that waits longer than `timeout`.
fn capture<R: Read + AsRawFd>(source: &mut R, timeout: Duration) -> Vec<u8> {
    let mut output = Vec::new();
    let mut buf = [0; 4096];
    if !selectable(source.as_raw_fd()) {
        warn!("CGI output descriptor {} is past FD_SETSIZE", source.as_raw_fd());
        return output;
    }
    loop {
        let mut read_set = FdSet::new();
        read_set.insert(source.as_raw_fd());
        let mut deadline = TimeVal::from(libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        });
        match select(None, Some(&mut read_set), None, None, Some(&mut deadline)) {
            Ok(0) => {
                debug!("CGI output timed out after {} bytes", output.len());
                break;
            }
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
            Err(e) => {
                warn!("select() on CGI output failed: {}", e);
                break;
            }
        }
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("failed to read CGI output: {}", e);
                break;
            }
        }
    }
    output
}

/// Kill the child if it's still running, then wait for it.
fn reap(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => warn!("failed to poll CGI child: {}", e),
    }
    if let Err(e) = child.kill() {
        debug!("failed to kill CGI child: {}", e);
    }
    if let Err(e) = child.wait() {
        warn!("failed to reap CGI child: {}", e);
    }
}

/// Split script output into its header block and body.
///
/// `Status` sets the status line and `Content-Type` defaults to text/html. Framing and
/// connection headers are dropped, other headers are passed through. Output without a blank
/// line is all body.
pub fn parse_cgi_output(output: &[u8]) -> Response {
    let separator = output
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| (pos, 4))
        .or_else(|| output.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2)));
    let (head, body) = match separator {
        Some((pos, len)) => (&output[..pos], &output[pos + len..]),
        None => (&output[..0], output),
    };

    let mut response = Response::new(200);
    let mut content_type = DEFAULT_CGI_CONTENT_TYPE.to_string();
    for line in String::from_utf8_lossy(head).lines() {
        let line = line.trim_end_matches('\r');
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if name.eq_ignore_ascii_case("Content-Type") {
            content_type = value.to_string();
        } else if name.eq_ignore_ascii_case("Status") {
            let mut parts = value.splitn(2, ' ');
            let code = parts.next().and_then(|code| code.parse::<u16>().ok());
            if let Some(code) = code.filter(|code| (100..1000).contains(code)) {
                response.code = code;
                response.reason = match parts.next().map(str::trim) {
                    Some(reason) if !reason.is_empty() => reason.to_string(),
                    _ => status_message(code).to_string(),
                };
            }
        } else if !name.is_empty()
            && !DROPPED_CGI_HEADERS
                .iter()
                .any(|dropped| name.eq_ignore_ascii_case(dropped))
        {
            response.set_header(name, value);
        }
    }
    response.set_body(body, &content_type);
    response
}

/// Run `job` on a new thread. The outcome is sent on `completions`, then `waker` fires.
pub fn spawn(
    job: CgiJob,
    completions: Sender<CgiOutcome>,
    waker: Waker,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("cgi-{}", job.conn_id))
        .spawn(move || {
            let response = execute(&job);
            let outcome = CgiOutcome {
                conn_id: job.conn_id,
                response,
            };
            // The receiver is gone only when the server is shutting down.
            if completions.send(outcome).is_ok() {
                waker.wake();
            }
        })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::mpsc::channel;
    use std::time::Instant;

    use tempfile::{tempdir, TempDir};
    use test_case::test_case;

    fn script(dir: &TempDir, name: &str, source: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(raw: &[u8]) -> Request {
        let mut request = Request::new();
        request.parse(raw);
        assert!(request.is_complete());
        request
    }

    fn job(path: &Path, raw: &[u8]) -> CgiJob {
        let mut job = CgiJob::prepare(7, &request(raw), path.to_path_buf(), "/bin/sh".into())
            .expect("script should exist");
        job.server_port = 8080;
        job.server_software = "webservd/test".to_string();
        job
    }

    #[test]
    fn missing_script() {
        let dir = tempdir().unwrap();
        let result = CgiJob::prepare(
            1,
            &request(b"GET /nope.sh HTTP/1.1\r\n\r\n"),
            dir.path().join("nope.sh"),
            "/bin/sh".into(),
        );
        assert_eq!(result.unwrap_err().code, 404);
        let result = CgiJob::prepare(
            1,
            &request(b"GET / HTTP/1.1\r\n\r\n"),
            dir.path().to_path_buf(),
            "/bin/sh".into(),
        );
        assert_eq!(result.unwrap_err().code, 404);
    }

    #[test]
    fn environment_for_post() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "env.sh", "");
        let job = job(
            &path,
            b"POST /cgi/env.sh?a=1&b=2 HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        );
        let env = job.environment();
        let get = |name: &str| {
            env.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(get("SCRIPT_NAME"), Some("/cgi/env.sh"));
        assert_eq!(get("PATH_INFO"), Some("/cgi/env.sh"));
        assert_eq!(get("QUERY_STRING"), Some("a=1&b=2"));
        assert_eq!(get("CONTENT_LENGTH"), Some("3"));
        assert_eq!(get("CONTENT_TYPE"), Some(DEFAULT_FORM_TYPE));
        assert_eq!(get("SERVER_PORT"), Some("8080"));
        assert_eq!(get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(get("SERVER_SOFTWARE"), Some("webservd/test"));
    }

    #[test]
    fn environment_for_get() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "env.sh", "");
        let env = job(&path, b"GET /env.sh HTTP/1.1\r\n\r\n").environment();
        assert!(env.iter().all(|(key, _)| *key != "CONTENT_LENGTH"));
        assert!(env.iter().any(|(key, value)| *key == "QUERY_STRING" && value.is_empty()));
    }

    #[test]
    fn plain_text_output() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "hi.sh", "printf 'Content-Type: text/plain\\r\\n\\r\\nhi'\n");
        let response = execute(&job(&path, b"GET /hi.sh HTTP/1.1\r\n\r\n"));
        assert_eq!(response.code, 200);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn echoes_body_and_query() {
        let dir = tempdir().unwrap();
        let path = script(
            &dir,
            "echo.sh",
            "printf 'Content-Type: text/plain\\n\\n'\nprintf '%s|' \"$QUERY_STRING\"\ncat\n",
        );
        let response = execute(&job(
            &path,
            b"POST /echo.sh?x=1 HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        ));
        assert_eq!(response.code, 200);
        assert_eq!(response.body, b"x=1|hello");
    }

    #[test]
    fn no_output() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "quiet.sh", "exit 0\n");
        let response = execute(&job(&path, b"GET /quiet.sh HTTP/1.1\r\n\r\n"));
        assert_eq!(response.code, 500);
    }

    #[test]
    fn missing_interpreter() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "x.sh", "echo hi\n");
        let mut job = job(&path, b"GET /x.sh HTTP/1.1\r\n\r\n");
        job.interpreter = dir.path().join("no-such-interpreter");
        assert_eq!(execute(&job).code, 500);
    }

    #[test]
    fn hung_script_is_killed() {
        let dir = tempdir().unwrap();
        let path = script(
            &dir,
            "hang.sh",
            "printf 'Content-Type: text/plain\\r\\n\\r\\npartial'\nexec sleep 30\n",
        );
        let mut job = job(&path, b"GET /hang.sh HTTP/1.1\r\n\r\n");
        job.read_timeout = Duration::from_millis(300);
        let start = Instant::now();
        let response = execute(&job);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(response.code, 200);
        assert_eq!(response.body, b"partial");
    }

    #[test]
    fn spawn_reports_completion() {
        let dir = tempdir().unwrap();
        let path = script(&dir, "ok.sh", "printf 'Status: 201\\r\\n\\r\\nmade'\n");
        let waker = Waker::new().unwrap();
        let (sender, receiver) = channel();
        spawn(job(&path, b"GET /ok.sh HTTP/1.1\r\n\r\n"), sender, waker)
            .unwrap()
            .join()
            .unwrap();
        let outcome = receiver.recv().unwrap();
        assert_eq!(outcome.conn_id, 7);
        assert_eq!(outcome.response.code, 201);
        assert_eq!(outcome.response.reason, "Created");
        assert_eq!(outcome.response.body, b"made");
    }

    #[test_case(b"Status: 404 Gone Fishing\r\n\r\nx", 404, "Gone Fishing" ; "custom reason")]
    #[test_case(b"status: 302\r\nLocation: /a\r\n\r\n", 302, "Found" ; "default reason")]
    #[test_case(b"Status: bogus\r\n\r\n", 200, "OK" ; "invalid status")]
    #[test_case(b"no header block at all", 200, "OK" ; "no separator")]
    fn status_lines(output: &[u8], code: u16, reason: &str) {
        let response = parse_cgi_output(output);
        assert_eq!(response.code, code);
        assert_eq!(response.reason, reason);
    }

    #[test]
    fn output_headers() {
        let response = parse_cgi_output(
            b"Content-Type: application/json\nX-Script: yes\nContent-Length: 99\n\n{}\n\nmore",
        );
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert_eq!(response.header("X-Script"), Some("yes"));
        assert_eq!(response.body, b"{}\n\nmore");
        assert!(response
            .build()
            .windows(19)
            .any(|w| w == b"Content-Length: 8\r\n"));
    }

    #[test]
    fn framing_headers_are_dropped() {
        let mut response = parse_cgi_output(
            b"Transfer-Encoding: chunked\r\nconnection: keep-alive\r\nserver: script\r\n\r\nok",
        );
        assert_eq!(response.header("Transfer-Encoding"), None);
        assert_eq!(response.header("Connection"), None);
        response.set_header("Server", "webservd/0.1.0");
        let head = String::from_utf8(response.build_head()).unwrap();
        assert_eq!(head.matches("erver: ").count(), 1);
        assert!(head.contains("Server: webservd/0.1.0\r\n"));
    }

    #[test]
    fn output_without_separator() {
        let response = parse_cgi_output(b"just a body");
        assert_eq!(response.header("Content-Type"), Some(DEFAULT_CGI_CONTENT_TYPE));
        assert_eq!(response.body, b"just a body");
    }
}

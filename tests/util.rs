use std::collections::HashMap;
use std::fs::create_dir;
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn with_args(args: &[&str]) -> Self {
        Self::in_dir(tempdir().expect("failed to create tempdir"), args)
    }

    /// Start the server on an already populated root, for flags that read files at startup.
    pub fn in_dir(root: TempDir, args: &[&str]) -> Self {
        // Get an unused port. Assumes the port won't be reused before we start the server.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_webservd"))
            .args(&[
                root.path().to_str().expect("path is not valid UTF-8"),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webservd")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to webservd");

        Self {
            _child: child,
            port,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) {
        std::fs::write(self.root().join(name), contents).expect("failed to create file");
    }

    /// Write a shell script for `--cgi .sh /bin/sh`.
    pub fn create_script(&self, name: &str, source: &str) {
        self.create_file(name, source.as_bytes());
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webservd");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw bytes on a new connection and read one response.
    pub fn send(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n", path);
        for (header_name, header_value) in headers {
            request.push_str(&format!("{}: {}\r\n", header_name, header_value));
        }
        request.push_str("\r\n");
        self.send(request.as_bytes())
    }

    pub fn request(&self, method: &str, path: &str) -> Response {
        self.send(format!("{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n", method, path).as_bytes())
    }

    /// POST a multipart body with one file part.
    pub fn upload(&self, path: &str, filename: &str, contents: &[u8]) -> Response {
        let mut body = format!(
            "--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
            Content-Type: application/octet-stream\r\n\r\n",
            filename
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(b"\r\n--XyZ--\r\n");
        self.post(path, "multipart/form-data; boundary=XyZ", &body)
    }

    pub fn post(&self, path: &str, content_type: &str, body: &[u8]) -> Response {
        let mut request = format!(
            "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            path,
            content_type,
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        self.send(&request)
    }
}

/// HTTP Response from webservd.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut response = Self::head_from_reader(reader)?;
        let length = response
            .header("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .unwrap_or(0);
        response.body = Self::read_body(reader, length)?;
        Ok(response)
    }

    /// Read a response that has no body on the wire, such as the answer to HEAD.
    pub fn head_from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        Ok(Self {
            response_line,
            headers,
            body: Vec::new(),
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    /// Status code and reason, e.g. "200 OK".
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}

/// True once the peer has closed the connection.
pub fn at_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0; 1];
    matches!(stream.read(&mut buf), Ok(0))
}

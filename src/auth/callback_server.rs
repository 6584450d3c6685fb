//! Sign-in callback server
//!
//! A temporary local HTTP server that captures the authorization code from
//! the browser redirect. The first request to `/` carrying a non-empty `code`
//! wins: its code is handed over through a single-slot channel and the server
//! stops accepting connections. Anything that arrives later on an already
//! open connection is answered with an "already completed" page and never
//! blocks.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::Result;
use crate::error::Error;

/// Time allowed for the request line and headers
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for the whole request, body included
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for writing the response
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a keep-alive connection may sit idle between requests
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long open connections get to finish once the server stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Per-connection time limits of a [`CallbackServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Request line and headers
    pub read_header: Duration,
    /// Whole request, body included
    pub read: Duration,
    /// Writing one response
    pub write: Duration,
    /// Keep-alive wait between requests
    pub idle: Duration,
    /// How long open connections get to finish once the server stops
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_header: READ_HEADER_TIMEOUT,
            read: READ_TIMEOUT,
            write: WRITE_TIMEOUT,
            idle: IDLE_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Page shown once the code has been received
const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Account connection</title>
    <style>
        body {
            margin: 0;
            font-family: -apple-system, system-ui, sans-serif;
        }
        .center {
            height: 100vh;
            display: flex;
            flex-direction: column;
            align-items: center;
            justify-content: center;
        }
    </style>
</head>
<body>
    <div class="center">
        <h2>You can safely close this window</h2>
        <p>The cloudlink command line is finishing sign in.</p>
    </div>
</body>
</html>"#;

/// Page shown when the redirect carries no usable code
const ERROR_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Account connection failed</title>
</head>
<body style="font-family: -apple-system, system-ui, sans-serif; text-align: center; margin-top: 20vh;">
    <h2>Account connection failed</h2>
    <p>Something went wrong during the connection.<br>Please try again or check your terminal.</p>
</body>
</html>"#;

/// Page shown to any callback after the first one
const COMPLETED_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Account connection</title>
</head>
<body style="font-family: -apple-system, system-ui, sans-serif; text-align: center; margin-top: 20vh;">
    <h2>Sign in already completed</h2>
    <p>You can safely close this window.</p>
</body>
</html>"#;

const NOT_FOUND_HTML: &str = "<!DOCTYPE html>\n<html><body><h2>Not found</h2></body></html>";
const METHOD_NOT_ALLOWED_HTML: &str = "<!DOCTYPE html>\n<html><body><h2>Method not allowed</h2></body></html>";
const PAYLOAD_TOO_LARGE_HTML: &str = "<!DOCTYPE html>\n<html><body><h2>Request too large</h2></body></html>";

/// A running callback server
///
/// Dropping it stops the server in the background; [`CallbackServer::shutdown`]
/// also waits for it to finish.
pub struct CallbackServer {
    port: u16,
    code: oneshot::Receiver<String>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind `127.0.0.1:<port>` and start serving in the background
    ///
    /// `None` lets the OS pick a free port. The server stops when `cancel`
    /// fires, when [`CallbackServer::shutdown`] is called, or after it has
    /// delivered a code.
    pub async fn start(port: Option<u16>, cancel: &CancellationToken) -> Result<Self> {
        Self::start_with_timeouts(port, cancel, Timeouts::default()).await
    }

    /// Like [`CallbackServer::start`] with custom connection time limits
    pub async fn start_with_timeouts(
        port: Option<u16>,
        cancel: &CancellationToken,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port.unwrap_or(0)));
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let port = listener
            .local_addr()
            .map_err(|source| Error::Bind {
                addr: addr.to_string(),
                source,
            })?
            .port();

        tracing::info!("Callback server listening on http://localhost:{}", port);

        let (sender, code) = oneshot::channel();
        let state = Arc::new(CallbackState {
            sender: Mutex::new(Some(sender)),
            delivered: CancellationToken::new(),
        });
        let shutdown = cancel.child_token();
        let task = tokio::spawn(serve(listener, state, shutdown.clone(), timeouts));

        Ok(Self {
            port,
            code,
            shutdown,
            task,
        })
    }

    /// Port the server is bound to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves with the first authorization code
    ///
    /// Resolves with an error if the server stopped without receiving one.
    pub fn code(&mut self) -> &mut oneshot::Receiver<String> {
        &mut self.code
    }

    /// Stop the server and wait until every connection is closed
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.task).await {
            tracing::error!("Callback server task failed: {}", e);
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State shared by every connection of one server
struct CallbackState {
    sender: Mutex<Option<oneshot::Sender<String>>>,
    delivered: CancellationToken,
}

impl CallbackState {
    /// Hand over `code` unless a code was already handed over
    fn deliver(&self, code: String) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match sender {
            Some(sender) => {
                if sender.send(code).is_err() {
                    tracing::debug!("Sign in stopped waiting before the code arrived");
                }
                self.delivered.cancel();
                true
            }
            None => false,
        }
    }

    fn respond(&self, request: &Request) -> Response {
        if request.method != "GET" {
            return Response::new(405, "Method Not Allowed", METHOD_NOT_ALLOWED_HTML)
                .with_header("Allow", "GET");
        }

        let params = match parse_target(&request.target) {
            Some(params) => params,
            None => return Response::new(404, "Not Found", NOT_FOUND_HTML),
        };

        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_else(|| "Unknown error".to_string());
            tracing::warn!("Authorization failed: {} - {}", error, description);
            return Response::new(400, "Bad Request", ERROR_HTML);
        }

        let code = match params.code {
            Some(code) if !code.is_empty() => code,
            _ => {
                tracing::warn!("Ignoring callback without an authorization code");
                return Response::new(400, "Bad Request", ERROR_HTML);
            }
        };

        if self.deliver(code) {
            Response::new(200, "OK", SUCCESS_HTML).closing()
        } else {
            Response::new(409, "Conflict", COMPLETED_HTML)
        }
    }
}

/// Query parameters of a callback to `/`
#[derive(Debug, Default, PartialEq)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Parse a request target; `None` unless it addresses the root path
fn parse_target(target: &str) -> Option<CallbackParams> {
    let base = Url::parse("http://localhost/").ok()?;
    let url = base.join(target).ok()?;
    if url.path() != "/" {
        return None;
    }

    let mut params = CallbackParams::default();
    for (key, value) in url.query_pairs() {
        let slot = match key.as_ref() {
            "code" => &mut params.code,
            "error" => &mut params.error,
            "error_description" => &mut params.error_description,
            _ => continue,
        };
        // first occurrence wins
        if slot.is_none() {
            *slot = Some(value.into_owned());
        }
    }

    Some(params)
}

/// Request line and the headers the server cares about
#[derive(Debug)]
struct Request {
    method: String,
    target: String,
    keep_alive: bool,
    content_length: u64,
    chunked: bool,
}

impl Request {
    /// Bodies the server refuses to read
    fn body_too_large(&self) -> bool {
        self.content_length > MAX_BODY_BYTES || self.chunked
    }

    fn parse(lines: &[String]) -> io::Result<Self> {
        let (request_line, headers) = lines.split_first().ok_or_else(|| invalid("empty request"))?;

        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version), None) => (method, target, version),
            _ => return Err(invalid("malformed request line")),
        };

        let mut keep_alive = version == "HTTP/1.1";
        let mut content_length = 0;
        let mut chunked = false;

        for header in headers {
            let (name, value) = header.split_once(':').ok_or_else(|| invalid("malformed header"))?;
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "connection" => {
                    if value.eq_ignore_ascii_case("close") {
                        keep_alive = false;
                    } else if value.eq_ignore_ascii_case("keep-alive") {
                        keep_alive = true;
                    }
                }
                "content-length" => {
                    content_length = value.parse().map_err(|_| invalid("invalid content-length"))?;
                }
                "transfer-encoding" => chunked = value.to_ascii_lowercase().contains("chunked"),
                _ => {}
            }
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            keep_alive,
            content_length,
            chunked,
        })
    }
}

struct Response {
    status: u16,
    reason: &'static str,
    body: &'static str,
    extra_header: Option<(&'static str, &'static str)>,
    close: bool,
}

impl Response {
    fn new(status: u16, reason: &'static str, body: &'static str) -> Self {
        Self {
            status,
            reason,
            body,
            extra_header: None,
            close: false,
        }
    }

    fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.extra_header = Some((name, value));
        self
    }

    fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    fn to_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: {}\r\n",
            self.status,
            self.reason,
            self.body.len(),
            if keep_alive { "keep-alive" } else { "close" },
        );
        if let Some((name, value)) = self.extra_header {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Accept loop; returns once every connection is closed
async fn serve(
    listener: TcpListener,
    state: Arc<CallbackState>,
    shutdown: CancellationToken,
    timeouts: Timeouts,
) {
    let closing = CancellationToken::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = state.delivered.cancelled() => {
                tracing::debug!("Authorization code received, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    let closing = closing.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, state, closing, timeouts).await {
                            tracing::debug!("Callback connection from {} closed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to accept callback connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    closing.cancel();

    let drained = timeout(timeouts.shutdown_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!("Closing {} stalled callback connection(s)", connections.len());
        connections.shutdown().await;
    }

    tracing::debug!("Callback server stopped");
}

/// Serve requests on one connection until it closes, idles out, or the
/// server starts closing
async fn serve_connection(
    stream: TcpStream,
    state: Arc<CallbackState>,
    closing: CancellationToken,
    timeouts: Timeouts,
) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut first = true;

    loop {
        if !first {
            tokio::select! {
                _ = closing.cancelled() => break,
                ready = timeout(timeouts.idle, next_request_ready(&mut reader)) => match ready {
                    Ok(Ok(true)) => {}
                    Ok(Ok(false)) | Err(_) => break,
                    Ok(Err(e)) => return Err(e),
                },
            }
        }
        first = false;

        // one deadline for head and body together
        let read = timeout(timeouts.read, async {
            let request = read_request(&mut reader, timeouts.read_header).await?;
            if let Some(request) = &request {
                if !request.body_too_large() {
                    discard_body(&mut reader, request.content_length).await?;
                }
            }
            Ok::<_, io::Error>(request)
        })
        .await;

        let (response, request_keep_alive) = match read {
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "reading request timed out")),
            Ok(Ok(None)) => break,
            Ok(Ok(Some(request))) if request.body_too_large() => {
                (Response::new(413, "Payload Too Large", PAYLOAD_TOO_LARGE_HTML), false)
            }
            Ok(Ok(Some(request))) => (state.respond(&request), request.keep_alive),
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                (Response::new(400, "Bad Request", ERROR_HTML), false)
            }
            Ok(Err(e)) => return Err(e),
        };

        let keep_alive = request_keep_alive && !response.close && !closing.is_cancelled();
        write_response(&mut write_half, &response.to_bytes(keep_alive), timeouts.write).await?;

        if !keep_alive {
            break;
        }
    }

    write_half.shutdown().await
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8], limit: Duration) -> io::Result<()> {
    timeout(limit, writer.write_all(bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "writing response timed out"))?
}

/// `false` once the peer has closed its side
async fn next_request_ready<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<bool> {
    let buf = reader.fill_buf().await?;
    Ok(!buf.is_empty())
}

/// Read one request head; `None` if the peer closed before sending anything
async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    header_limit: Duration,
) -> io::Result<Option<Request>> {
    let lines = match timeout(header_limit, read_head(reader)).await {
        Ok(lines) => lines?,
        Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "reading headers timed out")),
    };

    match lines {
        Some(lines) => Request::parse(&lines).map(Some),
        None => Ok(None),
    }
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<String>>> {
    let mut lines = Vec::new();
    let mut total = 0;

    loop {
        if total >= MAX_HEAD_BYTES {
            return Err(invalid("request head too large"));
        }

        let mut line = Vec::new();
        let remaining = (MAX_HEAD_BYTES - total) as u64;
        let n = (&mut *reader).take(remaining).read_until(b'\n', &mut line).await?;

        if n == 0 {
            if total == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-request"));
        }

        total += n;
        if !line.ends_with(b"\n") {
            if total >= MAX_HEAD_BYTES {
                return Err(invalid("request head too large"));
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-request"));
        }

        let line = String::from_utf8_lossy(&line)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string();

        if line.is_empty() {
            // stray CRLF between pipelined requests
            if lines.is_empty() {
                continue;
            }
            return Ok(Some(lines));
        }

        lines.push(line);
    }
}

async fn discard_body<R: AsyncBufRead + Unpin>(reader: &mut R, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }

    let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-body"));
    }
    Ok(())
}

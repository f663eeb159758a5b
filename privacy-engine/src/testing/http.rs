//! A scripted HTTP server on a local port.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request received by [`MockHttpServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Method, e.g. `GET`.
    pub method: String,
    /// Path and query string.
    pub target: String,
    /// Headers with lowercased names.
    pub headers: Vec<(String, String)>,
    /// Raw body.
    pub body: String,
}

impl RecordedRequest {
    /// Looks up a header by lowercase name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Path without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }
}

/// Responses for one method and path.
///
/// Responses are served in order; the last one repeats.
#[derive(Debug, Clone)]
pub struct MockRoute {
    method: String,
    path: String,
    responses: VecDeque<(u16, String)>,
}

impl MockRoute {
    /// Creates a route with no responses.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            responses: VecDeque::new(),
        }
    }

    /// Queues a JSON response.
    #[must_use]
    pub fn respond(self, status: u16, body: Value) -> Self {
        self.respond_raw(status, &body.to_string())
    }

    /// Queues a raw response body.
    #[must_use]
    pub fn respond_raw(mut self, status: u16, body: &str) -> Self {
        self.responses.push_back((status, body.to_string()));
        self
    }

    fn next_response(&mut self) -> (u16, String) {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap_or_else(not_found)
        } else {
            self.responses.front().cloned().unwrap_or_else(not_found)
        }
    }
}

fn not_found() -> (u16, String) {
    (404, "{}".to_string())
}

/// Local HTTP/1.1 server answering from [`MockRoute`]s.
///
/// Every response closes the connection. The server stops when dropped.
#[derive(Debug)]
pub struct MockHttpServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl MockHttpServer {
    /// Binds to an ephemeral port and starts serving.
    pub async fn start(routes: Vec<MockRoute>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let routes = Arc::new(Mutex::new(routes));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, &routes, &requests).await {
                            tracing::debug!(error = %e, "Mock HTTP connection failed");
                        }
                    });
                }
            })
        };

        Ok(Self {
            base_url,
            requests,
            handle,
        })
    }

    /// Base URL, e.g. `http://127.0.0.1:4567`.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests for a method and path.
    #[must_use]
    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .count()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn serve(
    mut stream: TcpStream,
    routes: &Mutex<Vec<MockRoute>>,
    requests: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).into_owned();

    let request = RecordedRequest {
        method,
        target,
        headers,
        body,
    };
    let (status, payload) = routes
        .lock()
        .iter_mut()
        .find(|route| route.method == request.method && route.path == request.path())
        .map_or_else(not_found, MockRoute::next_response);
    requests.lock().push(request);

    let response = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
        reason(status),
        payload.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

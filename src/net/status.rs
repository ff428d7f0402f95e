#![cfg(feature = "net")]

//! Read-only HTTP/JSON view of the daemon's persisted state.
//!
//! Every request reopens the store file so answers always reflect what the
//! orchestrator last wrote.

use crate::signup::SignupRecord;
use crate::storage::{FileStore, Storage, StorageError};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Status service settings.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Store file written by the daemon.
    pub store_path: PathBuf,
    /// Read timeout for a single request.
    pub request_timeout: Duration,
}

impl StatusConfig {
    /// Builds a config with the default request timeout.
    pub fn new(listen: SocketAddr, store_path: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            store_path: store_path.into(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct SignupView<'a> {
    survey_id: &'a str,
    survey_name: &'a str,
    state: &'static str,
    client_public_key: &'a str,
    delegate_public_key: Option<&'a str>,
    group_size: Option<usize>,
    is_delegate: bool,
    result_pending: bool,
}

impl<'a> From<&'a SignupRecord> for SignupView<'a> {
    fn from(record: &'a SignupRecord) -> Self {
        Self {
            survey_id: record.survey_id(),
            survey_name: &record.survey.name,
            state: record.state.as_str(),
            client_public_key: &record.client_public_key,
            delegate_public_key: record.delegate_public_key.as_deref(),
            group_size: record.group_size,
            is_delegate: record.is_delegate(),
            result_pending: record.pending_result.is_some(),
        }
    }
}

/// Serves status requests until the listener fails.
pub async fn run_status_server(cfg: StatusConfig) -> io::Result<()> {
    let listener = TcpListener::bind(cfg.listen).await?;
    info!(addr = %cfg.listen, store = %cfg.store_path.display(), "status service listening");
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let cfg = cfg.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&mut stream, &cfg).await {
                debug!(%peer, %err, "status connection error");
            }
        });
    }
}

async fn handle_connection(stream: &mut TcpStream, cfg: &StatusConfig) -> io::Result<()> {
    let (status, body) = match read_http_request(stream, MAX_HEADER_BYTES, cfg.request_timeout).await {
        Ok(req) => {
            debug!(method = %req.method, path = %req.path, agent = ?req.headers.get("user-agent"), "status request");
            route(&req.method, &req.path, &cfg.store_path)
        }
        Err(err) => (
            "400 Bad Request",
            json!({ "error": format!("bad request: {err}") }),
        ),
    };
    let resp = build_json_response(status, &body.to_string());
    stream.write_all(&resp).await?;
    stream.shutdown().await
}

fn route(method: &str, target: &str, store_path: &Path) -> (&'static str, Value) {
    if !method.eq_ignore_ascii_case("GET") {
        return (
            "405 Method Not Allowed",
            json!({ "error": "only GET is supported" }),
        );
    }
    let path = target.split('?').next().unwrap_or("");
    let path = path.trim_end_matches('/');

    if path == "/healthz" {
        return ("200 OK", json!({ "status": "ok" }));
    }
    let store = match FileStore::open(store_path) {
        Ok(store) => store,
        Err(err) => return storage_failure(err),
    };
    let outcome = match path {
        "/signups" => store.list_signup_records().map(|records| {
            let views: Vec<SignupView<'_>> = records.iter().map(SignupView::from).collect();
            json!(views)
        }),
        "/responses" => store.list_survey_responses().map(|responses| json!(responses)),
        _ => match path.strip_prefix("/data-points/") {
            Some(key) if !key.is_empty() && !key.contains('/') => store
                .list_data_points(key)
                .map(|values| json!({ "key": key, "values": values })),
            _ => return ("404 Not Found", json!({ "error": "unknown path" })),
        },
    };
    match outcome {
        Ok(value) => ("200 OK", value),
        Err(err) => storage_failure(err),
    }
}

fn storage_failure(err: StorageError) -> (&'static str, Value) {
    warn!(%err, "status query failed");
    (
        "500 Internal Server Error",
        json!({ "error": err.to_string() }),
    )
}

async fn read_http_request(
    stream: &mut TcpStream,
    max_header_bytes: usize,
    timeout: Duration,
) -> io::Result<HttpRequest> {
    let mut buf = Vec::new();
    let mut header_end = None;
    loop {
        let mut tmp = [0u8; 1024];
        let n = time::timeout(timeout, stream.read(&mut tmp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            header_end = Some(pos);
            break;
        }
        if buf.len() > max_header_bytes {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header too large"));
        }
    }
    let end = header_end
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "malformed request"))?;
    parse_request_head(&buf[..end])
}

fn parse_request_head(head: &[u8]) -> io::Result<HttpRequest> {
    let text = str::from_utf8(head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid header"))?;
    let mut lines = text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method.to_string(), path.to_string()),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed request line",
            ))
        }
    };
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Ok(HttpRequest {
        method,
        path,
        headers,
    })
}

fn build_json_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::PlainSurveyResponse;
    use crate::survey::Survey;
    use std::fs;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn seeded_store() -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("cohort_status_{nanos}"));
        let path = dir.join("store.json");
        let mut store = FileStore::open(&path).unwrap();
        store.add_data_point("age", "31").unwrap();
        store.add_data_point("age", "45").unwrap();
        store
            .add_signup_record(SignupRecord::new(
                Arc::new(Survey::new("s1", "Ages").with_commissioner("KDE")),
                "client-1",
            ))
            .unwrap();
        store
            .add_survey_response(&PlainSurveyResponse::new("s1"))
            .unwrap();
        path
    }

    #[test]
    fn serves_persisted_state() {
        let path = seeded_store();

        let (status, body) = route("GET", "/signups", &path);
        assert_eq!(status, "200 OK");
        assert_eq!(body[0]["survey_id"], "s1");
        assert_eq!(body[0]["state"], "initial");
        assert_eq!(body[0]["is_delegate"], false);

        let (_, body) = route("GET", "/data-points/age?fresh=1", &path);
        assert_eq!(body["values"], json!(["31", "45"]));

        let (_, body) = route("GET", "/responses/", &path);
        assert_eq!(body[0]["response"]["survey_id"], "s1");

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn rejects_writes_and_unknown_paths() {
        let path = std::env::temp_dir().join("cohort_status_absent/store.json");
        assert_eq!(route("POST", "/signups", &path).0, "405 Method Not Allowed");
        assert_eq!(route("GET", "/keys", &path).0, "404 Not Found");
        assert_eq!(route("GET", "/data-points/", &path).0, "404 Not Found");
        assert_eq!(route("GET", "/healthz", &path).0, "200 OK");
        let (status, body) = route("GET", "/signups", &path);
        assert_eq!(status, "200 OK");
        assert_eq!(body, json!([]));
    }

    #[test]
    fn parses_request_head() {
        let req =
            parse_request_head(b"GET /signups HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl")
                .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/signups");
        assert_eq!(req.headers.get("host").map(String::as_str), Some("localhost"));
        assert!(parse_request_head(b"GET\r\n").is_err());
    }

    #[test]
    fn response_carries_content_length() {
        let resp = String::from_utf8(build_json_response("200 OK", "{}")).unwrap();
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("Content-Length: 2\r\n"));
        assert!(resp.ends_with("\r\n\r\n{}"));
    }
}

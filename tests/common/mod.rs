//! Shared test infrastructure for integration tests
//!
//! Provides a mock S3 backend running in-process, a TestProxy wrapper that
//! spawns the real s3gate binary against it, and SigV4 helpers for callers.

#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::Utc;
use parking_lot::Mutex;
use s3gate::sigv4::{self, AuthCarrier, CredentialScope, InboundRequest, SigningParams, SigningRequest};
use s3gate::tokens::DirTokenStore;
use std::collections::HashMap;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

pub const BACKEND_KEY: &str = "BACKENDKEY";
pub const BACKEND_SECRET: &str = "backend-secret";

pub const ADMIN_KEY: &str = "ADMINKEY";
pub const ADMIN_SECRET: &str = "admin-secret";
pub const VIEWER_KEY: &str = "VIEWERKEY";
pub const VIEWER_SECRET: &str = "viewer-secret";

/// One request as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    /// Raw (encoded) path, bucket included.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct BackendState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Path-style S3 stand-in. Objects are keyed by decoded `/bucket/key`.
/// Requests must carry a valid signature made with the backend credentials.
pub struct MockBackend {
    pub port: u16,
    state: Arc<BackendState>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(BackendState::default());

        let app = Router::new()
            .fallback(mock_handler)
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { port, state }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn put(&self, path: &str, body: &[u8]) {
        self.state.objects.lock().insert(path.to_string(), body.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.objects.lock().get(path).cloned()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests().pop().expect("backend saw no request")
    }
}

fn backend_signature_ok(request: &RecordedRequest) -> bool {
    let query = sigv4::decode_query(request.query.as_deref().unwrap_or(""));
    let Ok(Some(carrier)) = AuthCarrier::from_request(&request.headers, &query) else {
        return false;
    };
    if carrier.parsed().access_key_id != BACKEND_KEY {
        return false;
    }
    let inbound = InboundRequest {
        method: request.method.as_str(),
        raw_path: &request.path,
        raw_query: request.query.as_deref(),
        headers: &request.headers,
    };
    match sigv4::expected_signature(&carrier, &inbound, BACKEND_SECRET) {
        Ok(expected) => sigv4::signatures_match(&expected, &carrier.parsed().signature),
        Err(_) => false,
    }
}

async fn mock_handler(State(state): State<Arc<BackendState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
    let recorded = RecordedRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers.clone(),
        body: body.to_vec(),
    };
    state.requests.lock().push(recorded.clone());

    if !backend_signature_ok(&recorded) {
        return (
            StatusCode::FORBIDDEN,
            "<Error><Code>SignatureDoesNotMatch</Code></Error>",
        )
            .into_response();
    }

    let key = sigv4::percent_decode(&recorded.path);
    match parts.method {
        Method::GET | Method::HEAD => match state.objects.lock().get(&key) {
            Some(data) => {
                let mut response = Response::new(Body::from(data.clone()));
                response
                    .headers_mut()
                    .insert("etag", "\"mock-etag\"".parse().unwrap());
                response
            }
            None => (
                StatusCode::NOT_FOUND,
                "<Error><Code>NoSuchKey</Code></Error>",
            )
                .into_response(),
        },
        Method::PUT => {
            state.objects.lock().insert(key, body.to_vec());
            StatusCode::OK.into_response()
        }
        Method::DELETE => {
            state.objects.lock().remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Test server wrapper that spawns a real s3gate binary
pub struct TestProxy {
    process: Child,
    pub port: u16,
    pub dir: TempDir,
}

impl TestProxy {
    /// S3 mode with an admin (grant-all) and a viewer (read on `photos`).
    pub async fn s3_mode(backend: &MockBackend) -> Self {
        let config = format!(
            r#"
mode = "s3"

[clients.{ADMIN_KEY}]
secret_access_key = "{ADMIN_SECRET}"
grant_all = true

[clients.{VIEWER_KEY}]
secret_access_key = "{VIEWER_SECRET}"
buckets = {{ photos = "r" }}
"#
        );
        Self::spawn(backend, &config, |_| String::new()).await
    }

    /// Web mode with a token directory inside the proxy's temp dir and an
    /// access log next to it. `anonymous` is an optional TOML table body.
    pub async fn web_mode(backend: &MockBackend, anonymous: Option<&str>) -> Self {
        let extra = anonymous
            .map(|body| format!("\n[anonymous]\n{}\n", body))
            .unwrap_or_default();
        Self::spawn(backend, "mode = \"web\"\n", |dir| {
            format!(
                "{}\n[tokens]\ntype = \"dir\"\npath = \"{}\"\n\n[access_log]\ntype = \"jsonl\"\npath = \"{}\"\n",
                extra,
                dir.path().join("tokens").display(),
                dir.path().join("access.jsonl").display()
            )
        })
        .await
    }

    async fn spawn(
        backend: &MockBackend,
        config_body: &str,
        extra: impl FnOnce(&TempDir) -> String,
    ) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = TempDir::new().expect("Failed to create temp dir");
        let extra = extra(&dir);

        let full_config = format!(
            "listen_addr = \"127.0.0.1:{port}\"\nhostname = \"127.0.0.1\"\nhost_id = \"host-test\"\n{config_body}\n{extra}\n\
             [backend]\ntarget = \"{}\"\naccess_key_id = \"{BACKEND_KEY}\"\nsecret_access_key = \"{BACKEND_SECRET}\"\npath_style = true\n",
            backend.url()
        );
        let config_path = dir.path().join("s3gate.toml");
        std::fs::write(&config_path, &full_config).expect("Failed to write test config");

        let process = Command::new(env!("CARGO_BIN_EXE_s3gate"))
            .arg("--config")
            .arg(&config_path)
            .env("RUST_LOG", "s3gate=warn")
            .spawn()
            .expect("Failed to start server");

        let mut proxy = Self { process, port, dir };
        proxy.wait_ready().await;
        proxy
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.host(), path_and_query)
    }

    pub fn token_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("tokens")
    }

    pub fn access_log(&self) -> Vec<serde_json::Value> {
        std::fs::read_to_string(self.dir.path().join("access.jsonl"))
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).expect("access log line is JSON"))
            .collect()
    }

    /// Store a raw token document where the proxy will look for it.
    pub fn write_token(&self, document: serde_json::Value) -> std::path::PathBuf {
        let token = document["token"].as_str().expect("token field").to_string();
        let store = DirTokenStore::open(self.token_dir()).expect("token dir");
        let path = store.token_path(&token);
        std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();
        path
    }

    /// Build a header-signed request the way an S3 client would.
    pub fn signed(
        &self,
        client: &reqwest::Client,
        method: Method,
        path: &str,
        access_key_id: &str,
        secret: &str,
        extra_headers: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        let amz_date = sigv4::format_amz_date(Utc::now());
        let mut headers: Vec<(String, String)> = extra_headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        headers.push((sigv4::X_AMZ_CONTENT_SHA256.into(), sigv4::UNSIGNED_PAYLOAD.into()));
        headers.push((sigv4::X_AMZ_DATE.into(), amz_date.clone()));

        let (raw_path, raw_query) = path.split_once('?').unwrap_or((path, ""));
        let query = sigv4::decode_query(raw_query);
        let host = self.host();
        let request = SigningRequest {
            method: method.as_str(),
            host: &host,
            path: &sigv4::percent_decode(raw_path),
            query: &query,
            headers: &headers,
            payload_hash: sigv4::UNSIGNED_PAYLOAD,
        };
        let params = SigningParams {
            access_key_id,
            secret_access_key: secret,
            scope: CredentialScope::new(&amz_date, "us-east-1", "s3"),
            amz_date: &amz_date,
        };
        let authorization = sigv4::authorization_header(&request, &params);

        let mut builder = client
            .request(method, self.url(path))
            .header("authorization", authorization);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    /// Presigned URL for `path`, valid for `expires` seconds.
    pub fn presigned_url(&self, method: &Method, path: &str, access_key_id: &str, secret: &str, expires: u64) -> String {
        let amz_date = sigv4::format_amz_date(Utc::now());
        let host = self.host();
        let request = SigningRequest {
            method: method.as_str(),
            host: &host,
            path: &sigv4::percent_decode(path),
            query: &[],
            headers: &[],
            payload_hash: sigv4::UNSIGNED_PAYLOAD,
        };
        let params = SigningParams {
            access_key_id,
            secret_access_key: secret,
            scope: CredentialScope::new(&amz_date, "us-east-1", "s3"),
            amz_date: &amz_date,
        };
        let query = sigv4::presigned_query(&request, &params, expires);
        self.url(&format!("{}?{}", path, sigv4::encode_query(&query)))
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

pub fn error_header(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(s3gate::api::ERROR_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

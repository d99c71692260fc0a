//! Mock HTTP server for end-to-end engine tests.
//!
//! | Route | Response |
//! |-------|----------|
//! | `/json` | `200`, `{"ok":true}`, `X-Test: 1` |
//! | `/cookies` | `200`, two `Set-Cookie` headers |
//! | `/empty` | `200`, `Content-Length: 0` |
//! | `/binary` | `200`, body containing a NUL byte |
//! | `/delay/{ms}` | `200` after sleeping `ms` milliseconds (any method) |
//! | `/echo` | `200`, JSON with the request method, body and `Content-Length` (any method) |
//! | `/headers` | `200`, JSON array of the request's `[name, value]` pairs (any method) |
//! | `/redirect` | `302` to `/json` |
//! | `/status/{code}` | `code` (any method) |

use axum::body::Body;
use axum::extract::Path;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

/// The mock application.
pub fn app() -> Router {
    Router::new()
        .route("/json", get(json_ok))
        .route("/cookies", get(cookies))
        .route("/empty", get(empty))
        .route("/binary", get(binary))
        .route("/delay/{ms}", any(delay))
        .route("/echo", any(echo))
        .route("/headers", any(request_headers))
        .route("/redirect", get(redirect))
        .route("/status/{code}", any(status))
}

/// A mock server running on its own thread and runtime.
///
/// The server lives until the process exits.
#[derive(Debug, Clone, Copy)]
pub struct MockServer {
    addr: SocketAddr,
}

impl MockServer {
    /// Bind to an ephemeral port on 127.0.0.1 and start serving.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener or the runtime cannot be created.
    pub fn start() -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = std_listener.local_addr()?;
        std_listener.set_nonblocking(true)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        thread::spawn(move || {
            runtime.block_on(async {
                let listener = tokio::net::TcpListener::from_std(std_listener)?;
                axum::serve(listener, app()).await
            })
        });

        Ok(Self { addr })
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn json_ok() -> impl IntoResponse {
    ([("X-Test", "1")], Json(json!({ "ok": true })))
}

async fn cookies() -> Response {
    Response::builder()
        .header(SET_COOKIE, "a=1; Path=/")
        .header(SET_COOKIE, "b=2; Path=/")
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from("cookies"))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn empty() -> Response {
    Response::builder()
        .header(CONTENT_LENGTH, "0")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn binary() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "application/octet-stream")],
        b"nul\0byte".to_vec(),
    )
}

async fn delay(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "late"
}

async fn echo(method: Method, headers: HeaderMap, body: String) -> Json<Value> {
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Json(json!({
        "method": method.as_str(),
        "body": body,
        "content_length": content_length,
    }))
}

async fn request_headers(headers: HeaderMap) -> Json<Value> {
    let pairs: Vec<Value> = headers
        .iter()
        .map(|(name, value)| json!([name.as_str(), value.to_str().unwrap_or_default()]))
        .collect();
    Json(Value::Array(pairs))
}

async fn redirect() -> impl IntoResponse {
    (StatusCode::FOUND, [(LOCATION, "/json")])
}

async fn status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (status, "status").into_response()
}

//! Local HTTP server used by the unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;

pub(crate) struct TestServer {
    addr: SocketAddr,
    // Owns the server task; dropped with the server.
    _rt: tokio::runtime::Runtime,
}

impl TestServer {
    pub(crate) fn start() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let listener = rt.block_on(tokio::net::TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        rt.spawn(async move {
            let _ = axum::serve(listener, app()).await;
        });
        Self { addr, _rt: rt }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn app() -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/text/{text}", any(text))
        .route("/status/{code}", any(status))
        .route("/redirect/{n}", any(redirect))
        .route("/temporary", any(temporary))
        .route("/redirect-to", any(redirect_to))
        .route("/set-cookie/{name}/{value}", get(set_cookie))
        .route("/delay/{ms}/{text}", get(delay))
        .route("/slow", get(slow))
}

/// Reflects the request back as JSON; header names are lowercase.
async fn echo(method: Method, headers: HeaderMap, body: String) -> Json<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (name, value) in &headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(serde_json::Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                map.insert(name.as_str().to_string(), serde_json::Value::String(value));
            }
        }
    }
    Json(json!({ "method": method.as_str(), "headers": map, "body": body }))
}

async fn text(Path(text): Path<String>) -> String {
    text
}

async fn status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, format!("status {}", code)).into_response()
}

async fn redirect(Path(n): Path<u32>) -> Response {
    if n == 0 {
        return "done".into_response();
    }
    (StatusCode::FOUND, [(header::LOCATION, format!("/redirect/{}", n - 1))]).into_response()
}

async fn temporary() -> Response {
    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, "/echo")]).into_response()
}

/// 302 to the absolute URL in `?url=`.
async fn redirect_to(Query(query): Query<HashMap<String, String>>) -> Response {
    match query.get("url") {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn set_cookie(Path((name, value)): Path<(String, String)>) -> Response {
    ([(header::SET_COOKIE, format!("{}={}; Path=/", name, value))], "ok").into_response()
}

async fn delay(Path((ms, text)): Path<(u64, String)>) -> String {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    text
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "slow"
}

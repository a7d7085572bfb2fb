//! Path routing: `/<prefix>/<hook-id>` lookup against the current hook
//! registry snapshot, then handoff to the dispatcher.

use crate::dispatcher::{self, IncomingRequest};
use crate::hook::HookRegistry;
use arc_swap::ArcSwap;
use hyper::{body, Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct AppState {
    pub registry: Arc<ArcSwap<HookRegistry>>,
    pub url_prefix: String,
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("no such hook"))
        .expect("static status/body always build")
}

fn method_not_allowed() -> Response<Body> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .body(Body::from("method not allowed for this hook"))
        .expect("static status/body always build")
}

fn bad_request(message: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::from(message))
        .expect("static status/body always build")
}

/// Splits `/<prefix>/<hook-id>` into its two segments, rejecting anything
/// with extra path components.
fn parse_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let trimmed = path.trim_start_matches('/');
    let (first, rest) = trimmed.split_once('/')?;
    if first != prefix || rest.is_empty() {
        return None;
    }
    Some(rest)
}

pub async fn handle(
    req: Request<Body>,
    remote_addr: SocketAddr,
    state: &AppState,
    request_id: String,
) -> Result<Response<Body>, Infallible> {
    let hook_id = match parse_path(req.uri().path(), &state.url_prefix) {
        Some(id) => id.to_string(),
        None => return Ok(not_found()),
    };

    // `load_full` takes an owned `Arc` snapshot rather than a `Guard`, which
    // would otherwise pin the registry's generation for the lifetime of this
    // future across the `.await` points below.
    let registry = state.registry.load_full();
    let hook = match registry.find(&hook_id) {
        Some(h) => h,
        None => return Ok(not_found()),
    };

    if !hook.method_allowed(req.method()) {
        return Ok(method_not_allowed());
    }

    let (parts, body) = req.into_parts();
    let content_type = parts
        .headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let query = parts.uri.query().map(str::to_string);

    let body_bytes = match body::to_bytes(body).await {
        Ok(b) => b,
        Err(_) => return Ok(bad_request("failed to read request body")),
    };

    let incoming = IncomingRequest {
        method: parts.method,
        content_type,
        headers: parts.headers,
        query,
        body: body_bytes,
        remote_addr,
        request_id,
    };

    Ok(dispatcher::dispatch(hook, incoming).await)
}

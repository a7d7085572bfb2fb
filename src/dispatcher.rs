//! The per-request controller: parse, evaluate the trigger rule, marshal
//! command inputs, spawn, stream or capture output, clean up.

use crate::error::HookError;
use crate::hook::Hook;
use crate::payload;
use crate::request::Request;
use crate::rule;
use crate::tempfile_guard::TempFileGuard;
use crate::value;
use bytes::Bytes;
use hyper::{Body, HeaderMap, Method, Response, StatusCode};
use serde_json::Value;
use std::net::SocketAddr;
use std::process::Stdio;
use tokio::process::Command;

pub struct IncomingRequest {
    pub method: Method,
    pub content_type: Option<String>,
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
    pub remote_addr: SocketAddr,
    pub request_id: String,
}

fn base_content_type(ct: &str) -> &str {
    ct.split(';').next().unwrap_or("").trim()
}

fn parse_payload(content_type: &str, body: &[u8]) -> Result<Value, HookError> {
    let base = base_content_type(content_type);
    if base.eq_ignore_ascii_case("application/json") {
        payload::parse_json(body)
    } else if base.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
        payload::parse_form(body)
    } else if base.to_ascii_lowercase().contains("xml") {
        payload::parse_xml(body)
    } else {
        payload::parse_raw(body)
    }
}

/// Builds the `Request` record and runs JSON-string-parameter
/// preprocessing. Parse errors are logged and tolerated: evaluation
/// continues with an empty payload map.
fn build_request(hook: &Hook, incoming: &IncomingRequest) -> Request {
    let effective_content_type = hook
        .incoming_payload_content_type
        .clone()
        .unwrap_or_else(|| incoming.content_type.clone().unwrap_or_default());

    let payload_value = match parse_payload(&effective_content_type, &incoming.body) {
        Ok(v) => v,
        Err(e) => {
            log::warn!(
                "[{}] payload parse failed, continuing with empty payload: {e}",
                incoming.request_id
            );
            Value::Object(serde_json::Map::new())
        }
    };

    let mut request = Request::new(
        incoming.request_id.clone(),
        incoming.method.clone(),
        effective_content_type,
        incoming.body.clone(),
        payload::headers_to_value(&incoming.headers),
        payload::query_to_value(incoming.query.as_deref()),
        payload_value,
        incoming.remote_addr,
        hook.trigger_signature_soft_failures,
    );

    preprocess_json_string_parameters(hook, &mut request);
    request
}

fn preprocess_json_string_parameters(hook: &Hook, request: &mut Request) {
    for arg in &hook.json_string_parameters {
        let raw = match arg.resolve(request, &hook.templates) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("[{}] json-string-parameter '{}' unresolved: {e}", request.id, arg.name);
                continue;
            }
        };
        let decoded: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[{}] json-string-parameter '{}' invalid json: {e}", request.id, arg.name);
                continue;
            }
        };
        let target = match arg.source {
            crate::argument::Source::Header => &mut request.headers,
            crate::argument::Source::Query => &mut request.query,
            crate::argument::Source::Payload => &mut request.payload,
            _ => continue,
        };
        if !value::replace(&arg.name, target, decoded) {
            log::warn!("[{}] json-string-parameter '{}' path not found", request.id, arg.name);
        }
    }
}

fn mismatch_response(hook: &Hook) -> Response<Body> {
    let code = StatusCode::from_u16(hook.trigger_rule_mismatch_http_response_code)
        .unwrap_or(StatusCode::OK);
    apply_response_headers(Response::builder().status(code), hook)
        .body(Body::from(crate::hook::DEFAULT_MISMATCH_BODY))
        .expect("static status/body always build")
}

fn bad_request(message: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::from(message))
        .expect("static status/body always build")
}

fn apply_response_headers(
    mut builder: hyper::http::response::Builder,
    hook: &Hook,
) -> hyper::http::response::Builder {
    for (name, value) in &hook.response_headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

pub async fn dispatch(hook: &Hook, incoming: IncomingRequest) -> Response<Body> {
    let request = build_request(hook, &incoming);

    match &hook.trigger_rule {
        None => {}
        Some(rule) => match rule::evaluate(rule, &request, &hook.templates) {
            Ok(true) => {}
            Ok(false) => return mismatch_response(hook),
            Err(e) if e.is_signature() => {
                log::info!("[{}] signature check failed: {e}", request.id);
                return bad_request("Signature verification failed.");
            }
            Err(e) => {
                // Any other rule evaluation error (e.g. a parameter the
                // request doesn't carry) outside an `or` that could have
                // swallowed it is treated the same as the rule simply not
                // firing, per the failure semantics in SPEC_FULL.md §4.7.
                log::warn!("[{}] trigger rule evaluation error: {e}", request.id);
                return mismatch_response(hook);
            }
        },
    }

    run_command(hook, &request).await
}

async fn run_command(hook: &Hook, request: &Request) -> Response<Body> {
    let mut temp_files = TempFileGuard::new();
    let temp_dir = std::env::temp_dir();

    let mut args = Vec::with_capacity(hook.pass_arguments_to_command.len());
    for arg in &hook.pass_arguments_to_command {
        match arg.resolve(request, &hook.templates) {
            Ok(v) => args.push(v),
            Err(e) => {
                log::warn!("[{}] argument '{}' unresolved, using empty string: {e}", request.id, arg.name);
                args.push(String::new());
            }
        }
    }

    let mut envs: Vec<(String, String)> = Vec::new();
    for arg in &hook.pass_environment_to_command {
        match arg.resolve(request, &hook.templates) {
            Ok(v) => envs.push((arg.env_var_name(), v)),
            Err(e) => {
                log::warn!("[{}] environment argument '{}' unresolved: {e}", request.id, arg.name);
                envs.push((arg.env_var_name(), String::new()));
            }
        }
    }

    for arg in &hook.pass_file_to_command {
        let contents = match arg.resolve(request, &hook.templates) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[{}] file argument '{}' unresolved: {e}", request.id, arg.name);
                continue;
            }
        };
        let env_name = arg
            .env_name
            .clone()
            .unwrap_or_else(|| format!("HOOK_{}", arg.name.to_uppercase()));
        match temp_files.write(&temp_dir, &format!("hookrelay-{}", hook.id), contents.as_bytes()) {
            Ok(path) => envs.push((env_name, path.display().to_string())),
            Err(e) => log::warn!("[{}] failed to write temp file for '{}': {e}", request.id, arg.name),
        }
    }

    let mut command = Command::new(&hook.execute_command);
    command.args(&args);
    command.envs(envs);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = &hook.command_working_directory {
        command.current_dir(dir);
    }
    command.kill_on_drop(true);
    apply_run_as_user(&mut command, hook);

    if hook.stream_command_output {
        return stream_response(hook, command, request, temp_files).await;
    }

    match command.output().await {
        Ok(output) => capture_response(hook, output),
        Err(e) => {
            log::error!("[{}] failed to spawn '{}': {e}", request.id, hook.execute_command);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("failed to execute hook command"))
                .expect("static status/body always build")
        }
    }
}

#[cfg(unix)]
fn apply_run_as_user(command: &mut Command, hook: &Hook) {
    if let Some((uid, gid)) = hook.run_as_user {
        command.uid(uid);
        if let Some(gid) = gid {
            command.gid(gid);
        }
    }
}

#[cfg(not(unix))]
fn apply_run_as_user(_command: &mut Command, _hook: &Hook) {}

/// Grace period between a terminate signal and a hard kill for a streaming
/// hook whose client has disconnected.
const TERMINATE_GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(2);

#[cfg(unix)]
async fn terminate_then_kill(child: &mut tokio::process::Child, request_id: &str, hook_id: &str) {
    if let Some(pid) = child.id() {
        // SAFETY: pid is the child's own pid as reported by tokio; SIGTERM is
        // a request the process can ignore, no memory is touched.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(TERMINATE_GRACE_PERIOD, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            log::warn!(
                "[{request_id}] hook '{hook_id}' still running {TERMINATE_GRACE_PERIOD:?} after SIGTERM, killing"
            );
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_then_kill(child: &mut tokio::process::Child, _request_id: &str, _hook_id: &str) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn capture_response(hook: &Hook, output: std::process::Output) -> Response<Body> {
    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);

    let (status, body): (StatusCode, Vec<u8>) = if output.status.success() {
        let status = StatusCode::from_u16(hook.success_http_response_code).unwrap_or(StatusCode::OK);
        if hook.capture_command_output {
            (status, combined)
        } else {
            (status, hook.response_message.clone().into_bytes())
        }
    } else if hook.capture_command_output_on_error {
        (StatusCode::INTERNAL_SERVER_ERROR, combined)
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            b"command execution failed".to_vec(),
        )
    };

    apply_response_headers(Response::builder().status(status), hook)
        .body(Body::from(body))
        .expect("static status/body always build")
}

async fn stream_response(
    hook: &Hook,
    mut command: Command,
    request: &Request,
    temp_files: TempFileGuard,
) -> Response<Body> {
    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            log::error!("[{}] failed to spawn '{}': {e}", request.id, hook.execute_command);
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("failed to execute hook command"))
                .expect("static status/body always build");
        }
    };

    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");
    let (mut sender, body) = Body::channel();
    let request_id = request.id.clone();
    let hook_id = hook.id.clone();

    tokio::spawn(async move {
        // Keep the temp files (passFileToCommand) alive until the child has
        // finished reading them; they would otherwise be unlinked as soon as
        // this function returns its (already-committed) streaming response.
        let _temp_files = temp_files;
        let mut buf = [0u8; 8192];
        let mut client_gone = false;
        loop {
            match tokio::io::AsyncReadExt::read(&mut stdout, &mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sender.send_data(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        // The client hung up mid-stream. Terminate the child rather
                        // than let it keep running with nothing left to consume its
                        // output: a graceful signal first, then a hard kill if it's
                        // still alive after a short grace period.
                        client_gone = true;
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("[{request_id}] error reading stdout for hook '{hook_id}': {e}");
                    break;
                }
            }
        }
        if client_gone {
            terminate_then_kill(&mut child, &request_id, &hook_id).await;
        }
        // Drain and log stderr; streaming responses have already committed
        // their status, so a non-zero exit cannot change it.
        let mut stderr_buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut stderr_buf).await;
        if !stderr_buf.is_empty() {
            log::warn!(
                "[{request_id}] hook '{hook_id}' wrote to stderr: {}",
                String::from_utf8_lossy(&stderr_buf)
            );
        }
        match child.wait().await {
            Ok(status) if !status.success() => {
                log::warn!("[{request_id}] hook '{hook_id}' exited with {status}");
            }
            Err(e) => log::warn!("[{request_id}] failed to wait on hook '{hook_id}': {e}"),
            _ => {}
        }
    });

    let status = StatusCode::from_u16(hook.success_http_response_code).unwrap_or(StatusCode::OK);
    apply_response_headers(Response::builder().status(status), hook)
        .body(body)
        .expect("static status/body always build")
}

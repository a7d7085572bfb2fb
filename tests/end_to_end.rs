//! End-to-end dispatcher scenarios mirroring the literal cases in
//! SPEC_FULL.md §8: a signed push-style webhook, a form-encoded success
//! response, an unmatched trigger rule, capture-on-error, an unknown hook
//! id, and an IP allow-list denial.

use hmac::{Hmac, Mac};
use hookrelay::dispatcher::{self, IncomingRequest};
use hookrelay::hook;
use hyper::{body, HeaderMap, Method};
use sha1::Sha1;
use std::net::SocketAddr;

fn write_hook_file(contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("hookrelay-e2e-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, contents).unwrap();
    path
}

fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (k, v) in pairs {
        headers.insert(
            hyper::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
            v.parse().unwrap(),
        );
    }
    headers
}

fn remote() -> SocketAddr {
    "203.0.113.9:4000".parse().unwrap()
}

async fn response_body(res: hyper::Response<hyper::Body>) -> (u16, String) {
    let status = res.status().as_u16();
    let bytes = body::to_bytes(res.into_body()).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn github_style_signed_push_fires_and_captures_output() {
    let secret = "supersecretsquirrel";
    let body = br#"{"head_commit":{"id":"1481a2de7b2a7d02428ad93446ab166be7793fbb"},"ref":"refs/heads/master"}"#;
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    let digest = hex::encode(mac.finalize().into_bytes());
    let signature_header = format!("sha1={digest}");

    let spec = format!(
        r#"[{{
            "id": "github",
            "execute-command": "/bin/echo",
            "pass-arguments-to-command": [
                {{"source": "payload", "name": "head_commit.id"}}
            ],
            "include-command-output-in-response": true,
            "trigger-rule": {{
                "check-signature": {{
                    "algorithm": "sha1",
                    "secret": "{secret}",
                    "signature": {{"source": "header", "name": "X-Hub-Signature"}}
                }}
            }}
        }}]"#
    );
    let path = write_hook_file(&spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("github").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/json".to_string()),
        headers: header_map(&[("X-Hub-Signature", &signature_header)]),
        query: None,
        body: bytes::Bytes::from_static(body),
        remote_addr: remote(),
        request_id: "t-github".to_string(),
    };

    let (status, text) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 200);
    assert_eq!(text.trim_end(), "1481a2de7b2a7d02428ad93446ab166be7793fbb");
}

#[tokio::test]
async fn mismatched_signature_digest_is_a_plain_rule_mismatch() {
    // A well-formed but wrong digest is a boolean `false` from the rule
    // engine, not a `SignatureError` — it falls through to the ordinary
    // trigger-rule-mismatch response, per SPEC_FULL.md §4.4/§4.7.
    let spec = r#"[{
        "id": "github",
        "execute-command": "/bin/true",
        "trigger-rule": {
            "check-signature": {
                "algorithm": "sha1",
                "secret": "supersecretsquirrel",
                "signature": {"source": "header", "name": "X-Hub-Signature"}
            }
        }
    }]"#;
    let path = write_hook_file(spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("github").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/json".to_string()),
        headers: header_map(&[("X-Hub-Signature", "sha1=deadbeef")]),
        query: None,
        body: bytes::Bytes::from_static(b"{}"),
        remote_addr: remote(),
        request_id: "t-badsig".to_string(),
    };

    let (status, text) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 200);
    assert_eq!(text, hook::DEFAULT_MISMATCH_BODY);
}

#[tokio::test]
async fn empty_signature_header_is_a_signature_error() {
    // An empty claimed-signature value is a genuine `SignatureError`
    // (verify() refuses to compare against an empty header), which always
    // surfaces as a flat 400 rather than the configurable mismatch code.
    let spec = r#"[{
        "id": "github",
        "execute-command": "/bin/true",
        "trigger-rule": {
            "check-signature": {
                "algorithm": "sha1",
                "secret": "supersecretsquirrel",
                "signature": {"source": "header", "name": "X-Hub-Signature"}
            }
        }
    }]"#;
    let path = write_hook_file(spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("github").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/json".to_string()),
        headers: header_map(&[("X-Hub-Signature", "")]),
        query: None,
        body: bytes::Bytes::from_static(b"{}"),
        remote_addr: remote(),
        request_id: "t-emptysig".to_string(),
    };

    let (status, _) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn form_encoded_hook_returns_configured_response_message() {
    let spec = r#"[{
        "id": "bitbucket",
        "execute-command": "/bin/true",
        "response-message": "success"
    }]"#;
    let path = write_hook_file(spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("bitbucket").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/x-www-form-urlencoded".to_string()),
        headers: HeaderMap::new(),
        query: None,
        body: bytes::Bytes::from_static(b"payload=%7B%22user%22%3A%22marcus%22%7D"),
        remote_addr: remote(),
        request_id: "t-form".to_string(),
    };

    let (status, text) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 200);
    assert_eq!(text, "success");
}

#[tokio::test]
async fn unsatisfied_trigger_rule_yields_configured_mismatch_response() {
    let spec = r#"[{
        "id": "github",
        "execute-command": "/bin/true",
        "trigger-rule-mismatch-http-response-code": 400,
        "trigger-rule": {
            "match": {
                "type": "value",
                "value": "refs/heads/master",
                "parameter": {"source": "payload", "name": "ref"}
            }
        }
    }]"#;
    let path = write_hook_file(spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("github").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/json".to_string()),
        headers: HeaderMap::new(),
        query: None,
        body: bytes::Bytes::from_static(b"{}"),
        remote_addr: remote(),
        request_id: "t-empty".to_string(),
    };

    let (status, text) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 400);
    assert_eq!(text, hook::DEFAULT_MISMATCH_BODY);
}

#[tokio::test]
async fn capture_on_error_returns_command_stdout_with_500() {
    let spec = r#"[{
        "id": "failing",
        "execute-command": "/bin/sh",
        "pass-arguments-to-command": [
            {"source": "string", "name": "-c"},
            {"source": "string", "name": "echo 'arg: exit=1'; exit 1"}
        ],
        "include-command-output-in-response-on-error": true
    }]"#;
    let path = write_hook_file(spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("failing").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/json".to_string()),
        headers: HeaderMap::new(),
        query: None,
        body: bytes::Bytes::new(),
        remote_addr: remote(),
        request_id: "t-fail".to_string(),
    };

    let (status, text) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 500);
    assert_eq!(text.trim_end(), "arg: exit=1");
}

#[tokio::test]
async fn ip_allowlist_denies_non_member_remote_address() {
    let spec = r#"[{
        "id": "restricted",
        "execute-command": "/bin/true",
        "trigger-rule": {
            "match": {
                "type": "ip-whitelist",
                "ip-range": "192.168.0.1/32"
            }
        }
    }]"#;
    let path = write_hook_file(spec);
    let registry = hook::load_from_file(&path, false, None).unwrap();
    std::fs::remove_file(&path).ok();
    let hook = registry.find("restricted").unwrap();

    let incoming = IncomingRequest {
        method: Method::POST,
        content_type: Some("application/json".to_string()),
        headers: HeaderMap::new(),
        query: None,
        body: bytes::Bytes::new(),
        remote_addr: "192.168.0.2:5555".parse().unwrap(),
        request_id: "t-ip".to_string(),
    };

    let (status, text) = response_body(dispatcher::dispatch(hook, incoming).await).await;
    assert_eq!(status, 200);
    assert_eq!(text, hook::DEFAULT_MISMATCH_BODY);
}

#[tokio::test]
async fn unknown_hook_id_is_not_found() {
    use hookrelay::router::{self, AppState};
    use arc_swap::ArcSwap;
    use std::sync::Arc;

    let state = AppState {
        registry: Arc::new(ArcSwap::from_pointee(hook::HookRegistry::new())),
        url_prefix: "hooks".to_string(),
    };

    let req = hyper::Request::builder()
        .method(Method::GET)
        .uri("/hooks/does-not-exist")
        .body(hyper::Body::empty())
        .unwrap();

    let res = router::handle(req, remote(), &state, "t-404".to_string())
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

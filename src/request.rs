//! The per-invocation request record. Immutable after parameter parsing
//! except for the in-place JSON-string-parameter preprocessing step.

use crate::payload::canonicalize_header_name;
use bytes::Bytes;
use hyper::Method;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub method: Method,
    pub content_type: String,
    pub body: Bytes,
    /// Object keyed by canonical header name -> first value.
    pub headers: Value,
    /// Object keyed by query parameter name -> first value.
    pub query: Value,
    /// Object; JSON array bodies are wrapped under the key `root`.
    pub payload: Value,
    pub remote_addr: SocketAddr,
    /// Mirrors the hook's `triggerSignatureSoftFailures`: when set, an
    /// `or` rule swallows signature errors from its children too.
    pub allow_signature_errors: bool,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        method: Method,
        content_type: String,
        body: Bytes,
        headers: Value,
        query: Value,
        payload: Value,
        remote_addr: SocketAddr,
        allow_signature_errors: bool,
    ) -> Self {
        Request {
            id,
            method,
            content_type,
            body,
            headers,
            query,
            payload,
            remote_addr,
            allow_signature_errors,
        }
    }

    pub fn get_header(&self, name: &str) -> Option<String> {
        let canonical = canonicalize_header_name(name);
        crate::value::get_as_string(&canonical, &self.headers)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn template_context(&self) -> TemplateContext<'_> {
        TemplateContext {
            id: &self.id,
            content_type: &self.content_type,
            body: self.body_text(),
            headers: &self.headers,
            query: &self.query,
            payload: &self.payload,
            method: self.method.as_str(),
            remote_addr: self.remote_addr.to_string(),
        }
    }
}

/// Fields exposed to user templates, mirroring §3's Argument lifecycle
/// context exactly: `{ID, ContentType, Body, Headers, Query, Payload,
/// Method, RemoteAddr}`. `BodyText()`/`GetHeader(name)` are exposed as the
/// `bodyText`/`getHeader` handlebars helpers instead of context methods.
#[derive(Serialize)]
pub struct TemplateContext<'a> {
    #[serde(rename = "ID")]
    pub id: &'a str,
    #[serde(rename = "ContentType")]
    pub content_type: &'a str,
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "Headers")]
    pub headers: &'a Value,
    #[serde(rename = "Query")]
    pub query: &'a Value,
    #[serde(rename = "Payload")]
    pub payload: &'a Value,
    #[serde(rename = "Method")]
    pub method: &'a str,
    #[serde(rename = "RemoteAddr")]
    pub remote_addr: String,
}

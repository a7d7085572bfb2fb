//! The argument resolver: turns an `Argument` descriptor plus a `Request`
//! into a single string value.

use crate::error::HookError;
use crate::request::Request;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Header,
    Query,
    Payload,
    Request,
    StringLiteral,
    RawRequestBody,
    EntirePayload,
    EntireQuery,
    EntireHeaders,
    Template,
}

impl Source {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "header" => Some(Source::Header),
            "url" | "query" => Some(Source::Query),
            "payload" => Some(Source::Payload),
            "request" => Some(Source::Request),
            "string" => Some(Source::StringLiteral),
            "raw-request-body" => Some(Source::RawRequestBody),
            "entire-payload" => Some(Source::EntirePayload),
            "entire-query" => Some(Source::EntireQuery),
            "entire-headers" => Some(Source::EntireHeaders),
            "template" => Some(Source::Template),
            _ => None,
        }
    }
}

/// Wire shape as it appears inside a hook file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArgumentSpec {
    pub source: String,
    pub name: String,
    #[serde(rename = "envName", default)]
    pub env_name: Option<String>,
    #[serde(rename = "base64Decode", default)]
    pub base64_decode: bool,
}

/// The loaded, resolvable descriptor. `template_key` is set at load time
/// when `source == template`, naming the entry this argument's text was
/// compiled under in the owning hook's template registry.
#[derive(Debug, Clone)]
pub struct Argument {
    pub source: Source,
    pub name: String,
    pub env_name: Option<String>,
    pub base64_decode: bool,
    pub template_key: Option<String>,
}

impl Argument {
    pub fn from_spec(spec: &ArgumentSpec) -> Result<Self, HookError> {
        let source = Source::from_str(&spec.source)
            .ok_or_else(|| HookError::Source(format!("unknown argument source '{}'", spec.source)))?;
        Ok(Argument {
            source,
            name: spec.name.clone(),
            env_name: spec.env_name.clone(),
            base64_decode: spec.base64_decode,
            template_key: None,
        })
    }

    /// The `HOOK_<name>` style environment variable name, honoring an
    /// explicit override.
    pub fn env_var_name(&self) -> String {
        match &self.env_name {
            Some(name) => name.clone(),
            None => format!("HOOK_{}", self.name),
        }
    }

    pub fn resolve(&self, request: &Request, templates: &Handlebars) -> Result<String, HookError> {
        let raw = self.resolve_raw(request, templates)?;
        if self.base64_decode {
            let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw.trim())
                .map_err(|e| HookError::Argument(format!("base64 decode failed for '{}': {e}", self.name)))?;
            Ok(String::from_utf8_lossy(&decoded).into_owned())
        } else {
            Ok(raw)
        }
    }

    fn resolve_raw(&self, request: &Request, templates: &Handlebars) -> Result<String, HookError> {
        match self.source {
            Source::Header => request
                .get_header(&self.name)
                .ok_or_else(|| missing(&self.name)),
            Source::Query => crate::value::get_as_string(&self.name, &request.query)
                .ok_or_else(|| missing(&self.name)),
            Source::Payload => crate::value::get_as_string(&self.name, &request.payload)
                .ok_or_else(|| missing(&self.name)),
            Source::StringLiteral => Ok(self.name.clone()),
            Source::RawRequestBody => Ok(String::from_utf8_lossy(&request.body).into_owned()),
            Source::Request => match self.name.to_ascii_lowercase().as_str() {
                "remote-addr" => Ok(request.remote_addr.to_string()),
                "method" => Ok(request.method.to_string()),
                other => Err(HookError::Argument(format!("unknown request field '{other}'"))),
            },
            Source::EntirePayload => serde_json::to_string(&request.payload)
                .map_err(|e| HookError::Argument(e.to_string())),
            Source::EntireQuery => serde_json::to_string(&request.query)
                .map_err(|e| HookError::Argument(e.to_string())),
            Source::EntireHeaders => serde_json::to_string(&request.headers)
                .map_err(|e| HookError::Argument(e.to_string())),
            Source::Template => {
                let key = self.template_key.as_ref().ok_or_else(|| {
                    HookError::Argument("template argument missing a compiled template".to_string())
                })?;
                let ctx = request.template_context();
                templates
                    .render(key, &ctx)
                    .map_err(|e| HookError::Argument(format!("template render failed: {e}")))
            }
        }
    }
}

fn missing(name: &str) -> HookError {
    HookError::ParameterNode(format!("no value for '{name}'"))
}

/// Registers the helpers templates in hook files rely on (`bodyText`,
/// `getHeader`) on a fresh registry. Each hook owns one of these.
pub fn new_template_registry() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("bodyText", Box::new(body_text_helper));
    hb.register_helper("getHeader", Box::new(get_header_helper));
    hb
}

fn body_text_helper(
    _h: &handlebars::Helper,
    _r: &Handlebars,
    ctx: &handlebars::Context,
    _rc: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    if let Some(body) = ctx.data().get("Body").and_then(|v| v.as_str()) {
        out.write(body)?;
    }
    Ok(())
}

fn get_header_helper(
    h: &handlebars::Helper,
    _r: &Handlebars,
    ctx: &handlebars::Context,
    _rc: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let name = h
        .param(0)
        .and_then(|p| p.value().as_str())
        .unwrap_or_default();
    if let Some(headers) = ctx.data().get("Headers") {
        if let Some(value) = crate::value::get_as_string(name, headers) {
            out.write(&value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use hyper::{Body, Method};
    use std::net::SocketAddr;

    fn sample_request() -> Request {
        Request::new(
            "req-1".to_string(),
            Method::POST,
            "application/json".to_string(),
            bytes::Bytes::from_static(b"hello"),
            serde_json::json!({"X-Hub-Signature": "abc"}),
            serde_json::json!({}),
            serde_json::json!({"name": "octocat"}),
            "127.0.0.1:1234".parse::<SocketAddr>().unwrap(),
            false,
        )
    }

    #[test]
    fn resolves_payload_source() {
        let req = sample_request();
        let templates = new_template_registry();
        let arg = Argument {
            source: Source::Payload,
            name: "name".to_string(),
            env_name: None,
            base64_decode: false,
            template_key: None,
        };
        assert_eq!(arg.resolve(&req, &templates).unwrap(), "octocat");
    }

    #[test]
    fn missing_payload_path_is_parameter_node_error() {
        let req = sample_request();
        let templates = new_template_registry();
        let arg = Argument {
            source: Source::Payload,
            name: "nope".to_string(),
            env_name: None,
            base64_decode: false,
            template_key: None,
        };
        assert!(matches!(
            arg.resolve(&req, &templates).unwrap_err(),
            HookError::ParameterNode(_)
        ));
    }

    #[test]
    fn base64_decode_applies_after_resolution() {
        let req = sample_request();
        let templates = new_template_registry();
        let arg = Argument {
            source: Source::StringLiteral,
            name: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "plain"),
            env_name: None,
            base64_decode: true,
            template_key: None,
        };
        assert_eq!(arg.resolve(&req, &templates).unwrap(), "plain");
    }

    #[test]
    fn template_source_renders_compiled_template() {
        let req = sample_request();
        let mut templates = new_template_registry();
        templates
            .register_template_string("t1", "{{Method}} {{Payload.name}}")
            .unwrap();
        let arg = Argument {
            source: Source::Template,
            name: "{{Method}} {{Payload.name}}".to_string(),
            env_name: None,
            base64_decode: false,
            template_key: Some("t1".to_string()),
        };
        assert_eq!(arg.resolve(&req, &templates).unwrap(), "POST octocat");
    }

    #[test]
    fn env_var_name_defaults_to_hook_prefixed_name() {
        let arg = Argument {
            source: Source::Payload,
            name: "head_commit.timestamp".to_string(),
            env_name: None,
            base64_decode: false,
            template_key: None,
        };
        assert_eq!(arg.env_var_name(), "HOOK_head_commit.timestamp");
    }
}

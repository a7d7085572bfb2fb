//! Hook definitions and the registry they're loaded into.

use crate::argument::{self, Argument, ArgumentSpec, Source};
use crate::error::HookError;
use crate::rule::{self, Rule, RuleSpec};
use handlebars::Handlebars;
use hyper::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_MISMATCH_BODY: &str = "Hook rules were not satisfied.";
pub const DEFAULT_RESPONSE_MESSAGE: &str = "Success";

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseHeaderSpec {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookSpec {
    pub id: String,
    #[serde(rename = "execute-command")]
    pub execute_command: String,
    #[serde(rename = "command-working-directory", default)]
    pub command_working_directory: Option<String>,
    #[serde(rename = "response-message", default)]
    pub response_message: Option<String>,
    #[serde(rename = "response-headers", default)]
    pub response_headers: Vec<ResponseHeaderSpec>,
    #[serde(rename = "include-command-output-in-response", default)]
    pub capture_command_output: bool,
    #[serde(rename = "include-command-output-in-response-on-error", default)]
    pub capture_command_output_on_error: bool,
    #[serde(rename = "pass-environment-to-command", default)]
    pub pass_environment_to_command: Vec<ArgumentSpec>,
    #[serde(rename = "pass-arguments-to-command", default)]
    pub pass_arguments_to_command: Vec<ArgumentSpec>,
    #[serde(rename = "pass-file-to-command", default)]
    pub pass_file_to_command: Vec<ArgumentSpec>,
    #[serde(rename = "parse-parameters-as-json", default)]
    pub json_string_parameters: Vec<ArgumentSpec>,
    #[serde(rename = "trigger-rule", default)]
    pub trigger_rule: Option<RuleSpec>,
    #[serde(rename = "trigger-rule-mismatch-http-response-code", default)]
    pub trigger_rule_mismatch_http_response_code: Option<u16>,
    #[serde(rename = "trigger-signature-soft-failures", default)]
    pub trigger_signature_soft_failures: bool,
    #[serde(rename = "incoming-payload-content-type", default)]
    pub incoming_payload_content_type: Option<String>,
    #[serde(rename = "success-http-response-code", default)]
    pub success_http_response_code: Option<u16>,
    #[serde(rename = "http-methods", default)]
    pub http_methods: Option<Vec<String>>,
    #[serde(rename = "stream-command-output", default)]
    pub stream_command_output: bool,
    #[serde(rename = "run-as-user", default)]
    pub run_as_user: Option<String>,
}

/// A loaded, ready-to-evaluate hook. Each hook owns its own template
/// registry so `Argument`s of `source == template` can be compiled once at
/// load time and rendered many times per request.
pub struct Hook {
    pub id: String,
    pub execute_command: String,
    pub command_working_directory: Option<String>,
    pub response_message: String,
    pub response_headers: Vec<(String, String)>,
    pub capture_command_output: bool,
    pub capture_command_output_on_error: bool,
    pub pass_environment_to_command: Vec<Argument>,
    pub pass_arguments_to_command: Vec<Argument>,
    pub pass_file_to_command: Vec<Argument>,
    pub json_string_parameters: Vec<Argument>,
    pub trigger_rule: Option<Rule>,
    pub trigger_rule_mismatch_http_response_code: u16,
    pub trigger_signature_soft_failures: bool,
    pub incoming_payload_content_type: Option<String>,
    pub success_http_response_code: u16,
    pub http_methods: Option<Vec<Method>>,
    pub stream_command_output: bool,
    pub run_as_user: Option<(u32, Option<u32>)>,
    pub templates: Arc<Handlebars<'static>>,
}

impl Hook {
    pub fn method_allowed(&self, method: &Method) -> bool {
        match &self.http_methods {
            None => true,
            Some(methods) => methods.contains(method),
        }
    }
}

fn parse_run_as_user(spec: &str) -> Result<(u32, Option<u32>), HookError> {
    match spec.split_once(':') {
        Some((uid, gid)) => {
            let uid: u32 = uid
                .parse()
                .map_err(|_| HookError::Config(format!("invalid run-as-user uid '{uid}'")))?;
            let gid: u32 = gid
                .parse()
                .map_err(|_| HookError::Config(format!("invalid run-as-user gid '{gid}'")))?;
            Ok((uid, Some(gid)))
        }
        None => {
            let uid: u32 = spec
                .parse()
                .map_err(|_| HookError::Config(format!("invalid run-as-user uid '{spec}'")))?;
            Ok((uid, None))
        }
    }
}

fn compile_argument(
    spec: &ArgumentSpec,
    templates: &mut Handlebars<'static>,
    counter: &mut usize,
) -> Result<Argument, HookError> {
    let mut arg = Argument::from_spec(spec)?;
    if arg.source == Source::Template {
        let key = format!("t{counter}");
        *counter += 1;
        templates
            .register_template_string(&key, &arg.name)
            .map_err(|e| HookError::Config(format!("bad template '{}': {e}", arg.name)))?;
        arg.template_key = Some(key);
    }
    Ok(arg)
}

fn compile_rule(
    spec: &RuleSpec,
    templates: &mut Handlebars<'static>,
    counter: &mut usize,
) -> Result<Rule, HookError> {
    let rule = Rule::from_spec(spec)?;
    register_templates(rule, templates, counter)
}

/// Re-walks a freshly compiled rule tree to register any `template`
/// arguments nested inside match/signature nodes.
fn register_templates(
    mut rule: Rule,
    templates: &mut Handlebars<'static>,
    counter: &mut usize,
) -> Result<Rule, HookError> {
    match &mut rule {
        Rule::And(children) | Rule::Or(children) => {
            for child in children.iter_mut() {
                let replaced = register_templates(child.clone(), templates, counter)?;
                *child = replaced;
            }
        }
        Rule::Not(child) => {
            let replaced = register_templates((**child).clone(), templates, counter)?;
            *child = Box::new(replaced);
        }
        Rule::Match(m) => {
            let needs_registration =
                matches!(&m.parameter, Some(p) if p.source == Source::Template && p.template_key.is_none());
            if needs_registration {
                let param = m.parameter.clone().unwrap();
                m.parameter = Some(reregister(&param, templates, counter)?);
            }
        }
        Rule::Signature(s) => {
            if s.signature.source == Source::Template && s.signature.template_key.is_none() {
                let signature = s.signature.clone();
                s.signature = reregister(&signature, templates, counter)?;
            }
            let needs_sts_registration =
                matches!(&s.string_to_sign, Some(a) if a.source == Source::Template && a.template_key.is_none());
            if needs_sts_registration {
                let sts = s.string_to_sign.clone().unwrap();
                s.string_to_sign = Some(reregister(&sts, templates, counter)?);
            }
        }
        Rule::Malformed => {}
    }
    Ok(rule)
}

fn reregister(
    arg: &Argument,
    templates: &mut Handlebars<'static>,
    counter: &mut usize,
) -> Result<Argument, HookError> {
    let key = format!("t{counter}");
    *counter += 1;
    templates
        .register_template_string(&key, &arg.name)
        .map_err(|e| HookError::Config(format!("bad template '{}': {e}", arg.name)))?;
    let mut cloned = arg.clone();
    cloned.template_key = Some(key);
    Ok(cloned)
}

fn compile_hook(spec: HookSpec) -> Result<Hook, HookError> {
    let mut templates = argument::new_template_registry();
    let mut counter = 0usize;

    let pass_environment_to_command = spec
        .pass_environment_to_command
        .iter()
        .map(|a| compile_argument(a, &mut templates, &mut counter))
        .collect::<Result<Vec<_>, _>>()?;
    let pass_arguments_to_command = spec
        .pass_arguments_to_command
        .iter()
        .map(|a| compile_argument(a, &mut templates, &mut counter))
        .collect::<Result<Vec<_>, _>>()?;
    let pass_file_to_command = spec
        .pass_file_to_command
        .iter()
        .map(|a| compile_argument(a, &mut templates, &mut counter))
        .collect::<Result<Vec<_>, _>>()?;
    let json_string_parameters = spec
        .json_string_parameters
        .iter()
        .map(|a| compile_argument(a, &mut templates, &mut counter))
        .collect::<Result<Vec<_>, _>>()?;

    let trigger_rule = match &spec.trigger_rule {
        Some(rule_spec) => {
            let mut rule_spec = rule_spec.clone();
            rule::rewrite_legacy_signatures(&mut rule_spec);
            Some(compile_rule(&rule_spec, &mut templates, &mut counter)?)
        }
        None => None,
    };

    let http_methods = match &spec.http_methods {
        Some(methods) => Some(
            methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|_| HookError::Config(format!("invalid http method '{m}'")))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };

    let run_as_user = spec.run_as_user.as_deref().map(parse_run_as_user).transpose()?;

    Ok(Hook {
        id: spec.id,
        execute_command: spec.execute_command,
        command_working_directory: spec.command_working_directory,
        response_message: spec.response_message.unwrap_or_else(|| DEFAULT_RESPONSE_MESSAGE.to_string()),
        response_headers: spec
            .response_headers
            .into_iter()
            .map(|h| (h.name, h.value))
            .collect(),
        capture_command_output: spec.capture_command_output,
        capture_command_output_on_error: spec.capture_command_output_on_error,
        pass_environment_to_command,
        pass_arguments_to_command,
        pass_file_to_command,
        json_string_parameters,
        trigger_rule,
        trigger_rule_mismatch_http_response_code: spec.trigger_rule_mismatch_http_response_code.unwrap_or(200),
        trigger_signature_soft_failures: spec.trigger_signature_soft_failures,
        incoming_payload_content_type: spec.incoming_payload_content_type,
        success_http_response_code: spec.success_http_response_code.unwrap_or(200),
        http_methods,
        stream_command_output: spec.stream_command_output,
        run_as_user,
        templates: Arc::new(templates),
    })
}

/// Ordered list of hooks plus an id -> index lookup, append-time unique.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
    index: HashMap<String, usize>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Errors (and leaves `self` unchanged) if any id in `other` already
    /// exists in this registry.
    pub fn append(&mut self, other: HookRegistry) -> Result<(), HookError> {
        for hook in &other.hooks {
            if self.index.contains_key(&hook.id) {
                return Err(HookError::Config(format!("duplicate hook id '{}'", hook.id)));
            }
        }
        for hook in other.hooks {
            self.index.insert(hook.id.clone(), self.hooks.len());
            self.hooks.push(hook);
        }
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&Hook> {
        self.index.get(id).map(|&i| &self.hooks[i])
    }

    pub fn find_all<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Hook> {
        self.hooks.iter().filter(move |h| h.id == id)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HookFile {
    List(Vec<HookSpec>),
    Labeled(HashMap<String, Vec<HookSpec>>),
}

impl HookFile {
    fn into_specs(self) -> Vec<HookSpec> {
        match self {
            HookFile::List(v) => v,
            HookFile::Labeled(map) => {
                let mut labels: Vec<_> = map.into_iter().collect();
                labels.sort_by(|a, b| a.0.cmp(&b.0));
                labels.into_iter().flat_map(|(_, v)| v).collect()
            }
        }
    }
}

/// Optional text-template preprocessing delimiters. Only the default
/// handlebars markers (`{{`/`}}`) are honored; a non-default request is
/// logged and otherwise ignored (see DESIGN.md).
pub struct TemplateDelimiters {
    pub left: String,
    pub right: String,
}

pub fn load_from_file(
    path: &Path,
    as_template: bool,
    delimiters: Option<&TemplateDelimiters>,
) -> Result<HookRegistry, HookError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| HookError::Config(format!("reading {}: {e}", path.display())))?;

    let text = if as_template {
        if let Some(d) = delimiters {
            if d.left != "{{" || d.right != "}}" {
                log::warn!(
                    "hook file {} requested custom template delimiters '{}' / '{}'; only the default markers are supported",
                    path.display(),
                    d.left,
                    d.right
                );
            }
        }
        render_as_template(&raw, path)?
    } else {
        raw
    };

    let specs = parse_hook_specs(&text, path)?;
    let mut registry = HookRegistry::new();
    for spec in specs {
        let hook = compile_hook(spec)?;
        if registry.index.contains_key(&hook.id) {
            return Err(HookError::Config(format!(
                "duplicate hook id '{}' within {}",
                hook.id,
                path.display()
            )));
        }
        registry.index.insert(hook.id.clone(), registry.hooks.len());
        registry.hooks.push(hook);
    }
    Ok(registry)
}

fn render_as_template(raw: &str, path: &Path) -> Result<String, HookError> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("getenv", Box::new(getenv_helper));
    hb.render_template(raw, &serde_json::json!({}))
        .map_err(|e| HookError::Config(format!("rendering {} as template: {e}", path.display())))
}

fn getenv_helper(
    h: &handlebars::Helper,
    _r: &Handlebars,
    _ctx: &handlebars::Context,
    _rc: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let name = h.param(0).and_then(|p| p.value().as_str()).unwrap_or_default();
    if let Ok(value) = std::env::var(name) {
        out.write(&value)?;
    }
    Ok(())
}

fn parse_hook_specs(text: &str, path: &Path) -> Result<Vec<HookSpec>, HookError> {
    let trimmed = text.trim_start();
    let looks_like_json = trimmed.starts_with('{') || trimmed.starts_with('[');
    if looks_like_json {
        if let Ok(file) = serde_json::from_str::<HookFile>(text) {
            return Ok(file.into_specs());
        }
    }
    serde_yaml::from_str::<HookFile>(text)
        .map(HookFile::into_specs)
        .or_else(|_| serde_json::from_str::<HookFile>(text).map(HookFile::into_specs))
        .map_err(|e| HookError::Config(format!("parsing {}: {e}", path.display())))
}

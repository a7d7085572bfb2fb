//! The trigger-rule engine: a recursive tree of boolean combinators over
//! parameter predicates and signature checks.

use crate::argument::{Argument, ArgumentSpec};
use crate::error::HookError;
use crate::request::Request;
use crate::signature::{self, Algorithm};
use handlebars::Handlebars;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;

/// Wire shape of a rule node: exactly one of the five fields should be set.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleSpec {
    #[serde(default)]
    pub and: Option<Vec<RuleSpec>>,
    #[serde(default)]
    pub or: Option<Vec<RuleSpec>>,
    #[serde(default)]
    pub not: Option<Box<RuleSpec>>,
    #[serde(rename = "match", default)]
    pub match_rule: Option<MatchRuleSpec>,
    #[serde(rename = "check-signature", default)]
    pub check_signature: Option<SignatureRuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchRuleSpec {
    #[serde(rename = "type")]
    pub match_type: String,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(rename = "ip-range", default)]
    pub ip_range: Option<String>,
    #[serde(default)]
    pub parameter: Option<ArgumentSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignatureRuleSpec {
    pub algorithm: String,
    pub secret: String,
    pub signature: ArgumentSpec,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(rename = "stringToSign", default)]
    pub string_to_sign: Option<ArgumentSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Value,
    Regex,
    IpWhitelist,
    ScalrSignature,
}

impl MatchType {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "value" => Some(MatchType::Value),
            "regex" => Some(MatchType::Regex),
            "ip-whitelist" => Some(MatchType::IpWhitelist),
            "scalr-signature" => Some(MatchType::ScalrSignature),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchRule {
    pub match_type: MatchType,
    pub regex: Option<Regex>,
    /// For `value`: the literal to compare against. For `scalr-signature`:
    /// repurposed as the shared secret (the spec's MatchRule shape has no
    /// dedicated secret field for this legacy match type; see DESIGN.md).
    pub value: Option<String>,
    pub ip_range: Option<String>,
    pub parameter: Option<Argument>,
}

#[derive(Debug, Clone)]
pub struct SignatureRule {
    pub algorithm: Algorithm,
    pub secret: Vec<u8>,
    pub signature: Argument,
    pub prefix: Option<String>,
    pub string_to_sign: Option<Argument>,
}

/// The compiled rule tree the evaluator walks.
#[derive(Debug, Clone)]
pub enum Rule {
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    Match(MatchRule),
    Signature(SignatureRule),
    /// Zero or more than one discriminator was set on the source node.
    Malformed,
}

impl Rule {
    pub fn from_spec(spec: &RuleSpec) -> Result<Rule, HookError> {
        let set = [
            spec.and.is_some(),
            spec.or.is_some(),
            spec.not.is_some(),
            spec.match_rule.is_some(),
            spec.check_signature.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count();
        if set != 1 {
            return Ok(Rule::Malformed);
        }
        if let Some(children) = &spec.and {
            return Ok(Rule::And(
                children.iter().map(Rule::from_spec).collect::<Result<_, _>>()?,
            ));
        }
        if let Some(children) = &spec.or {
            return Ok(Rule::Or(
                children.iter().map(Rule::from_spec).collect::<Result<_, _>>()?,
            ));
        }
        if let Some(child) = &spec.not {
            return Ok(Rule::Not(Box::new(Rule::from_spec(child)?)));
        }
        if let Some(m) = &spec.match_rule {
            return Ok(Rule::Match(compile_match(m)?));
        }
        if let Some(s) = &spec.check_signature {
            return Ok(Rule::Signature(compile_signature(s)?));
        }
        unreachable!("exactly one discriminator was confirmed set above")
    }
}

fn compile_match(spec: &MatchRuleSpec) -> Result<MatchRule, HookError> {
    let match_type = MatchType::from_str(&spec.match_type)
        .ok_or_else(|| HookError::Config(format!("unknown match type '{}'", spec.match_type)))?;
    let regex = match (&match_type, &spec.regex) {
        (MatchType::Regex, Some(pattern)) => Some(
            Regex::new(pattern).map_err(|e| HookError::Config(format!("bad regex '{pattern}': {e}")))?,
        ),
        _ => None,
    };
    let parameter = spec
        .parameter
        .as_ref()
        .map(Argument::from_spec)
        .transpose()?;
    Ok(MatchRule {
        match_type,
        regex,
        value: spec.value.clone(),
        ip_range: spec.ip_range.clone(),
        parameter,
    })
}

fn compile_signature(spec: &SignatureRuleSpec) -> Result<SignatureRule, HookError> {
    let algorithm = Algorithm::from_str(&spec.algorithm)
        .ok_or_else(|| HookError::Config(format!("unknown signature algorithm '{}'", spec.algorithm)))?;
    Ok(SignatureRule {
        algorithm,
        secret: spec.secret.clone().into_bytes(),
        signature: Argument::from_spec(&spec.signature)?,
        prefix: spec.prefix.clone(),
        string_to_sign: spec.string_to_sign.as_ref().map(Argument::from_spec).transpose()?,
    })
}

/// Rewrites legacy `match.type = payload-hash-sha1` / `payload-hmac-sha256`
/// / ... nodes into an equivalent `check-signature` node. Mutates the tree
/// in place and logs a deprecation warning per rewritten node.
pub fn rewrite_legacy_signatures(spec: &mut RuleSpec) {
    if let Some(children) = &mut spec.and {
        children.iter_mut().for_each(rewrite_legacy_signatures);
    }
    if let Some(children) = &mut spec.or {
        children.iter_mut().for_each(rewrite_legacy_signatures);
    }
    if let Some(child) = &mut spec.not {
        rewrite_legacy_signatures(child);
    }
    let Some(m) = &spec.match_rule else { return };
    let Some(algorithm_name) = legacy_algorithm_name(&m.match_type) else {
        return;
    };
    log::warn!(
        "hook file uses deprecated match.type '{}'; rewriting to check-signature",
        m.match_type
    );
    let rewritten = SignatureRuleSpec {
        algorithm: algorithm_name.to_string(),
        secret: m.value.clone().unwrap_or_default(),
        signature: m
            .parameter
            .clone()
            .unwrap_or_else(|| ArgumentSpec {
                source: "header".to_string(),
                name: "X-Hub-Signature".to_string(),
                env_name: None,
                base64_decode: false,
            }),
        prefix: Some(String::new()),
        string_to_sign: None,
    };
    spec.match_rule = None;
    spec.check_signature = Some(rewritten);
}

fn legacy_algorithm_name(match_type: &str) -> Option<&'static str> {
    match match_type {
        "payload-hash-sha1" | "payload-hmac-sha1" => Some("sha1"),
        "payload-hash-sha256" | "payload-hmac-sha256" => Some("sha256"),
        "payload-hash-sha512" | "payload-hmac-sha512" => Some("sha512"),
        _ => None,
    }
}

pub fn evaluate(rule: &Rule, request: &Request, templates: &Handlebars) -> Result<bool, HookError> {
    match rule {
        Rule::Malformed => Ok(false),
        Rule::And(children) => {
            for child in children {
                if !evaluate(child, request, templates)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Rule::Or(children) => {
            for child in children {
                match evaluate(child, request, templates) {
                    Ok(true) => return Ok(true),
                    Ok(false) => continue,
                    Err(e) if e.is_parameter_node() => continue,
                    Err(e) if e.is_signature() && request.allow_signature_errors => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(false)
        }
        Rule::Not(child) => evaluate(child, request, templates).map(|b| !b),
        Rule::Match(m) => evaluate_match(m, request, templates),
        Rule::Signature(s) => evaluate_signature(s, request, templates),
    }
}

fn evaluate_match(m: &MatchRule, request: &Request, templates: &Handlebars) -> Result<bool, HookError> {
    match m.match_type {
        MatchType::IpWhitelist => {
            let ranges = m.ip_range.as_deref().unwrap_or("");
            Ok(ip_in_ranges(request.remote_addr.ip(), ranges))
        }
        MatchType::Value => {
            let param = m
                .parameter
                .as_ref()
                .ok_or_else(|| HookError::Argument("match rule missing parameter".to_string()))?;
            let actual = param.resolve(request, templates)?;
            let expected = m.value.as_deref().unwrap_or("");
            Ok(signature::constant_time_eq(&actual, expected))
        }
        MatchType::Regex => {
            let param = m
                .parameter
                .as_ref()
                .ok_or_else(|| HookError::Argument("match rule missing parameter".to_string()))?;
            let actual = param.resolve(request, templates)?;
            let re = m
                .regex
                .as_ref()
                .ok_or_else(|| HookError::Config("regex match rule missing a compiled pattern".to_string()))?;
            Ok(re.is_match(&actual))
        }
        MatchType::ScalrSignature => {
            let param = m
                .parameter
                .as_ref()
                .ok_or_else(|| HookError::Argument("match rule missing parameter".to_string()))?;
            let claimed = param.resolve(request, templates)?;
            let secret = m.value.as_deref().unwrap_or("");
            let date_header = request
                .get_header("Date")
                .ok_or_else(|| HookError::Signature("missing Date header".to_string()))?;
            signature::verify_scalr(secret.as_bytes(), &request.body, &date_header, &claimed)
        }
    }
}

fn evaluate_signature(s: &SignatureRule, request: &Request, templates: &Handlebars) -> Result<bool, HookError> {
    let claimed = s.signature.resolve(request, templates)?;
    let payload: Vec<u8> = match &s.string_to_sign {
        Some(arg) => arg.resolve(request, templates)?.into_bytes(),
        None => request.body.to_vec(),
    };
    let prefix = match &s.prefix {
        Some(p) if !p.is_empty() => p.clone(),
        _ => s.algorithm.default_prefix(),
    };
    signature::verify(s.algorithm, &s.secret, &payload, &prefix, &claimed)
}

fn ip_in_ranges(ip: IpAddr, ranges: &str) -> bool {
    ranges.split_whitespace().any(|entry| {
        if let Ok(network) = entry.parse::<IpNetwork>() {
            return network.contains(ip);
        }
        matches!(entry.parse::<IpAddr>(), Ok(single) if single == ip)
    })
}

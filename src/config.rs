//! Server configuration: bind address, URL prefix, and the list of hook
//! definition files to load (and hot-reload) at startup.

use crate::error::HookError;
use crate::hook::{self, HookRegistry, TemplateDelimiters};
use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

pub struct ServerConfig {
    pub socket: SocketAddr,
    pub url_prefix: String,
    pub hook_files: Vec<HookFileConfig>,
}

pub struct HookFileConfig {
    pub path: PathBuf,
    pub as_template: bool,
    pub delimiters: Option<TemplateDelimiters>,
}

pub enum ConfigError {
    IoError(std::io::Error),
    DeError(toml::de::Error),
    BadConfig(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}
impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::DeError(e)
    }
}
impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigError::IoError(e) => e.to_string(),
            ConfigError::DeError(e) => e.to_string(),
            ConfigError::BadConfig(e) => e.to_string(),
        };
        f.write_str(&s)
    }
}

fn default_port() -> u16 {
    9000
}
fn default_prefix() -> String {
    "hooks".to_string()
}

#[derive(Deserialize)]
struct _ServerConfig {
    addr: IpAddr,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(rename = "url-prefix", default = "default_prefix")]
    url_prefix: String,
    #[serde(rename = "hook-file", default)]
    hook_file: Vec<_HookFileConfig>,
}

#[derive(Deserialize)]
struct _HookFileConfig {
    path: String,
    #[serde(rename = "as-template", default)]
    as_template: bool,
    #[serde(rename = "delimiter-left", default)]
    delimiter_left: Option<String>,
    #[serde(rename = "delimiter-right", default)]
    delimiter_right: Option<String>,
}

pub fn from_file(config_path: &str) -> Result<ServerConfig, ConfigError> {
    let cfg_str = fs::read_to_string(config_path)?;
    let raw: _ServerConfig = toml::from_str(&cfg_str)?;

    if raw.hook_file.is_empty() {
        return Err(ConfigError::BadConfig(
            "configuration must list at least one [[hook-file]]".to_string(),
        ));
    }

    let hook_files = raw
        .hook_file
        .into_iter()
        .map(|h| HookFileConfig {
            path: PathBuf::from(h.path),
            as_template: h.as_template,
            delimiters: match (h.delimiter_left, h.delimiter_right) {
                (Some(left), Some(right)) => Some(TemplateDelimiters { left, right }),
                _ => None,
            },
        })
        .collect();

    Ok(ServerConfig {
        socket: SocketAddr::new(raw.addr, raw.port),
        url_prefix: raw.url_prefix,
        hook_files,
    })
}

/// Loads every configured hook file into one registry. Atomic across
/// files: an id collision anywhere aborts the whole reload, leaving
/// whatever registry the caller already has in place untouched.
pub fn load_registry(cfg: &ServerConfig) -> Result<HookRegistry, HookError> {
    let mut registry = HookRegistry::new();
    for file in &cfg.hook_files {
        let loaded = hook::load_from_file(&file.path, file.as_template, file.delimiters.as_ref())?;
        registry.append(loaded)?;
    }
    Ok(registry)
}

use std::fmt::{self, Display};

/// The error taxonomy shared by the parameter accessor, argument resolver,
/// rule engine and dispatcher. The dispatcher maps each variant to an HTTP
/// disposition per the failure semantics in SPEC_FULL.md §4.7.
#[derive(Debug, Clone)]
pub enum HookError {
    /// A requested parameter path was absent. Recoverable: `or` swallows it.
    ParameterNode(String),
    /// HMAC mismatch, malformed signature header, or empty payload.
    Signature(String),
    /// An `Argument` could not be resolved at all.
    Argument(String),
    /// Unknown `source` tag on an argument descriptor.
    Source(String),
    /// Payload body failed to decode for its content type.
    Parse(String),
    /// Spawning or running the child command failed.
    Io(String),
    /// Server or hook-file configuration failed to load.
    Config(String),
}

impl HookError {
    pub fn is_signature(&self) -> bool {
        matches!(self, HookError::Signature(_))
    }

    pub fn is_parameter_node(&self) -> bool {
        matches!(self, HookError::ParameterNode(_))
    }
}

impl Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, msg) = match self {
            HookError::ParameterNode(m) => ("parameter", m),
            HookError::Signature(m) => ("signature", m),
            HookError::Argument(m) => ("argument", m),
            HookError::Source(m) => ("source", m),
            HookError::Parse(m) => ("parse", m),
            HookError::Io(m) => ("io", m),
            HookError::Config(m) => ("config", m),
        };
        write!(f, "{kind} error: {msg}")
    }
}

impl std::error::Error for HookError {}

impl From<std::io::Error> for HookError {
    fn from(e: std::io::Error) -> Self {
        HookError::Io(e.to_string())
    }
}

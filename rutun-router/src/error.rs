//! Error types for rule loading

use thiserror::Error;

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading a rule file
#[derive(Debug, Error)]
pub enum Error {
    /// Rule file could not be read
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    /// Rule file is not valid YAML
    #[error("failed to parse rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Unrecognized routing mode
    #[error("unknown routing mode: {0}")]
    UnknownMode(String),

    /// A rule line names a type this router does not know
    #[error("rule line {line}: unknown rule type {rule_type}")]
    UnknownRuleType { line: usize, rule_type: String },
}

use thiserror::Error;

/// A rule record that cannot be classified safely. Fatal to the run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("rule record #{index} is missing `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("rule `{rule}` has unknown category `{value}`")]
    UnknownCategory { rule: String, value: String },
    #[error("rule `{rule}` has unknown criticality `{value}`")]
    UnknownCriticality { rule: String, value: String },
    #[error("rule `{rule}` has invalid scope pattern `{pattern}`: {source}")]
    InvalidScope {
        rule: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("rule id `{0}` appears more than once")]
    DuplicateRule(String),
}

/// A rule or content source could not deliver. Fatal to the run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{collaborator} is not configured")]
    NotConfigured { collaborator: &'static str },
    #[error("{collaborator} unreachable: {reason}")]
    Unreachable {
        collaborator: &'static str,
        reason: String,
    },
    #[error("{collaborator} returned malformed data: {reason}")]
    Malformed {
        collaborator: &'static str,
        reason: String,
    },
    #[error("no rules are defined for `{0}`")]
    NoRules(String),
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Settings a run cannot start with.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("model provider `{provider}` is not configured (provider, both models and an API key are required)")]
    ProviderNotConfigured { provider: String },
    #[error("`{key}` is {value} bytes, below the minimum of {min}")]
    BudgetTooSmall {
        key: &'static str,
        value: usize,
        min: usize,
    },
}

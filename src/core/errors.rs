//! TSIM-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::isolation::guard::DenialReason;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, TsimError>;

/// Top-level error type for the trust simulation engine.
#[derive(Debug, Error)]
pub enum TsimError {
    #[error("[TSIM-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[TSIM-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[TSIM-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[TSIM-2001] validation failed for {field}: {details}")]
    Validation { field: String, details: String },

    #[error("[TSIM-2002] legacy delta could not be normalized: {details}")]
    DeltaImport { details: String },

    #[error("[TSIM-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[TSIM-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[TSIM-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[TSIM-3101] isolation denied ({}): {reason}", .reason.code())]
    IsolationDenied { reason: DenialReason },

    #[error("[TSIM-4001] {kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("[TSIM-4002] scenario {scenario_id} already has an active run")]
    RunInProgress { scenario_id: String },

    #[error("[TSIM-4003] scenario {scenario_id} cannot run from state {state}")]
    InvalidState { scenario_id: String, state: String },

    #[error("[TSIM-4004] snapshot append out of order for {scenario_id}: expected index {expected}, got {got}")]
    AppendOutOfOrder {
        scenario_id: String,
        expected: usize,
        got: usize,
    },

    #[error("[TSIM-4005] duplicate {kind} id: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("[TSIM-5001] generator exhausted: {details}")]
    GeneratorExhausted { details: String },

    #[error("[TSIM-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl TsimError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "TSIM-1001",
            Self::MissingConfig { .. } => "TSIM-1002",
            Self::ConfigParse { .. } => "TSIM-1003",
            Self::Validation { .. } => "TSIM-2001",
            Self::DeltaImport { .. } => "TSIM-2002",
            Self::Serialization { .. } => "TSIM-2101",
            Self::Sql { .. } => "TSIM-2102",
            Self::Io { .. } => "TSIM-3002",
            Self::IsolationDenied { .. } => "TSIM-3101",
            Self::NotFound { .. } => "TSIM-4001",
            Self::RunInProgress { .. } => "TSIM-4002",
            Self::InvalidState { .. } => "TSIM-4003",
            Self::AppendOutOfOrder { .. } => "TSIM-4004",
            Self::Duplicate { .. } => "TSIM-4005",
            Self::GeneratorExhausted { .. } => "TSIM-5001",
            Self::Runtime { .. } => "TSIM-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Sql { .. }
                | Self::RunInProgress { .. }
                | Self::Runtime { .. }
        )
    }

    /// Whether this is an isolation-guard denial.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(self, Self::IsolationDenied { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for validation failures.
    #[must_use]
    pub fn validation(field: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for TsimError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for TsimError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for TsimError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

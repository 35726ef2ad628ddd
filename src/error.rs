use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors raised by the calibration engine
///
/// Only [`Error::Storage`] is fatal to a request. Everything else is either rejected up front
/// (`Validation`), or downgraded to an [`Issue`] by the request layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no data found: {0}")]
    DataNotFound(String),
    #[error("malformed row {row}: {reason}")]
    Parse { row: usize, reason: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("optimisation failed: {0}")]
    Optimisation(String),
    #[error("optimisation cancelled after {generation} generations")]
    Cancelled { generation: usize },
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error must abort the request rather than be reported
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// Classify a recoverable error for the issue list
    pub const fn kind(&self) -> IssueKind {
        match self {
            Self::Validation(_) | Self::Pattern(_) | Self::Config(_) => IssueKind::Validation,
            Self::DataNotFound(_) => IssueKind::DataNotFound,
            Self::Parse { .. } | Self::Csv(_) | Self::Json(_) => IssueKind::Parse,
            _ => IssueKind::NumericGuard,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IssueKind {
    Validation,
    DataNotFound,
    Parse,
    NumericGuard,
}

/// A recoverable data-quality condition, reported alongside a result instead of raised
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

impl Issue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(IssueKind::Parse, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(IssueKind::DataNotFound, message)
    }

    pub fn numeric_guard(message: impl Into<String>) -> Self {
        Self::new(IssueKind::NumericGuard, message)
    }
}

impl From<&Error> for Issue {
    fn from(value: &Error) -> Self {
        Self::new(value.kind(), value.to_string())
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

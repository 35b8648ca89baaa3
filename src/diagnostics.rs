//! Diagnostics - Structured Errors at the Job Boundary
//!
//! Recoverable problems are collected as diagnostics on the scene.
//! Anything that ends a job is a `JobError`; callers never see a panic.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::lexer::Span;
use crate::parser::ParseError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    Evaluation,
    ImportCycle,
    Sandbox,
    Timeout,
    Capacity,
    RateLimit,
    InvalidPayload,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::ImportCycle => "import_cycle",
            ErrorKind::Sandbox => "sandbox",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Capacity => "capacity",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::InvalidPayload => "invalid_payload",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A recovered problem: one leaf, one statement or one import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// Artifact the problem originated in, when not the job's own source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl Diagnostic {
    pub fn warning(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            message: message.into(),
            span: None,
            artifact: None,
        }
    }

    pub fn info(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            ..Self::warning(kind, message)
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn in_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }
}

impl From<&ParseError> for Diagnostic {
    fn from(e: &ParseError) -> Self {
        Diagnostic::warning(ErrorKind::Parse, e.message.clone()).with_span(e.span)
    }
}

/// Terminal job failure, serialized as the job's error payload.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            retry_after_secs: None,
        }
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            retry_after_secs: Some(retry_after_secs),
            ..Self::new(
                ErrorKind::RateLimit,
                format!("Too many render jobs; retry in {}s", retry_after_secs),
            )
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPayload, message)
    }
}

impl From<ParseError> for JobError {
    fn from(e: ParseError) -> Self {
        Self {
            span: Some(e.span),
            ..Self::new(ErrorKind::Parse, e.message)
        }
    }
}

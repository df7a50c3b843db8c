//! Error taxonomy shared by the engine, session and viewer layers

use std::path::PathBuf;

/// Errors surfaced to callers of the crate
///
/// A cooperative stop is not an error: it is reported as
/// [`RunOutcome::Interrupted`](crate::processor::RunOutcome::Interrupted).
/// Malformed progress lines and bounding-box comments are logged and
/// ignored, so they have no variant here either.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller contract violation detected before any native call
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A processor is single-use; another run needs a fresh one
    #[error("session has already run")]
    SessionAlreadyRun,

    #[error("no compatible interpreter engine found")]
    EngineNotFound,

    #[error("failed to load interpreter engine {path:?}: {reason}")]
    EngineLoadFailed { path: PathBuf, reason: String },

    /// A native entry point returned an error status other than quit or interrupt.
    /// `output` carries the stdout/stderr trail captured up to the failure.
    #[error("{call} failed with code {code}")]
    EngineCallFailed {
        call: &'static str,
        code: i32,
        output: String,
    },

    #[error("cannot open document {path:?}: {source}")]
    DocumentOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("logger: {0}")]
    Logger(#[from] log::SetLoggerError),
}

impl Error {
    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn call_failed(call: &'static str, code: i32, output: impl Into<String>) -> Self {
        Self::EngineCallFailed {
            call,
            code,
            output: output.into(),
        }
    }

    /// Diagnostic text captured from the engine, if any
    #[must_use]
    pub fn engine_output(&self) -> Option<&str> {
        match self {
            Self::EngineCallFailed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! Failure taxonomy for a single simulation request.
//!
//! Every way a request can fail maps to exactly one [`SimulationError`]
//! variant, which in turn fixes the HTTP status and the JSON body the caller
//! receives.

use std::{fmt, path::PathBuf, time::Duration};

use http::StatusCode;
use serde_json::{json, Value};

/// Classification of a failed request, in the order the checks are made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidInput,
    EngineNotFound,
    EngineExecutionFailed,
    EmptyEngineOutput,
    MalformedEngineOutput,
    EngineTimeout,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::EngineNotFound => "engine_not_found",
            FailureKind::EngineExecutionFailed => "engine_execution_failed",
            FailureKind::EmptyEngineOutput => "empty_engine_output",
            FailureKind::MalformedEngineOutput => "malformed_engine_output",
            FailureKind::EngineTimeout => "engine_timeout",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum SimulationError {
    /// Request body missing, not declared as JSON, or not parseable.
    InvalidInput(String),

    /// No engine executable at any configured location.
    EngineNotFound { searched: Vec<PathBuf> },

    /// Engine exited non-zero or was killed by a signal.
    EngineExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Engine exited zero but its result channel was blank.
    EmptyEngineOutput { stderr: String },

    /// Engine produced text that is not JSON.
    MalformedEngineOutput { raw: String, reason: String },

    /// Engine exceeded the wall-clock bound and was killed.
    EngineTimeout { timeout: Duration },

    /// Anything else: spawn failures, handoff file I/O.
    Internal(String),
}

impl SimulationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SimulationError::InvalidInput(_) => FailureKind::InvalidInput,
            SimulationError::EngineNotFound { .. } => FailureKind::EngineNotFound,
            SimulationError::EngineExecutionFailed { .. } => FailureKind::EngineExecutionFailed,
            SimulationError::EmptyEngineOutput { .. } => FailureKind::EmptyEngineOutput,
            SimulationError::MalformedEngineOutput { .. } => FailureKind::MalformedEngineOutput,
            SimulationError::EngineTimeout { .. } => FailureKind::EngineTimeout,
            SimulationError::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            SimulationError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Captured engine stderr, when the failure happened after the engine ran.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            SimulationError::EngineExecutionFailed { stderr, .. }
            | SimulationError::EmptyEngineOutput { stderr } => Some(stderr),
            _ => None,
        }
    }

    /// Response body returned to the HTTP caller.
    pub fn to_json(&self) -> Value {
        match self {
            SimulationError::InvalidInput(_) => json!({ "error": "Invalid JSON" }),
            SimulationError::EngineExecutionFailed { stderr, .. } => json!({
                "error": "Simulation failed",
                "details": stderr,
            }),
            SimulationError::EmptyEngineOutput { stderr } => json!({
                "error": "Engine returned empty result",
                "stderr": stderr,
            }),
            SimulationError::MalformedEngineOutput { raw, reason } => json!({
                "error": format!("Engine returned invalid JSON: {reason}"),
                "details": raw,
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::InvalidInput(msg) => write!(f, "Invalid JSON: {msg}"),
            SimulationError::EngineNotFound { searched } => {
                let searched: Vec<String> = searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                write!(
                    f,
                    "Simulation engine not found (searched: {})",
                    searched.join(", ")
                )
            }
            SimulationError::EngineExecutionFailed { exit_code, stderr } => match exit_code {
                Some(code) => write!(f, "Simulation failed with exit code {code}: {stderr}"),
                None => write!(f, "Simulation terminated by signal: {stderr}"),
            },
            SimulationError::EmptyEngineOutput { .. } => {
                write!(f, "Engine returned empty result")
            }
            SimulationError::MalformedEngineOutput { reason, .. } => {
                write!(f, "Engine returned invalid JSON: {reason}")
            }
            SimulationError::EngineTimeout { timeout } => {
                write!(f, "Simulation timed out after {}s", timeout.as_secs_f64())
            }
            SimulationError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SimulationError {}

//! Core types for the simulation lifecycle library
//!
//! This module defines the error taxonomy, the numeric value type used by the
//! variable environment, and the small enumerations (restart mode, lifecycle
//! state) that the persisted document is built from.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors that can occur while orchestrating a simulation
///
/// `EndReached` is deliberately absent: reaching the end of the timeline is a
/// normal outcome of a restart (see [`crate::RestartOutcome`]).
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("Failed to evaluate expression: {0}")]
    Evaluation(String),

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("Lock file exists: {0}")]
    LockHeld(String),

    #[error("No checkpoint found: {0}")]
    NoCheckpointFound(String),

    #[error("Malformed checkpoint header: {0}")]
    MalformedCheckpointHeader(String),

    #[error("Test run failed: {0}")]
    TestRunFailed(String),

    #[error("Timeline is inconsistent: {0}")]
    InconsistentTimeline(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Post processor error: {0}")]
    PostProcessor(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Build a parse error for a (zero-based) template line
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        LifecycleError::Parse {
            line,
            message: message.into(),
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Parse { .. } => "ParseError",
            LifecycleError::UndefinedVariable(_) => "UndefinedVariable",
            LifecycleError::Evaluation(_) => "EvaluationError",
            LifecycleError::InvalidState(_) => "InvalidState",
            LifecycleError::LockHeld(_) => "LockHeld",
            LifecycleError::NoCheckpointFound(_) => "NoCheckpointFound",
            LifecycleError::MalformedCheckpointHeader(_) => "MalformedCheckpointHeader",
            LifecycleError::TestRunFailed(_) => "TestRunFailed",
            LifecycleError::InconsistentTimeline(_) => "InconsistentTimeline",
            LifecycleError::Scheduler(_) => "SchedulerError",
            LifecycleError::PostProcessor(_) => "PostProcessorError",
            LifecycleError::IoError(_) => "IoError",
            LifecycleError::JsonError(_) => "JsonError",
        }
    }
}

/// Numeric value stored in the variable environment
///
/// Integers stay integers through `+ - * %` so that step counts written back
/// into generated scripts do not pick up a spurious decimal point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Convert to f64 for mixed arithmetic
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }

    /// Round to the nearest integer (step counts, trip counts)
    pub fn round_i64(&self) -> i64 {
        match self {
            Number::Int(v) => *v,
            Number::Float(v) => v.round() as i64,
        }
    }

    /// True if the value is zero
    pub fn is_zero(&self) -> bool {
        match self {
            Number::Int(v) => *v == 0,
            Number::Float(v) => *v == 0.0,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{}", v),
            Number::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

/// Checkpoint file layout convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Not fixed yet; the template's checkpoint directive decides
    #[default]
    None,
    /// A single fixed-name file, overwritten in place
    One,
    /// Two alternating files (`.a` / `.b`)
    Two,
    /// One file per checkpoint step (`basename.<step>`)
    Multiple,
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartMode::None => write!(f, "none"),
            RestartMode::One => write!(f, "one"),
            RestartMode::Two => write!(f, "two"),
            RestartMode::Multiple => write!(f, "multiple"),
        }
    }
}

impl std::str::FromStr for RestartMode {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(RestartMode::None),
            "one" => Ok(RestartMode::One),
            "two" => Ok(RestartMode::Two),
            "multiple" => Ok(RestartMode::Multiple),
            other => Err(LifecycleError::InvalidState(format!(
                "Unknown restart mode: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of the persisted document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initialized,
    FullyInitialized,
    Started,
    Restarted,
    Completed,
    PostProcessorCalled,
    PostProcessDone,
}

impl LifecycleState {
    /// True if a restart (or the initial start) may be performed
    pub fn can_restart(&self) -> bool {
        matches!(
            self,
            LifecycleState::FullyInitialized | LifecycleState::Started | LifecycleState::Restarted
        )
    }

    /// Check that a restart is allowed from this state
    pub fn ensure_restartable(&self) -> Result<()> {
        if self.can_restart() {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState(format!(
                "Cannot restart a simulation in state '{}'",
                self
            )))
        }
    }

    /// Check that post-processing may be started from this state
    ///
    /// `ongoing` allows post-processing an intermediate result while the
    /// simulation itself is still running.
    pub fn ensure_can_end(&self, ongoing: bool) -> Result<()> {
        let allowed = match self {
            LifecycleState::Completed => true,
            LifecycleState::Started | LifecycleState::Restarted => ongoing,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState(format!(
                "Cannot start post-processing in state '{}'",
                self
            )))
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Initialized => "initialized",
            LifecycleState::FullyInitialized => "fully_initialized",
            LifecycleState::Started => "started",
            LifecycleState::Restarted => "restarted",
            LifecycleState::Completed => "completed",
            LifecycleState::PostProcessorCalled => "post_processor_called",
            LifecycleState::PostProcessDone => "post_process_done",
        };
        write!(f, "{}", name)
    }
}

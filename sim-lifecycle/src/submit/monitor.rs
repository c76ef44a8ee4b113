//! Scheduler and job monitor contracts
//!
//! The library never talks to a batch system directly. Submissions go through
//! a [`Scheduler`] and job supervision through a [`JobMonitor`]; the CLI
//! provides Slurm-backed implementations, tests provide in-memory fakes.

use crate::types::{LifecycleError, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Job state as reported by the batch system (Slurm vocabulary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    BootFail,
    Cancelled,
    Completed,
    Configuring,
    Completing,
    Deadline,
    Failed,
    NodeFail,
    OutOfMemory,
    Pending,
    Preempted,
    Running,
    ResvDelHold,
    RequeueFed,
    RequeueHold,
    Requeued,
    Resizing,
    Revoked,
    Signaling,
    SpecialExit,
    StageOut,
    Stopped,
    Suspended,
    Timeout,
    Unknown,
}

const STATE_NAMES: [(SchedulerState, &str); 25] = [
    (SchedulerState::BootFail, "BOOT_FAIL"),
    (SchedulerState::Cancelled, "CANCELLED"),
    (SchedulerState::Completed, "COMPLETED"),
    (SchedulerState::Configuring, "CONFIGURING"),
    (SchedulerState::Completing, "COMPLETING"),
    (SchedulerState::Deadline, "DEADLINE"),
    (SchedulerState::Failed, "FAILED"),
    (SchedulerState::NodeFail, "NODE_FAIL"),
    (SchedulerState::OutOfMemory, "OUT_OF_MEMORY"),
    (SchedulerState::Pending, "PENDING"),
    (SchedulerState::Preempted, "PREEMPTED"),
    (SchedulerState::Running, "RUNNING"),
    (SchedulerState::ResvDelHold, "RESV_DEL_HOLD"),
    (SchedulerState::RequeueFed, "REQUEUE_FED"),
    (SchedulerState::RequeueHold, "REQUEUE_HOLD"),
    (SchedulerState::Requeued, "REQUEUED"),
    (SchedulerState::Resizing, "RESIZING"),
    (SchedulerState::Revoked, "REVOKED"),
    (SchedulerState::Signaling, "SIGNALING"),
    (SchedulerState::SpecialExit, "SPECIAL_EXIT"),
    (SchedulerState::StageOut, "STAGE_OUT"),
    (SchedulerState::Stopped, "STOPPED"),
    (SchedulerState::Suspended, "SUSPENDED"),
    (SchedulerState::Timeout, "TIMEOUT"),
    (SchedulerState::Unknown, "UNKNOWN_STATE"),
];

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        STATE_NAMES
            .iter()
            .find(|(state, _)| state == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN_STATE")
    }

    /// Classify the state for the restart decision
    pub fn class(&self) -> StatusClass {
        use SchedulerState::*;
        match self {
            Completed | Failed | Timeout => StatusClass::RestartEligible,
            BootFail | Deadline | NodeFail | OutOfMemory | Preempted | Stopped | Cancelled => {
                StatusClass::HardFailure
            }
            Unknown => StatusClass::Unknown,
            _ => StatusClass::Active,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SchedulerState {
    type Err = LifecycleError;

    /// Accepts decorated forms like `CANCELLED by 1000` or `RUNNING+`
    fn from_str(s: &str) -> Result<Self> {
        let word = s
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_ascii_uppercase();
        if word == "UNKNOWN" {
            return Ok(SchedulerState::Unknown);
        }
        STATE_NAMES
            .iter()
            .find(|(_, name)| *name == word)
            .map(|(state, _)| *state)
            .ok_or_else(|| LifecycleError::Scheduler(format!("Unknown scheduler state: '{}'", s)))
    }
}

/// What a monitor should do after observing a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Terminal state after which the restart entrypoint is invoked
    RestartEligible,
    /// Node fault, preemption, out of memory, cancellation
    HardFailure,
    /// Not terminal yet
    Active,
    /// The scheduler does not know the job
    Unknown,
    /// The same non-terminal state was seen for too long
    Stuck,
}

impl StatusClass {
    /// True if polling should stop
    pub fn is_final(&self) -> bool {
        !matches!(self, StatusClass::Active)
    }
}

/// Tracks repeated observations of one non-terminal state
///
/// After `threshold` consecutive polls reporting the same active state the
/// job is classified as [`StatusClass::Stuck`]. `PENDING` never counts as
/// stuck: queue time is not under the job's control.
#[derive(Debug, Clone)]
pub struct StuckDetector {
    threshold: u32,
    last: Option<SchedulerState>,
    repeats: u32,
}

impl StuckDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last: None,
            repeats: 0,
        }
    }

    /// Record one poll result and classify it
    pub fn observe(&mut self, state: SchedulerState) -> StatusClass {
        let class = state.class();
        if class != StatusClass::Active || state == SchedulerState::Pending {
            self.last = Some(state);
            self.repeats = 0;
            return class;
        }
        if self.last == Some(state) {
            self.repeats += 1;
        } else {
            self.last = Some(state);
            self.repeats = 0;
        }
        if self.repeats >= self.threshold {
            log::warn!("Job stayed in state {} for {} polls", state, self.repeats);
            StatusClass::Stuck
        } else {
            StatusClass::Active
        }
    }
}

/// Which scheduler profile a job is submitted under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobProfile {
    Main,
    Test,
    Post,
}

impl fmt::Display for JobProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobProfile::Main => "main",
            JobProfile::Test => "test",
            JobProfile::Post => "post",
        };
        write!(f, "{}", name)
    }
}

/// One job to hand to the scheduler
///
/// Arguments may contain the `{jd}` placeholder, which the scheduler replaces
/// with the job's own directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub workdir: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    pub profile: JobProfile,
    /// Global run number, names the job directory when present
    pub number: Option<u64>,
}

impl JobRequest {
    pub fn new(workdir: impl Into<PathBuf>, executable: impl Into<String>, profile: JobProfile) -> Self {
        Self {
            workdir: workdir.into(),
            executable: executable.into(),
            args: Vec::new(),
            profile,
            number: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_number(mut self, number: u64) -> Self {
        self.number = Some(number);
        self
    }
}

/// Asynchronous supervision request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    pub workdir: PathBuf,
    pub job_id: u64,
    /// Tag of the document the job belongs to
    pub tag: i64,
    /// Command to run once the job reaches a restart-eligible state
    pub command: Option<String>,
}

/// Batch system submission
pub trait Scheduler {
    /// Submit a job and return its scheduler id
    fn submit(&self, request: &JobRequest) -> Result<u64>;
}

/// Batch system supervision
pub trait JobMonitor {
    /// Start supervising a job without blocking
    fn watch(&self, request: &WatchRequest) -> Result<()>;

    /// Block until the job reaches a final state or `timeout` elapses
    fn wait(&self, job_id: u64, timeout: Duration) -> Result<SchedulerState>;
}

//! Job submission and supervision contracts

mod gate;
mod monitor;

pub use gate::{clone_tree, run_args, test_run_args, Submission, SubmissionGate};
pub use monitor::{
    JobMonitor, JobProfile, JobRequest, Scheduler, SchedulerState, StatusClass, StuckDetector, WatchRequest,
};

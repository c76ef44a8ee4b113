//! Simulation Lifecycle Library
//!
//! A reusable library for driving long, checkpoint-based batch simulations
//! through repeated scheduler allocations until their timeline is finished.
//!
//! # Architecture
//!
//! The library is organized around one persisted document per working
//! directory:
//! - Interprets a templated simulation script into a timeline of named phases
//! - Generates the concrete script for each run of a phase
//! - Resolves the newest checkpoint against the timeline, discovering
//!   dynamically sized phases through signal files
//! - Submits exactly one job per restart, optionally after a blocking test run
//! - Hands the finished simulation to a post processor
//!
//! The library does NOT:
//! - Load configuration files
//! - Initialize logging
//! - Talk to a batch system directly
//! - Load plugins
//!
//! Those concerns live in the application layer (sim-lifecycle-cli), which
//! implements the [`Scheduler`], [`JobMonitor`], [`CheckpointConverter`] and
//! [`PostProcessor`] traits.
//!
//! # Example Usage
//!
//! ```no_run
//! use sim_lifecycle::{
//!     CheckpointConverter, JobMonitor, JobRequest, Orchestrator, OrchestratorConfig,
//!     RestartMode, RestartOptions, RestartOutcome, Result, Scheduler, SchedulerState,
//!     WatchRequest,
//! };
//! use std::path::Path;
//! use std::time::Duration;
//!
//! struct Batch;
//! impl Scheduler for Batch {
//!     fn submit(&self, _request: &JobRequest) -> Result<u64> {
//!         Ok(42)
//!     }
//! }
//!
//! struct Monitor;
//! impl JobMonitor for Monitor {
//!     fn watch(&self, _request: &WatchRequest) -> Result<()> {
//!         Ok(())
//!     }
//!     fn wait(&self, _job_id: u64, _timeout: Duration) -> Result<SchedulerState> {
//!         Ok(SchedulerState::Completed)
//!     }
//! }
//!
//! struct Converter;
//! impl CheckpointConverter for Converter {
//!     fn convert(&self, _checkpoint: &Path, _data_file: &Path) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let config = OrchestratorConfig::new("/scratch/run1")
//!     .add_variable("T", 450i64)
//!     .with_test_runs(true);
//! let orchestrator = Orchestrator::new(config, Box::new(Batch), Box::new(Monitor), Box::new(Converter));
//!
//! orchestrator.initialize(RestartMode::Multiple).unwrap();
//! match orchestrator.restart(&RestartOptions::default()).unwrap() {
//!     RestartOutcome::Submitted { job_id, phase, .. } => println!("job {} runs {}", job_id, phase),
//!     RestartOutcome::EndReached { last_step } => println!("done at {}", last_step),
//!     RestartOutcome::Generated { script, .. } => println!("generated {:?}", script),
//! }
//! ```

// Public modules
pub mod config;
pub mod expression;
pub mod orchestrator;
pub mod postprocess;
pub mod restart;
pub mod state;
pub mod submit;
pub mod template;
pub mod types;

// Re-export main types for convenience
pub use config::{Layout, OrchestratorConfig};
pub use expression::{evaluate, VariableEnvironment};
pub use orchestrator::{EndOutcome, Orchestrator, PhaseStatus, RestartOptions, RestartOutcome, StatusReport};
pub use postprocess::{EndOptions, PostProcessRequest, PostProcessor, SubmissionSpec};
pub use restart::{Checkpoint, CheckpointConverter, Resolution};
pub use state::{LifecycleDocument, Phase, RunRecord, StateStore, Timeline};
pub use submit::{
    JobMonitor, JobProfile, JobRequest, Scheduler, SchedulerState, StatusClass, StuckDetector, WatchRequest,
};
pub use types::{LifecycleError, LifecycleState, Number, RestartMode, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

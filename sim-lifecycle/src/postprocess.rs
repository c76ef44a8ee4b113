//! Post-processing hand-off
//!
//! Once the timeline is complete the document is handed to a
//! [`PostProcessor`], which decides what job computes the observables. The
//! library only validates the document beforehand and submits what the
//! processor returns.

use crate::config::Layout;
use crate::state::LifecycleDocument;
use crate::types::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a post processor gets to see
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessRequest {
    /// Working directory of the simulation
    pub cwd: PathBuf,
    /// Snapshot of the document at hand-off time
    pub state: LifecycleDocument,
    /// Free-form arguments passed through from the caller
    pub args: Vec<String>,
    /// Nodes times tasks per node of the post-processing allocation
    pub worker_count: u32,
}

/// The job a post processor wants submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionSpec {
    pub executable: String,
    #[serde(default)]
    pub arguments: String,
    /// Command run by the monitor once the post-processing job finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_arguments: Option<String>,
}

impl SubmissionSpec {
    /// `poll_executable poll_arguments`, if a poll executable was given
    pub fn poll_command(&self) -> Option<String> {
        let exe = self.poll_executable.as_deref().filter(|e| !e.is_empty())?;
        match self.poll_arguments.as_deref().filter(|a| !a.is_empty()) {
            Some(args) => Some(format!("{} {}", exe, args)),
            None => Some(exe.to_string()),
        }
    }
}

/// Computes the post-processing job for a finished simulation
pub trait PostProcessor {
    fn end(&self, request: &PostProcessRequest) -> Result<SubmissionSpec>;
}

/// Options of the `end` operation
#[derive(Debug, Clone, Default)]
pub struct EndOptions {
    /// Skip the consistency checks
    pub anyway: bool,
    /// Post-process an intermediate result without touching the lifecycle state
    pub ongoing: bool,
    /// Passed through to the post processor
    pub args: Vec<String>,
    pub worker_count: u32,
}

/// Check that every phase's run counter matches its records
pub fn runs_consistent(document: &LifecycleDocument) -> bool {
    let mismatches = document.run_count_mismatches();
    for (phase, present, real) in &mismatches {
        log::warn!("Phase '{}' runs: present={}, real={}", phase, present, real);
    }
    mismatches.is_empty()
}

/// Check that every recorded run left its dump behind
pub fn dumps_present(root: &Path, layout: &Layout, document: &LifecycleDocument) -> bool {
    let mut ok = true;
    for phase in document.timeline.phases() {
        for run in 0..phase.runs {
            let Some(record) = phase.record(run) else {
                continue;
            };
            let dump = root.join(&layout.dumps).join(&record.dump_tag);
            log::debug!("Checking {}:{}:{:?}", phase.name, run, dump);
            if !dump.exists() {
                log::warn!("Dump file {:?} does not exist", dump);
                ok = false;
            }
        }
    }
    ok
}

/// Run both consistency checks
pub fn validate(root: &Path, layout: &Layout, document: &LifecycleDocument) -> Result<()> {
    let runs = runs_consistent(document);
    let dumps = dumps_present(root, layout, document);
    if runs && dumps {
        Ok(())
    } else {
        log::error!("Stopped, state is inconsistent");
        Err(LifecycleError::InconsistentTimeline(
            "Run records or dumps do not match the document".to_string(),
        ))
    }
}

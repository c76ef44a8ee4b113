//! Submission gate
//!
//! Turns a generated script into exactly one scheduler job: an optional
//! blocking test run in a throwaway clone of the working directory, the real
//! submission, bookkeeping in the document, and the hand-off to the monitor.

use super::monitor::{JobMonitor, JobProfile, JobRequest, Scheduler, SchedulerState, WatchRequest};
use crate::config::OrchestratorConfig;
use crate::state::{LifecycleDocument, RunRecord};
use crate::types::{LifecycleError, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A job recorded in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: u64,
    pub phase: String,
    pub run: u32,
}

/// Simulator arguments of a test run: `test = 0` makes the script skip the real work
pub fn test_run_args(script: &str) -> Vec<String> {
    ["-v", "test", "0", "-echo", "both", "-log", "{jd}/log.lammps", "-in", script]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Simulator arguments of a real run
pub fn run_args(script: &str) -> Vec<String> {
    [
        "-v",
        "test",
        "1",
        "-nonbuf",
        "-echo",
        "both",
        "-log",
        "{jd}/log.lammps",
        "-in",
        script,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Copy `from` into `to`, leaving the top-level `excluded` directories empty
///
/// Symlinks are followed, so linked directories are cloned with their contents.
pub fn clone_tree(from: &Path, to: &Path, excluded: &[&str]) -> Result<()> {
    fs::create_dir(to)?;
    let is_excluded = |entry: &DirEntry| {
        entry.depth() == 1
            && entry.file_type().is_dir()
            && excluded.iter().any(|ex| entry.file_name().to_str() == Some(*ex))
    };

    let walker = WalkDir::new(from).min_depth(1).follow_links(true).into_iter();
    for entry in walker.filter_entry(|e| !is_excluded(e)) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }

    for ex in excluded {
        log::trace!("Not copying {:?}", from.join(ex));
        fs::create_dir_all(to.join(ex))?;
    }
    Ok(())
}

/// Submits jobs on behalf of the orchestrator
pub struct SubmissionGate<'a> {
    config: &'a OrchestratorConfig,
    scheduler: &'a dyn Scheduler,
    monitor: &'a dyn JobMonitor,
}

impl<'a> SubmissionGate<'a> {
    pub fn new(config: &'a OrchestratorConfig, scheduler: &'a dyn Scheduler, monitor: &'a dyn JobMonitor) -> Self {
        Self {
            config,
            scheduler,
            monitor,
        }
    }

    fn relative<'p>(&self, script: &'p Path) -> &'p Path {
        script.strip_prefix(&self.config.workdir).unwrap_or(script)
    }

    /// Run the script once in a sibling clone and block until it finishes
    ///
    /// Anything but `COMPLETED` fails with `TestRunFailed`. The clone is
    /// removed on success and kept for inspection otherwise.
    pub fn test_run(&self, script: &Path) -> Result<()> {
        let root = &self.config.workdir;
        let layout = &self.config.layout;
        let parent = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".."));
        let clone = parent.join(format!("{}{}", layout.tmp_dir_prefix, Utc::now().timestamp()));

        log::debug!("Copying {:?} to {:?}", root, clone);
        clone_tree(root, &clone, &layout.clone_excluded())?;

        let relative = self.relative(script).display().to_string();
        let request = JobRequest::new(&clone, &self.config.simulator, JobProfile::Test)
            .with_args(test_run_args(&relative));

        log::info!("Submitting test run and waiting for it to complete");
        let job_id = self.scheduler.submit(&request)?;
        log::info!("Submitted test job id: {}", job_id);

        let state = self
            .monitor
            .wait(job_id, self.config.test_run_timeout())
            .map_err(|e| {
                log::error!("Polling the test run failed: {}", e);
                LifecycleError::TestRunFailed(format!("job {}: {}", job_id, e))
            })?;
        log::debug!("Polling complete, result state: {}", state);

        if state != SchedulerState::Completed {
            log::error!("Test run ended in state {}, clone kept at {:?}", state, clone);
            return Err(LifecycleError::TestRunFailed(format!(
                "job {} ended in state {}",
                job_id, state
            )));
        }

        log::info!("Test run is OK, removing {:?}", clone);
        if let Err(e) = fs::remove_dir_all(&clone) {
            log::warn!("Failed to remove test run directory {:?}: {}", clone, e);
        }
        Ok(())
    }

    /// Submit one run of `phase` and record it in the document
    ///
    /// `poll` decides whether the job is handed to the monitor (it is also
    /// subject to the configuration's auto-poll switch).
    pub fn submit(&self, document: &mut LifecycleDocument, phase: &str, script: &Path, poll: bool) -> Result<Submission> {
        if self.config.test_runs {
            self.test_run(script)?;
        }

        let run = document
            .timeline
            .get(phase)
            .map(|p| p.runs)
            .ok_or_else(|| LifecycleError::InconsistentTimeline(format!("Unknown phase '{}'", phase)))?;

        let run_no = document.run_counter + 1;
        let relative = self.relative(script).display().to_string();
        let request = JobRequest::new(&self.config.workdir, &self.config.simulator, JobProfile::Main)
            .with_args(run_args(&relative))
            .with_number(run_no);
        let job_id = self.scheduler.submit(&request)?;
        log::info!("Submitted job {} for phase '{}' run {}", job_id, phase, run);

        let record = RunRecord {
            job_id: Some(job_id),
            input_file_name: Some(relative),
            dump_tag: format!("{}{}", phase, run),
            run_no: Some(run_no),
            last_step: None,
        };
        if let Some(p) = document.timeline.get_mut(phase) {
            p.records.insert(run.to_string(), record);
            p.runs += 1;
        }
        document.run_counter = run_no;

        if poll && self.config.auto_poll {
            let watch = WatchRequest {
                workdir: self.config.workdir.clone(),
                job_id,
                tag: document.tag,
                command: self.config.restart_command.clone(),
            };
            // Job is queued already, the hand-off only warns
            if let Err(e) = self.monitor.watch(&watch) {
                log::warn!("Could not hand job {} to the monitor: {}", job_id, e);
            }
        }

        Ok(Submission {
            job_id,
            phase: phase.to_string(),
            run,
        })
    }
}

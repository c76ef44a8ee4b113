//! Main orchestrator API
//!
//! This module provides the primary interface of the library. The
//! [`Orchestrator`] owns the configuration and the external collaborators and
//! exposes the lifecycle operations: `initialize`, `restart`, `end` and
//! `status`. Every mutating operation runs inside a
//! [`StateStore::transaction`].

use crate::config::OrchestratorConfig;
use crate::postprocess::{self, EndOptions, PostProcessRequest, PostProcessor};
use crate::restart::{self, CheckpointConverter, Resolution};
use crate::state::{LifecycleDocument, LockGuard, StateStore, INITIAL_PHASE};
use crate::submit::{JobMonitor, JobProfile, JobRequest, Scheduler, SubmissionGate, WatchRequest};
use crate::template;
use crate::types::{LifecycleError, LifecycleState, RestartMode, Result};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Options of the `restart` operation
#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    /// Restart from this checkpoint step instead of the newest (multiple-file mode)
    pub step_override: Option<i64>,
    /// Resolve and generate the script, but submit nothing
    pub generate_only: bool,
    /// Do not hand the submitted job to the monitor
    pub no_auto: bool,
}

/// Result of a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A job was submitted for the current phase
    Submitted { job_id: u64, phase: String, run: u32 },
    /// The script was generated but not submitted
    Generated { phase: String, run: u32, script: PathBuf },
    /// The timeline is finished, the document is now `completed`
    EndReached { last_step: i64 },
}

/// Result of the post-processing hand-off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOutcome {
    pub job_id: u64,
    pub poll_command: Option<String>,
}

/// Bounds and run count of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    pub name: String,
    pub begin_step: i64,
    pub end_step: Option<i64>,
    pub runs: u32,
}

/// Read-only summary of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub tag: i64,
    pub restart_mode: RestartMode,
    pub restart_count: u32,
    pub run_counter: u64,
    pub restart_cadence: i64,
    pub post_process_job_id: Option<u64>,
    pub phases: Vec<PhaseStatus>,
}

impl StatusReport {
    pub fn from_document(document: &LifecycleDocument) -> Self {
        Self {
            state: document.state,
            tag: document.tag,
            restart_mode: document.restart_mode,
            restart_count: document.restart_count,
            run_counter: document.run_counter,
            restart_cadence: document.restart_cadence,
            post_process_job_id: document.post_process_job_id,
            phases: document
                .timeline
                .phases()
                .iter()
                .map(|p| PhaseStatus {
                    name: p.name.clone(),
                    begin_step: p.begin_step,
                    end_step: p.end_step,
                    runs: p.runs,
                })
                .collect(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State:         {}", self.state)?;
        writeln!(f, "Tag:           {}", self.tag)?;
        writeln!(f, "Restart mode:  {}", self.restart_mode)?;
        writeln!(f, "Restarts:      {}", self.restart_count)?;
        writeln!(f, "Runs:          {}", self.run_counter)?;
        writeln!(f, "Cadence:       {}", self.restart_cadence)?;
        if let Some(id) = self.post_process_job_id {
            writeln!(f, "Post job:      {}", id)?;
        }
        writeln!(f, "Phases:")?;
        for phase in &self.phases {
            let end = phase
                .end_step
                .map(|e| e.to_string())
                .unwrap_or_else(|| "?".to_string());
            writeln!(
                f,
                "  {:<16} {:>10} .. {:<10} runs={}",
                phase.name, phase.begin_step, end, phase.runs
            )?;
        }
        Ok(())
    }
}

/// The main orchestrator struct - entry point for all lifecycle operations
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: StateStore,
    scheduler: Box<dyn Scheduler>,
    monitor: Box<dyn JobMonitor>,
    converter: Box<dyn CheckpointConverter>,
    post_processor: Option<Box<dyn PostProcessor>>,
}

impl Orchestrator {
    /// Create an orchestrator for the configured working directory
    pub fn new(
        config: OrchestratorConfig,
        scheduler: Box<dyn Scheduler>,
        monitor: Box<dyn JobMonitor>,
        converter: Box<dyn CheckpointConverter>,
    ) -> Self {
        let store = StateStore::new(config.workdir.clone(), config.layout.clone());
        Self {
            config,
            store,
            scheduler,
            monitor,
            converter,
            post_processor: None,
        }
    }

    /// Builder method: set the post processor used by [`Orchestrator::end`]
    pub fn with_post_processor(mut self, processor: Box<dyn PostProcessor>) -> Self {
        self.post_processor = Some(processor);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Interpret the template and create the document
    ///
    /// The template is interpreted once, the initial script is generated from
    /// it and interpreted again, so the timeline reflects the caller's values.
    /// The generated script is removed afterwards; the first `restart`
    /// regenerates it.
    pub fn initialize(&self, restart_mode: RestartMode) -> Result<LifecycleDocument> {
        let root = &self.config.workdir;
        let layout = &self.config.layout;

        if self.store.exists() {
            return Err(LifecycleError::InvalidState(format!(
                "State file {:?} already exists",
                self.store.path()
            )));
        }

        let template_path = layout.template_path(root);
        if !template_path.exists() {
            log::error!("Template file {:?} was not found, unable to proceed", template_path);
        }
        let source = fs::read_to_string(&template_path)?;

        for dir in layout.managed_dirs() {
            fs::create_dir_all(root.join(dir))?;
        }

        let mut document = LifecycleDocument::new(
            Utc::now().timestamp(),
            restart_mode,
            self.config.user_variables.clone(),
        );
        let _lock = LockGuard::acquire(&layout.lock_path(root, document.tag))?;

        log::info!("Processing 1st stage: template file");
        if let Err(e) = template::interpret(&source, &mut document) {
            self.store.write_diagnostics(&document, &e);
            return Err(e);
        }

        log::info!("Generating initial script");
        let script = template::generate(root, layout, &document, INITIAL_PHASE, 0, None)?;
        let generated = fs::read_to_string(&script)?;

        log::info!("Processing 2nd stage: generated script");
        if let Err(e) = template::interpret(&generated, &mut document) {
            self.store.write_diagnostics(&document, &e);
            return Err(e);
        }
        fs::remove_file(&script)?;
        if document.restart_mode == RestartMode::None {
            log::warn!("No checkpoint directive found, restarts will fail");
        }

        document.state = LifecycleState::FullyInitialized;
        self.store.save(&document)?;
        log::info!("Initialization complete");
        Ok(document)
    }

    /// Start or continue the simulation
    ///
    /// From `fully_initialized` this is the first submission of the initial
    /// phase. Otherwise the newest checkpoint is resolved against the
    /// timeline: either the current phase gets a new run or, when the
    /// timeline is finished, the document becomes `completed`.
    pub fn restart(&self, options: &RestartOptions) -> Result<RestartOutcome> {
        let root = &self.config.workdir;
        let layout = &self.config.layout;
        let gate = SubmissionGate::new(&self.config, self.scheduler.as_ref(), self.monitor.as_ref());

        self.store.transaction(|document| {
            document.state.ensure_restartable()?;

            let (phase, checkpoint) = if document.state == LifecycleState::FullyInitialized {
                document.state = LifecycleState::Started;
                (INITIAL_PHASE.to_string(), None)
            } else {
                let checkpoint = restart::locate(root, layout, document, self.converter.as_ref(), options.step_override)?;
                log::info!("Last step: {}", checkpoint.step);

                if document.state == LifecycleState::Started {
                    document.restart_count = 1;
                    document.state = LifecycleState::Restarted;
                } else {
                    document.restart_count += 1;
                }

                match restart::resolve(root, layout, document, checkpoint.step)? {
                    Resolution::EndReached => {
                        document.state = LifecycleState::Completed;
                        log::info!("End was reached, exiting...");
                        return Ok(RestartOutcome::EndReached {
                            last_step: checkpoint.step,
                        });
                    }
                    Resolution::Current(phase) => (phase, Some(checkpoint.relative)),
                }
            };

            let run = document
                .timeline
                .get(&phase)
                .map(|p| p.runs)
                .ok_or_else(|| LifecycleError::InconsistentTimeline(format!("Unknown phase '{}'", phase)))?;

            log::info!("Generating script for '{}' run {}", phase, run);
            let script = template::generate(root, layout, document, &phase, run, checkpoint.as_deref())?;

            if options.generate_only {
                log::info!("Generate only, not submitting");
                return Ok(RestartOutcome::Generated { phase, run, script });
            }

            let submission = gate.submit(document, &phase, &script, !options.no_auto)?;
            Ok(RestartOutcome::Submitted {
                job_id: submission.job_id,
                phase: submission.phase,
                run: submission.run,
            })
        })
    }

    /// Hand a finished simulation to the post processor and submit its job
    pub fn end(&self, options: &EndOptions) -> Result<EndOutcome> {
        let root = &self.config.workdir;
        let layout = &self.config.layout;

        let processor = self
            .post_processor
            .as_ref()
            .ok_or_else(|| LifecycleError::PostProcessor("No post processor configured".to_string()))?;

        self.store.transaction(|document| {
            document.state.ensure_can_end(options.ongoing)?;

            if !options.anyway {
                postprocess::validate(root, layout, document)?;
            }

            if !options.ongoing {
                document.state = LifecycleState::PostProcessorCalled;
            }

            let request = PostProcessRequest {
                cwd: root.clone(),
                state: document.clone(),
                args: options.args.clone(),
                worker_count: options.worker_count,
            };
            log::info!("Calling post processor with {} workers", options.worker_count);
            let spec = processor.end(&request).map_err(|e| {
                log::error!("Post processor raised an error: {}", e);
                e
            })?;

            log::info!("Post processor returned, submitting {}", spec.executable);
            let mut job = JobRequest::new(root, &spec.executable, JobProfile::Post);
            if !spec.arguments.is_empty() {
                job = job.with_args([spec.arguments.clone()]);
            }
            let job_id = self.scheduler.submit(&job)?;

            if !options.ongoing {
                document.state = LifecycleState::PostProcessDone;
            }
            document.post_process_job_id = Some(job_id);

            let poll_command = spec.poll_command();
            if let Some(command) = &poll_command {
                if self.config.auto_poll {
                    let watch = WatchRequest {
                        workdir: root.clone(),
                        job_id,
                        tag: document.tag,
                        command: Some(command.clone()),
                    };
                    if let Err(e) = self.monitor.watch(&watch) {
                        log::warn!("Could not hand job {} to the monitor: {}", job_id, e);
                    }
                }
            }

            Ok(EndOutcome { job_id, poll_command })
        })
    }

    /// Summarize the document without taking the lock
    pub fn status(&self) -> Result<StatusReport> {
        let document = self.store.load()?;
        Ok(StatusReport::from_document(&document))
    }
}

//! End-to-end lifecycle tests with in-memory collaborators

use sim_lifecycle::{
    CheckpointConverter, EndOptions, JobMonitor, JobProfile, JobRequest, LifecycleError, LifecycleState,
    Orchestrator, OrchestratorConfig, PostProcessRequest, PostProcessor, RestartMode, RestartOptions,
    RestartOutcome, Result, Scheduler, SchedulerState, SubmissionSpec, WatchRequest,
};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct Recorder {
    submitted: RefCell<Vec<JobRequest>>,
    watched: RefCell<Vec<WatchRequest>>,
    post_requests: RefCell<Vec<PostProcessRequest>>,
}

struct FakeScheduler(Rc<Recorder>);

impl Scheduler for FakeScheduler {
    fn submit(&self, request: &JobRequest) -> Result<u64> {
        let mut submitted = self.0.submitted.borrow_mut();
        submitted.push(request.clone());
        Ok(5000 + submitted.len() as u64)
    }
}

struct FakeMonitor {
    recorder: Rc<Recorder>,
    outcome: SchedulerState,
}

impl JobMonitor for FakeMonitor {
    fn watch(&self, request: &WatchRequest) -> Result<()> {
        self.recorder.watched.borrow_mut().push(request.clone());
        Ok(())
    }

    fn wait(&self, _job_id: u64, _timeout: Duration) -> Result<SchedulerState> {
        Ok(self.outcome)
    }
}

/// Writes a data-file header whose timestep is the checkpoint's content
struct HeaderConverter;

impl CheckpointConverter for HeaderConverter {
    fn convert(&self, checkpoint: &Path, data_file: &Path) -> Result<()> {
        let step = fs::read_to_string(checkpoint)?;
        fs::write(
            data_file,
            format!(
                "LAMMPS data file via write_data, version 2 Aug 2023, timestep = {}, units = lj\n\nAtoms\n",
                step.trim()
            ),
        )?;
        Ok(())
    }
}

struct FakePostProcessor(Rc<Recorder>);

impl PostProcessor for FakePostProcessor {
    fn end(&self, request: &PostProcessRequest) -> Result<SubmissionSpec> {
        self.0.post_requests.borrow_mut().push(request.clone());
        Ok(SubmissionSpec {
            executable: "python3".to_string(),
            arguments: "-m observables".to_string(),
            poll_executable: Some("notify".to_string()),
            poll_arguments: Some("--done".to_string()),
        })
    }
}

const MULTIPLE_TEMPLATE: &str = "\
# part: start
variable T equal 300
variable steps equal 1000
read_data system.data
restart 500 restarts/restart.*
# part: save
dump d1 all custom 100 out.dump id x y z
# part: run
# label: A
run ${steps}
# label: B
run 2000
";

const TWO_TEMPLATE: &str = "\
restart 500 restarts/ckpt.a restarts/ckpt.b
# label: A
run 5000
";

const ONE_TEMPLATE: &str = "\
restart 500 restarts/state.rst
# label: A
run 5000
";

const TWO_DYNAMIC_TEMPLATE: &str = "\
restart 100 restarts/restart.*
# label: HEAT
label loop_h
run 100
if \"${temp} > 300\" then \"jump SELF loop_h\"
# label: HOLD
run 200
# label: COOL
label loop_c
run 100
if \"${temp} < 300\" then \"jump SELF loop_c\"
# label: C
run 300
";

const DYNAMIC_TEMPLATE: &str = "\
restart 100 restarts/restart.*
# label: COOL
label loop_c
run 100
if \"${temp} < 300\" then \"jump SELF loop_c\"
# label: C
run 200
";

struct Harness {
    dir: TempDir,
    recorder: Rc<Recorder>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(template: &str, configure: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig) -> Self {
        Self::with_outcome(template, SchedulerState::Completed, configure)
    }

    fn with_outcome(
        template: &str,
        outcome: SchedulerState,
        configure: impl FnOnce(OrchestratorConfig) -> OrchestratorConfig,
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("run");
        let config = configure(OrchestratorConfig::new(&root).with_restart_command("sim-lifecycle restart"));
        fs::create_dir_all(root.join(&config.layout.in_templates)).unwrap();
        fs::write(config.layout.template_path(&root), template).unwrap();

        let recorder = Rc::new(Recorder::default());
        let orchestrator = Orchestrator::new(
            config,
            Box::new(FakeScheduler(recorder.clone())),
            Box::new(FakeMonitor {
                recorder: recorder.clone(),
                outcome,
            }),
            Box::new(HeaderConverter),
        )
        .with_post_processor(Box::new(FakePostProcessor(recorder.clone())));

        Self {
            dir,
            recorder,
            orchestrator,
        }
    }

    fn root(&self) -> std::path::PathBuf {
        self.dir.path().join("run")
    }

    fn checkpoint(&self, name: &str, content: &str) {
        fs::write(self.root().join("restarts").join(name), content).unwrap();
    }

    fn restart(&self) -> Result<RestartOutcome> {
        self.orchestrator.restart(&RestartOptions::default())
    }

    fn state_text(&self) -> String {
        fs::read_to_string(self.orchestrator.store().path()).unwrap()
    }
}

fn submitted_phase(outcome: RestartOutcome) -> (String, u32) {
    match outcome {
        RestartOutcome::Submitted { phase, run, .. } => (phase, run),
        other => panic!("expected a submission, got {:?}", other),
    }
}

#[test]
fn test_full_cycle_multiple_mode() {
    let h = Harness::new(MULTIPLE_TEMPLATE, |c| c);
    h.orchestrator.initialize(RestartMode::Multiple).unwrap();

    // First submission runs the initial phase
    assert_eq!(submitted_phase(h.restart().unwrap()), ("START".to_string(), 0));
    assert!(h.root().join("in_files/START0.in").exists());

    h.checkpoint("restart.400", "");
    h.checkpoint("restart.500", "");
    assert_eq!(submitted_phase(h.restart().unwrap()), ("A".to_string(), 0));
    let remaining: Vec<_> = fs::read_dir(h.root().join("restarts"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(remaining, vec!["restart.500"]);

    let script = fs::read_to_string(h.root().join("in_files/A0.in")).unwrap();
    assert!(script.starts_with("read_restart restarts/restart.500\nrun 0\n"));
    assert!(!script.contains("read_data"));
    assert!(script.contains("dump d1 all custom 100 dumps/A0"));

    h.checkpoint("restart.1400", "");
    assert_eq!(submitted_phase(h.restart().unwrap()), ("B".to_string(), 0));

    let doc = h.orchestrator.store().load().unwrap();
    assert_eq!(doc.state, LifecycleState::Restarted);
    assert_eq!(doc.restart_count, 2);
    assert_eq!(doc.run_counter, 3);
    assert_eq!(doc.timeline.get("START").unwrap().record(0).unwrap().last_step, Some(500));
    assert_eq!(doc.timeline.get("A").unwrap().record(0).unwrap().last_step, Some(1400));

    h.checkpoint("restart.2750", "");
    assert_eq!(
        h.restart().unwrap(),
        RestartOutcome::EndReached { last_step: 2750 }
    );
    let doc = h.orchestrator.store().load().unwrap();
    assert_eq!(doc.state, LifecycleState::Completed);
    // Back-fill targets the latest run before the current phase
    assert_eq!(doc.timeline.get("A").unwrap().record(0).unwrap().last_step, Some(2750));
    assert_eq!(doc.timeline.get("B").unwrap().record(0).unwrap().last_step, None);

    // A completed simulation cannot be restarted
    assert!(matches!(h.restart(), Err(LifecycleError::InvalidState(_))));

    let main_jobs = h.recorder.submitted.borrow().len();
    assert_eq!(main_jobs, 3);
    assert_eq!(h.recorder.watched.borrow().len(), 3);

    // Hand-off requires every run's dump
    let options = EndOptions {
        worker_count: 64,
        ..EndOptions::default()
    };
    assert!(matches!(
        h.orchestrator.end(&options),
        Err(LifecycleError::InconsistentTimeline(_))
    ));
    for dump in ["START0", "A0", "B0"] {
        fs::write(h.root().join("dumps").join(dump), "").unwrap();
    }
    let ended = h.orchestrator.end(&options).unwrap();
    assert_eq!(ended.poll_command.as_deref(), Some("notify --done"));

    let doc = h.orchestrator.store().load().unwrap();
    assert_eq!(doc.state, LifecycleState::PostProcessDone);
    assert_eq!(doc.post_process_job_id, Some(ended.job_id));

    let requests = h.recorder.post_requests.borrow();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].worker_count, 64);
    assert_eq!(requests[0].state.state, LifecycleState::PostProcessorCalled);

    let submitted = h.recorder.submitted.borrow();
    let post = submitted.last().unwrap();
    assert_eq!(post.profile, JobProfile::Post);
    assert_eq!(post.executable, "python3");
    assert_eq!(h.recorder.watched.borrow().last().unwrap().command.as_deref(), Some("notify --done"));
}

#[test]
fn test_restart_with_held_lock_changes_nothing() {
    let h = Harness::new(MULTIPLE_TEMPLATE, |c| c);
    let doc = h.orchestrator.initialize(RestartMode::Multiple).unwrap();
    let before = h.state_text();

    let lock = h.orchestrator.config().layout.lock_path(&h.root(), doc.tag);
    fs::write(&lock, "").unwrap();

    assert!(matches!(h.restart(), Err(LifecycleError::LockHeld(_))));
    assert!(matches!(h.restart(), Err(LifecycleError::LockHeld(_))));
    assert_eq!(h.state_text(), before);
    assert!(h.recorder.submitted.borrow().is_empty());
    assert!(lock.exists());

    fs::remove_file(&lock).unwrap();
    assert!(h.restart().is_ok());
    assert!(!lock.exists());
}

#[test]
fn test_two_file_mode_keeps_newer() {
    let h = Harness::new(TWO_TEMPLATE, |c| c);
    let doc = h.orchestrator.initialize(RestartMode::None).unwrap();
    assert_eq!(doc.restart_mode, RestartMode::Two);
    assert_eq!(doc.restart_file_basename, "ckpt");
    h.restart().unwrap();

    h.checkpoint("ckpt.a", "500");
    h.checkpoint("ckpt.b", "700");
    assert_eq!(submitted_phase(h.restart().unwrap()), ("A".to_string(), 0));
    assert!(!h.root().join("restarts/ckpt.a").exists());
    assert!(h.root().join("restarts/ckpt.b").exists());

    let script = fs::read_to_string(h.root().join("in_files/A0.in")).unwrap();
    assert!(script.starts_with("read_restart restarts/ckpt.b\n"));
    assert!(script.contains("restart 500 restarts/ckpt.a restarts/ckpt.b"));
}

#[test]
fn test_one_file_mode_from_template() {
    let h = Harness::new(ONE_TEMPLATE, |c| c);
    let doc = h.orchestrator.initialize(RestartMode::None).unwrap();
    assert_eq!(doc.restart_mode, RestartMode::One);
    assert_eq!(doc.restart_file_basename, "state.rst");
    assert_eq!(h.orchestrator.store().load().unwrap().restart_mode, RestartMode::One);
    h.restart().unwrap();

    h.checkpoint("state.rst", "700");
    assert_eq!(submitted_phase(h.restart().unwrap()), ("A".to_string(), 0));
    assert!(h.root().join("restarts/state.rst").exists());

    let script = fs::read_to_string(h.root().join("in_files/A0.in")).unwrap();
    assert!(script.starts_with("read_restart restarts/state.rst\n"));
    assert!(script.contains("restart 500 restarts/state.rst"));
}

#[test]
fn test_signal_file_resolves_dynamic_phase() {
    let h = Harness::new(DYNAMIC_TEMPLATE, |c| c.with_auto_poll(false));
    h.orchestrator.initialize(RestartMode::Multiple).unwrap();
    h.restart().unwrap();

    h.checkpoint("restart.50", "");
    fs::write(h.root().join("signals/COOL.signal"), "30\n").unwrap();
    assert_eq!(submitted_phase(h.restart().unwrap()), ("COOL".to_string(), 0));
    assert!(!h.root().join("signals/COOL.signal").exists());

    fs::write(h.root().join("signals/COOL.signal"), "5000\n").unwrap();
    assert_eq!(submitted_phase(h.restart().unwrap()), ("COOL".to_string(), 1));

    let doc = h.orchestrator.store().load().unwrap();
    let cool = doc.timeline.get("COOL").unwrap();
    assert_eq!(cool.end_step, Some(5000));
    let c = doc.timeline.get("C").unwrap();
    assert_eq!((c.begin_step, c.end_step), (5000, Some(5200)));
    assert!(h.recorder.watched.borrow().is_empty());
}

#[test]
fn test_failed_test_run_leaves_document() {
    let h = Harness::with_outcome(MULTIPLE_TEMPLATE, SchedulerState::Timeout, |c| c.with_test_runs(true));
    h.orchestrator.initialize(RestartMode::Multiple).unwrap();
    let before = h.state_text();

    assert!(matches!(h.restart(), Err(LifecycleError::TestRunFailed(_))));
    assert_eq!(h.state_text(), before);

    let submitted = h.recorder.submitted.borrow();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].profile, JobProfile::Test);
}

#[test]
fn test_generate_only_submits_nothing() {
    let h = Harness::new(MULTIPLE_TEMPLATE, |c| c);
    h.orchestrator.initialize(RestartMode::Multiple).unwrap();
    h.restart().unwrap();
    h.checkpoint("restart.1500", "");

    let options = RestartOptions {
        generate_only: true,
        ..RestartOptions::default()
    };
    match h.orchestrator.restart(&options).unwrap() {
        RestartOutcome::Generated { phase, run, script } => {
            assert_eq!((phase.as_str(), run), ("B", 0));
            assert!(script.exists());
        }
        other => panic!("expected generation only, got {:?}", other),
    }
    assert_eq!(h.recorder.submitted.borrow().len(), 1);
    assert_eq!(h.orchestrator.status().unwrap().state, LifecycleState::Restarted);
}

#[test]
fn test_step_override_requires_existing_checkpoint() {
    let h = Harness::new(MULTIPLE_TEMPLATE, |c| c);
    h.orchestrator.initialize(RestartMode::Multiple).unwrap();
    h.restart().unwrap();
    h.checkpoint("restart.600", "");
    h.checkpoint("restart.1200", "");

    let options = RestartOptions {
        step_override: Some(700),
        ..RestartOptions::default()
    };
    assert!(matches!(
        h.orchestrator.restart(&options),
        Err(LifecycleError::NoCheckpointFound(_))
    ));

    let options = RestartOptions {
        step_override: Some(600),
        ..RestartOptions::default()
    };
    assert_eq!(submitted_phase(h.orchestrator.restart(&options).unwrap()), ("A".to_string(), 0));
    assert!(h.root().join("restarts/restart.1200").exists());
}

#[test]
fn test_two_dynamic_phases_across_restarts() {
    let h = Harness::new(TWO_DYNAMIC_TEMPLATE, |c| c.with_auto_poll(false));
    h.orchestrator.initialize(RestartMode::None).unwrap();
    h.restart().unwrap();

    h.checkpoint("restart.150", "");
    fs::write(h.root().join("signals/HEAT.signal"), "3000\n").unwrap();
    assert_eq!(submitted_phase(h.restart().unwrap()), ("HEAT".to_string(), 0));

    let doc = h.orchestrator.store().load().unwrap();
    assert!(doc.timeline.is_contiguous());
    let cool = doc.timeline.get("COOL").unwrap();
    assert_eq!((cool.begin_step, cool.end_step), (3200, None));
    let c = doc.timeline.get("C").unwrap();
    assert_eq!((c.begin_step, c.end_step), (0, Some(300)));

    h.checkpoint("restart.3300", "");
    fs::write(h.root().join("signals/COOL.signal"), "6000\n").unwrap();
    assert_eq!(submitted_phase(h.restart().unwrap()), ("COOL".to_string(), 0));
    assert!(!h.root().join("signals/COOL.signal").exists());

    let doc = h.orchestrator.store().load().unwrap();
    assert!(doc.timeline.is_contiguous());
    assert!(doc.timeline.is_fully_known());
    let spans: Vec<_> = doc.timeline.phases()[1..]
        .iter()
        .map(|p| (p.name.as_str(), p.begin_step, p.end_step))
        .collect();
    assert_eq!(
        spans,
        [
            ("HEAT", 0, Some(3000)),
            ("HOLD", 3000, Some(3200)),
            ("COOL", 3200, Some(6000)),
            ("C", 6000, Some(6300)),
        ]
    );

    h.checkpoint("restart.6250", "");
    assert_eq!(h.restart().unwrap(), RestartOutcome::EndReached { last_step: 6250 });
    assert_eq!(h.orchestrator.store().load().unwrap().state, LifecycleState::Completed);
}

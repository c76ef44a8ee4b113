//! Job supervision via `sacct`
//!
//! `watch` detaches a `sim-lifecycle poll` process for the submitted job; the
//! poll loop invokes the restart command once the job reaches a
//! restart-eligible state. `wait` blocks in-process and backs the test runs.

use regex::Regex;
use sim_lifecycle::{JobMonitor, LifecycleError, Result, SchedulerState, StatusClass, StuckDetector, WatchRequest};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn sacct_regex() -> Result<&'static Regex> {
    static LINE: OnceLock<std::result::Result<Regex, String>> = OnceLock::new();
    LINE.get_or_init(|| Regex::new(r"^(\d+)\|([A-Za-z_]+[^|]*)\|").map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| LifecycleError::Scheduler(format!("Invalid sacct grammar: {}", e)))
}

/// State of `job_id` in `sacct -n -p -o jobid,state` output
///
/// Job steps (`123.batch`) are ignored. `None` means sacct has no record yet.
pub fn parse_sacct(output: &str, job_id: u64) -> Result<Option<SchedulerState>> {
    let regex = sacct_regex()?;
    for line in output.lines() {
        let Some(caps) = regex.captures(line.trim()) else {
            continue;
        };
        if caps[1].parse::<u64>().ok() != Some(job_id) {
            continue;
        }
        return match caps[2].parse::<SchedulerState>() {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                log::warn!("{}", e);
                Ok(Some(SchedulerState::Unknown))
            }
        };
    }
    Ok(None)
}

/// Settings of one poll loop
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub every: Duration,
    /// Consecutive identical observations before a job counts as stuck
    pub times_criteria: u32,
    /// Give up after this long
    pub timeout: Option<Duration>,
}

/// Final observation of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub state: SchedulerState,
    pub class: StatusClass,
}

/// Poll until the job reaches a final class
///
/// `query` reports the current state, `sleep` waits between polls. A job the
/// scheduler keeps not knowing about for `times_criteria` polls is Unknown.
pub fn poll_until_final<Q, S>(settings: &PollSettings, mut query: Q, mut sleep: S) -> Result<PollOutcome>
where
    Q: FnMut() -> Result<Option<SchedulerState>>,
    S: FnMut(Duration),
{
    let started = Instant::now();
    let mut detector = StuckDetector::new(settings.times_criteria);
    let mut missing = 0u32;

    loop {
        match query()? {
            Some(state) => {
                missing = 0;
                let class = detector.observe(state);
                log::debug!("Observed {} ({:?})", state, class);
                if class.is_final() {
                    return Ok(PollOutcome { state, class });
                }
            }
            None => {
                missing += 1;
                if missing >= settings.times_criteria {
                    return Ok(PollOutcome {
                        state: SchedulerState::Unknown,
                        class: StatusClass::Unknown,
                    });
                }
            }
        }

        if let Some(timeout) = settings.timeout {
            if started.elapsed() >= timeout {
                return Err(LifecycleError::Scheduler(format!(
                    "Timed out after {}s waiting for job",
                    timeout.as_secs()
                )));
            }
        }
        sleep(settings.every);
    }
}

/// [`JobMonitor`] backed by `sacct`
pub struct SacctMonitor {
    sacct: String,
    every: Duration,
    times_criteria: u32,
    /// Invocation used for detached poll processes
    program: PathBuf,
    config_file: PathBuf,
    logs_folder: String,
}

impl SacctMonitor {
    pub fn new(
        sacct: impl Into<String>,
        every: Duration,
        times_criteria: u32,
        program: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
        logs_folder: impl Into<String>,
    ) -> Self {
        Self {
            sacct: sacct.into(),
            every,
            times_criteria,
            program: program.into(),
            config_file: config_file.into(),
            logs_folder: logs_folder.into(),
        }
    }

    pub fn settings(&self, timeout: Option<Duration>) -> PollSettings {
        PollSettings {
            every: self.every,
            times_criteria: self.times_criteria,
            timeout,
        }
    }

    /// One sacct query
    pub fn query(&self, job_id: u64) -> Result<Option<SchedulerState>> {
        let output = Command::new(&self.sacct)
            .args(["-j", &job_id.to_string(), "-n", "-p", "-o", "jobid,state"])
            .output()
            .map_err(|e| LifecycleError::Scheduler(format!("Failed to run {}: {}", self.sacct, e)))?;
        if !output.status.success() {
            log::warn!("sacct failed: {}", String::from_utf8_lossy(&output.stderr).trim());
            return Ok(None);
        }
        parse_sacct(&String::from_utf8_lossy(&output.stdout), job_id)
    }

    /// Arguments of the detached poll process
    pub fn poll_args(&self, request: &WatchRequest) -> Vec<String> {
        let log_file = request
            .workdir
            .join(&self.logs_folder)
            .join(format!("poll_{}.log", request.job_id));
        let mut args = vec![
            "--workdir".to_string(),
            request.workdir.display().to_string(),
            "--config".to_string(),
            self.config_file.display().to_string(),
            "--log-file".to_string(),
            log_file.display().to_string(),
            "--no-screen".to_string(),
            "poll".to_string(),
            "--job-id".to_string(),
            request.job_id.to_string(),
            "--tag".to_string(),
            request.tag.to_string(),
        ];
        if let Some(command) = &request.command {
            args.push("--command".to_string());
            args.push(command.clone());
        }
        args
    }
}

impl JobMonitor for SacctMonitor {
    fn watch(&self, request: &WatchRequest) -> Result<()> {
        let child = Command::new(&self.program)
            .args(self.poll_args(request))
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        log::info!("Polling job {} in process {}", request.job_id, child.id());
        Ok(())
    }

    fn wait(&self, job_id: u64, timeout: Duration) -> Result<SchedulerState> {
        let outcome = poll_until_final(&self.settings(Some(timeout)), || self.query(job_id), std::thread::sleep)?;
        Ok(outcome.state)
    }
}

/// Run the restart command after a restart-eligible outcome
///
/// Returns false when the job ended in a state that needs attention.
pub fn handle_outcome(workdir: &Path, job_id: u64, outcome: PollOutcome, command: Option<&str>) -> Result<bool> {
    match outcome.class {
        StatusClass::RestartEligible => {
            log::info!("Job {} finished as {}", job_id, outcome.state);
            if let Some(command) = command {
                log::info!("Running: {}", command);
                let status = Command::new("sh").arg("-c").arg(command).current_dir(workdir).status()?;
                if !status.success() {
                    log::error!("Restart command exited with {}", status);
                    return Ok(false);
                }
            }
            Ok(true)
        }
        StatusClass::Stuck => {
            log::error!("Job {} is stuck in state {}", job_id, outcome.state);
            Ok(false)
        }
        _ => {
            log::error!("Job {} ended as {}, not restarting", job_id, outcome.state);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    const SACCT: &str = "4242|RUNNING|\n4242.batch|RUNNING|\n4242.0|RUNNING|\n";

    #[test]
    fn test_parse_sacct() {
        assert_eq!(parse_sacct(SACCT, 4242).unwrap(), Some(SchedulerState::Running));
        assert_eq!(parse_sacct(SACCT, 1).unwrap(), None);
        assert_eq!(parse_sacct("", 4242).unwrap(), None);
        assert_eq!(
            parse_sacct("77|CANCELLED by 1000|\n", 77).unwrap(),
            Some(SchedulerState::Cancelled)
        );
    }

    fn settings(times_criteria: u32) -> PollSettings {
        PollSettings {
            every: Duration::from_millis(0),
            times_criteria,
            timeout: None,
        }
    }

    fn scripted(states: Vec<Option<SchedulerState>>) -> impl FnMut() -> Result<Option<SchedulerState>> {
        let queue = RefCell::new(VecDeque::from(states));
        move || Ok(queue.borrow_mut().pop_front().flatten())
    }

    #[test]
    fn test_poll_until_completed() {
        let mut sleeps = 0;
        let outcome = poll_until_final(
            &settings(10),
            scripted(vec![
                Some(SchedulerState::Pending),
                Some(SchedulerState::Running),
                Some(SchedulerState::Completed),
            ]),
            |_| sleeps += 1,
        )
        .unwrap();
        assert_eq!(outcome.state, SchedulerState::Completed);
        assert_eq!(outcome.class, StatusClass::RestartEligible);
        assert_eq!(sleeps, 2);
    }

    #[test]
    fn test_poll_detects_stuck_job() {
        let outcome = poll_until_final(
            &settings(2),
            scripted(vec![Some(SchedulerState::Running); 5]),
            |_| {},
        )
        .unwrap();
        assert_eq!(outcome.class, StatusClass::Stuck);
    }

    #[test]
    fn test_poll_gives_up_on_missing_job() {
        let outcome = poll_until_final(&settings(3), scripted(vec![None; 5]), |_| {}).unwrap();
        assert_eq!(outcome.class, StatusClass::Unknown);
    }

    #[test]
    fn test_poll_timeout() {
        let timed = PollSettings {
            timeout: Some(Duration::from_millis(0)),
            ..settings(100)
        };
        let result = poll_until_final(&timed, scripted(vec![Some(SchedulerState::Running); 3]), |_| {});
        assert!(result.is_err());
    }

    #[test]
    fn test_poll_args() {
        let monitor = SacctMonitor::new("sacct", Duration::from_secs(5), 288, "/bin/sim-lifecycle", "/sim/sim-lifecycle.toml", "logs");
        let request = WatchRequest {
            workdir: PathBuf::from("/sim"),
            job_id: 99,
            tag: 1700000000,
            command: Some("sim-lifecycle restart".to_string()),
        };
        let args = monitor.poll_args(&request);
        assert!(args.contains(&"/sim/logs/poll_99.log".to_string()));
        let poll = args.iter().position(|a| a == "poll").unwrap();
        assert_eq!(args[poll + 1..], ["--job-id", "99", "--tag", "1700000000", "--command", "sim-lifecycle restart"]);
    }

    #[test]
    fn test_hard_failure_skips_restart() {
        let outcome = PollOutcome {
            state: SchedulerState::NodeFail,
            class: StatusClass::HardFailure,
        };
        assert!(!handle_outcome(Path::new("/"), 1, outcome, Some("false")).unwrap());
    }
}

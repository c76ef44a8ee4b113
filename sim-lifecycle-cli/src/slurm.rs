//! Slurm submission via `sbatch`
//!
//! Every job gets its own directory under the layout's `slurm` folder holding
//! the generated job file and the scheduler's stdout/stderr.

use crate::config::{SbatchConfig, SbatchProfile};
use regex::Regex;
use sim_lifecycle::{JobProfile, JobRequest, LifecycleError, Result, Scheduler};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

/// Placeholder in job arguments replaced by the job directory
pub const JOB_DIR_PLACEHOLDER: &str = "{jd}";

fn submitted_regex() -> Result<&'static Regex> {
    static SUBMITTED: OnceLock<std::result::Result<Regex, String>> = OnceLock::new();
    SUBMITTED
        .get_or_init(|| Regex::new(r"Submitted batch job (\d+)").map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| LifecycleError::Scheduler(format!("Invalid sbatch grammar: {}", e)))
}

/// Extract the job id from sbatch's stdout
pub fn parse_job_id(output: &str) -> Result<u64> {
    submitted_regex()?
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or_else(|| LifecycleError::Scheduler(format!("Unexpected sbatch output: {}", output.trim())))
}

/// Render the job file for one submission
pub fn render_job_script(profile: &SbatchProfile, job_name: &str, job_dir: &Path, workdir: &Path, command: &str) -> String {
    let mut lines = vec![
        "#!/usr/bin/env bash".to_string(),
        format!("#SBATCH --job-name={}", job_name),
        format!("#SBATCH --output={}/{}.out", job_dir.display(), job_name),
        format!("#SBATCH --error={}/{}.err", job_dir.display(), job_name),
        format!("#SBATCH --chdir={}", workdir.display()),
        "#SBATCH --begin=now".to_string(),
    ];
    if let Some(nodes) = profile.nodes {
        lines.push(format!("#SBATCH --nodes={}", nodes));
    }
    if let Some(ntpn) = profile.tasks_per_node {
        lines.push(format!("#SBATCH --ntasks-per-node={}", ntpn));
    }
    if let Some(partition) = &profile.partition {
        lines.push(format!("#SBATCH --partition={}", partition));
    }
    if let Some(time) = &profile.time {
        lines.push(format!("#SBATCH --time={}", time));
    }
    if !profile.exclude.is_empty() {
        lines.push(format!("#SBATCH --exclude={}", profile.exclude.join(",")));
    }
    lines.push(String::new());
    if let Some(pre) = &profile.pre {
        lines.push(pre.clone());
    }
    lines.push(format!("srun -u {}", command));
    lines.join("\n") + "\n"
}

/// [`Scheduler`] backed by the `sbatch` executable
pub struct SlurmScheduler {
    sbatch: String,
    jobs_folder: String,
    profiles: SbatchConfig,
}

impl SlurmScheduler {
    pub fn new(sbatch: impl Into<String>, jobs_folder: impl Into<String>, profiles: SbatchConfig) -> Self {
        Self {
            sbatch: sbatch.into(),
            jobs_folder: jobs_folder.into(),
            profiles,
        }
    }

    fn profile(&self, profile: JobProfile) -> Result<&SbatchProfile> {
        let selected = match profile {
            JobProfile::Main => Some(&self.profiles.main),
            JobProfile::Test => self.profiles.test.as_ref(),
            JobProfile::Post => self.profiles.post.as_ref(),
        };
        selected.ok_or_else(|| LifecycleError::Scheduler(format!("No [sbatch.{}] section configured", profile)))
    }

    /// Job name and directory for a request
    pub fn job_location(&self, request: &JobRequest) -> Result<(String, PathBuf)> {
        let profile = self.profile(request.profile)?;
        let base = profile.job_name.clone().unwrap_or_else(|| format!("sim-{}", request.profile));
        let name = match request.number {
            Some(number) => format!("{}{}", base, number),
            None => format!("{}_{}", base, chrono::Local::now().format("%Y%m%d%H%M%S")),
        };
        let dir = request.workdir.join(&self.jobs_folder).join(&name);
        Ok((name, dir))
    }

    /// Write the job file and return its path
    pub fn prepare(&self, request: &JobRequest) -> Result<PathBuf> {
        let profile = self.profile(request.profile)?;
        let (name, dir) = self.job_location(request)?;
        fs::create_dir_all(&dir)?;

        let jd = dir.display().to_string();
        let mut command = vec![request.executable.clone()];
        command.extend(request.args.iter().map(|a| a.replace(JOB_DIR_PLACEHOLDER, &jd)));

        let script = render_job_script(profile, &name, &dir, &request.workdir, &command.join(" "));
        let path = dir.join(format!("{}.job", name));
        fs::write(&path, script)?;
        Ok(path)
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, request: &JobRequest) -> Result<u64> {
        let job_file = self.prepare(request)?;
        log::debug!("Submitting {:?} via {}", job_file, self.sbatch);

        let output = Command::new(&self.sbatch)
            .arg(&job_file)
            .current_dir(&request.workdir)
            .output()
            .map_err(|e| LifecycleError::Scheduler(format!("Failed to run {}: {}", self.sbatch, e)))?;
        if !output.status.success() {
            return Err(LifecycleError::Scheduler(format!(
                "sbatch failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let job_id = parse_job_id(&String::from_utf8_lossy(&output.stdout))?;
        log::info!("Submitted {} job {} ({:?})", request.profile, job_id, job_file);
        Ok(job_id)
    }
}

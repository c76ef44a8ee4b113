//! Configuration loading and parsing
//!
//! `sim-lifecycle.toml` lives in the simulation's working directory. Only the
//! `[sbatch.main]` section is required; everything else has defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sim_lifecycle::{Layout, Number, OrchestratorConfig};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name inside the working directory
pub const CONFIG_FILE: &str = "sim-lifecycle.toml";

/// Main application configuration (loaded from sim-lifecycle.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub execs: ExecsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub folders: FoldersConfig,
    /// Simulation parameters, override template declarations
    #[serde(default)]
    pub params: BTreeMap<String, Number>,
    #[serde(default)]
    pub post_processing: PostProcessingConfig,
    pub sbatch: SbatchConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecsConfig {
    #[serde(default = "default_lammps")]
    pub simulator: String,
    #[serde(default = "default_lammps")]
    pub converter: String,
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_sacct")]
    pub sacct: String,
}

impl Default for ExecsConfig {
    fn default() -> Self {
        Self {
            simulator: default_lammps(),
            converter: default_lammps(),
            sbatch: default_sbatch(),
            sacct: default_sacct(),
        }
    }
}

fn default_lammps() -> String {
    "lmp".to_string()
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_sacct() -> String {
    "sacct".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilesConfig {
    pub state: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FoldersConfig {
    pub restarts: Option<String>,
    pub dumps: Option<String>,
    pub in_files: Option<String>,
    pub slurm: Option<String>,
    pub special_restarts: Option<String>,
    pub signals: Option<String>,
    pub post: Option<String>,
    pub logs: Option<String>,
    pub in_templates: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PostProcessingConfig {
    /// Plugin directory holding `plugin.toml` and the shared library
    pub plugin: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SbatchConfig {
    pub main: SbatchProfile,
    pub test: Option<SbatchProfile>,
    pub post: Option<SbatchProfile>,
}

/// One `#SBATCH` resource profile
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SbatchProfile {
    pub job_name: Option<String>,
    pub nodes: Option<u32>,
    pub tasks_per_node: Option<u32>,
    pub partition: Option<String>,
    pub time: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Shell text placed in front of `srun`
    pub pre: Option<String>,
}

impl SbatchProfile {
    pub fn worker_count(&self) -> u32 {
        self.nodes.unwrap_or(1) * self.tasks_per_node.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_every")]
    pub every_secs: u64,
    /// Polls in the same active state before a job counts as stuck
    #[serde(default = "default_times_criteria")]
    pub times_criteria: u32,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            every_secs: default_every(),
            times_criteria: default_times_criteria(),
            test_timeout_secs: default_test_timeout(),
        }
    }
}

fn default_every() -> u64 {
    5
}

fn default_times_criteria() -> u32 {
    288
}

fn default_test_timeout() -> u64 {
    3600
}

impl PollingConfig {
    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }
}

impl AppConfig {
    /// Directory layout with configured names over the defaults
    pub fn layout(&self) -> Layout {
        let mut layout = Layout::default();
        let f = &self.folders;
        let overrides = [
            (&mut layout.restarts, &f.restarts),
            (&mut layout.dumps, &f.dumps),
            (&mut layout.in_files, &f.in_files),
            (&mut layout.slurm, &f.slurm),
            (&mut layout.special_restarts, &f.special_restarts),
            (&mut layout.signals, &f.signals),
            (&mut layout.post, &f.post),
            (&mut layout.logs, &f.logs),
            (&mut layout.in_templates, &f.in_templates),
            (&mut layout.state_file, &self.files.state),
            (&mut layout.template, &self.files.template),
        ];
        for (slot, value) in overrides {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }
        layout
    }

    /// Library configuration for a working directory
    pub fn orchestrator_config(&self, workdir: &Path, restart_command: String) -> OrchestratorConfig {
        let test_runs = self.sbatch.test.is_some();
        let mut config = OrchestratorConfig::new(workdir)
            .with_layout(self.layout())
            .with_simulator(&self.execs.simulator)
            .with_converter(&self.execs.converter)
            .with_test_runs(test_runs)
            .with_test_run_timeout(Duration::from_secs(self.polling.test_timeout_secs))
            .with_restart_command(restart_command);
        for (name, value) in &self.params {
            config = config.add_variable(name, *value);
        }
        config
    }

    /// Warn about optional features switched off by missing sections
    pub fn report_disabled(&self) {
        if self.sbatch.test.is_none() {
            log::warn!("Test runs are disabled due to a missing [sbatch.test] section");
        }
        if self.sbatch.post.is_none() {
            log::warn!("Post processing is disabled due to a missing [sbatch.post] section");
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// Default configuration written by `genconf`
pub const DEFAULT_CONFIG: &str = r#"# sim-lifecycle configuration

[execs]
simulator = "lmp"
converter = "lmp"
sbatch = "sbatch"
sacct = "sacct"

[files]
state = "state.json"
template = "in.template"

[folders]
in_templates = "in.templates"
restarts = "restarts"
dumps = "dumps"
in_files = "in_files"
slurm = "slurm"
special_restarts = "special_restarts"
signals = "signals"
post = "post"
logs = "logs"

[params]
# T = 300

[post_processing]
plugin = "post_processor"
args = []

[sbatch.main]
job_name = "sim"
nodes = 4
tasks_per_node = 32
partition = "medium"

[sbatch.test]
job_name = "sim-test"
nodes = 1
tasks_per_node = 8
partition = "small"

[sbatch.post]
job_name = "sim-post"
nodes = 1
tasks_per_node = 32
partition = "small"

[polling]
every_secs = 5
times_criteria = 288
test_timeout_secs = 3600
"#;

/// Write the default configuration, refusing to overwrite
pub fn write_default(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Configuration file {:?} already exists", path);
    }
    fs::write(path, DEFAULT_CONFIG).with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}

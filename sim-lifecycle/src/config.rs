//! Orchestrator configuration types
//!
//! This module defines the minimal configuration needed by the lifecycle library.
//! Loading it from a file is the job of the application layer; the library only
//! consumes an already-built [`OrchestratorConfig`].

use crate::types::Number;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names of every managed file and directory, relative to the working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Persisted lifecycle document
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Checkpoints written by the running simulation
    #[serde(default = "default_restarts")]
    pub restarts: String,

    /// Trajectory dumps
    #[serde(default = "default_dumps")]
    pub dumps: String,

    /// Generated per-phase input scripts
    #[serde(default = "default_in_files")]
    pub in_files: String,

    /// Scheduler job directories
    #[serde(default = "default_slurm")]
    pub slurm: String,

    /// Per-run checkpoint writes (`write_restart` targets)
    #[serde(default = "default_special_restarts")]
    pub special_restarts: String,

    /// Signal files reporting dynamic phase lengths
    #[serde(default = "default_signals")]
    pub signals: String,

    /// Post-processing output
    #[serde(default = "default_post")]
    pub post: String,

    /// Log files
    #[serde(default = "default_logs")]
    pub logs: String,

    /// Directory holding the simulation script template
    #[serde(default = "default_in_templates")]
    pub in_templates: String,

    /// Template file name inside `in_templates`
    #[serde(default = "default_template")]
    pub template: String,

    /// Prefix of the sibling directory used for test runs
    #[serde(default = "default_tmp_dir_prefix")]
    pub tmp_dir_prefix: String,
}

fn default_state_file() -> String {
    "state.json".to_string()
}

fn default_restarts() -> String {
    "restarts".to_string()
}

fn default_dumps() -> String {
    "dumps".to_string()
}

fn default_in_files() -> String {
    "in_files".to_string()
}

fn default_slurm() -> String {
    "slurm".to_string()
}

fn default_special_restarts() -> String {
    "special_restarts".to_string()
}

fn default_signals() -> String {
    "signals".to_string()
}

fn default_post() -> String {
    "post".to_string()
}

fn default_logs() -> String {
    "logs".to_string()
}

fn default_in_templates() -> String {
    "in.templates".to_string()
}

fn default_template() -> String {
    "in.template".to_string()
}

fn default_tmp_dir_prefix() -> String {
    "sim-lifecycle-test-".to_string()
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            restarts: default_restarts(),
            dumps: default_dumps(),
            in_files: default_in_files(),
            slurm: default_slurm(),
            special_restarts: default_special_restarts(),
            signals: default_signals(),
            post: default_post(),
            logs: default_logs(),
            in_templates: default_in_templates(),
            template: default_template(),
            tmp_dir_prefix: default_tmp_dir_prefix(),
        }
    }
}

impl Layout {
    pub fn state_path(&self, root: &Path) -> PathBuf {
        root.join(&self.state_file)
    }

    /// Lock file named by the document tag
    pub fn lock_path(&self, root: &Path, tag: i64) -> PathBuf {
        root.join(format!("{}.lock", tag))
    }

    /// Diagnostics dump written when an operation fails
    pub fn diag_path(&self, root: &Path, tag: i64) -> PathBuf {
        root.join(format!("{}.diag.json", tag))
    }

    pub fn template_path(&self, root: &Path) -> PathBuf {
        root.join(&self.in_templates).join(&self.template)
    }

    pub fn signal_path(&self, root: &Path, phase: &str) -> PathBuf {
        root.join(&self.signals).join(format!("{}.signal", phase))
    }

    /// Generated script for a phase and run index
    pub fn script_path(&self, root: &Path, phase: &str, run: u32) -> PathBuf {
        root.join(&self.in_files).join(format!("{}{}.in", phase, run))
    }

    /// Directories created by initialization, in creation order
    pub fn managed_dirs(&self) -> Vec<&str> {
        vec![
            self.restarts.as_str(),
            self.in_files.as_str(),
            self.dumps.as_str(),
            self.slurm.as_str(),
            self.special_restarts.as_str(),
            self.signals.as_str(),
            self.post.as_str(),
            self.logs.as_str(),
        ]
    }

    /// Bulky output directories left out of test-run clones
    pub fn clone_excluded(&self) -> Vec<&str> {
        vec![
            self.dumps.as_str(),
            self.special_restarts.as_str(),
            self.post.as_str(),
        ]
    }
}

/// Configuration threaded through every orchestrator operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Working directory of the simulation
    pub workdir: PathBuf,

    #[serde(default)]
    pub layout: Layout,

    /// Simulator executable submitted to the scheduler
    #[serde(default = "default_simulator")]
    pub simulator: String,

    /// Executable used for checkpoint-to-data conversion
    #[serde(default = "default_simulator")]
    pub converter: String,

    /// Perform a blocking validation run before every real submission
    #[serde(default)]
    pub test_runs: bool,

    /// Test-run monitoring timeout in seconds (default: one hour)
    #[serde(default = "default_test_run_timeout")]
    pub test_run_timeout_secs: u64,

    /// Hand every submitted job to the job monitor
    #[serde(default = "default_true")]
    pub auto_poll: bool,

    /// Command the job monitor invokes on a restart-eligible terminal state
    #[serde(default)]
    pub restart_command: Option<String>,

    /// Caller-supplied variable values (win over template declarations)
    #[serde(default)]
    pub user_variables: BTreeMap<String, Number>,
}

fn default_simulator() -> String {
    "lmp".to_string()
}

fn default_test_run_timeout() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl OrchestratorConfig {
    /// Create a configuration with default settings for a working directory
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            layout: Layout::default(),
            simulator: default_simulator(),
            converter: default_simulator(),
            test_runs: false,
            test_run_timeout_secs: default_test_run_timeout(),
            auto_poll: true,
            restart_command: None,
            user_variables: BTreeMap::new(),
        }
    }

    /// Builder method: set the directory layout
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Builder method: set the simulator executable
    pub fn with_simulator(mut self, simulator: impl Into<String>) -> Self {
        self.simulator = simulator.into();
        self
    }

    /// Builder method: set the checkpoint converter executable
    pub fn with_converter(mut self, converter: impl Into<String>) -> Self {
        self.converter = converter.into();
        self
    }

    /// Builder method: enable or disable test runs
    pub fn with_test_runs(mut self, enabled: bool) -> Self {
        self.test_runs = enabled;
        self
    }

    /// Builder method: set the test-run timeout
    pub fn with_test_run_timeout(mut self, timeout: Duration) -> Self {
        self.test_run_timeout_secs = timeout.as_secs();
        self
    }

    /// Builder method: enable or disable automatic job polling
    pub fn with_auto_poll(mut self, enabled: bool) -> Self {
        self.auto_poll = enabled;
        self
    }

    /// Builder method: set the restart command given to the job monitor
    pub fn with_restart_command(mut self, command: impl Into<String>) -> Self {
        self.restart_command = Some(command.into());
        self
    }

    /// Builder method: add a caller-supplied variable
    pub fn add_variable(mut self, name: impl Into<String>, value: impl Into<Number>) -> Self {
        self.user_variables.insert(name.into(), value.into());
        self
    }

    pub fn test_run_timeout(&self) -> Duration {
        Duration::from_secs(self.test_run_timeout_secs)
    }

    /// Resolve a layout-relative name against the working directory
    pub fn path(&self, relative: &str) -> PathBuf {
        self.workdir.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = Layout::default();
        let root = Path::new("/sim");
        assert_eq!(layout.state_path(root), PathBuf::from("/sim/state.json"));
        assert_eq!(layout.lock_path(root, 1700000000), PathBuf::from("/sim/1700000000.lock"));
        assert_eq!(
            layout.script_path(root, "MAIN", 3),
            PathBuf::from("/sim/in_files/MAIN3.in")
        );
        assert_eq!(
            layout.signal_path(root, "COOL"),
            PathBuf::from("/sim/signals/COOL.signal")
        );
        assert_eq!(
            layout.template_path(root),
            PathBuf::from("/sim/in.templates/in.template")
        );
    }

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new("/sim")
            .with_simulator("lmp_mpi")
            .with_test_runs(true)
            .with_auto_poll(false)
            .with_test_run_timeout(Duration::from_secs(60))
            .add_variable("temperature", 1.5)
            .add_variable("steps", 1000i64);

        assert_eq!(config.simulator, "lmp_mpi");
        assert_eq!(config.converter, "lmp");
        assert!(config.test_runs);
        assert!(!config.auto_poll);
        assert_eq!(config.test_run_timeout(), Duration::from_secs(60));
        assert_eq!(config.user_variables.get("steps"), Some(&Number::Int(1000)));
    }

    #[test]
    fn test_layout_serde_defaults() {
        let layout: Layout = serde_json::from_str(r#"{"dumps": "traj"}"#).unwrap();
        assert_eq!(layout.dumps, "traj");
        assert_eq!(layout.restarts, "restarts");
        assert_eq!(layout.clone_excluded(), vec!["traj", "special_restarts", "post"]);
    }
}

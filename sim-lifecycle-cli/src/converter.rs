//! Checkpoint conversion through the simulator executable

use sim_lifecycle::{CheckpointConverter, LifecycleError, Result};
use std::path::Path;
use std::process::Command;

/// Runs `<exe> -restart2data <checkpoint> <data file>`
pub struct ExternalConverter {
    executable: String,
}

impl ExternalConverter {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn command(&self, checkpoint: &Path, data_file: &Path) -> Command {
        let mut command = Command::new(&self.executable);
        command.arg("-restart2data").arg(checkpoint).arg(data_file);
        command
    }
}

impl CheckpointConverter for ExternalConverter {
    fn convert(&self, checkpoint: &Path, data_file: &Path) -> Result<()> {
        log::debug!("Converting {:?} to {:?}", checkpoint, data_file);
        let output = self.command(checkpoint, data_file).output().map_err(|e| {
            LifecycleError::MalformedCheckpointHeader(format!("Failed to run {}: {}", self.executable, e))
        })?;
        if !output.status.success() {
            return Err(LifecycleError::MalformedCheckpointHeader(format!(
                "{} could not convert {:?}: {}",
                self.executable,
                checkpoint,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

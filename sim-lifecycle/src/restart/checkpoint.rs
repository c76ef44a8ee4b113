//! Checkpoint location for the three restart-file layouts
//!
//! - `multiple`: one file per checkpoint step, `<basename>.<step>`; the newest
//!   survives a rotation that empties the directory around it
//! - `one`: a single fixed-name file whose step is read back through the
//!   checkpoint-to-data converter
//! - `two`: alternating `.a`/`.b` files; the newer one wins and the other is
//!   deleted

use crate::config::Layout;
use crate::state::LifecycleDocument;
use crate::types::{LifecycleError, RestartMode, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Converts a binary checkpoint into a text data file
///
/// The first line of the data file must be the simulator's data-file header,
/// which carries `timestep = <N>`.
pub trait CheckpointConverter {
    fn convert(&self, checkpoint: &Path, data_file: &Path) -> Result<()>;
}

/// The checkpoint chosen for a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Step stored in the checkpoint
    pub step: i64,
    /// Absolute path
    pub path: PathBuf,
    /// Path relative to the working directory, as written into scripts
    pub relative: String,
}

fn header_regex() -> Result<&'static Regex> {
    static HEADER: OnceLock<std::result::Result<Regex, String>> = OnceLock::new();
    HEADER
        .get_or_init(|| {
            Regex::new(
                r"^LAMMPS data file via write_data, version \d{1,2} [A-Za-z]{3} \d{4}, timestep = (\d+), units = [A-Za-z_]+\s*$",
            )
            .map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| LifecycleError::MalformedCheckpointHeader(format!("Invalid header grammar: {}", e)))
}

/// Extract the step from a data-file header line
pub fn parse_data_header(line: &str) -> Result<i64> {
    header_regex()?
        .captures(line.trim_end_matches(['\n', '\r']))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .ok_or_else(|| LifecycleError::MalformedCheckpointHeader(line.trim_end().to_string()))
}

/// Remove a converted data file, returning false if it stays behind
fn discard_data_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Failed to remove data file {:?}: {}", path, e);
            false
        }
    }
}

/// Recover the last step of a checkpoint via the converter
pub fn last_step_of(converter: &dyn CheckpointConverter, checkpoint: &Path) -> Result<i64> {
    let mut data_file = checkpoint.to_path_buf().into_os_string();
    data_file.push(".dat");
    let data_file = PathBuf::from(data_file);
    log::debug!("Converting {:?} to {:?}", checkpoint, data_file);

    converter.convert(checkpoint, &data_file)?;
    let content = fs::read_to_string(&data_file)?;
    discard_data_file(&data_file);

    let header = content.lines().next().unwrap_or_default();
    let step = parse_data_header(header).map_err(|e| {
        log::error!("Data file of {:?} does not contain a proper header", checkpoint);
        e
    })?;
    log::debug!("Checkpoint {:?} is at step {}", checkpoint, step);
    Ok(step)
}

/// Find the checkpoint to restart from, rotating checkpoint files as a side effect
pub fn locate(
    root: &Path,
    layout: &Layout,
    document: &LifecycleDocument,
    converter: &dyn CheckpointConverter,
    step_override: Option<i64>,
) -> Result<Checkpoint> {
    let dir = root.join(&layout.restarts);
    let basename = &document.restart_file_basename;

    let checkpoint = |name: String, step: i64| Checkpoint {
        step,
        path: dir.join(&name),
        relative: format!("{}/{}", layout.restarts, name),
    };

    match document.restart_mode {
        RestartMode::Multiple => {
            let step = match step_override {
                Some(step) => {
                    let name = format!("{}.{}", basename, step);
                    if !dir.join(&name).exists() {
                        return Err(LifecycleError::NoCheckpointFound(format!(
                            "Specified step checkpoint {:?} not found",
                            dir.join(&name)
                        )));
                    }
                    step
                }
                None => {
                    let step = find_last(&dir, basename)?.ok_or_else(|| {
                        LifecycleError::NoCheckpointFound(format!(
                            "No '{}.<step>' files in {:?}",
                            basename, dir
                        ))
                    })?;
                    log::info!("Cleaning checkpoint directory around step {}", step);
                    rotate(root, &dir, &format!("{}.{}", basename, step))?;
                    step
                }
            };
            Ok(checkpoint(format!("{}.{}", basename, step), step))
        }
        RestartMode::One => {
            let path = dir.join(basename);
            if !path.exists() {
                return Err(LifecycleError::NoCheckpointFound(format!("{:?}", path)));
            }
            let step = last_step_of(converter, &path)?;
            Ok(checkpoint(basename.clone(), step))
        }
        RestartMode::Two => {
            let name_a = format!("{}.a", basename);
            let name_b = format!("{}.b", basename);
            let step_a = step_if_exists(converter, &dir.join(&name_a))?;
            let step_b = step_if_exists(converter, &dir.join(&name_b))?;

            match (step_a, step_b) {
                (Some(a), Some(b)) if a > b => {
                    fs::remove_file(dir.join(&name_b))?;
                    Ok(checkpoint(name_a, a))
                }
                (Some(_), Some(b)) => {
                    fs::remove_file(dir.join(&name_a))?;
                    Ok(checkpoint(name_b, b))
                }
                (Some(a), None) => {
                    log::warn!("Checkpoint {} is missing, using {}", name_b, name_a);
                    Ok(checkpoint(name_a, a))
                }
                (None, Some(b)) => {
                    log::warn!("Checkpoint {} is missing, using {}", name_a, name_b);
                    Ok(checkpoint(name_b, b))
                }
                (None, None) => Err(LifecycleError::NoCheckpointFound(format!(
                    "Neither {} nor {} exists in {:?}",
                    name_a, name_b, dir
                ))),
            }
        }
        RestartMode::None => Err(LifecycleError::InvalidState(
            "Restart mode is not set".to_string(),
        )),
    }
}

fn step_if_exists(converter: &dyn CheckpointConverter, path: &Path) -> Result<Option<i64>> {
    if path.exists() {
        last_step_of(converter, path).map(Some)
    } else {
        Ok(None)
    }
}

/// Largest `N` among files named `<basename>.<N>`
fn find_last(dir: &Path, basename: &str) -> Result<Option<i64>> {
    let pattern = Regex::new(&format!(r"^{}\.(\d+)$", regex::escape(basename)))
        .map_err(|e| LifecycleError::InvalidState(e.to_string()))?;
    let mut last = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(step) = pattern
            .captures(name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
        {
            last = last.max(Some(step));
        }
    }
    Ok(last)
}

/// Keep exactly one checkpoint: copy it out, empty the directory, copy it back
///
/// A crash between the steps loses at most the rotation, never the file.
fn rotate(root: &Path, dir: &Path, keep: &str) -> Result<()> {
    let source = dir.join(keep);
    let temp = root.join(keep);
    fs::copy(&source, &temp)?;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
        } else {
            log::warn!("Leaving non-file entry {:?} in checkpoint directory", path);
        }
    }
    fs::copy(&temp, &source)?;
    fs::remove_file(&temp)?;
    Ok(())
}

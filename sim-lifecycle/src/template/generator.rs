//! Script generator
//!
//! Emits the concrete input script for one run of one phase. The template is
//! rewritten line by line:
//!
//! - `#!const` declarations get their evaluated value
//! - numeric declarations of caller-supplied variables get the caller's value
//! - dump targets become `<dumps>/<phase><run>`
//! - `write_restart` targets become `<special_restarts>/<phase>.<run>`
//! - the checkpoint directive writes into `<restarts>/<basename>` following the
//!   active restart mode
//!
//! Restart scripts additionally load the checkpoint, drop the `# part: start`
//! section, and skip every phase before the current one.

use super::directives::{self, Directive, Part};
use crate::config::Layout;
use crate::state::LifecycleDocument;
use crate::types::{LifecycleError, RestartMode, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Rewrite a template for one run of a phase
pub fn render(template: &str, document: &LifecycleDocument, layout: &Layout, phase: &str, run: u32) -> Result<String> {
    log::debug!("Generating script for phase '{}' run {}", phase, run);
    let mut out = String::with_capacity(template.len());

    for (i, raw) in template.lines().enumerate() {
        let mut line = raw.to_string();

        if let Some(name) = directives::const_variable(&line)? {
            let value = document
                .variables
                .get(&name)
                .ok_or_else(|| LifecycleError::UndefinedVariable(name.clone()))?;
            log::debug!("Line {}, const variable '{}'={}", i, name, value);
            line = format!("variable {} equal {}", name, value);
        }

        if let Some(name) = directives::numeric_variable(&line)? {
            match document.user_variables.get(&name) {
                Some(value) => {
                    log::debug!("Line {}, variable '{}', setting to {}", i, name, value);
                    line = format!("variable {} equal {}", name, value);
                }
                None => log::trace!("Line {}, '{}' is not a caller variable", i, name),
            }
        } else if let Some(dump) = directives::dump(&line)? {
            let target = format!("{}/{}{}", layout.dumps, phase, run);
            log::debug!("Line {}, dump '{}' redirected to {}", i, dump.id, target);
            let mut fields = vec![dump.id, dump.group, dump.style, dump.every, target];
            fields.extend(dump.args);
            line = format!("dump {}", fields.join(" "));
        } else if directives::is_write_restart(&line)? {
            let target = format!("{}/{}.{}", layout.special_restarts, phase, run);
            log::debug!("Line {}, write_restart redirected to {}", i, target);
            line = format!("write_restart {}", target);
        } else {
            match directives::classify(&line)? {
                Directive::Checkpoint { cadence, .. } => {
                    line = checkpoint_line(&cadence, document, layout)?;
                    log::debug!("Line {}, checkpoint rewritten: {}", i, line);
                }
                Directive::MalformedCheckpoint => {
                    return Err(LifecycleError::parse(i, "Unknown checkpoint file layout"));
                }
                _ => {}
            }
        }

        out.push_str(&line);
        out.push('\n');
    }

    Ok(out)
}

fn checkpoint_line(cadence: &str, document: &LifecycleDocument, layout: &Layout) -> Result<String> {
    let base = format!("{}/{}", layout.restarts, document.restart_file_basename);
    let files = match document.restart_mode {
        RestartMode::Multiple => format!("{}.*", base),
        RestartMode::One => base,
        RestartMode::Two => format!("{}.a {}.b", base, base),
        RestartMode::None => {
            return Err(LifecycleError::InvalidState(
                "Restart mode is not set, cannot rewrite checkpoint directive".to_string(),
            ))
        }
    };
    Ok(format!("restart {} {}", cadence, files))
}

/// Turn a rendered script into a restart script for `phase`
///
/// The checkpoint is loaded first and followed by a zero-length run. Lines of
/// the `start` part are dropped, a warm-up `run 0` follows the `run` marker,
/// and inside the `run` part every phase before `phase` is skipped.
pub fn render_restart(script: &str, phase: &str, checkpoint: &str) -> Result<String> {
    let mut out = format!("read_restart {}\nrun 0\n", checkpoint);
    let mut part: Option<Part> = None;
    let mut skipping = false;
    let mut reached = false;

    for (i, line) in script.lines().enumerate() {
        let mut line = line.to_string();
        if let Some(marker) = directives::part_marker(&line)? {
            log::debug!("Line {}, part {:?}", i, marker);
            part = Some(marker);
            if marker == Part::Run {
                line.push_str("\nrun 0");
            }
        }

        match part {
            Some(Part::Start) => {
                log::trace!("Line {}, start part, skipping", i);
                continue;
            }
            Some(Part::Run) => {
                if let Directive::PhaseBoundary { name } = directives::classify(&line)? {
                    if !reached {
                        if name == phase {
                            log::debug!("Line {}, current phase '{}' reached", i, name);
                            skipping = false;
                            reached = true;
                        } else {
                            log::debug!("Line {}, phase '{}' is before '{}', skipping", i, name, phase);
                            skipping = true;
                        }
                    }
                }
                if skipping {
                    continue;
                }
            }
            Some(Part::Save) | None => {}
        }

        out.push_str(&line);
        out.push('\n');
    }

    Ok(out)
}

/// Generate the script for one run and write it under the layout's script directory
///
/// An existing script of the same name is moved aside to `<name>.trash`.
pub fn generate(
    root: &Path,
    layout: &Layout,
    document: &LifecycleDocument,
    phase: &str,
    run: u32,
    checkpoint: Option<&str>,
) -> Result<PathBuf> {
    let template_path = layout.template_path(root);
    let template = fs::read_to_string(&template_path).map_err(|e| {
        log::error!("Template {:?} could not be read: {}", template_path, e);
        LifecycleError::IoError(e)
    })?;

    let mut script = render(&template, document, layout, phase, run)?;
    if let Some(checkpoint) = checkpoint {
        log::info!("Generating restart script from {}", checkpoint);
        script = render_restart(&script, phase, checkpoint)?;
    }

    let out = layout.script_path(root, phase, run);
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    if out.exists() {
        let mut trash = out.clone().into_os_string();
        trash.push(".trash");
        log::warn!("Script {:?} already exists, moving it to {:?}", out, trash);
        fs::rename(&out, &trash)?;
    }
    fs::write(&out, script)?;
    log::info!("Generated {:?}", out);
    Ok(out)
}

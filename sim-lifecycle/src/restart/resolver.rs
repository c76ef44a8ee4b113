//! Restart-point resolution
//!
//! Given the step of the newest checkpoint, find the phase execution has
//! reached, discover dynamic phase lengths from signal files, back-fill the
//! previous run's last step, and detect the end of the timeline.

use crate::config::Layout;
use crate::expression;
use crate::state::LifecycleDocument;
use crate::types::{LifecycleError, Result};
use std::fs;
use std::path::Path;

/// Outcome of resolving a checkpoint step against the timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Execution continues in this phase
    Current(String),
    /// Every phase is done
    EndReached,
}

/// What a phase's signal file says about its length
enum Signal {
    Absent,
    Unreadable,
    Length(i64),
}

fn read_signal(path: &Path, document: &LifecycleDocument) -> Result<Signal> {
    if !path.exists() {
        return Ok(Signal::Absent);
    }
    let content = fs::read_to_string(path)?;
    let first = content.lines().next().unwrap_or_default();
    let value = first.split('#').next().unwrap_or_default().trim();
    if value.is_empty() {
        return Ok(Signal::Unreadable);
    }
    match expression::evaluate(value, &document.variables) {
        Ok(length) => Ok(Signal::Length(length.round_i64())),
        Err(e) => {
            log::warn!("Signal file {:?} is not readable: {}", path, e);
            Ok(Signal::Unreadable)
        }
    }
}

/// Find the phase containing `step`
///
/// A phase of unknown length consults its signal file. A reported length
/// shorter than one checkpoint cadence is noise: the file is deleted and the
/// phase stays current. Otherwise the phase end is fixed to the reported
/// value, every later phase is shifted by the same amount, and the phase is
/// checked again with its new bounds.
pub fn current_phase(root: &Path, layout: &Layout, document: &mut LifecycleDocument, step: i64) -> Result<Option<String>> {
    let mut index = 0;
    while index < document.timeline.len() {
        let phase = &document.timeline.phases()[index];
        if step < phase.begin_step {
            index += 1;
            continue;
        }

        if let Some(end) = phase.end_step {
            if step < end - 1 {
                return Ok(Some(phase.name.clone()));
            }
            index += 1;
            continue;
        }

        let name = phase.name.clone();
        log::debug!("End step of phase '{}' is unknown", name);
        let signal_path = layout.signal_path(root, &name);
        match read_signal(&signal_path, document)? {
            Signal::Absent => {
                log::debug!("No signal file for '{}', phase continues", name);
                return Ok(Some(name));
            }
            Signal::Unreadable => {
                log::error!("Signal file {:?} does not contain a readable step", signal_path);
                return Ok(Some(name));
            }
            Signal::Length(length) if length < document.restart_cadence => {
                log::info!(
                    "Signal length {} of '{}' is below the cadence {}, ignoring",
                    length,
                    name,
                    document.restart_cadence
                );
                fs::remove_file(&signal_path)?;
                return Ok(Some(name));
            }
            Signal::Length(length) => {
                log::info!("Phase '{}' finished with length {}", name, length);
                document.timeline.phases_mut()[index].end_step = Some(length);
                document.timeline.shift_after(index, length);
                fs::remove_file(&signal_path)?;
                // Re-check this phase with its now known end
            }
        }
    }
    Ok(None)
}

/// Record `step` as the last step of the most recent run before `current`
///
/// With no current phase the walk starts at the last phase.
pub fn back_fill(document: &mut LifecycleDocument, current: Option<&str>, step: i64) {
    let end = match current {
        Some(name) => match document.timeline.position(name) {
            Some(idx) => idx,
            None => return,
        },
        None => document.timeline.len(),
    };

    for phase in document.timeline.phases_mut()[..end].iter_mut().rev() {
        if phase.runs == 0 {
            continue;
        }
        let last = phase.runs - 1;
        let name = phase.name.clone();
        if let Some(record) = phase.record_mut(last) {
            log::debug!("Setting last step {} for run {} of '{}'", step, last, name);
            record.last_step = Some(step);
            return;
        }
    }
}

/// True if every phase end is known and `step` is within one cadence of the last
pub fn is_complete(document: &LifecycleDocument, step: i64) -> bool {
    if !document.timeline.is_fully_known() {
        return false;
    }
    match document.timeline.max_end_step() {
        Some(max) => step >= max - document.restart_cadence,
        None => false,
    }
}

/// Resolve a checkpoint step against the document's timeline
pub fn resolve(root: &Path, layout: &Layout, document: &mut LifecycleDocument, step: i64) -> Result<Resolution> {
    let current = current_phase(root, layout, document, step)?;
    match &current {
        Some(name) => log::info!("Current phase: '{}'", name),
        None => log::info!("Step {} lies beyond every phase", step),
    }

    back_fill(document, current.as_deref(), step);

    if is_complete(document, step) {
        log::info!("End was reached at step {}", step);
        return Ok(Resolution::EndReached);
    }

    current.map(Resolution::Current).ok_or_else(|| {
        LifecycleError::InconsistentTimeline(format!(
            "Step {} matches no phase and the timeline is not complete",
            step
        ))
    })
}

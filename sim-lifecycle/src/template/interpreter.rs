//! Template interpreter
//!
//! Walks the lines of a simulation script and builds the phase timeline and
//! the variable environment. The interpreter keeps two pieces of transient
//! state: the current phase and the currently open native loop. Native loops
//! cannot nest.
//!
//! # Step accounting
//!
//! Each phase accumulates a list of step entries. A `run` inside an open loop
//! is tagged with the loop label and multiplied by the loop's trip count when
//! the closing `jump` is seen. A loop left early through a single-outcome
//! conditional makes every tagged entry unknown, and the phase end with it.

use super::directives::{self, Directive};
use crate::expression::{self, VariableEnvironment};
use crate::state::{LifecycleDocument, Phase, RunRecord, Timeline, INITIAL_PHASE};
use crate::types::{LifecycleError, Number, RestartMode, Result};
use chrono::Utc;

/// Variables every template may rely on, unless the caller supplies them
const PRESEEDED: [(&str, i64); 3] = [("step", 0), ("temp", 0), ("test", 1)];

#[derive(Debug, Clone, PartialEq)]
enum StepEntry {
    Plain(Number),
    Looped { label: String, steps: Number },
    Unknown,
}

#[derive(Debug)]
struct PhaseSteps {
    name: String,
    entries: Vec<StepEntry>,
}

/// Line-by-line state of one interpretation pass
struct Interpreter<'a> {
    document: &'a mut LifecycleDocument,
    phases: Vec<PhaseSteps>,
    open_loop: Option<String>,
    previous: Option<Directive>,
}

/// Interpret a template (or generated script) into the document
///
/// Rebuilds `variables` from the caller's `user_variables`, then replaces the
/// timeline, time step, restart cadence and basename. A restart mode already
/// fixed on the document is kept even if the checkpoint directive disagrees.
pub fn interpret(source: &str, document: &mut LifecycleDocument) -> Result<()> {
    let mut variables = VariableEnvironment::new();
    for (name, value) in &document.user_variables {
        variables.set(name, *value);
    }
    for (name, value) in PRESEEDED {
        if !variables.contains(name) {
            variables.set(name, Number::Int(value));
        }
    }
    document.variables = variables;

    let mut interpreter = Interpreter {
        document,
        phases: vec![PhaseSteps {
            name: INITIAL_PHASE.to_string(),
            entries: vec![StepEntry::Plain(Number::Int(0))],
        }],
        open_loop: None,
        previous: None,
    };

    log::info!("Start line by line parsing");
    for (i, line) in source.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let directive = directives::classify(line)?;
        interpreter.apply(i, &directive)?;
        interpreter.previous = Some(directive);
    }
    log::info!("Done parsing");

    if let Some(label) = &interpreter.open_loop {
        return Err(LifecycleError::parse(
            source.lines().count(),
            format!("Native loop '{}' was never closed", label),
        ));
    }

    let timeline = finalize(interpreter.phases)?;
    interpreter.document.set_timeline(timeline);
    Ok(())
}

impl<'a> Interpreter<'a> {
    fn current(&mut self) -> &mut PhaseSteps {
        let idx = self.phases.len() - 1;
        &mut self.phases[idx]
    }

    fn evaluate(&self, line: usize, expr: &str) -> Result<Number> {
        expression::evaluate(expr, &self.document.variables).map_err(|e| {
            log::error!("Line {}: unable to evaluate '{}': {}", line, expr, e);
            e
        })
    }

    fn apply(&mut self, i: usize, directive: &Directive) -> Result<()> {
        match directive {
            Directive::Seed { name } => {
                let seed = Number::Int(Utc::now().timestamp());
                log::debug!("Line {}, found seed '{}', setting {}", i, name, seed);
                self.document.user_variables.insert(name.clone(), seed);
                self.document.variables.set(name, seed);
            }
            Directive::Variable { name, value, .. } => {
                if self.document.variables.contains(name) {
                    log::debug!("Line {}, variable '{}' already set, not changing", i, name);
                } else {
                    let evaluated = self.evaluate(i, value)?;
                    log::debug!("Line {}, setting '{}'={}", i, name, evaluated);
                    self.document.variables.set(name, evaluated);
                }
            }
            Directive::Timestep { value } => {
                let dt = self.evaluate(i, value)?;
                log::debug!("Line {}, setting 'dt'={}", i, dt);
                self.document.variables.set("dt", dt);
                self.document.time_step = Some(dt);
            }
            Directive::Run { steps } => {
                let steps = self.evaluate(i, steps)?;
                let entry = match &self.open_loop {
                    Some(label) => StepEntry::Looped {
                        label: label.clone(),
                        steps,
                    },
                    None => StepEntry::Plain(steps),
                };
                log::debug!("Line {}, run {:?}", i, entry);
                self.current().entries.push(entry);
            }
            Directive::PhaseBoundary { name } => {
                if let Some(label) = &self.open_loop {
                    return Err(LifecycleError::parse(
                        i,
                        format!("Native loop '{}' is still open at phase '{}'", label, name),
                    ));
                }
                if self.phases.iter().any(|p| &p.name == name) {
                    return Err(LifecycleError::parse(
                        i,
                        format!("Phase '{}' is declared twice", name),
                    ));
                }
                log::debug!("Line {}, new phase '{}'", i, name);
                self.phases.push(PhaseSteps {
                    name: name.clone(),
                    entries: Vec::new(),
                });
            }
            Directive::LoopLabel { label } => {
                if let Some(open) = &self.open_loop {
                    return Err(LifecycleError::parse(
                        i,
                        format!(
                            "Loop '{}' opened while '{}' is still open, nested loops are not supported",
                            label, open
                        ),
                    ));
                }
                log::debug!("Line {}, opening loop '{}'", i, label);
                self.open_loop = Some(label.clone());
            }
            Directive::LoopJump { label } => self.close_loop(i, label)?,
            Directive::Conditional {
                jump_label: Some(label),
            } => {
                if self.open_loop.as_deref() != Some(label.as_str()) {
                    return Err(LifecycleError::parse(
                        i,
                        format!(
                            "Conditional jumps to '{}' but the open loop is {:?}",
                            label, self.open_loop
                        ),
                    ));
                }
                log::debug!("Line {}, early exit from loop '{}', phase length unknown", i, label);
                for entry in self.current().entries.iter_mut() {
                    if matches!(entry, StepEntry::Looped { .. }) {
                        *entry = StepEntry::Unknown;
                    }
                }
                self.open_loop = None;
            }
            Directive::Checkpoint {
                cadence,
                shape,
                files,
            } => self.checkpoint(i, cadence, *shape, files)?,
            Directive::MalformedCheckpoint => {
                return Err(LifecycleError::parse(i, "Unknown checkpoint file layout"));
            }
            Directive::Conditional { jump_label: None }
            | Directive::LoopNext { .. }
            | Directive::Other => {
                log::trace!("Line {}, nothing was found", i);
            }
        }
        Ok(())
    }

    fn close_loop(&mut self, i: usize, label: &str) -> Result<()> {
        let Some(Directive::LoopNext { variable }) = self.previous.clone() else {
            return Err(LifecycleError::parse(
                i,
                "Line before jump does not contain a next command",
            ));
        };
        if self.open_loop.as_deref() != Some(label) {
            return Err(LifecycleError::parse(
                i,
                format!("Open loop is {:?}, but jump is to '{}'", self.open_loop, label),
            ));
        }
        let count = self
            .document
            .variables
            .get(&variable)
            .ok_or_else(|| LifecycleError::UndefinedVariable(variable.clone()))?;
        log::debug!("Line {}, loop '{}' runs {} times", i, label, count);

        for entry in self.current().entries.iter_mut() {
            if let StepEntry::Looped { label: l, steps } = entry {
                if l == label {
                    *entry = StepEntry::Plain(multiply(*steps, count));
                }
            }
        }
        self.open_loop = None;
        Ok(())
    }

    fn checkpoint(&mut self, i: usize, cadence: &str, shape: RestartMode, files: &[String]) -> Result<()> {
        let document = &mut *self.document;
        if document.restart_mode == RestartMode::None {
            log::debug!("Line {}, setting restart mode to {}", i, shape);
            document.restart_mode = shape;
        } else if document.restart_mode != shape {
            log::warn!(
                "Restart modes are not equal, specified: {}, in file: {}",
                document.restart_mode,
                shape
            );
            log::warn!("Using specified restart mode");
        }
        document.restart_cadence = expression::evaluate(cadence, &document.variables)?.round_i64();
        if let Some(basename) = files.first().and_then(|f| checkpoint_basename(f, shape)) {
            document.restart_file_basename = basename;
        }
        log::debug!(
            "Line {}, checkpoint every {} steps to '{}'",
            i,
            document.restart_cadence,
            document.restart_file_basename
        );
        Ok(())
    }
}

/// Bare checkpoint name without directory and layout suffix
fn checkpoint_basename(file: &str, shape: RestartMode) -> Option<String> {
    let name = file.rsplit('/').next()?;
    let base = match shape {
        RestartMode::Multiple => name.strip_suffix(".*").unwrap_or(name),
        RestartMode::Two => name.rsplit_once('.').map(|(b, _)| b).unwrap_or(name),
        RestartMode::One | RestartMode::None => name,
    };
    (!base.is_empty()).then(|| base.to_string())
}

fn multiply(a: Number, b: Number) -> Number {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x
            .checked_mul(y)
            .map(Number::Int)
            .unwrap_or(Number::Float(x as f64 * y as f64)),
        _ => Number::Float(a.as_f64() * b.as_f64()),
    }
}

/// Turn accumulated step lists into phase bounds
///
/// A phase of unknown length resets the running offset, so the phases after
/// it start from zero until the real length is discovered.
fn finalize(phases: Vec<PhaseSteps>) -> Result<Timeline> {
    let mut offset: i64 = 0;
    let mut result = Vec::with_capacity(phases.len());

    for steps in phases {
        let mut phase = if steps.entries.contains(&StepEntry::Unknown) {
            let phase = Phase::new(&steps.name, offset, None);
            offset = 0;
            phase
        } else {
            let mut total = 0.0;
            for entry in &steps.entries {
                match entry {
                    StepEntry::Plain(n) => total += n.as_f64(),
                    StepEntry::Looped { label, .. } => {
                        return Err(LifecycleError::parse(
                            0,
                            format!("Loop '{}' in phase '{}' was never closed", label, steps.name),
                        ))
                    }
                    StepEntry::Unknown => {}
                }
            }
            let end = (offset as f64 + total).round() as i64;
            let phase = Phase::new(&steps.name, offset, Some(end));
            offset = end;
            phase
        };
        if phase.name == INITIAL_PHASE {
            phase
                .records
                .insert("0".to_string(), RunRecord::seed(INITIAL_PHASE));
        }
        log::debug!(
            "Phase '{}': {} -> {:?}",
            phase.name,
            phase.begin_step,
            phase.end_step
        );
        result.push(phase);
    }

    Ok(Timeline::new(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn document() -> LifecycleDocument {
        LifecycleDocument::new(1, RestartMode::None, BTreeMap::new())
    }

    fn bounds(doc: &LifecycleDocument) -> Vec<(String, i64, Option<i64>)> {
        doc.timeline
            .phases()
            .iter()
            .map(|p| (p.name.clone(), p.begin_step, p.end_step))
            .collect()
    }

    const TWO_PHASES: &str = "\
variable steps equal 1000
timestep 0.005
restart 500 restarts/restart.*

# label: A
run ${steps}

# label: B
run $(v_steps*2)
";

    #[test]
    fn test_simple_timeline() {
        let mut doc = document();
        interpret(TWO_PHASES, &mut doc).unwrap();

        assert_eq!(
            bounds(&doc),
            vec![
                ("START".to_string(), 0, Some(0)),
                ("A".to_string(), 0, Some(1000)),
                ("B".to_string(), 1000, Some(3000)),
            ]
        );
        assert_eq!(doc.phase_order, vec!["START", "A", "B"]);
        assert_eq!(doc.restart_mode, RestartMode::Multiple);
        assert_eq!(doc.restart_cadence, 500);
        assert_eq!(doc.restart_file_basename, "restart");
        assert_eq!(doc.time_step, Some(Number::Float(0.005)));
        assert_eq!(doc.variables.get("v_dt"), Some(Number::Float(0.005)));
        assert!(doc.timeline.get("START").unwrap().record(0).is_some());
        assert!(doc.timeline.is_contiguous());
    }

    #[test]
    fn test_preseeded_and_caller_values() {
        let mut doc = document();
        doc.user_variables.insert("steps".to_string(), Number::Int(10));
        interpret(TWO_PHASES, &mut doc).unwrap();

        assert_eq!(doc.variables.get("test"), Some(Number::Int(1)));
        assert_eq!(doc.variables.get("v_temp"), Some(Number::Int(0)));
        assert_eq!(doc.timeline.get("B").unwrap().end_step, Some(30));
        assert!(!doc.user_variables.contains_key("test"));
    }

    #[test]
    fn test_seed_uses_wall_clock() {
        let mut doc = document();
        interpret("variable SEED_I equal 42\n", &mut doc).unwrap();
        let seed = doc.user_variables.get("SEED_I").copied().unwrap();
        assert!(seed.round_i64() > 1_600_000_000);
        assert_eq!(doc.variables.get("v_SEED_I"), Some(seed));
    }

    #[test]
    fn test_native_loop_multiplies() {
        let source = "\
variable n loop 5
# label: HEAT
run 100
label loop_a
run 200
next n
jump SELF loop_a
# label: HOLD
run 50
";
        let mut doc = document();
        interpret(source, &mut doc).unwrap();
        assert_eq!(doc.timeline.get("HEAT").unwrap().end_step, Some(1100));
        let hold = doc.timeline.get("HOLD").unwrap();
        assert_eq!((hold.begin_step, hold.end_step), (1100, Some(1150)));
    }

    #[test]
    fn test_conditional_exit_makes_phase_unknown() {
        let source = "\
variable n loop 100
# label: A
run 1000
# label: COOL
label loop_c
run 500
if \"${temp} < 300\" then \"jump SELF loop_c\"
# label: C
run 200
";
        let mut doc = document();
        interpret(source, &mut doc).unwrap();
        assert_eq!(
            bounds(&doc),
            vec![
                ("START".to_string(), 0, Some(0)),
                ("A".to_string(), 0, Some(1000)),
                ("COOL".to_string(), 1000, None),
                ("C".to_string(), 0, Some(200)),
            ]
        );
    }

    #[test]
    fn test_nested_loop_is_error() {
        let source = "label a\nlabel b\n";
        let err = interpret(source, &mut document()).unwrap_err();
        assert!(matches!(err, LifecycleError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_jump_without_next_is_error() {
        let source = "variable n loop 3\nlabel a\nrun 10\njump SELF a\n";
        assert!(matches!(
            interpret(source, &mut document()),
            Err(LifecycleError::Parse { line: 3, .. })
        ));
    }

    #[test]
    fn test_jump_label_mismatch_is_error() {
        let source = "variable n loop 3\nlabel a\nrun 10\nnext n\njump SELF b\n";
        assert!(matches!(
            interpret(source, &mut document()),
            Err(LifecycleError::Parse { .. })
        ));
    }

    #[test]
    fn test_phase_boundary_inside_loop_is_error() {
        let source = "label a\nrun 10\n# label: B\n";
        assert!(matches!(
            interpret(source, &mut document()),
            Err(LifecycleError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_unclosed_loop_is_error() {
        let source = "label a\nrun 10\n";
        assert!(matches!(
            interpret(source, &mut document()),
            Err(LifecycleError::Parse { .. })
        ));
    }

    #[test]
    fn test_undefined_variable_propagates() {
        let source = "run ${missing}\n";
        assert!(matches!(
            interpret(source, &mut document()),
            Err(LifecycleError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn test_caller_restart_mode_wins() {
        let mut doc = LifecycleDocument::new(1, RestartMode::Two, BTreeMap::new());
        interpret("restart 100 restarts/restart.*\n", &mut doc).unwrap();
        assert_eq!(doc.restart_mode, RestartMode::Two);
        assert_eq!(doc.restart_cadence, 100);
    }

    #[test]
    fn test_malformed_checkpoint_is_error() {
        assert!(matches!(
            interpret("restart 100 a b c\n", &mut document()),
            Err(LifecycleError::Parse { line: 0, .. })
        ));
    }

    #[test]
    fn test_checkpoint_basename() {
        assert_eq!(
            checkpoint_basename("restarts/restart.*", RestartMode::Multiple),
            Some("restart".to_string())
        );
        assert_eq!(
            checkpoint_basename("restarts/ckpt.a", RestartMode::Two),
            Some("ckpt".to_string())
        );
        assert_eq!(
            checkpoint_basename("state.rst", RestartMode::One),
            Some("state.rst".to_string())
        );
    }
}

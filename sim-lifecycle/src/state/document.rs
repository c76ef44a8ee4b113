//! Persisted lifecycle document and its timeline

use crate::expression::VariableEnvironment;
use crate::types::{LifecycleError, LifecycleState, Number, RestartMode, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the phase every timeline starts with
pub const INITIAL_PHASE: &str = "START";

/// One submitted run of a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Scheduler job id (absent for the synthetic phase-zero record)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,

    /// Generated script file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_name: Option<String>,

    /// Dump name, `<phase><run>`
    pub dump_tag: String,

    /// Global run number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_no: Option<u64>,

    /// Step the run actually reached, back-filled on the next restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<i64>,
}

impl RunRecord {
    /// The synthetic record seeded for the initial phase
    pub fn seed(phase: &str) -> Self {
        Self {
            job_id: None,
            input_file_name: None,
            dump_tag: format!("{}0", phase),
            run_no: None,
            last_step: None,
        }
    }
}

/// A named, contiguous range of simulation steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub begin_step: i64,
    /// `None` while the length is not known statically
    pub end_step: Option<i64>,
    pub runs: u32,
    /// Run records keyed by run index
    #[serde(default)]
    pub records: BTreeMap<String, RunRecord>,
}

impl Phase {
    pub fn new(name: impl Into<String>, begin_step: i64, end_step: Option<i64>) -> Self {
        Self {
            name: name.into(),
            begin_step,
            end_step,
            runs: 0,
            records: BTreeMap::new(),
        }
    }

    pub fn record(&self, index: u32) -> Option<&RunRecord> {
        self.records.get(&index.to_string())
    }

    pub fn record_mut(&mut self, index: u32) -> Option<&mut RunRecord> {
        self.records.get_mut(&index.to_string())
    }

    /// Number of consecutive records starting at index 0
    pub fn contiguous_records(&self) -> u32 {
        let mut count = 0;
        while self.records.contains_key(&count.to_string()) {
            count += 1;
        }
        count
    }
}

/// Ordered sequence of phases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline {
    phases: Vec<Phase>,
}

impl Timeline {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phases_mut(&mut self) -> &mut [Phase] {
        &mut self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }

    /// True if every phase has a known end step
    pub fn is_fully_known(&self) -> bool {
        self.phases.iter().all(|p| p.end_step.is_some())
    }

    /// Largest known end step
    pub fn max_end_step(&self) -> Option<i64> {
        self.phases.iter().filter_map(|p| p.end_step).max()
    }

    /// Check that adjacent phases with known bounds share their boundary
    pub fn is_contiguous(&self) -> bool {
        self.phases.windows(2).all(|pair| match pair[0].end_step {
            Some(end) => end == pair[1].begin_step,
            None => true,
        })
    }

    /// Shift the phases after `index` by `amount`
    ///
    /// Shifting stops at the next phase of unknown length: only its begin step
    /// moves. The phases behind it are counted from its end, which is shifted
    /// in once that length is discovered.
    pub fn shift_after(&mut self, index: usize, amount: i64) {
        for phase in self.phases.iter_mut().skip(index + 1) {
            phase.begin_step += amount;
            match phase.end_step.as_mut() {
                Some(end) => *end += amount,
                None => break,
            }
        }
    }
}

/// The single persisted entity describing one simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleDocument {
    pub state: LifecycleState,

    /// Run-unique integer (creation timestamp) naming lock and diagnostic files
    pub tag: i64,

    #[serde(default)]
    pub restart_count: u32,

    #[serde(default)]
    pub restart_mode: RestartMode,

    #[serde(default = "default_restart_basename")]
    pub restart_file_basename: String,

    /// Checkpoint cadence in steps
    #[serde(default)]
    pub restart_cadence: i64,

    /// Monotonic across the whole simulation
    #[serde(default)]
    pub run_counter: u64,

    #[serde(default)]
    pub user_variables: BTreeMap<String, Number>,

    #[serde(default)]
    pub variables: VariableEnvironment,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_step: Option<Number>,

    #[serde(default)]
    pub timeline: Timeline,

    /// Phase names in timeline order
    #[serde(default)]
    pub phase_order: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process_job_id: Option<u64>,
}

fn default_restart_basename() -> String {
    "restart".to_string()
}

impl LifecycleDocument {
    /// Create a document in the `initialized` pre-state
    pub fn new(tag: i64, restart_mode: RestartMode, user_variables: BTreeMap<String, Number>) -> Self {
        Self {
            state: LifecycleState::Initialized,
            tag,
            restart_count: 0,
            restart_mode,
            restart_file_basename: default_restart_basename(),
            restart_cadence: 0,
            run_counter: 0,
            user_variables,
            variables: VariableEnvironment::new(),
            time_step: None,
            timeline: Timeline::default(),
            phase_order: Vec::new(),
            post_process_job_id: None,
        }
    }

    /// Replace the timeline, keeping `phase_order` in sync
    pub fn set_timeline(&mut self, timeline: Timeline) {
        self.phase_order = timeline.names();
        self.timeline = timeline;
    }

    /// Check structural consistency after loading
    pub fn validate(&self) -> Result<()> {
        if self.phase_order != self.timeline.names() {
            return Err(LifecycleError::InconsistentTimeline(format!(
                "Phase order {:?} does not match timeline {:?}",
                self.phase_order,
                self.timeline.names()
            )));
        }
        if !self.timeline.is_contiguous() {
            return Err(LifecycleError::InconsistentTimeline(
                "Adjacent phases are not contiguous".to_string(),
            ));
        }
        Ok(())
    }

    /// Run-count consistency: every phase's `runs` equals its record count
    ///
    /// Returns the names of phases that disagree.
    pub fn run_count_mismatches(&self) -> Vec<(String, u32, u32)> {
        self.timeline
            .phases()
            .iter()
            .filter_map(|phase| {
                let real = phase.contiguous_records();
                // The seeded record of a never-started initial phase is not a run
                let seeded_only = phase.runs == 0
                    && real == 1
                    && phase.record(0).is_some_and(|r| r.job_id.is_none());
                if phase.runs != real && !seeded_only {
                    Some((phase.name.clone(), phase.runs, real))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline() -> Timeline {
        Timeline::new(vec![
            Phase::new("START", 0, Some(0)),
            Phase::new("A", 0, Some(1000)),
            Phase::new("B", 1000, None),
            Phase::new("C", 0, Some(500)),
        ])
    }

    #[test]
    fn test_timeline_queries() {
        let timeline = timeline();
        assert_eq!(timeline.position("B"), Some(2));
        assert!(!timeline.is_fully_known());
        assert_eq!(timeline.max_end_step(), Some(1000));
        assert!(timeline.is_contiguous());
    }

    #[test]
    fn test_shift_after() {
        let mut timeline = timeline();
        timeline.phases_mut()[2].end_step = Some(6000);
        timeline.shift_after(2, 5000);
        let c = timeline.get("C").unwrap();
        assert_eq!((c.begin_step, c.end_step), (5000, Some(5500)));
        let b = timeline.get("B").unwrap();
        assert_eq!((b.begin_step, b.end_step), (1000, Some(6000)));
    }

    #[test]
    fn test_shift_stops_at_next_unknown_phase() {
        let mut timeline = Timeline::new(vec![
            Phase::new("D1", 0, None),
            Phase::new("X", 0, Some(200)),
            Phase::new("D2", 200, None),
            Phase::new("Y", 0, Some(300)),
        ]);
        timeline.phases_mut()[0].end_step = Some(5000);
        timeline.shift_after(0, 5000);
        let spans: Vec<_> = timeline.phases().iter().map(|p| (p.begin_step, p.end_step)).collect();
        assert_eq!(spans, vec![(0, Some(5000)), (5000, Some(5200)), (5200, None), (0, Some(300))]);
        assert!(timeline.is_contiguous());

        timeline.phases_mut()[2].end_step = Some(8000);
        timeline.shift_after(2, 8000);
        let y = timeline.get("Y").unwrap();
        assert_eq!((y.begin_step, y.end_step), (8000, Some(8300)));
        assert!(timeline.is_contiguous());
    }

    #[test]
    fn test_document_roundtrip() {
        let mut doc = LifecycleDocument::new(1700000000, RestartMode::Multiple, BTreeMap::new());
        doc.variables.set("steps", Number::Int(1000));
        let mut timeline = timeline();
        timeline
            .get_mut("START")
            .unwrap()
            .records
            .insert("0".to_string(), RunRecord::seed("START"));
        doc.set_timeline(timeline);

        let json = serde_json::to_string_pretty(&doc).unwrap();
        let loaded: LifecycleDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, doc);
        assert!(loaded.validate().is_ok());
        assert!(json.contains("\"end_step\": null"));
        assert!(json.contains("\"state\": \"initialized\""));
    }

    #[test]
    fn test_validate_phase_order() {
        let mut doc = LifecycleDocument::new(1, RestartMode::One, BTreeMap::new());
        doc.set_timeline(timeline());
        doc.phase_order.reverse();
        assert!(matches!(
            doc.validate(),
            Err(LifecycleError::InconsistentTimeline(_))
        ));
    }

    #[test]
    fn test_run_count_mismatches() {
        let mut doc = LifecycleDocument::new(1, RestartMode::One, BTreeMap::new());
        let mut timeline = timeline();
        timeline
            .get_mut("START")
            .unwrap()
            .records
            .insert("0".to_string(), RunRecord::seed("START"));
        let a = timeline.get_mut("A").unwrap();
        a.runs = 2;
        a.records.insert("0".to_string(), RunRecord::seed("A"));
        doc.set_timeline(timeline);

        assert_eq!(doc.run_count_mismatches(), vec![("A".to_string(), 2, 1)]);
    }
}

//! Line classification for simulation script templates
//!
//! Every template line is matched against an ordered table of directive
//! patterns; the first match wins. Later patterns are looser than earlier ones
//! (a seed declaration is also a variable declaration), so the table order is
//! part of the grammar.

use crate::types::{LifecycleError, RestartMode, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Names whose declarations are replaced by a wall-clock seed
pub const SEED_NAMES: [&str; 3] = ["SEED_I", "SEED_II", "SEED_III"];

/// Variable declaration style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableStyle {
    Equal,
    Loop,
}

/// A classified template line
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `variable SEED_I equal <n>`
    Seed { name: String },
    /// `variable <name> equal|loop <expr>`
    Variable {
        name: String,
        style: VariableStyle,
        value: String,
    },
    /// `timestep <expr>`
    Timestep { value: String },
    /// `run <expr> [keywords...]`
    Run { steps: String },
    /// `# label: <Name>`
    PhaseBoundary { name: String },
    /// `label <name>`
    LoopLabel { label: String },
    /// `jump SELF <name>`
    LoopJump { label: String },
    /// `next <var>`
    LoopNext { variable: String },
    /// `if "<cond>" then "<command>"` with no alternative branch
    Conditional { jump_label: Option<String> },
    /// `restart <expr> <file>...`
    Checkpoint {
        cadence: String,
        shape: RestartMode,
        files: Vec<String>,
    },
    /// A `restart` line whose file arguments fit none of the known layouts
    MalformedCheckpoint,
    /// Anything else
    Other,
}

/// Section marker used by the script generator (`# part: start|save|run`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Start,
    Save,
    Run,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Seed,
    VariableEqual,
    VariableLoop,
    Timestep,
    Run,
    PhaseBoundary,
    LoopLabel,
    LoopJump,
    LoopNext,
    Conditional,
    CheckpointMultiple,
    CheckpointOne,
    CheckpointTwo,
    CheckpointAny,
}

/// Ordered classification table: precedence is the slice order
const RULES: &[(Kind, &str)] = &[
    (
        Kind::Seed,
        r"^\s*variable\s+(SEED_I|SEED_II|SEED_III)\s+equal\s+\d+(?:[./]\d+)?\s*$",
    ),
    (Kind::VariableEqual, r"^\s*variable\s+([A-Za-z_\d]+)\s+equal\s+(.+?)\s*$"),
    (Kind::VariableLoop, r"^\s*variable\s+([A-Za-z_\d]+)\s+loop\s+(\S+).*$"),
    (Kind::Timestep, r"^\s*timestep\s+(\S+)\s*$"),
    (Kind::Run, r"^\s*run\s+(\S+).*$"),
    (Kind::PhaseBoundary, r"^\s*#\s+label:\s*([A-Za-z][A-Za-z_\d]*)\s*$"),
    (Kind::LoopLabel, r"^\s*label\s+([A-Za-z_]+)\s*$"),
    (Kind::LoopJump, r"^\s*jump\s+SELF\s+([A-Za-z_]+)\s*$"),
    (Kind::LoopNext, r"^\s*next\s+([A-Za-z_]+)\s*$"),
    (Kind::Conditional, r#"^\s*if\s+"[^"]*"\s+then(\s+"[^"]*")+\s*$"#),
    (
        Kind::CheckpointMultiple,
        r"^\s*restart\s+(\d+|\$\{[^}]*\})\s+([A-Za-z_/\d]+)\.\*\s*$",
    ),
    (
        Kind::CheckpointOne,
        r"^\s*restart\s+(\d+|\$\{[^}]*\})\s+([A-Za-z_/\d.]+)\s*$",
    ),
    (
        Kind::CheckpointTwo,
        r"^\s*restart\s+(\d+|\$\{[^}]*\})\s+([A-Za-z_/\d.]+)\s+([A-Za-z_/\d.]+)\s*$",
    ),
    (Kind::CheckpointAny, r"^\s*restart\s+.*$"),
];

struct Grammar {
    rules: Vec<(Kind, Regex)>,
    conditional_jump: Regex,
    const_variable: Regex,
    numeric_variable: Regex,
    dump: Regex,
    write_restart: Regex,
    part: Regex,
}

impl Grammar {
    fn compile() -> std::result::Result<Self, String> {
        let re = |pattern: &str| Regex::new(pattern).map_err(|e| e.to_string());
        let mut rules = Vec::with_capacity(RULES.len());
        for (kind, pattern) in RULES {
            rules.push((*kind, re(pattern)?));
        }
        Ok(Self {
            rules,
            conditional_jump: re(r"jump\s+SELF\s+([A-Za-z_]+)")?,
            const_variable: re(
                r"^\s*variable\s+([A-Za-z_\d]+)\s+equal\s+(\d+|\$\{.*?\})\s*#!const\s*$",
            )?,
            numeric_variable: re(r"^\s*variable\s+([A-Za-z_\d]+)\s+equal\s+\d+(?:[./]\d+)?\s*$")?,
            dump: re(
                r"^\s*dump\s+(\S+)\s+(\S+)\s+(\S+)\s+(\d+|\$\{[A-Za-z_\d]+\})\s+(\S+)((?:\s+\S+)*)\s*$",
            )?,
            write_restart: re(r"^\s*write_restart\s+\S+\s*$")?,
            part: re(r"^\s*#\s*part:\s*([A-Za-z_]+)\s*$")?,
        })
    }
}

fn grammar() -> Result<&'static Grammar> {
    static GRAMMAR: OnceLock<std::result::Result<Grammar, String>> = OnceLock::new();
    GRAMMAR
        .get_or_init(Grammar::compile)
        .as_ref()
        .map_err(|e| LifecycleError::parse(0, format!("Invalid directive grammar: {}", e)))
}

/// Strip a trailing `#` comment
///
/// Lines that are themselves comments (phase boundaries, part markers) are
/// matched before stripping.
pub fn code_part(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Classify one template line
pub fn classify(line: &str) -> Result<Directive> {
    let grammar = grammar()?;
    let raw = line.trim_end_matches(['\n', '\r']);
    let code = code_part(raw);

    for (kind, regex) in &grammar.rules {
        // Phase boundaries live inside comments, everything else in code
        let subject = match kind {
            Kind::PhaseBoundary => raw,
            _ if is_comment(raw) => continue,
            _ => code,
        };
        let Some(caps) = regex.captures(subject) else {
            continue;
        };
        let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();

        let directive = match kind {
            Kind::Seed => Directive::Seed { name: group(1) },
            Kind::VariableEqual => Directive::Variable {
                name: group(1),
                style: VariableStyle::Equal,
                value: group(2),
            },
            Kind::VariableLoop => Directive::Variable {
                name: group(1),
                style: VariableStyle::Loop,
                value: group(2),
            },
            Kind::Timestep => Directive::Timestep { value: group(1) },
            Kind::Run => Directive::Run { steps: group(1) },
            Kind::PhaseBoundary => Directive::PhaseBoundary { name: group(1) },
            Kind::LoopLabel => Directive::LoopLabel { label: group(1) },
            Kind::LoopJump => Directive::LoopJump { label: group(1) },
            Kind::LoopNext => Directive::LoopNext { variable: group(1) },
            Kind::Conditional => Directive::Conditional {
                jump_label: grammar
                    .conditional_jump
                    .captures(code)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            },
            Kind::CheckpointMultiple => Directive::Checkpoint {
                cadence: group(1),
                shape: RestartMode::Multiple,
                files: vec![format!("{}.*", group(2))],
            },
            Kind::CheckpointOne => Directive::Checkpoint {
                cadence: group(1),
                shape: RestartMode::One,
                files: vec![group(2)],
            },
            Kind::CheckpointTwo => Directive::Checkpoint {
                cadence: group(1),
                shape: RestartMode::Two,
                files: vec![group(2), group(3)],
            },
            Kind::CheckpointAny => Directive::MalformedCheckpoint,
        };
        return Ok(directive);
    }

    Ok(Directive::Other)
}

/// Name of a `#!const` variable declaration
pub fn const_variable(line: &str) -> Result<Option<String>> {
    Ok(grammar()?
        .const_variable
        .captures(line.trim_end_matches(['\n', '\r']))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string()))
}

/// Name of a variable declared with a plain numeric literal
pub fn numeric_variable(line: &str) -> Result<Option<String>> {
    Ok(grammar()?
        .numeric_variable
        .captures(code_part(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string()))
}

/// A `dump` directive split into its fields
#[derive(Debug, Clone, PartialEq)]
pub struct DumpLine {
    pub id: String,
    pub group: String,
    pub style: String,
    pub every: String,
    pub file: String,
    pub args: Vec<String>,
}

pub fn dump(line: &str) -> Result<Option<DumpLine>> {
    let grammar = grammar()?;
    if is_comment(line) {
        return Ok(None);
    }
    Ok(grammar.dump.captures(code_part(line)).map(|c| {
        let group = |i: usize| c.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
        DumpLine {
            id: group(1),
            group: group(2),
            style: group(3),
            every: group(4),
            file: group(5),
            args: group(6).split_whitespace().map(str::to_string).collect(),
        }
    }))
}

pub fn is_write_restart(line: &str) -> Result<bool> {
    Ok(!is_comment(line) && grammar()?.write_restart.is_match(code_part(line)))
}

/// Parse a `# part: <name>` marker
pub fn part_marker(line: &str) -> Result<Option<Part>> {
    let Some(caps) = grammar()?.part.captures(line.trim_end_matches(['\n', '\r'])) else {
        return Ok(None);
    };
    match caps.get(1).map(|m| m.as_str()) {
        Some("start") => Ok(Some(Part::Start)),
        Some("save") => Ok(Some(Part::Save)),
        Some("run") => Ok(Some(Part::Run)),
        Some(other) => Err(LifecycleError::parse(
            0,
            format!("Unknown part marker '{}'", other),
        )),
        None => Ok(None),
    }
}

//! Restart resolver
//!
//! Locates the newest checkpoint for the active restart mode and resolves it
//! against the persisted timeline.

mod checkpoint;
mod resolver;

pub use checkpoint::{last_step_of, locate, parse_data_header, Checkpoint, CheckpointConverter};
pub use resolver::{back_fill, current_phase, is_complete, resolve, Resolution};

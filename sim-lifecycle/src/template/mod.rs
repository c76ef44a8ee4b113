//! Template interpreter and script generator

pub mod directives;
mod generator;
mod interpreter;

pub use directives::{Directive, Part};
pub use generator::{generate, render, render_restart};
pub use interpreter::interpret;

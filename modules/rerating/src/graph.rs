//! Handle on the three materialized views of one rerate run
//!
//! The view builder returns a `GraphViews`; every later stage (summary,
//! cursor, executor, cleanup) receives it explicitly instead of assuming a
//! fixed view name.

use thiserror::Error;

/// Longest accepted prefix; keeps `<prefix>_triggered_graph_parent_idx`
/// under the 63 byte Postgres identifier limit.
pub const MAX_PREFIX_LEN: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphNameError {
    #[error("Invalid view prefix '{0}': use 1-30 lowercase letters, digits or '_', starting with a letter")]
    InvalidPrefix(String),
}

/// Names of the dependency-graph views for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphViews {
    prefix: String,
    main: String,
    triggered: String,
    billed_marker: String,
}

impl GraphViews {
    /// Build the handle from a prefix, validating it as a SQL identifier
    pub fn new(prefix: &str) -> Result<Self, GraphNameError> {
        if !is_valid_prefix(prefix) {
            return Err(GraphNameError::InvalidPrefix(prefix.to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            main: format!("{prefix}_main_graph"),
            triggered: format!("{prefix}_triggered_graph"),
            billed_marker: format!("{prefix}_billed_marker"),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// One row per (billing account, invoice line, discount invoice line)
    pub fn main(&self) -> &str {
        &self.main
    }

    /// Triggered and triggered-discount waves, keyed by main-graph row
    pub fn triggered(&self) -> &str {
        &self.triggered
    }

    /// Main-graph rows whose group touches a billed invoice line
    pub fn billed_marker(&self) -> &str {
        &self.billed_marker
    }

    /// Views in drop order (dependents first)
    pub fn drop_order(&self) -> [&str; 3] {
        [&self.billed_marker, &self.triggered, &self.main]
    }
}

fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }

    prefix.len() <= MAX_PREFIX_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

//! Store handle for a routeforge deployment instance.
//!
//! One store directory holds one deployment instance: its sqlite database,
//! its event log, and its configuration. Independent stores share nothing;
//! cross-instance consistency comes only from deterministic inputs.

use std::path::PathBuf;

/// Handle to one deployment instance's state workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory (`.routeforge/data`).
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path to the append-only transition event log.
    pub fn event_log_path(&self) -> PathBuf {
        self.root.join("router.events.jsonl")
    }
}

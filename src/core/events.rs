use crate::core::clock::{new_event_id, now_epoch_z};
use crate::core::error::ForgeError;
use crate::core::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::PathBuf;

/// One structured record per state transition, appended to
/// `router.events.jsonl` for audit tooling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ForgeEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub kind: String,
    pub detail: JsonValue,
}

/// Append-only JSONL transition log. Every commit, apply, activation, pause,
/// role change, and deployment lands here with the hashes/addresses/epoch the
/// auditor needs.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(store: &Store) -> Self {
        Self {
            path: store.event_log_path(),
        }
    }

    pub fn append(&self, actor: &str, kind: &str, detail: JsonValue) -> Result<(), ForgeError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let ev = ForgeEvent {
            ts: now_epoch_z(),
            event_id: new_event_id(),
            actor: actor.to_string(),
            kind: kind.to_string(),
            detail,
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(ForgeError::IoError)?;

        writeln!(
            f,
            "{}",
            serde_json::to_string(&ev)
                .map_err(|e| ForgeError::Validation(format!("event serialize: {}", e)))?
        )
        .map_err(ForgeError::IoError)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<ForgeEvent>, ForgeError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(ForgeError::IoError)?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let ev: ForgeEvent = serde_json::from_str(line)
                .map_err(|e| ForgeError::Validation(format!("corrupt event log line: {}", e)))?;
            events.push(ev);
        }
        Ok(events)
    }
}

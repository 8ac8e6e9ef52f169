// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Append-only, per-session log of agent messages, tool calls, and tool
//! results (§4.8, C8), used to reconstruct context for agents that don't
//! natively support resume ("fork-session"). Storage location is internal
//! to the manager host; if the directory can't be created, history is
//! silently disabled rather than failing the caller (Design Note: "Session
//! history storage path").

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Message { role: String, text: String },
    ToolCall { id: String, name: String, args: serde_json::Value },
    ToolResult { id: String, result: serde_json::Value },
}

pub struct SessionHistory {
    root: PathBuf,
}

impl SessionHistory {
    /// `root` is the base directory (e.g. `{state_dir}/execd/history`);
    /// creation failure here is not fatal — `append`/`read_all` degrade to
    /// no-ops and return an empty history respectively.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if let Err(e) = fs::create_dir_all(&root) {
            warn!(path = %root.display(), error = %e, "session history directory unavailable, history disabled");
        }
        Self { root }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    pub fn append(&self, session_id: &str, entry: &HistoryEntry) {
        let path = self.path_for(session_id);
        let Ok(line) = serde_json::to_string(entry) else {
            warn!(session_id, "failed to serialize history entry");
            return;
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(session_id, path = %path.display(), error = %e, "failed to append session history, context injection disabled for this write");
        }
    }

    pub fn read_all(&self, session_id: &str) -> Vec<HistoryEntry> {
        let path = self.path_for(session_id);
        let Ok(contents) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_all_round_trips_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path());

        history.append(
            "s1",
            &HistoryEntry::Message {
                role: "user".into(),
                text: "fix the bug".into(),
            },
        );
        history.append(
            "s1",
            &HistoryEntry::ToolCall {
                id: "tc1".into(),
                name: "ls".into(),
                args: serde_json::json!({}),
            },
        );

        let entries = history.read_all("s1");
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], HistoryEntry::Message { .. }));
        assert!(matches!(entries[1], HistoryEntry::ToolCall { .. }));
    }

    #[test]
    fn read_all_on_missing_session_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path());
        assert!(history.read_all("never-written").is_empty());
    }

    #[test]
    fn unwritable_root_degrades_gracefully_instead_of_panicking() {
        let history = SessionHistory::new("/proc/execd-history-should-not-be-creatable/sub");
        history.append(
            "s1",
            &HistoryEntry::Message {
                role: "user".into(),
                text: "hi".into(),
            },
        );
        assert!(history.read_all("s1").is_empty());
    }
}

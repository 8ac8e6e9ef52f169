// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::collections::BTreeMap;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Opaque unique id for one [`AgentExecution`], assigned on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller's session id, distinct from the protocol-level `acpSessionID`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-assigned container id, used as the third `ExecutionStore` index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle states from §4.10.6 of the design. `Completed`, `Failed`, and
/// `Stopped` are terminal; there is no transition out of any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Starting,
    Running,
    Ready,
    Stopped,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Completed | Status::Failed)
    }
}

/// Backend-specific placement info: a containerized instance carries a
/// container id and IP; a standalone instance carries an id and port.
/// Exactly one variant is set once a backend has created the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Container { container_id: ContainerId, container_ip: String },
    Standalone { instance_id: String, port: u16 },
}

impl Placement {
    pub fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Placement::Container { container_id, .. } => Some(container_id),
            Placement::Standalone { .. } => None,
        }
    }
}

/// The well-known metadata keys from §6, plus a narrow extension bag for
/// anything else. A tagged struct rather than a bare `HashMap<String, String>`
/// so callers get compile-time field access for the keys the manager itself
/// reads, while still round-tripping arbitrary extra keys a caller set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub task_description: Option<String>,
    pub worktree_id: Option<String>,
    pub worktree_branch: Option<String>,
    pub main_repo_git_dir: Option<String>,
    pub executor_id: Option<String>,
    pub executor_mcp_policy: Option<String>,
    pub acp_session_id: Option<String>,
    pub auggie_session_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "task_description" => self.task_description.as_deref(),
            "worktree_id" => self.worktree_id.as_deref(),
            "worktree_branch" => self.worktree_branch.as_deref(),
            "main_repo_git_dir" => self.main_repo_git_dir.as_deref(),
            "executor_id" => self.executor_id.as_deref(),
            "executor_mcp_policy" => self.executor_mcp_policy.as_deref(),
            "acp_session_id" => self.acp_session_id.as_deref(),
            "auggie_session_id" => self.auggie_session_id.as_deref(),
            other => self.extra.get(other).map(String::as_str),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match key {
            "task_description" => self.task_description = Some(value),
            "worktree_id" => self.worktree_id = Some(value),
            "worktree_branch" => self.worktree_branch = Some(value),
            "main_repo_git_dir" => self.main_repo_git_dir = Some(value),
            "executor_id" => self.executor_id = Some(value),
            "executor_mcp_policy" => self.executor_mcp_policy = Some(value),
            "acp_session_id" => self.acp_session_id = Some(value),
            "auggie_session_id" => self.auggie_session_id = Some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }
}

/// Buffers and in-flight segment ids for the message/thinking stream flush
/// machinery (§4.10.5). Every read or write of these fields MUST happen
/// while holding the owning execution's streaming mutex (invariant I5/F4).
#[derive(Debug, Clone, Default)]
pub struct StreamingState {
    pub message_buffer: String,
    pub thinking_buffer: String,
    pub current_message_id: Option<String>,
    pub current_thinking_id: Option<String>,
}

impl StreamingState {
    pub fn clear(&mut self) {
        self.message_buffer.clear();
        self.thinking_buffer.clear();
        self.current_message_id = None;
        self.current_thinking_id = None;
    }
}

/// Snapshot of the agent's most recently announced slash commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableCommands {
    pub commands: Vec<AvailableCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableCommand {
    pub name: String,
    pub description: String,
}

/// The central entity: one tracked agent lifecycle (§3).
pub struct AgentExecution {
    pub id: ExecutionId,
    pub task_id: String,
    pub session_id: SessionId,
    pub agent_profile_id: String,
    pub workspace_path: String,
    pub placement: Option<Placement>,
    pub runtime_name: String,
    pub status: Status,
    pub acp_session_id: Option<String>,
    pub agent_command: Vec<String>,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub error_message: String,
    pub metadata: Metadata,
    pub streaming: Mutex<StreamingState>,
    pub available_commands: AvailableCommands,
    pub passthrough_process_id: Option<u32>,
}

impl AgentExecution {
    pub fn new(
        task_id: impl Into<String>,
        session_id: SessionId,
        agent_profile_id: impl Into<String>,
        workspace_path: impl Into<String>,
        now: SystemTime,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            task_id: task_id.into(),
            session_id,
            agent_profile_id: agent_profile_id.into(),
            workspace_path: workspace_path.into(),
            placement: None,
            runtime_name: String::new(),
            status: Status::Starting,
            acp_session_id: None,
            agent_command: Vec::new(),
            started_at: now,
            finished_at: None,
            exit_code: None,
            error_message: String::new(),
            metadata: Metadata::default(),
            streaming: Mutex::new(StreamingState::default()),
            available_commands: AvailableCommands::default(),
            passthrough_process_id: None,
        }
    }

    pub fn container_id(&self) -> Option<&ContainerId> {
        self.placement.as_ref().and_then(Placement::container_id)
    }

    /// Read-only snapshot handed to external callers; the live record never
    /// leaves the store (Ownership, §3).
    pub fn snapshot(&self) -> AgentExecutionSnapshot {
        let streaming = self.streaming.lock();
        AgentExecutionSnapshot {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            session_id: self.session_id.clone(),
            agent_profile_id: self.agent_profile_id.clone(),
            workspace_path: self.workspace_path.clone(),
            placement: self.placement.clone(),
            runtime_name: self.runtime_name.clone(),
            status: self.status,
            acp_session_id: self.acp_session_id.clone(),
            agent_command: self.agent_command.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            error_message: self.error_message.clone(),
            metadata: self.metadata.clone(),
            has_pending_message: !streaming.message_buffer.is_empty(),
            available_commands: self.available_commands.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentExecutionSnapshot {
    pub id: ExecutionId,
    pub task_id: String,
    pub session_id: SessionId,
    pub agent_profile_id: String,
    pub workspace_path: String,
    pub placement: Option<Placement>,
    pub runtime_name: String,
    pub status: Status,
    pub acp_session_id: Option<String>,
    pub agent_command: Vec<String>,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub error_message: String,
    pub metadata: Metadata,
    pub has_pending_message: bool,
    pub available_commands: AvailableCommands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_well_known_and_extension_keys() {
        let mut meta = Metadata::default();
        meta.set("task_description", "fix the bug");
        meta.set("worktree_id", "wt-1");
        meta.set("some_custom_key", "value");

        assert_eq!(meta.get("task_description"), Some("fix the bug"));
        assert_eq!(meta.get("worktree_id"), Some("wt-1"));
        assert_eq!(meta.get("some_custom_key"), Some("value"));
        assert_eq!(meta.get("missing"), None);
    }

    #[test]
    fn status_terminal_classification() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Stopped.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Ready.is_terminal());
        assert!(!Status::Starting.is_terminal());
    }

    #[test]
    fn streaming_state_clear_resets_segment_ids() {
        let mut s = StreamingState {
            message_buffer: "hi".into(),
            thinking_buffer: "thinking".into(),
            current_message_id: Some("m1".into()),
            current_thinking_id: Some("t1".into()),
        };
        s.clear();
        assert!(s.message_buffer.is_empty());
        assert!(s.thinking_buffer.is_empty());
        assert!(s.current_message_id.is_none());
        assert!(s.current_thinking_id.is_none());
    }
}

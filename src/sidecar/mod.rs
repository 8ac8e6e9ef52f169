// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! The sidecar (`agentctl`) API this crate consumes (§6). Only the external
//! surface is modeled here; the sidecar's own implementation is an
//! out-of-scope collaborator. `AgentctlClient` is a trait so tests can swap
//! in a fake without standing up a real HTTP server.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod http;

/// Boxed future returned by every [`AgentctlClient`] method, keeping the
/// trait object-safe (the same pattern the PTY `Backend` trait uses for
/// its `run` method) without pulling in an async-trait macro crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalPolicy {
    Never,
    Untrusted,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::Untrusted => "untrusted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResult {
    pub stop_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarStatus {
    pub is_running: bool,
}

/// Typed events delivered over the agent stream (`stream_agent`). Mirrors
/// the event kinds in §4.5/§4.10.5; the manager is the only consumer and
/// applies the flush transformations described there before anything is
/// republished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    MessageChunk { text: String },
    Reasoning { text: String },
    ToolCall { id: String, name: String, args: serde_json::Value },
    ToolUpdate { id: String, status: String, result: Option<serde_json::Value> },
    Plan { steps: Vec<String> },
    Error { message: String, is_error: bool },
    Complete { is_error: bool, error: Option<String> },
    PermissionRequest {
        pending_id: String,
        options: Vec<PermissionOption>,
        description: String,
    },
    ContextWindow { used_tokens: u64, max_tokens: u64 },
    AvailableCommands { commands: Vec<crate::model::AvailableCommand> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    pub label: String,
}

/// Events delivered over the workspace stream (`stream_workspace`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkspaceStreamEvent {
    GitStatus { porcelain: String },
    GitCommit { sha: String, message: String },
    GitReset { to: String },
    FileChange { path: String, kind: String },
    ShellOutput { shell_id: String, chunk: String },
    ShellExit { shell_id: String, code: Option<i32> },
    ProcessOutput { process_id: String, chunk: String },
    ProcessStatus { process_id: String, running: bool },
    /// An MCP callback the agent routed back through agentctl to the
    /// backend; the manager dispatches it to a pluggable handler rather
    /// than acting on it directly.
    McpRequest { request_id: String, payload: serde_json::Value },
}

/// The sidecar control API consumed per execution (§6). One client instance
/// is created per execution by the owning backend and closed on Stop.
///
/// Object-safe via boxed futures so `Box<dyn AgentctlClient>` can be stored
/// on an `AgentExecution` without a generic parameter.
pub trait AgentctlClient: Send + Sync {
    fn initialize<'a>(&'a self, client_name: &'a str, client_version: &'a str) -> BoxFuture<'a, AgentInfo>;
    fn new_session<'a>(&'a self, workspace: &'a str, mcp_servers: &'a [McpServer]) -> BoxFuture<'a, String>;
    fn load_session<'a>(&'a self, session_id: &'a str, workspace: &'a str, mcp_servers: &'a [McpServer]) -> BoxFuture<'a, ()>;
    fn configure_agent<'a>(
        &'a self,
        argv: &'a [String],
        env: &'a HashMap<String, String>,
        approval_policy: Option<ApprovalPolicy>,
    ) -> BoxFuture<'a, ()>;
    fn start(&self) -> BoxFuture<'_, ()>;
    fn stop(&self) -> BoxFuture<'_, ()>;
    fn cancel(&self) -> BoxFuture<'_, ()>;
    fn close(&self) -> BoxFuture<'_, ()>;
    /// Blocks until the agent ends its turn; honors the caller-supplied
    /// timeout (designed ceiling: 10 minutes, §5).
    fn prompt<'a>(&'a self, text: &'a str, timeout: Duration) -> BoxFuture<'a, PromptResult>;
    fn respond_to_permission<'a>(&'a self, pending_id: &'a str, option_id: &'a str, cancelled: bool) -> BoxFuture<'a, ()>;
    fn get_status(&self) -> BoxFuture<'_, SidecarStatus>;
    fn wait_for_ready(&self, timeout: Duration) -> BoxFuture<'_, ()>;

    fn start_shell<'a>(&'a self, shell_id: &'a str, cwd: &'a str) -> BoxFuture<'a, ()>;
    fn shell_input<'a>(&'a self, shell_id: &'a str, data: &'a [u8]) -> BoxFuture<'a, ()>;
    fn shell_resize<'a>(&'a self, shell_id: &'a str, cols: u16, rows: u16) -> BoxFuture<'a, ()>;
}

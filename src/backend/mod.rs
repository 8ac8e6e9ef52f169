// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Execution backends: the container/process runtime drivers themselves are
//! out of scope (§1); only the `ExecutorBackend` contract they must satisfy
//! is modeled here, plus the registry that selects one per request (§4.6).

pub mod registry;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use serde_json::Value;

use crate::model::Metadata;
use crate::sidecar::{AgentctlClient, McpServer};
use crate::stream_manager::AgentEventSource;

/// A sidecar client that also serves as the execution's long-lived event
/// source, so the manager can hold exactly one handle per execution for
/// both control calls and stream access. Blanket-implemented for anything
/// satisfying both — a backend only has to produce an `AgentctlClient` that
/// happens to also implement `AgentEventSource`.
pub trait AgentBackendClient: AgentctlClient + AgentEventSource {}
impl<T: AgentctlClient + AgentEventSource + ?Sized> AgentBackendClient for T {}

#[derive(Debug, Clone)]
pub struct RuntimeCreateRequest {
    pub instance_id: String,
    pub task_id: String,
    pub session_id: String,
    pub agent_profile_id: String,
    pub workspace_path: String,
    pub protocol: String,
    pub env: HashMap<String, String>,
    pub metadata: Metadata,
    pub agent_config_name: String,
    pub mcp_servers: Vec<McpServer>,
}

pub struct RuntimeInstance {
    pub client: Box<dyn AgentBackendClient>,
    pub container_id: Option<String>,
    pub container_ip: Option<String>,
    pub standalone_instance_id: Option<String>,
    pub standalone_port: Option<u16>,
    pub metadata: Metadata,
}

pub struct RecoveredInstance {
    pub instance_id: String,
    pub task_id: String,
    pub session_id: String,
    pub agent_profile_id: String,
    pub workspace_path: String,
    pub client: Box<dyn AgentBackendClient>,
    pub container_id: Option<String>,
}

/// An interactive runner used by [`crate::passthrough`] when a profile asks
/// for CLI passthrough mode; acquired from the standalone backend.
pub trait InteractiveRunner: Send + Sync {
    fn spawn(&self, argv: &[String], cwd: &str, env: &HashMap<String, String>, cols: u16, rows: u16) -> Result<Box<dyn crate::passthrough::pty::PtyProcess>>;
}

/// Object-safe backend contract (§6, ExecutorBackend). Every async method
/// returns a boxed future so the trait can be stored as `Box<dyn ExecutorBackend>`
/// in the registry.
pub trait ExecutorBackend: Send + Sync {
    fn name(&self) -> &str;
    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
    fn create_instance<'a>(&'a self, req: &'a RuntimeCreateRequest) -> Pin<Box<dyn Future<Output = Result<RuntimeInstance>> + Send + 'a>>;
    fn stop_instance<'a>(&'a self, instance: &'a RuntimeInstance, force: bool) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
    fn recover_instances(&self) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveredInstance>>> + Send + '_>>;
    fn get_interactive_runner(&self) -> Option<Box<dyn InteractiveRunner>>;
    fn is_container_backend(&self) -> bool {
        false
    }
}

/// How `BackendRegistry::get_for_executor_type` responds when the requested
/// backend is unavailable (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    Allow,
    Warn,
    Deny,
}

/// Default MCP policy per backend name, absent an executor override. A
/// conservative default (deny) for anything other than the standalone
/// backend — supplemented from `original_source/` since spec.md's
/// distillation does not spell this rule out (§4.6 of SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpPolicy {
    AllowAll,
    DenyAll,
}

pub fn default_policy_for_runtime(backend_name: &str) -> McpPolicy {
    match backend_name {
        "standalone" => McpPolicy::AllowAll,
        _ => McpPolicy::DenyAll,
    }
}

pub fn resolve_mcp_overlay(policy: McpPolicy, overlay: Option<&str>) -> Result<McpPolicy> {
    let Some(overlay) = overlay else {
        return Ok(policy);
    };
    match overlay {
        "allow_all" => Ok(McpPolicy::AllowAll),
        "deny_all" => Ok(McpPolicy::DenyAll),
        "inherit" => Ok(policy),
        other => Err(crate::error::ManagerError::new(crate::error::ErrorKind::MCPPolicy, format!("unrecognized executor_mcp_policy override: {other}")).into()),
    }
}

pub type McpPolicyOverlayValue = Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_standalone_and_denies_others() {
        assert_eq!(default_policy_for_runtime("standalone"), McpPolicy::AllowAll);
        assert_eq!(default_policy_for_runtime("docker"), McpPolicy::DenyAll);
        assert_eq!(default_policy_for_runtime("unknown"), McpPolicy::DenyAll);
    }

    #[test]
    fn overlay_parse_error_is_fatal() {
        let err = resolve_mcp_overlay(McpPolicy::DenyAll, Some("garbage")).unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }

    #[test]
    fn overlay_inherit_keeps_base_policy() {
        let resolved = resolve_mcp_overlay(McpPolicy::AllowAll, Some("inherit")).unwrap();
        assert_eq!(resolved, McpPolicy::AllowAll);
    }
}

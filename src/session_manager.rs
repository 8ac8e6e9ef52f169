// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Drives the session protocol over an [`AgentctlClient`]: initialize →
//! new/load session → prompt → await turn end (§4.3, C3).

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::error::{ErrorKind, ManagerError};
use crate::model::{AgentExecutionSnapshot, Status};
use crate::sidecar::{AgentctlClient, McpServer};
use crate::store::ExecutionStore;

pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const CLIENT_NAME: &str = "execd";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of a completed turn, handed back to the caller of `prompt`.
pub struct TurnResult {
    pub stop_reason: String,
}

pub struct SessionManager;

impl SessionManager {
    /// Step 1-5 of §4.3: initialize, open or resume the protocol session,
    /// reset streaming buffers, and (if a task description is present)
    /// drive the initial prompt to completion.
    pub async fn initialize_and_prompt(
        store: &ExecutionStore,
        client: &dyn AgentctlClient,
        id: &crate::model::ExecutionId,
        workspace_path: &str,
        task_description: Option<&str>,
        mcp_servers: &[McpServer],
        agent_supports_resume: bool,
        prior_acp_session_id: Option<&str>,
    ) -> Result<Option<TurnResult>> {
        let info = client
            .initialize(CLIENT_NAME, CLIENT_VERSION)
            .await
            .map_err(|e| ManagerError::new(ErrorKind::ProtocolInit, e.to_string()))
            .context("sidecar initialize failed")?;
        info!(agent_name = %info.name, agent_version = %info.version, "agent initialized");

        let acp_session_id = match (prior_acp_session_id, agent_supports_resume) {
            (Some(session_id), true) => {
                client
                    .load_session(session_id, workspace_path, mcp_servers)
                    .await
                    .map_err(|e| ManagerError::new(ErrorKind::ProtocolInit, e.to_string()))
                    .context("sidecar load_session failed")?;
                session_id.to_string()
            }
            _ => client
                .new_session(workspace_path, mcp_servers)
                .await
                .map_err(|e| ManagerError::new(ErrorKind::ProtocolInit, e.to_string()))
                .context("sidecar new_session failed")?,
        };

        store.with_write_lock(id, |execution| -> Result<()> {
            let execution = execution.map_err(|_| ManagerError::not_found(id.to_string()))?;
            execution.acp_session_id = Some(acp_session_id.clone());
            execution.metadata.set("acp_session_id", acp_session_id.clone());
            execution.streaming.lock().clear();
            Ok(())
        })?;

        match task_description {
            Some(text) if !text.is_empty() => {
                let result = Self::run_prompt(store, client, id, text).await?;
                Ok(Some(result))
            }
            _ => Ok(None),
        }
    }

    /// §4.3 `SendPrompt`: requires the execution be `Running` or `Ready`,
    /// transitions to `Running`, resets the message buffer, and blocks
    /// until the turn ends.
    pub async fn send_prompt(
        store: &ExecutionStore,
        client: &dyn AgentctlClient,
        id: &crate::model::ExecutionId,
        text: &str,
    ) -> Result<TurnResult> {
        store.with_write_lock(id, |execution| -> Result<()> {
            let execution = execution.map_err(|_| ManagerError::not_found(id.to_string()))?;
            if !matches!(execution.status, Status::Running | Status::Ready) {
                return Err(ManagerError::invalid_state(format!(
                    "cannot prompt execution in state {:?}",
                    execution.status
                ))
                .into());
            }
            execution.status = Status::Running;
            execution.streaming.lock().clear();
            Ok(())
        })?;

        Self::run_prompt(store, client, id, text).await
    }

    async fn run_prompt(store: &ExecutionStore, client: &dyn AgentctlClient, id: &crate::model::ExecutionId, text: &str) -> Result<TurnResult> {
        match client.prompt(text, PROMPT_TIMEOUT).await {
            Ok(result) => {
                store.update_status(id, Status::Ready).ok();
                Ok(TurnResult {
                    stop_reason: result.stop_reason,
                })
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "prompt failed");
                Err(ManagerError::new(ErrorKind::ProtocolPrompt, e.to_string()).into())
            }
        }
    }

    /// Cancel the in-flight turn. The manager calls the sidecar's `cancel`
    /// before returning whenever a caller's context is cancelled mid-prompt
    /// (§4.3 cancellation clause).
    pub async fn cancel(client: &dyn AgentctlClient) -> Result<()> {
        client
            .cancel()
            .await
            .map_err(|e| ManagerError::new(ErrorKind::SidecarCall, e.to_string()).into())
    }

    pub fn snapshot_ok(store: &ExecutionStore, id: &crate::model::ExecutionId) -> Result<AgentExecutionSnapshot> {
        store.get(id).map_err(|_| ManagerError::not_found(id.to_string()).into())
    }
}

/// Env vars injected into every agent/backend subprocess (§6).
pub fn standard_env_vars(task_id: &str, instance_id: &str, session_id: &str, agent_profile_id: &str, task_description: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("KANDEV_TASK_ID".to_string(), task_id.to_string());
    env.insert("KANDEV_INSTANCE_ID".to_string(), instance_id.to_string());
    env.insert("KANDEV_SESSION_ID".to_string(), session_id.to_string());
    env.insert("KANDEV_AGENT_PROFILE_ID".to_string(), agent_profile_id.to_string());
    env.insert("TASK_DESCRIPTION".to_string(), task_description.to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_env_vars_carries_all_required_keys() {
        let env = standard_env_vars("t1", "i1", "s1", "p1", "do the thing");
        assert_eq!(env.get("KANDEV_TASK_ID").unwrap(), "t1");
        assert_eq!(env.get("KANDEV_INSTANCE_ID").unwrap(), "i1");
        assert_eq!(env.get("KANDEV_SESSION_ID").unwrap(), "s1");
        assert_eq!(env.get("KANDEV_AGENT_PROFILE_ID").unwrap(), "p1");
        assert_eq!(env.get("TASK_DESCRIPTION").unwrap(), "do the thing");
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Top-level composition (§4.10, C10): owns the store, backends, streams,
//! and publisher, and is the only component that calls into more than one
//! of them. Grounded on the teacher's `session::Session` / `run::run` —
//! the one place that wires a PTY, a driver, and the event log together —
//! widened here from a single PTY session to N concurrently tracked agent
//! executions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::registry::BackendRegistry;
use crate::backend::RuntimeCreateRequest;
use crate::command::{self, AgentConfig, BuildOptions, PermissionFlag};
use crate::credentials::CredentialsManager;
use crate::error::{ErrorKind, ManagerError};
use crate::history::{HistoryEntry, SessionHistory};
use crate::janitor::{ContainerJanitor, ContainerLister, JanitorSink};
use crate::model::{AgentExecution, AgentExecutionSnapshot, ExecutionId, SessionId, Status};
use crate::passthrough::pty::PtyExitStatus;
use crate::passthrough::{PassthroughOptions, PassthroughRunner, PassthroughSink};
use crate::publisher::EventPublisher;
use crate::session_manager::{standard_env_vars, SessionManager, TurnResult};
use crate::sidecar::{AgentStreamEvent, AgentctlClient, McpServer, WorkspaceStreamEvent};
use crate::store::ExecutionStore;
use crate::stream_manager::{AgentEventSource, McpRequestHandler, StreamCallbacks, StreamManager};
use crate::worktree::WorktreeProvider;

const AGENTCTL_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// The profile fields `Manager::Launch`/`StartAgentProcess` consume.
/// Profile persistence itself is an out-of-scope collaborator (§1).
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub agent_type: String,
    pub model: Option<String>,
    pub auto_approve: bool,
    pub allow_indexing: bool,
    pub dangerously_skip_permissions: bool,
    pub plan: bool,
    pub cli_passthrough: bool,
}

pub trait ProfileResolver: Send + Sync {
    fn resolve(&self, profile_id: &str) -> Result<ResolvedProfile>;
}

/// How a resolved profile's boolean settings map onto this agent type's
/// command-line flags. `None` means the agent has no flag for that setting.
#[derive(Debug, Clone, Default)]
pub struct PermissionFlagSpec {
    pub auto_approve: Option<&'static str>,
    pub allow_indexing: Option<&'static str>,
    pub dangerously_skip_permissions: Option<&'static str>,
    pub plan: Option<&'static str>,
}

/// Passthrough-mode specifics for one agent type, absent for agents that
/// only support the protocol path.
#[derive(Debug, Clone)]
pub struct PassthroughProfile {
    pub resume_command: Option<Vec<String>>,
    pub prompt_pattern: regex::Regex,
    pub idle_timeout: Duration,
    pub stability_window: Duration,
    pub check_interval: Duration,
}

/// Everything the manager needs to know about one agent type: its argv
/// template, backend/resume/MCP capabilities, required credentials, and
/// (optionally) its passthrough wiring.
#[derive(Debug, Clone)]
pub struct AgentTypeEntry {
    pub command: AgentConfig,
    pub disabled: bool,
    pub supports_resume: bool,
    pub mcp_supported: bool,
    pub required_env: Vec<String>,
    pub permission_flags: PermissionFlagSpec,
    pub passthrough: Option<PassthroughProfile>,
}

pub trait AgentTypeRegistry: Send + Sync {
    fn get(&self, agent_type: &str) -> Option<Arc<AgentTypeEntry>>;
}

/// Resolves the ACP MCP server list a profile should get, before policy is
/// applied. Profile-level MCP configuration is an out-of-scope collaborator
/// (§1); `None` means "no configuration for this profile" (§4.10.3).
pub trait McpProvider: Send + Sync {
    fn servers_for_profile(&self, profile_id: &str) -> Option<Vec<McpServer>>;
}

pub struct NoMcpProvider;
impl McpProvider for NoMcpProvider {
    fn servers_for_profile(&self, _profile_id: &str) -> Option<Vec<McpServer>> {
        None
    }
}

/// Workspace/profile info needed to satisfy `EnsureWorkspaceExecutionForSession`
/// when no execution already exists for the session (recovery/attach path).
pub struct WorkspaceInfo {
    pub workspace_path: String,
    pub agent_profile_id: String,
}

pub trait WorkspaceInfoProvider: Send + Sync {
    fn workspace_for_session(&self, task_id: &str, session_id: &str) -> Option<WorkspaceInfo>;
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub task_id: String,
    pub session_id: String,
    pub agent_profile_id: String,
    pub workspace_path: String,
    pub task_description: Option<String>,
    pub use_worktree: bool,
    pub resume_acp_session_id: Option<String>,
    pub executor_type: Option<String>,
    pub env: HashMap<String, String>,
}

/// The pieces wired together at construction (§A3 of the expanded design);
/// grouped so `Manager::new` doesn't take a dozen positional arguments.
pub struct ManagerDeps {
    pub backends: BackendRegistry,
    pub publisher: EventPublisher,
    pub history: SessionHistory,
    pub credentials: Arc<dyn CredentialsManager>,
    pub worktree: Option<Arc<dyn WorktreeProvider>>,
    pub profiles: Arc<dyn ProfileResolver>,
    pub agent_types: Arc<dyn AgentTypeRegistry>,
    pub mcp_provider: Arc<dyn McpProvider>,
    pub workspace_info: Option<Arc<dyn WorkspaceInfoProvider>>,
    pub container_lister: Option<Arc<dyn ContainerLister>>,
}

/// Work queued by sync trait callbacks (`StreamCallbacks`, `JanitorSink`,
/// `McpRequestHandler`) for the single outbound task to publish in order
/// (Design Note: "async work from sync callbacks").
enum OutboundEvent {
    AgentLifecycle {
        kind: &'static str,
        agent_id: String,
        task_id: String,
        session_id: String,
        data: Value,
    },
    AgentctlLifecycle {
        kind: &'static str,
        agent_id: String,
        task_id: String,
        session_id: String,
        reason: Option<String>,
    },
    AgentStream {
        event_type: String,
        agent_id: String,
        task_id: String,
        session_id: String,
        data: Value,
    },
    Dedicated {
        kind: &'static str,
        agent_id: String,
        task_id: String,
        session_id: String,
        data: Value,
    },
    Workspace {
        kind: &'static str,
        agent_id: String,
        task_id: String,
        session_id: String,
        data: Value,
    },
}

/// Delegates `StreamCallbacks`/`JanitorSink`/`McpRequestHandler` back onto a
/// `Manager` by weak reference, so `StreamManager`/`ContainerJanitor` can be
/// constructed before the `Arc<Manager>` they point back into exists
/// (`Arc::new_cyclic`).
struct ManagerHandle(Weak<Manager>);

impl StreamCallbacks for ManagerHandle {
    fn on_agent_event(&self, id: &ExecutionId, event: AgentStreamEvent) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_agent_event(id, event);
        }
    }
    fn on_git_status(&self, id: &ExecutionId, porcelain: String) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "git_status", json!({ "porcelain": porcelain }));
        }
    }
    fn on_git_commit(&self, id: &ExecutionId, sha: String, message: String) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "git_commit", json!({ "sha": sha, "message": message }));
        }
    }
    fn on_git_reset(&self, id: &ExecutionId, to: String) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "git_reset", json!({ "to": to }));
        }
    }
    fn on_file_change(&self, id: &ExecutionId, path: String, kind: String) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "file_change", json!({ "path": path, "kind": kind }));
        }
    }
    fn on_shell_output(&self, id: &ExecutionId, shell_id: String, chunk: String) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "shell_output", json!({ "shellId": shell_id, "chunk": chunk }));
        }
    }
    fn on_shell_exit(&self, id: &ExecutionId, shell_id: String, code: Option<i32>) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "shell_exit", json!({ "shellId": shell_id, "code": code }));
        }
    }
    fn on_process_output(&self, id: &ExecutionId, process_id: String, chunk: String) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "process_output", json!({ "processId": process_id, "chunk": chunk }));
        }
    }
    fn on_process_status(&self, id: &ExecutionId, process_id: String, running: bool) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "process_status", json!({ "processId": process_id, "running": running }));
        }
    }
}

impl JanitorSink for ManagerHandle {
    fn mark_completed(&self, container_id: &str, exit_code: i32, reason: &str) {
        if let Some(m) = self.0.upgrade() {
            m.on_container_exited(container_id, exit_code, reason);
        }
    }
}

impl McpRequestHandler for ManagerHandle {
    fn handle(&self, id: &ExecutionId, request_id: String, payload: Value) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_workspace(id, "mcp_request", json!({ "requestId": request_id, "payload": payload }));
        }
    }
}

impl PassthroughSink for ManagerHandle {
    fn on_output(&self, id: &ExecutionId, chunk: bytes::Bytes) {
        if let Some(m) = self.0.upgrade() {
            m.dispatch_agent_stream(id, "passthrough_output", json!({ "chunk": String::from_utf8_lossy(&chunk) }));
        }
    }
    fn on_turn_complete(&self, id: &ExecutionId) {
        if let Some(m) = self.0.upgrade() {
            m.mark_ready(id);
        }
    }
    fn on_exited(&self, id: &ExecutionId, status: PtyExitStatus) {
        if let Some(m) = self.0.upgrade() {
            m.passthrough_runners.write().remove(id);
            let exit_code = status.code.unwrap_or(-1);
            m.mark_completed(id, exit_code, status.signal.map(|s| format!("killed by signal {s}")));
        }
    }
}

/// One execution's sidecar handle plus the cancellation token scoping its
/// background stream tasks; dropped (and the token cancelled) on removal.
struct RuntimeHandle {
    client: Arc<dyn crate::backend::AgentBackendClient>,
    shutdown: CancellationToken,
}

pub struct Manager {
    store: ExecutionStore,
    backends: BackendRegistry,
    publisher: Arc<EventPublisher>,
    history: SessionHistory,
    credentials: Arc<dyn CredentialsManager>,
    worktree: Option<Arc<dyn WorktreeProvider>>,
    profiles: Arc<dyn ProfileResolver>,
    agent_types: Arc<dyn AgentTypeRegistry>,
    mcp_provider: Arc<dyn McpProvider>,
    workspace_info: Option<Arc<dyn WorkspaceInfoProvider>>,
    stream_manager: StreamManager,
    runtime: parking_lot::RwLock<HashMap<ExecutionId, RuntimeHandle>>,
    passthrough_runners: parking_lot::RwLock<HashMap<ExecutionId, Arc<PassthroughRunner>>>,
    segment_text: parking_lot::Mutex<HashMap<ExecutionId, String>>,
    outbound_tx: mpsc::UnboundedSender<OutboundEvent>,
    root_shutdown: CancellationToken,
    self_ref: OnceLock<Weak<Manager>>,
}

impl Manager {
    pub fn new(deps: ManagerDeps) -> Arc<Self> {
        let publisher = Arc::new(deps.publisher);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                while let Some(event) = outbound_rx.recv().await {
                    publish_outbound(&publisher, event).await;
                }
            });
        }

        let root_shutdown = CancellationToken::new();
        let container_lister = deps.container_lister;

        Arc::new_cyclic(|weak| {
            let handle = Arc::new(ManagerHandle(weak.clone()));
            let stream_manager = StreamManager::new(handle.clone(), handle.clone());
            if let Some(lister) = container_lister {
                let janitor = Arc::new(ContainerJanitor::new(lister, handle));
                janitor.spawn(root_shutdown.child_token());
            }
            let self_ref = OnceLock::new();
            let _ = self_ref.set(weak.clone());
            Self {
                store: ExecutionStore::new(),
                backends: deps.backends,
                publisher,
                history: deps.history,
                credentials: deps.credentials,
                worktree: deps.worktree,
                profiles: deps.profiles,
                agent_types: deps.agent_types,
                mcp_provider: deps.mcp_provider,
                workspace_info: deps.workspace_info,
                stream_manager,
                runtime: parking_lot::RwLock::new(HashMap::new()),
                passthrough_runners: parking_lot::RwLock::new(HashMap::new()),
                segment_text: parking_lot::Mutex::new(HashMap::new()),
                outbound_tx,
                root_shutdown,
                self_ref,
            }
        })
    }

    fn self_handle(&self) -> Arc<ManagerHandle> {
        Arc::new(ManagerHandle(self.self_ref.get().cloned().unwrap_or_default()))
    }

    fn enqueue(&self, event: OutboundEvent) {
        let _ = self.outbound_tx.send(event);
    }

    fn enqueue_agent_lifecycle(&self, id: &ExecutionId, snapshot: &AgentExecutionSnapshot, kind: &'static str, data: Value) {
        self.enqueue(OutboundEvent::AgentLifecycle {
            kind,
            agent_id: id.to_string(),
            task_id: snapshot.task_id.clone(),
            session_id: snapshot.session_id.to_string(),
            data,
        });
    }

    fn enqueue_agentctl_lifecycle(&self, id: &ExecutionId, snapshot: &AgentExecutionSnapshot, kind: &'static str, reason: Option<String>) {
        self.enqueue(OutboundEvent::AgentctlLifecycle {
            kind,
            agent_id: id.to_string(),
            task_id: snapshot.task_id.clone(),
            session_id: snapshot.session_id.to_string(),
            reason,
        });
    }

    fn enqueue_agent_stream(&self, id: &ExecutionId, snapshot: &AgentExecutionSnapshot, event_type: impl Into<String>, data: Value) {
        self.enqueue(OutboundEvent::AgentStream {
            event_type: event_type.into(),
            agent_id: id.to_string(),
            task_id: snapshot.task_id.clone(),
            session_id: snapshot.session_id.to_string(),
            data,
        });
    }

    fn enqueue_dedicated(&self, id: &ExecutionId, snapshot: &AgentExecutionSnapshot, kind: &'static str, data: Value) {
        self.enqueue(OutboundEvent::Dedicated {
            kind,
            agent_id: id.to_string(),
            task_id: snapshot.task_id.clone(),
            session_id: snapshot.session_id.to_string(),
            data,
        });
    }

    fn dispatch_agent_stream(&self, id: &ExecutionId, event_type: &str, data: Value) {
        if let Ok(snapshot) = self.store.get(id) {
            self.enqueue_agent_stream(id, &snapshot, event_type.to_string(), data);
        }
    }

    fn dispatch_workspace(&self, id: &ExecutionId, kind: &'static str, data: Value) {
        if let Ok(snapshot) = self.store.get(id) {
            self.enqueue(OutboundEvent::Workspace {
                kind,
                agent_id: id.to_string(),
                task_id: snapshot.task_id,
                session_id: snapshot.session_id.to_string(),
                data,
            });
        }
    }

    // ---- Launch (§4.10.2) ----------------------------------------------

    pub async fn launch(self: &Arc<Self>, req: LaunchRequest) -> Result<AgentExecutionSnapshot> {
        let profile = self.profiles.resolve(&req.agent_profile_id)?;
        let entry = self
            .agent_types
            .get(&profile.agent_type)
            .ok_or_else(|| ManagerError::new(ErrorKind::BackendUnavailable, format!("unknown agent type {}", profile.agent_type)))?;
        if entry.disabled {
            return Err(ManagerError::new(ErrorKind::BackendUnavailable, format!("agent type {} is disabled", profile.agent_type)).into());
        }

        let session_id = SessionId(req.session_id.clone());
        if self.store.contains_session(&session_id) {
            return Err(ManagerError::invalid_state(format!("session {} already has a running execution", req.session_id)).into());
        }

        let mut workspace_path = req.workspace_path.clone();
        let mut worktree_meta: Option<(String, String)> = None;
        if req.use_worktree {
            if let Some(provider) = &self.worktree {
                match provider.create_or_reuse(&req.workspace_path, None).await {
                    Ok(handle) => {
                        workspace_path = handle.path;
                        worktree_meta = Some((handle.worktree_id, handle.branch));
                    }
                    Err(e) => warn!(task_id = %req.task_id, error = %e, "worktree creation failed, continuing with repository path"),
                }
            }
        }

        let mut execution = AgentExecution::new(req.task_id.clone(), session_id.clone(), req.agent_profile_id.clone(), workspace_path.clone(), SystemTime::now());
        if let Some(description) = &req.task_description {
            execution.metadata.set("task_description", description.clone());
        }
        if let Some((worktree_id, branch)) = &worktree_meta {
            execution.metadata.set("worktree_id", worktree_id.clone());
            execution.metadata.set("worktree_branch", branch.clone());
        }
        let id = execution.id.clone();

        let backend = self.backends.get_for_executor_type(req.executor_type.as_deref())?;
        let mcp_servers = self.resolve_mcp(backend.name(), entry.mcp_supported, &execution.metadata)?;

        let mut env = req.env.clone();
        env.extend(standard_env_vars(
            &req.task_id,
            id.as_str(),
            &req.session_id,
            &req.agent_profile_id,
            req.task_description.as_deref().unwrap_or(""),
        ));
        if let Some(model) = &profile.model {
            env.insert("AGENT_MODEL".to_string(), model.clone());
        }
        for key in &entry.required_env {
            match self.credentials.resolve(key) {
                Some(value) => {
                    env.insert(key.clone(), value);
                }
                None => warn!(execution_id = %id, key, "required credential not resolved, continuing without it"),
            }
        }

        let create_req = RuntimeCreateRequest {
            instance_id: id.to_string(),
            task_id: req.task_id.clone(),
            session_id: req.session_id.clone(),
            agent_profile_id: req.agent_profile_id.clone(),
            workspace_path: workspace_path.clone(),
            protocol: "acp".to_string(),
            env: env.clone(),
            metadata: execution.metadata.clone(),
            agent_config_name: profile.agent_type.clone(),
            mcp_servers: mcp_servers.clone(),
        };
        let instance = backend.create_instance(&create_req).await?;

        execution.runtime_name = backend.name().to_string();
        execution.placement = match (&instance.container_id, &instance.standalone_instance_id) {
            (Some(container_id), _) => Some(crate::model::Placement::Container {
                container_id: crate::model::ContainerId(container_id.clone()),
                container_ip: instance.container_ip.clone().unwrap_or_default(),
            }),
            (None, Some(instance_id)) => Some(crate::model::Placement::Standalone {
                instance_id: instance_id.clone(),
                port: instance.standalone_port.unwrap_or_default(),
            }),
            (None, None) => None,
        };

        let permission_settings = self.permission_settings(&entry.permission_flags, &profile);
        execution.agent_command = command::build(
            &entry.command,
            &BuildOptions {
                passthrough: profile.cli_passthrough,
                model: profile.model.clone(),
                initial_prompt: req.task_description.clone(),
                resume_acp_session_id: req.resume_acp_session_id.clone(),
                permission_settings,
            },
        );

        let snapshot = execution.snapshot();
        self.store.add(execution);

        let client: Arc<dyn crate::backend::AgentBackendClient> = Arc::from(instance.client);
        let shutdown = self.root_shutdown.child_token();
        self.runtime.write().insert(id.clone(), RuntimeHandle { client, shutdown });

        self.enqueue_agent_lifecycle(&id, &snapshot, "started", Value::Null);
        self.enqueue_agentctl_lifecycle(&id, &snapshot, "starting", None);

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start_agent_process(&id).await {
                error!(execution_id = %id, error = %e, "start_agent_process failed");
            }
        });

        Ok(snapshot)
    }

    fn permission_settings(&self, flags: &PermissionFlagSpec, profile: &ResolvedProfile) -> std::collections::BTreeMap<String, PermissionFlag> {
        let mut settings = std::collections::BTreeMap::new();
        if let Some(flag) = flags.auto_approve {
            settings.insert(
                "auto_approve".to_string(),
                PermissionFlag::Boolean {
                    flag,
                    enabled: profile.auto_approve,
                },
            );
        }
        if let Some(flag) = flags.allow_indexing {
            settings.insert(
                "allow_indexing".to_string(),
                PermissionFlag::Boolean {
                    flag,
                    enabled: profile.allow_indexing,
                },
            );
        }
        if let Some(flag) = flags.dangerously_skip_permissions {
            settings.insert(
                "dangerously_skip_permissions".to_string(),
                PermissionFlag::Boolean {
                    flag,
                    enabled: profile.dangerously_skip_permissions,
                },
            );
        }
        if let Some(flag) = flags.plan {
            settings.insert("plan".to_string(), PermissionFlag::Boolean { flag, enabled: profile.plan });
        }
        settings
    }

    /// §4.10.3: resolve the final ACP MCP server list for a launch.
    fn resolve_mcp(&self, backend_name: &str, mcp_supported: bool, metadata: &crate::model::Metadata) -> Result<Vec<McpServer>> {
        if !mcp_supported {
            return Ok(Vec::new());
        }
        let profile_id = metadata.get("executor_id").unwrap_or_default();
        let Some(candidates) = self.mcp_provider.servers_for_profile(profile_id) else {
            return Ok(Vec::new());
        };

        let mut policy = crate::backend::default_policy_for_runtime(backend_name);
        if let Some(overlay) = metadata.executor_mcp_policy.as_deref() {
            policy = crate::backend::resolve_mcp_overlay(policy, Some(overlay))?;
        }
        match policy {
            crate::backend::McpPolicy::AllowAll => Ok(candidates),
            crate::backend::McpPolicy::DenyAll => Ok(Vec::new()),
        }
    }

    // ---- StartAgentProcess (§4.10.4) -----------------------------------

    pub async fn start_agent_process(self: &Arc<Self>, id: &ExecutionId) -> Result<()> {
        let snapshot = self.store.get(id).map_err(|_| ManagerError::not_found(id.to_string()))?;
        let profile = self.profiles.resolve(&snapshot.agent_profile_id)?;
        let entry = self
            .agent_types
            .get(&profile.agent_type)
            .ok_or_else(|| ManagerError::new(ErrorKind::BackendUnavailable, format!("unknown agent type {}", profile.agent_type)))?;

        if profile.cli_passthrough {
            return self.start_passthrough(id, &snapshot, &entry, &profile);
        }

        let client = {
            let runtime = self.runtime.read();
            runtime.get(id).map(|h| h.client.clone())
        }
        .ok_or_else(|| ManagerError::not_found(format!("no runtime handle for {id}")))?;

        if let Err(e) = client.wait_for_ready(AGENTCTL_READY_TIMEOUT).await {
            self.store.update_status(id, Status::Failed).ok();
            self.enqueue_agentctl_lifecycle(id, &snapshot, "error", Some(e.to_string()));
            return Err(ManagerError::new(ErrorKind::SidecarNotReady, e.to_string()).into());
        }
        self.enqueue_agentctl_lifecycle(id, &snapshot, "ready", None);

        let approval_policy = Some(if profile.auto_approve {
            crate::sidecar::ApprovalPolicy::Never
        } else {
            crate::sidecar::ApprovalPolicy::Untrusted
        });
        let env = standard_env_vars(
            &snapshot.task_id,
            id.as_str(),
            &snapshot.session_id.0,
            &snapshot.agent_profile_id,
            snapshot.metadata.task_description.as_deref().unwrap_or(""),
        );
        client.configure_agent(&snapshot.agent_command, &env, approval_policy).await?;
        client.start().await?;
        self.store.update_status(id, Status::Running).ok();

        let shutdown = {
            let runtime = self.runtime.read();
            runtime.get(id).map(|h| h.shutdown.clone())
        }
        .unwrap_or_else(|| self.root_shutdown.child_token());
        self.stream_manager.spawn(id.clone(), Arc::new(ClientHandle(client.clone())), shutdown);

        tokio::time::sleep(Duration::from_millis(500)).await;

        let mcp_servers = self.resolve_mcp(&snapshot.runtime_name, entry.mcp_supported, &snapshot.metadata)?;
        let was_resuming = snapshot.metadata.acp_session_id.is_some() && entry.supports_resume;
        let wrapped_client = ClientHandle(client.clone());
        let result = SessionManager::initialize_and_prompt(
            &self.store,
            &wrapped_client,
            id,
            &snapshot.workspace_path,
            snapshot.metadata.task_description.as_deref(),
            &mcp_servers,
            entry.supports_resume,
            snapshot.metadata.acp_session_id.as_deref(),
        )
        .await?;

        if let Ok(refreshed) = self.store.get(id) {
            self.enqueue_dedicated(
                id,
                &refreshed,
                "session_status",
                json!({ "status": if was_resuming { "resumed" } else { "new" }, "sessionID": refreshed.acp_session_id }),
            );
        }

        match result {
            Some(TurnResult { stop_reason }) => {
                if let Ok(refreshed) = self.store.get(id) {
                    self.enqueue_dedicated(id, &refreshed, "prompt_complete", json!({ "stopReason": stop_reason }));
                    self.enqueue_agent_lifecycle(id, &refreshed, "ready", Value::Null);
                }
            }
            None => self.mark_ready(id),
        }

        Ok(())
    }

    fn start_passthrough(self: &Arc<Self>, id: &ExecutionId, snapshot: &AgentExecutionSnapshot, entry: &AgentTypeEntry, profile: &ResolvedProfile) -> Result<()> {
        let passthrough = entry
            .passthrough
            .as_ref()
            .ok_or_else(|| ManagerError::new(ErrorKind::BackendUnavailable, format!("agent type {} has no passthrough configuration", profile.agent_type)))?;

        let env = standard_env_vars(
            &snapshot.task_id,
            id.as_str(),
            &snapshot.session_id.0,
            &snapshot.agent_profile_id,
            snapshot.metadata.task_description.as_deref().unwrap_or(""),
        );
        let options = PassthroughOptions {
            command: snapshot.agent_command.clone(),
            resume_command: passthrough.resume_command.clone(),
            workspace: snapshot.workspace_path.clone(),
            env,
            prompt_pattern: passthrough.prompt_pattern.clone(),
            idle_timeout: passthrough.idle_timeout,
            stability_window: passthrough.stability_window,
            check_interval: passthrough.check_interval,
            ..PassthroughOptions::default()
        };

        let sink: Arc<dyn PassthroughSink> = self.self_handle();
        let runner = Arc::new(PassthroughRunner::new(id.clone(), options, sink));
        self.passthrough_runners.write().insert(id.clone(), runner.clone());
        self.store.update_status(id, Status::Running).ok();

        let shutdown = self.root_shutdown.child_token();
        tokio::spawn(runner.run(shutdown));
        Ok(())
    }

    // ---- Streaming / flush machinery (§4.10.5) -------------------------

    fn dispatch_agent_event(&self, id: &ExecutionId, event: AgentStreamEvent) {
        let Ok(snapshot) = self.store.get(id) else { return };
        match event {
            AgentStreamEvent::MessageChunk { text } => self.handle_chunk(id, &snapshot, text, false),
            AgentStreamEvent::Reasoning { text } => self.handle_chunk(id, &snapshot, text, true),
            AgentStreamEvent::ToolCall { id: tool_id, name, args } => {
                let inline_text = self.end_segment(id, false);
                self.history.append(&snapshot.session_id.0, &HistoryEntry::ToolCall { id: tool_id.clone(), name: name.clone(), args: args.clone() });
                self.enqueue_agent_stream(id, &snapshot, "tool_call", json!({ "id": tool_id, "name": name, "args": args, "text": inline_text }));
            }
            AgentStreamEvent::ToolUpdate { id: tool_id, status, result } => {
                if status == "complete" {
                    if let Some(result) = result.clone() {
                        self.history.append(&snapshot.session_id.0, &HistoryEntry::ToolResult { id: tool_id.clone(), result });
                    }
                }
                self.enqueue_agent_stream(id, &snapshot, "tool_update", json!({ "id": tool_id, "status": status, "result": result }));
            }
            AgentStreamEvent::Plan { steps } => {
                self.enqueue_agent_stream(id, &snapshot, "plan", json!({ "steps": steps }));
            }
            AgentStreamEvent::Error { message, is_error } => {
                self.end_segment(id, false);
                self.end_segment(id, true);
                warn!(execution_id = %id, message, "agent reported an error event");
                self.enqueue_agent_stream(id, &snapshot, "error", json!({ "message": message, "isError": is_error }));
            }
            AgentStreamEvent::Complete { is_error, error } => {
                self.end_segment(id, false);
                self.end_segment(id, true);
                self.enqueue_agent_stream(id, &snapshot, "complete", json!({ "isError": is_error, "error": error }));
                if is_error {
                    self.mark_completed(id, 1, error);
                } else {
                    self.mark_ready(id);
                }
            }
            AgentStreamEvent::PermissionRequest { pending_id, options, description } => {
                self.enqueue_dedicated(
                    id,
                    &snapshot,
                    "permission_request",
                    json!({ "pendingId": pending_id, "options": options.into_iter().map(|o| json!({"id": o.id, "label": o.label})).collect::<Vec<_>>(), "description": description }),
                );
            }
            AgentStreamEvent::ContextWindow { used_tokens, max_tokens } => {
                self.enqueue_dedicated(id, &snapshot, "context_window", json!({ "usedTokens": used_tokens, "maxTokens": max_tokens }));
            }
            AgentStreamEvent::AvailableCommands { commands } => {
                self.store.with_write_lock(id, |exec| {
                    if let Ok(exec) = exec {
                        exec.available_commands = crate::model::AvailableCommands { commands: commands.clone() };
                    }
                });
                self.enqueue_dedicated(
                    id,
                    &snapshot,
                    "available_commands",
                    json!({ "commands": commands.into_iter().map(|c| json!({"name": c.name, "description": c.description})).collect::<Vec<_>>() }),
                );
            }
        }
    }

    /// Appends `text` to the buffer for `id` (message or thinking), flushing
    /// a `*_streaming` event whenever a newline completes a line (§4.10.5).
    fn handle_chunk(&self, id: &ExecutionId, snapshot: &AgentExecutionSnapshot, text: String, thinking: bool) {
        let flushed = self.store.with_read_lock(id, |exec| {
            let exec = exec.ok()?;
            let mut state = exec.streaming.lock();
            let state = &mut *state;
            let (buffer, current_id) = if thinking {
                (&mut state.thinking_buffer, &mut state.current_thinking_id)
            } else {
                (&mut state.message_buffer, &mut state.current_message_id)
            };
            buffer.push_str(&text);
            let pos = buffer.rfind('\n')?;
            let flushed_text: String = buffer.drain(..=pos).collect();
            let is_first = current_id.is_none();
            let message_id = current_id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string()).clone();
            Some((message_id, !is_first, flushed_text))
        });

        if let Some((message_id, is_append, text)) = flushed {
            if !thinking {
                self.segment_text.lock().entry(id.clone()).or_default().push_str(&text);
            }
            let kind = if thinking { "thinking_streaming" } else { "message_streaming" };
            let mut data = json!({ "text": text, "messageID": message_id, "isAppend": is_append });
            if thinking {
                data["messageType"] = json!("thinking");
            }
            self.enqueue_agent_stream(id, snapshot, kind, data);
        }
    }

    /// Ends the in-flight segment at a step boundary (tool_call, error,
    /// complete): flushes any unflushed buffer as a final append, resets the
    /// segment id, and (for the message buffer only) returns the full text
    /// published during the segment for inline attachment on `tool_call`.
    fn end_segment(&self, id: &ExecutionId, thinking: bool) -> String {
        let flushed = self.store.with_read_lock(id, |exec| {
            let exec = exec.ok()?;
            let mut state = exec.streaming.lock();
            let state = &mut *state;
            let (buffer, current_id) = if thinking {
                (&mut state.thinking_buffer, &mut state.current_thinking_id)
            } else {
                (&mut state.message_buffer, &mut state.current_message_id)
            };
            let event = if !buffer.is_empty() {
                let text = std::mem::take(buffer);
                let is_first = current_id.is_none();
                let message_id = current_id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string()).clone();
                Some((message_id, !is_first, text))
            } else {
                None
            };
            *current_id = None;
            Some(event)
        });

        if let (Some((message_id, is_append, text)), Ok(snapshot)) = (flushed.flatten(), self.store.get(id)) {
            if !thinking {
                self.segment_text.lock().entry(id.clone()).or_default().push_str(&text);
            }
            let kind = if thinking { "thinking_streaming" } else { "message_streaming" };
            let mut data = json!({ "text": text, "messageID": message_id, "isAppend": is_append });
            if thinking {
                data["messageType"] = json!("thinking");
            }
            self.enqueue_agent_stream(id, &snapshot, kind, data);
        }

        if thinking {
            String::new()
        } else {
            self.segment_text.lock().remove(id).unwrap_or_default()
        }
    }

    // ---- State machine (§4.10.6) ---------------------------------------

    fn mark_ready(&self, id: &ExecutionId) {
        let became_ready = self.store.with_write_lock(id, |exec| match exec {
            Ok(exec) if exec.status != Status::Ready => {
                exec.status = Status::Ready;
                true
            }
            _ => false,
        });
        if became_ready {
            if let Ok(snapshot) = self.store.get(id) {
                self.enqueue_agent_lifecycle(id, &snapshot, "ready", Value::Null);
            }
        }
    }

    fn mark_completed(&self, id: &ExecutionId, exit_code: i32, err: Option<String>) {
        let Ok(snapshot) = self.store.get(id) else { return };
        let failed = exit_code != 0 || err.is_some();
        self.store.update_error(id, Some(exit_code), err.clone().unwrap_or_default()).ok();
        self.store.update_status(id, if failed { Status::Failed } else { Status::Completed }).ok();
        self.cleanup_runtime(id);
        self.segment_text.lock().remove(id);
        self.store.remove(id);

        let kind = if failed { "failed" } else { "completed" };
        self.enqueue_agent_lifecycle(id, &snapshot, kind, json!({ "exitCode": exit_code, "error": err }));
    }

    fn cleanup_runtime(&self, id: &ExecutionId) {
        if let Some(handle) = self.runtime.write().remove(id) {
            handle.shutdown.cancel();
            tokio::spawn(async move {
                let _ = handle.client.close().await;
            });
        }
        self.passthrough_runners.write().remove(id);
    }

    fn on_container_exited(&self, container_id: &str, exit_code: i32, reason: &str) {
        let container = crate::model::ContainerId(container_id.to_string());
        if let Ok(snapshot) = self.store.get_by_container(&container) {
            let reason = (!reason.is_empty()).then(|| reason.to_string());
            self.mark_completed(&snapshot.id, exit_code, reason);
        }
    }

    // ---- Public contract (§4.10.1) -------------------------------------

    pub async fn prompt_agent(self: &Arc<Self>, id: &ExecutionId, text: &str) -> Result<TurnResult> {
        let client = {
            let runtime = self.runtime.read();
            runtime.get(id).map(|h| h.client.clone())
        }
        .ok_or_else(|| ManagerError::not_found(format!("no runtime handle for {id}")))?;
        self.segment_text.lock().remove(id);
        let wrapped_client = ClientHandle(client);
        SessionManager::send_prompt(&self.store, &wrapped_client, id, text).await
    }

    pub async fn cancel_agent(&self, id: &ExecutionId) -> Result<()> {
        let client = {
            let runtime = self.runtime.read();
            runtime.get(id).map(|h| h.client.clone())
        }
        .ok_or_else(|| ManagerError::not_found(format!("no runtime handle for {id}")))?;
        self.store.with_write_lock(id, |exec| {
            if let Ok(exec) = exec {
                exec.streaming.lock().clear();
            }
        });
        self.segment_text.lock().remove(id);
        let wrapped_client = ClientHandle(client);
        SessionManager::cancel(&wrapped_client).await?;
        self.mark_ready(id);
        Ok(())
    }

    pub async fn stop_agent(&self, id: &ExecutionId, force: bool) -> Result<()> {
        let snapshot = self.store.get(id).map_err(|_| ManagerError::not_found(id.to_string()))?;
        let mut first_error: Option<anyhow::Error> = None;
        if let Some(runner) = self.passthrough_runners.write().remove(id) {
            let _ = runner;
        } else if let Some(handle) = self.runtime.read().get(id).map(|h| h.client.clone()) {
            let backend = self.backends.get(&snapshot.runtime_name);
            if let Some(backend) = backend {
                let instance = crate::backend::RuntimeInstance {
                    client: Box::new(ClientHandle(handle.clone())),
                    container_id: snapshot.placement.as_ref().and_then(|p| p.container_id()).map(|c| c.0.clone()),
                    container_ip: None,
                    standalone_instance_id: None,
                    standalone_port: None,
                    metadata: snapshot.metadata.clone(),
                };
                if let Err(e) = backend.stop_instance(&instance, force).await {
                    warn!(execution_id = %id, error = %e, "backend stop_instance failed, removing execution anyway");
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = handle.stop().await {
                warn!(execution_id = %id, error = %e, "sidecar stop failed, removing execution anyway");
                first_error.get_or_insert(e);
            }
        }
        self.store.update_status(id, Status::Stopped).ok();
        self.cleanup_runtime(id);
        self.store.remove(id);
        self.enqueue_agent_lifecycle(id, &snapshot, "stopped", Value::Null);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops every tracked execution concurrently and returns every error
    /// encountered, rather than stopping at the first one (the manager is
    /// shutting down regardless, so a single failing execution must not
    /// prevent the others from being cleaned up).
    pub async fn stop_all_agents(&self, force: bool) -> Vec<anyhow::Error> {
        let ids: Vec<ExecutionId> = self.store.list().into_iter().map(|s| s.id).collect();
        let results = futures_util::future::join_all(ids.into_iter().map(|id| async move {
            let result = self.stop_agent(&id, force).await;
            (id, result)
        }))
        .await;
        let errors = results
            .into_iter()
            .filter_map(|(id, result)| match result {
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "error stopping execution during shutdown");
                    Some(e)
                }
                Ok(()) => None,
            })
            .collect();
        self.root_shutdown.cancel();
        errors
    }

    pub async fn respond_to_permission(&self, id: &ExecutionId, pending_id: &str, option_id: &str, cancelled: bool) -> Result<()> {
        let client = {
            let runtime = self.runtime.read();
            runtime.get(id).map(|h| h.client.clone())
        }
        .ok_or_else(|| ManagerError::not_found(format!("no runtime handle for {id}")))?;
        client
            .respond_to_permission(pending_id, option_id, cancelled)
            .await
            .map_err(|e| ManagerError::new(ErrorKind::PermissionDispatch, e.to_string()).into())
    }

    pub fn ensure_workspace_execution_for_session(&self, task_id: &str, session_id: &str) -> Result<AgentExecutionSnapshot> {
        let sid = SessionId(session_id.to_string());
        if let Ok(existing) = self.store.get_by_session(&sid) {
            return Ok(existing);
        }
        let provider = self
            .workspace_info
            .as_ref()
            .ok_or_else(|| ManagerError::new(ErrorKind::BackendUnavailable, "no workspace info provider configured"))?;
        let info = provider
            .workspace_for_session(task_id, session_id)
            .ok_or_else(|| ManagerError::not_found(format!("no workspace info for session {session_id}")))?;

        let mut execution = AgentExecution::new(task_id, sid, info.agent_profile_id, info.workspace_path, SystemTime::now());
        execution.status = Status::Ready;
        let snapshot = execution.snapshot();
        self.store.add(execution);
        Ok(snapshot)
    }

    pub fn ensure_passthrough_execution(self: &Arc<Self>, session_id: &str) -> Result<AgentExecutionSnapshot> {
        let sid = SessionId(session_id.to_string());
        let snapshot = self.store.get_by_session(&sid).map_err(|_| ManagerError::not_found(format!("no execution for session {session_id}")))?;
        if self.passthrough_runners.read().contains_key(&snapshot.id) {
            return Ok(snapshot);
        }
        let profile = self.profiles.resolve(&snapshot.agent_profile_id)?;
        if !profile.cli_passthrough {
            return Err(ManagerError::invalid_state(format!("session {session_id} is not a passthrough execution")).into());
        }
        let entry = self
            .agent_types
            .get(&profile.agent_type)
            .ok_or_else(|| ManagerError::new(ErrorKind::BackendUnavailable, format!("unknown agent type {}", profile.agent_type)))?;
        self.start_passthrough(&snapshot.id, &snapshot, &entry, &profile)?;
        Ok(snapshot)
    }

    pub fn list(&self) -> Vec<AgentExecutionSnapshot> {
        self.store.list()
    }

    pub fn get(&self, id: &ExecutionId) -> Result<AgentExecutionSnapshot> {
        self.store.get(id).map_err(|_| ManagerError::not_found(id.to_string()).into())
    }

    pub fn get_by_session(&self, session_id: &str) -> Result<AgentExecutionSnapshot> {
        self.store.get_by_session(&SessionId(session_id.to_string())).map_err(|_| ManagerError::not_found(session_id.to_string()).into())
    }

    pub fn is_agent_running_for_session(&self, session_id: &str) -> bool {
        match self.store.get_by_session(&SessionId(session_id.to_string())) {
            Ok(snapshot) => !snapshot.status.is_terminal(),
            Err(_) => false,
        }
    }

    pub fn resolve_agent_profile(&self, profile_id: &str) -> Result<ResolvedProfile> {
        self.profiles.resolve(profile_id)
    }

    // ---- Recovery / reconciliation (§4.10.7) ---------------------------

    pub async fn recover(self: &Arc<Self>) {
        self.backends.health_check_all().await;
        let recovered = self.backends.recover_all().await;
        for instance in recovered {
            let mut execution = AgentExecution::new(
                instance.task_id.clone(),
                SessionId(instance.session_id.clone()),
                instance.agent_profile_id.clone(),
                instance.workspace_path.clone(),
                SystemTime::now(),
            );
            execution.id = ExecutionId(instance.instance_id.clone());
            execution.status = Status::Running;
            if let Some(container_id) = &instance.container_id {
                execution.placement = Some(crate::model::Placement::Container {
                    container_id: crate::model::ContainerId(container_id.clone()),
                    container_ip: String::new(),
                });
            }
            let id = execution.id.clone();
            self.store.add(execution);

            let client: Arc<dyn crate::backend::AgentBackendClient> = Arc::from(instance.client);
            let shutdown = self.root_shutdown.child_token();
            self.stream_manager.spawn(id.clone(), Arc::new(ClientHandle(client.clone())), shutdown.clone());
            self.runtime.write().insert(id, RuntimeHandle { client, shutdown });
        }

        if self.backends.has_container_backend() {
            info!("container backend present, janitor reconciliation active via backend health checks");
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.root_shutdown.clone()
    }
}

/// Forwards both halves of `AgentBackendClient` to an inner `Arc`, so a
/// concrete type (never a trait object needing upcasting) can be handed to
/// call sites that want `&dyn AgentctlClient`, `Arc<dyn AgentEventSource>`,
/// or `Box<dyn AgentBackendClient>`.
struct ClientHandle(Arc<dyn crate::backend::AgentBackendClient>);

impl crate::sidecar::AgentctlClient for ClientHandle {
    fn initialize<'a>(&'a self, client_name: &'a str, client_version: &'a str) -> crate::sidecar::BoxFuture<'a, crate::sidecar::AgentInfo> {
        self.0.initialize(client_name, client_version)
    }
    fn new_session<'a>(&'a self, workspace: &'a str, mcp_servers: &'a [McpServer]) -> crate::sidecar::BoxFuture<'a, String> {
        self.0.new_session(workspace, mcp_servers)
    }
    fn load_session<'a>(&'a self, session_id: &'a str, workspace: &'a str, mcp_servers: &'a [McpServer]) -> crate::sidecar::BoxFuture<'a, ()> {
        self.0.load_session(session_id, workspace, mcp_servers)
    }
    fn configure_agent<'a>(
        &'a self,
        argv: &'a [String],
        env: &'a HashMap<String, String>,
        approval_policy: Option<crate::sidecar::ApprovalPolicy>,
    ) -> crate::sidecar::BoxFuture<'a, ()> {
        self.0.configure_agent(argv, env, approval_policy)
    }
    fn start(&self) -> crate::sidecar::BoxFuture<'_, ()> {
        self.0.start()
    }
    fn stop(&self) -> crate::sidecar::BoxFuture<'_, ()> {
        self.0.stop()
    }
    fn cancel(&self) -> crate::sidecar::BoxFuture<'_, ()> {
        self.0.cancel()
    }
    fn close(&self) -> crate::sidecar::BoxFuture<'_, ()> {
        self.0.close()
    }
    fn prompt<'a>(&'a self, text: &'a str, timeout: Duration) -> crate::sidecar::BoxFuture<'a, crate::sidecar::PromptResult> {
        self.0.prompt(text, timeout)
    }
    fn respond_to_permission<'a>(&'a self, pending_id: &'a str, option_id: &'a str, cancelled: bool) -> crate::sidecar::BoxFuture<'a, ()> {
        self.0.respond_to_permission(pending_id, option_id, cancelled)
    }
    fn get_status(&self) -> crate::sidecar::BoxFuture<'_, crate::sidecar::SidecarStatus> {
        self.0.get_status()
    }
    fn wait_for_ready(&self, timeout: Duration) -> crate::sidecar::BoxFuture<'_, ()> {
        self.0.wait_for_ready(timeout)
    }
    fn start_shell<'a>(&'a self, shell_id: &'a str, cwd: &'a str) -> crate::sidecar::BoxFuture<'a, ()> {
        self.0.start_shell(shell_id, cwd)
    }
    fn shell_input<'a>(&'a self, shell_id: &'a str, data: &'a [u8]) -> crate::sidecar::BoxFuture<'a, ()> {
        self.0.shell_input(shell_id, data)
    }
    fn shell_resize<'a>(&'a self, shell_id: &'a str, cols: u16, rows: u16) -> crate::sidecar::BoxFuture<'a, ()> {
        self.0.shell_resize(shell_id, cols, rows)
    }
}

impl AgentEventSource for ClientHandle {
    fn open_agent_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<AgentStreamEvent>>> + Send + '_>> {
        self.0.open_agent_stream()
    }
    fn open_workspace_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<WorkspaceStreamEvent>>> + Send + '_>> {
        self.0.open_workspace_stream()
    }
}

impl ExecutionId {
    fn as_str(&self) -> &str {
        &self.0
    }
}

async fn publish_outbound(publisher: &EventPublisher, event: OutboundEvent) {
    let now = SystemTime::now();
    match event {
        OutboundEvent::AgentLifecycle { kind, agent_id, task_id, session_id, data } => {
            publisher.agent_lifecycle(kind, &agent_id, &task_id, &session_id, now, data).await;
        }
        OutboundEvent::AgentctlLifecycle { kind, agent_id, task_id, session_id, reason } => {
            publisher.agentctl_lifecycle(kind, &agent_id, &task_id, &session_id, now, reason.as_deref()).await;
        }
        OutboundEvent::AgentStream { event_type, agent_id, task_id, session_id, data } => {
            publisher.agent_stream(&event_type, &agent_id, &task_id, &session_id, now, data).await;
        }
        OutboundEvent::Dedicated { kind, agent_id, task_id, session_id, data } => {
            publisher.dedicated(kind, &agent_id, &task_id, &session_id, now, data).await;
        }
        OutboundEvent::Workspace { kind, agent_id, task_id, session_id, data } => {
            publisher.workspace(kind, &agent_id, &task_id, &session_id, now, data).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FallbackPolicy;

    struct NullBroker;
    impl crate::publisher::Broker for NullBroker {
        fn publish(&self, _subject: String, _payload: Vec<u8>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct NoProfiles;
    impl ProfileResolver for NoProfiles {
        fn resolve(&self, profile_id: &str) -> Result<ResolvedProfile> {
            Err(ManagerError::not_found(format!("no profile {profile_id}")).into())
        }
    }

    struct NoAgentTypes;
    impl AgentTypeRegistry for NoAgentTypes {
        fn get(&self, _agent_type: &str) -> Option<Arc<AgentTypeEntry>> {
            None
        }
    }

    fn test_manager() -> Arc<Manager> {
        let history_dir = tempfile::tempdir().unwrap();
        Manager::new(ManagerDeps {
            backends: BackendRegistry::new(FallbackPolicy::Deny),
            publisher: EventPublisher::new(Arc::new(NullBroker), "test"),
            history: SessionHistory::new(history_dir.path()),
            credentials: Arc::new(crate::credentials::NoCredentials),
            worktree: None,
            profiles: Arc::new(NoProfiles),
            agent_types: Arc::new(NoAgentTypes),
            mcp_provider: Arc::new(NoMcpProvider),
            workspace_info: None,
            container_lister: None,
        })
    }

    #[test]
    fn permission_settings_map_only_flags_the_agent_declares() {
        let manager = test_manager();
        let flags = PermissionFlagSpec {
            auto_approve: Some("--yolo"),
            allow_indexing: None,
            dangerously_skip_permissions: None,
            plan: Some("--plan"),
        };
        let profile = ResolvedProfile {
            agent_type: "fake".into(),
            model: None,
            auto_approve: true,
            allow_indexing: true,
            dangerously_skip_permissions: false,
            plan: false,
            cli_passthrough: false,
        };

        let settings = manager.permission_settings(&flags, &profile);

        assert_eq!(settings.len(), 2);
        assert_eq!(settings.get("auto_approve"), Some(&PermissionFlag::Boolean { flag: "--yolo", enabled: true }));
        assert_eq!(settings.get("plan"), Some(&PermissionFlag::Boolean { flag: "--plan", enabled: false }));
        assert!(!settings.contains_key("allow_indexing"));
        assert!(!settings.contains_key("dangerously_skip_permissions"));
    }

    #[yare::parameterized(
        ready_from_running = { Status::Running, Status::Ready },
        ready_is_idempotent_from_ready = { Status::Ready, Status::Ready },
        ready_from_starting = { Status::Starting, Status::Ready },
    )]
    fn mark_ready_transitions_status(initial: Status, expected: Status) {
        let manager = test_manager();
        let execution = AgentExecution::new("t1", SessionId("s1".into()), "profile".into(), "/workspace".into(), SystemTime::UNIX_EPOCH);
        let id = execution.id.clone();
        manager.store.add(execution);
        manager.store.update_status(&id, initial).unwrap();

        manager.mark_ready(&id);

        assert_eq!(manager.store.get(&id).unwrap().status, expected);
    }

    #[yare::parameterized(
        clean_exit_completes = { 0, None, Status::Completed },
        nonzero_exit_fails = { 1, None, Status::Failed },
        zero_exit_with_error_fails = { 0, Some("panic".to_string()), Status::Failed },
    )]
    fn mark_completed_transitions_status_and_removes_execution(exit_code: i32, err: Option<String>, expected: Status) {
        let manager = test_manager();
        let execution = AgentExecution::new("t1", SessionId("s1".into()), "profile".into(), "/workspace".into(), SystemTime::UNIX_EPOCH);
        let id = execution.id.clone();
        manager.store.add(execution);
        manager.store.update_status(&id, Status::Running).unwrap();

        manager.mark_completed(&id, exit_code, err);

        assert!(manager.store.get(&id).is_err(), "completed executions are removed from the store, not just marked {expected:?}");
    }
}

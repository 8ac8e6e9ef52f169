// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Opens and reconnects the two long-lived streams per execution — the
//! agent stream and the workspace stream — and dispatches typed callbacks
//! to the Manager (§4.4, C4). Grounded on the teacher's `tokio::select!`
//! driven session loop (a single task consumes each stream sequentially)
//! and its reconnect-with-backoff pattern for long-lived NATS connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::model::ExecutionId;
use crate::sidecar::{AgentStreamEvent, WorkspaceStreamEvent};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Callbacks the Manager supplies so `StreamManager` never reaches back
/// into the Manager through a closure (Design Note: "Back references from
/// streams to the manager via closures" — re-expressed as an explicit,
/// exactly-9-method interface). Implementations must not block; heavy work
/// is handed off to the manager's own task.
pub trait StreamCallbacks: Send + Sync {
    fn on_agent_event(&self, id: &ExecutionId, event: AgentStreamEvent);
    fn on_git_status(&self, id: &ExecutionId, porcelain: String);
    fn on_git_commit(&self, id: &ExecutionId, sha: String, message: String);
    fn on_git_reset(&self, id: &ExecutionId, to: String);
    fn on_file_change(&self, id: &ExecutionId, path: String, kind: String);
    fn on_shell_output(&self, id: &ExecutionId, shell_id: String, chunk: String);
    fn on_shell_exit(&self, id: &ExecutionId, shell_id: String, code: Option<i32>);
    fn on_process_output(&self, id: &ExecutionId, process_id: String, chunk: String);
    fn on_process_status(&self, id: &ExecutionId, process_id: String, running: bool);
}

/// A handle to a long-lived event source. Implemented by the sidecar HTTP
/// client for real streams and by an in-memory channel in tests.
pub trait AgentEventSource: Send + Sync {
    fn open_agent_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<AgentStreamEvent>>> + Send + '_>>;
    fn open_workspace_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<WorkspaceStreamEvent>>> + Send + '_>>;
}

/// MCP requests arriving over the workspace stream are routed to a
/// pluggable handler rather than acted on directly by `StreamManager`.
pub trait McpRequestHandler: Send + Sync {
    fn handle(&self, id: &ExecutionId, request_id: String, payload: serde_json::Value);
}

pub struct StreamManager {
    callbacks: Arc<dyn StreamCallbacks>,
    mcp_handler: Arc<dyn McpRequestHandler>,
}

impl StreamManager {
    pub fn new(callbacks: Arc<dyn StreamCallbacks>, mcp_handler: Arc<dyn McpRequestHandler>) -> Self {
        Self { callbacks, mcp_handler }
    }

    /// Opens both streams for `id` and drives them until `shutdown` fires
    /// or the source keeps failing to reconnect. A single task consumes the
    /// agent stream, preserving the "no two `handleAgentEvent` invocations
    /// run concurrently for the same execution" ordering guarantee (§5);
    /// the workspace stream runs as an independent task.
    pub fn spawn(&self, id: ExecutionId, source: Arc<dyn AgentEventSource>, shutdown: CancellationToken) {
        let agent_id = id.clone();
        let agent_callbacks = self.callbacks.clone();
        let agent_source = source.clone();
        let agent_shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_agent_stream(agent_id, agent_source, agent_callbacks, agent_shutdown).await;
        });

        let ws_id = id;
        let ws_callbacks = self.callbacks.clone();
        let ws_mcp = self.mcp_handler.clone();
        tokio::spawn(async move {
            run_workspace_stream(ws_id, source, ws_callbacks, ws_mcp, shutdown).await;
        });
    }
}

async fn run_agent_stream(id: ExecutionId, source: Arc<dyn AgentEventSource>, callbacks: Arc<dyn StreamCallbacks>, shutdown: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let mut rx = match source.open_agent_stream().await {
            Ok(rx) => {
                backoff = INITIAL_BACKOFF;
                rx
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "agent stream open failed, retrying");
                if sleep_or_shutdown(backoff, &shutdown).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = rx.recv() => {
                    match event {
                        Some(event) => callbacks.on_agent_event(&id, event),
                        None => {
                            debug!(execution_id = %id, "agent stream closed, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        if sleep_or_shutdown(backoff, &shutdown).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_workspace_stream(
    id: ExecutionId,
    source: Arc<dyn AgentEventSource>,
    callbacks: Arc<dyn StreamCallbacks>,
    mcp_handler: Arc<dyn McpRequestHandler>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let mut rx = match source.open_workspace_stream().await {
            Ok(rx) => {
                backoff = INITIAL_BACKOFF;
                rx
            }
            Err(e) => {
                warn!(execution_id = %id, error = %e, "workspace stream open failed, retrying");
                if sleep_or_shutdown(backoff, &shutdown).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = rx.recv() => {
                    match event {
                        Some(event) => dispatch_workspace_event(&id, event, &callbacks, &mcp_handler),
                        None => {
                            debug!(execution_id = %id, "workspace stream closed, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        if sleep_or_shutdown(backoff, &shutdown).await {
            return;
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn dispatch_workspace_event(id: &ExecutionId, event: WorkspaceStreamEvent, callbacks: &Arc<dyn StreamCallbacks>, mcp_handler: &Arc<dyn McpRequestHandler>) {
    match event {
        WorkspaceStreamEvent::GitStatus { porcelain } => callbacks.on_git_status(id, porcelain),
        WorkspaceStreamEvent::GitCommit { sha, message } => callbacks.on_git_commit(id, sha, message),
        WorkspaceStreamEvent::GitReset { to } => callbacks.on_git_reset(id, to),
        WorkspaceStreamEvent::FileChange { path, kind } => callbacks.on_file_change(id, path, kind),
        WorkspaceStreamEvent::ShellOutput { shell_id, chunk } => callbacks.on_shell_output(id, shell_id, chunk),
        WorkspaceStreamEvent::ShellExit { shell_id, code } => callbacks.on_shell_exit(id, shell_id, code),
        WorkspaceStreamEvent::ProcessOutput { process_id, chunk } => callbacks.on_process_output(id, process_id, chunk),
        WorkspaceStreamEvent::ProcessStatus { process_id, running } => callbacks.on_process_status(id, process_id, running),
        WorkspaceStreamEvent::McpRequest { request_id, payload } => mcp_handler.handle(id, request_id, payload),
    }
}

/// Sleeps for `duration` unless `shutdown` fires first. Returns `true` if
/// shutdown won the race, signaling the caller to stop reconnecting.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        agent_events: Mutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl StreamCallbacks for RecordingCallbacks {
        fn on_agent_event(&self, _id: &ExecutionId, event: AgentStreamEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let AgentStreamEvent::MessageChunk { text } = event {
                self.agent_events.lock().unwrap().push(text);
            }
        }
        fn on_git_status(&self, _id: &ExecutionId, _porcelain: String) {}
        fn on_git_commit(&self, _id: &ExecutionId, _sha: String, _message: String) {}
        fn on_git_reset(&self, _id: &ExecutionId, _to: String) {}
        fn on_file_change(&self, _id: &ExecutionId, _path: String, _kind: String) {}
        fn on_shell_output(&self, _id: &ExecutionId, _shell_id: String, _chunk: String) {}
        fn on_shell_exit(&self, _id: &ExecutionId, _shell_id: String, _code: Option<i32>) {}
        fn on_process_output(&self, _id: &ExecutionId, _process_id: String, _chunk: String) {}
        fn on_process_status(&self, _id: &ExecutionId, _process_id: String, _running: bool) {}
    }

    struct NoopMcpHandler;
    impl McpRequestHandler for NoopMcpHandler {
        fn handle(&self, _id: &ExecutionId, _request_id: String, _payload: serde_json::Value) {}
    }

    struct OneShotSource {
        agent_rx: Mutex<Option<mpsc::Receiver<AgentStreamEvent>>>,
        workspace_rx: Mutex<Option<mpsc::Receiver<WorkspaceStreamEvent>>>,
    }

    impl AgentEventSource for OneShotSource {
        fn open_agent_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<AgentStreamEvent>>> + Send + '_>> {
            Box::pin(async move {
                self.agent_rx
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("stream already consumed"))
            })
        }
        fn open_workspace_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<WorkspaceStreamEvent>>> + Send + '_>> {
            Box::pin(async move {
                self.workspace_rx
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("stream already consumed"))
            })
        }
    }

    #[tokio::test]
    async fn dispatches_agent_events_in_order_until_stream_closes() {
        let (tx, rx) = mpsc::channel(4);
        let (_ws_tx, ws_rx) = mpsc::channel(4);
        tx.send(AgentStreamEvent::MessageChunk { text: "a".into() }).await.unwrap();
        tx.send(AgentStreamEvent::MessageChunk { text: "b".into() }).await.unwrap();
        drop(tx);

        let source = Arc::new(OneShotSource {
            agent_rx: Mutex::new(Some(rx)),
            workspace_rx: Mutex::new(Some(ws_rx)),
        });
        let callbacks = Arc::new(RecordingCallbacks::default());
        let shutdown = CancellationToken::new();

        let id = ExecutionId::new();
        let callbacks_clone = callbacks.clone();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(run_agent_stream(id, source, callbacks_clone, shutdown_clone));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(*callbacks.agent_events.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}

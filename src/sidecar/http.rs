// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! HTTP implementation of [`AgentctlClient`], grounded on the same
//! `reqwest` client usage the broker's pod registry uses for its own
//! pod-to-pod calls.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::{AgentInfo, ApprovalPolicy, BoxFuture, McpServer, PromptResult, SidecarStatus};
use crate::sidecar::{AgentStreamEvent, AgentctlClient, WorkspaceStreamEvent};
use crate::stream_manager::AgentEventSource;

pub struct HttpAgentctlClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgentctlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(&self, path: &str, body: &B, timeout: Duration) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("agentctl call to {path} failed"))?;

        if !resp.status().is_success() {
            bail!("agentctl {path} returned {}", resp.status());
        }
        resp.json::<T>().await.with_context(|| format!("decoding agentctl {path} response"))
    }

    async fn post_empty<B: Serialize>(&self, path: &str, body: &B, timeout: Duration) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("agentctl call to {path} failed"))?;
        if !resp.status().is_success() {
            bail!("agentctl {path} returned {}", resp.status());
        }
        Ok(())
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl AgentctlClient for HttpAgentctlClient {
    fn initialize<'a>(&'a self, client_name: &'a str, client_version: &'a str) -> BoxFuture<'a, AgentInfo> {
        Box::pin(async move {
            self.post_json(
                "/initialize",
                &json!({ "clientName": client_name, "clientVersion": client_version }),
                DEFAULT_TIMEOUT,
            )
            .await
        })
    }

    fn new_session<'a>(&'a self, workspace: &'a str, mcp_servers: &'a [McpServer]) -> BoxFuture<'a, String> {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Resp {
                session_id: String,
            }
            let resp: Resp = self
                .post_json(
                    "/new_session",
                    &json!({ "workspace": workspace, "mcpServers": mcp_servers }),
                    DEFAULT_TIMEOUT,
                )
                .await?;
            Ok(resp.session_id)
        })
    }

    fn load_session<'a>(&'a self, session_id: &'a str, workspace: &'a str, mcp_servers: &'a [McpServer]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_empty(
                "/load_session",
                &json!({ "sessionId": session_id, "workspace": workspace, "mcpServers": mcp_servers }),
                DEFAULT_TIMEOUT,
            )
            .await
        })
    }

    fn configure_agent<'a>(
        &'a self,
        argv: &'a [String],
        env: &'a HashMap<String, String>,
        approval_policy: Option<ApprovalPolicy>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_empty(
                "/configure_agent",
                &json!({
                    "argv": argv,
                    "env": env,
                    "approvalPolicy": approval_policy.map(|p| p.as_str()),
                }),
                DEFAULT_TIMEOUT,
            )
            .await
        })
    }

    fn start(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.post_empty("/start", &json!({}), DEFAULT_TIMEOUT).await })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.post_empty("/stop", &json!({}), DEFAULT_TIMEOUT).await })
    }

    fn cancel(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.post_empty("/cancel", &json!({}), DEFAULT_TIMEOUT).await })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.post_empty("/close", &json!({}), DEFAULT_TIMEOUT).await })
    }

    fn prompt<'a>(&'a self, text: &'a str, timeout: Duration) -> BoxFuture<'a, PromptResult> {
        Box::pin(async move { self.post_json("/prompt", &json!({ "text": text }), timeout).await })
    }

    fn respond_to_permission<'a>(&'a self, pending_id: &'a str, option_id: &'a str, cancelled: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_empty(
                "/respond_to_permission",
                &json!({ "pendingId": pending_id, "optionId": option_id, "cancelled": cancelled }),
                DEFAULT_TIMEOUT,
            )
            .await
        })
    }

    fn get_status(&self) -> BoxFuture<'_, SidecarStatus> {
        Box::pin(async move {
            let resp = self
                .http
                .get(format!("{}/status", self.base_url))
                .timeout(DEFAULT_TIMEOUT)
                .send()
                .await
                .context("agentctl status call failed")?;
            if !resp.status().is_success() {
                bail!("agentctl /status returned {}", resp.status());
            }
            resp.json().await.context("decoding agentctl status response")
        })
    }

    fn wait_for_ready(&self, timeout: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.post_empty("/wait_for_ready", &json!({}), timeout).await })
    }

    fn start_shell<'a>(&'a self, shell_id: &'a str, cwd: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_empty("/start_shell", &json!({ "shellId": shell_id, "cwd": cwd }), DEFAULT_TIMEOUT)
                .await
        })
    }

    fn shell_input<'a>(&'a self, shell_id: &'a str, data: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_empty(
                "/shell_input",
                &json!({ "shellId": shell_id, "data": data }),
                DEFAULT_TIMEOUT,
            )
            .await
        })
    }

    fn shell_resize<'a>(&'a self, shell_id: &'a str, cols: u16, rows: u16) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.post_empty(
                "/shell_resize",
                &json!({ "shellId": shell_id, "cols": cols, "rows": rows }),
                DEFAULT_TIMEOUT,
            )
            .await
        })
    }
}

/// Reads newline-delimited JSON from a long-lived response body and forwards
/// decoded values onto `tx` until the body ends or the receiver is dropped.
/// A line that fails to parse is logged and skipped rather than tearing down
/// the whole stream, since one malformed event shouldn't take the rest with it.
async fn forward_ndjson<T: DeserializeOwned + Send + 'static>(resp: reqwest::Response, tx: mpsc::Sender<T>) {
    let mut body = resp.bytes_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "ndjson stream read failed");
                return;
            }
        };
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<T>(line) {
                Ok(value) => {
                    if tx.send(value).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed ndjson line"),
            }
        }
    }
}

impl AgentEventSource for HttpAgentctlClient {
    fn open_agent_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<AgentStreamEvent>>> + Send + '_>> {
        Box::pin(async move {
            let resp = self
                .http
                .get(format!("{}/stream_agent", self.base_url))
                .send()
                .await
                .context("opening agent stream")?;
            if !resp.status().is_success() {
                bail!("agentctl /stream_agent returned {}", resp.status());
            }
            let (tx, rx) = mpsc::channel(256);
            tokio::spawn(forward_ndjson(resp, tx));
            Ok(rx)
        })
    }

    fn open_workspace_stream(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<mpsc::Receiver<WorkspaceStreamEvent>>> + Send + '_>> {
        Box::pin(async move {
            let resp = self
                .http
                .get(format!("{}/stream_workspace", self.base_url))
                .send()
                .await
                .context("opening workspace stream")?;
            if !resp.status().is_success() {
                bail!("agentctl /stream_workspace returned {}", resp.status());
            }
            let (tx, rx) = mpsc::channel(256);
            tokio::spawn(forward_ndjson(resp, tx));
            Ok(rx)
        })
    }
}

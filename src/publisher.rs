// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Serializes internal events to broker subjects (§4.5, C5). Grounded on
//! the teacher's NATS publishers (`transport::nats`, and `coopmux`'s
//! `transport::nats_pub`): a thin client wrapping `async_nats::Client`,
//! one `publish` call per event with a `{prefix}.<subject>` naming scheme
//! and a JSON envelope.

use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// `{type, timestamp, agentID, taskID, sessionID, data}` envelope from
/// §4.5. `timestamp` is always supplied by the caller rather than sampled
/// internally, so publisher behavior is reproducible in tests.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: String,
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub data: Value,
}

pub fn rfc3339_nano(time: SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Utc> = time.into();
    datetime.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

pub trait Broker: Send + Sync {
    fn publish(&self, subject: String, payload: Vec<u8>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;
}

pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.context("connecting to NATS broker")?;
        Ok(Self { client })
    }
}

impl Broker for NatsBroker {
    fn publish(&self, subject: String, payload: Vec<u8>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.client
                .publish(subject, payload.into())
                .await
                .context("publishing to NATS")?;
            Ok(())
        })
    }
}

/// Publishes lifecycle and streamed domain events under a configurable
/// subject prefix (default `kandev`).
pub struct EventPublisher {
    broker: std::sync::Arc<dyn Broker>,
    prefix: String,
}

impl EventPublisher {
    pub fn new(broker: std::sync::Arc<dyn Broker>, prefix: impl Into<String>) -> Self {
        Self { broker, prefix: prefix.into() }
    }

    fn subject(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    async fn publish(&self, suffix: String, envelope: EventEnvelope) {
        let subject = self.subject(&suffix);
        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                if let Err(e) = self.broker.publish(subject.clone(), payload).await {
                    warn!(subject = %subject, error = %e, "failed to publish event");
                }
            }
            Err(e) => warn!(subject = %subject, error = %e, "failed to serialize event"),
        }
    }

    /// `agent.{started,ready,stopped,completed,failed,running}`.
    pub async fn agent_lifecycle(&self, kind: &str, agent_id: &str, task_id: &str, session_id: &str, now: SystemTime, data: Value) {
        self.publish(
            format!("agent.{kind}"),
            EventEnvelope {
                event_type: format!("agent.{kind}"),
                timestamp: rfc3339_nano(now),
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                session_id: session_id.to_string(),
                data,
            },
        )
        .await;
    }

    /// `agentctl.{starting,ready,error}`.
    pub async fn agentctl_lifecycle(&self, kind: &str, agent_id: &str, task_id: &str, session_id: &str, now: SystemTime, reason: Option<&str>) {
        self.publish(
            format!("agentctl.{kind}"),
            EventEnvelope {
                event_type: format!("agentctl.{kind}"),
                timestamp: rfc3339_nano(now),
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                session_id: session_id.to_string(),
                data: reason.map(|r| serde_json::json!({ "reason": r })).unwrap_or(Value::Null),
            },
        )
        .await;
    }

    /// `agent/event.{taskID}`: the WebSocket fan-out stream keyed by task.
    pub async fn agent_stream(&self, event_type: &str, agent_id: &str, task_id: &str, session_id: &str, now: SystemTime, data: Value) {
        self.publish(
            format!("agent/event.{task_id}"),
            EventEnvelope {
                event_type: event_type.to_string(),
                timestamp: rfc3339_nano(now),
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                session_id: session_id.to_string(),
                data,
            },
        )
        .await;
    }

    /// Dedicated, per-taskID subjects that are never duplicated on the
    /// generic agent stream (`permission_request`, `context_window`,
    /// `available_commands` per §4.10.5; plus `prompt_complete` and
    /// `tool_call_{started,complete}`).
    pub async fn dedicated(&self, kind: &str, agent_id: &str, task_id: &str, session_id: &str, now: SystemTime, data: Value) {
        self.publish(
            format!("{kind}.{task_id}"),
            EventEnvelope {
                event_type: kind.to_string(),
                timestamp: rfc3339_nano(now),
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                session_id: session_id.to_string(),
                data,
            },
        )
        .await;
    }

    /// Workspace-side subjects: git_status, git_commit, git_reset,
    /// file_change, shell_output, shell_exit, process_output, process_status.
    pub async fn workspace(&self, kind: &str, agent_id: &str, task_id: &str, session_id: &str, now: SystemTime, data: Value) {
        self.publish(
            kind.to_string(),
            EventEnvelope {
                event_type: kind.to_string(),
                timestamp: rfc3339_nano(now),
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                session_id: session_id.to_string(),
                data,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Broker for RecordingBroker {
        fn publish(&self, subject: String, payload: Vec<u8>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            self.published.lock().unwrap().push((subject, payload));
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn agent_lifecycle_uses_prefixed_dotted_subject() {
        let broker = Arc::new(RecordingBroker::default());
        let publisher = EventPublisher::new(broker.clone(), "kandev");
        publisher
            .agent_lifecycle("started", "a1", "t1", "s1", SystemTime::UNIX_EPOCH, Value::Null)
            .await;

        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "kandev.agent.started");
    }

    #[tokio::test]
    async fn agent_stream_subject_is_keyed_by_task_id() {
        let broker = Arc::new(RecordingBroker::default());
        let publisher = EventPublisher::new(broker.clone(), "kandev");
        publisher
            .agent_stream("message_streaming", "a1", "task-7", "s1", SystemTime::UNIX_EPOCH, Value::Null)
            .await;

        assert_eq!(broker.published.lock().unwrap()[0].0, "kandev.agent/event.task-7");
    }

    #[test]
    fn rfc3339_nano_formats_unix_epoch() {
        assert_eq!(rfc3339_nano(SystemTime::UNIX_EPOCH), "1970-01-01T00:00:00.000000000Z");
    }
}

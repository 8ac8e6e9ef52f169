// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Periodically reconciles exited containers (§4.7, C7), active only when a
//! container backend is present. Grounded on the teacher's
//! `PodRegistry::run_health_checks` periodic sweep, widened here to call
//! back into the Manager for completion/removal instead of pruning its own
//! map in place.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub container_id: String,
    pub exited: bool,
    pub exit_code: Option<i32>,
}

/// Narrow view onto the container backend the janitor needs: list managed
/// containers and remove the ones it has already reconciled.
pub trait ContainerLister: Send + Sync {
    fn list_managed(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Vec<ManagedContainer>>> + Send + '_>>;
    fn remove_container(&self, container_id: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Called once per exited, tracked container found during a sweep.
pub trait JanitorSink: Send + Sync {
    fn mark_completed(&self, container_id: &str, exit_code: i32, reason: &str);
}

pub struct ContainerJanitor {
    lister: Arc<dyn ContainerLister>,
    sink: Arc<dyn JanitorSink>,
}

impl ContainerJanitor {
    pub fn new(lister: Arc<dyn ContainerLister>, sink: Arc<dyn JanitorSink>) -> Self {
        Self { lister, sink }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        self.sweep_once().await;
                    }
                }
            }
        });
    }

    pub async fn sweep_once(&self) {
        let containers = match self.lister.list_managed().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "janitor: failed to list managed containers");
                return;
            }
        };

        for container in containers.into_iter().filter(|c| c.exited) {
            let exit_code = container.exit_code.unwrap_or(-1);
            self.sink.mark_completed(&container.container_id, exit_code, "");

            if let Err(e) = self.lister.remove_container(&container.container_id).await {
                warn!(container_id = %container.container_id, error = %e, "janitor: failed to remove container");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeLister {
        containers: Vec<ManagedContainer>,
        removed: Mutex<Vec<String>>,
    }

    impl ContainerLister for FakeLister {
        fn list_managed(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Vec<ManagedContainer>>> + Send + '_>> {
            let containers = self.containers.clone();
            Box::pin(async move { Ok(containers) })
        }
        fn remove_container(&self, container_id: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        completed: Mutex<Vec<(String, i32)>>,
    }

    impl JanitorSink for RecordingSink {
        fn mark_completed(&self, container_id: &str, exit_code: i32, _reason: &str) {
            self.completed.lock().unwrap().push((container_id.to_string(), exit_code));
        }
    }

    #[tokio::test]
    async fn sweep_marks_and_removes_only_exited_containers() {
        let lister = Arc::new(FakeLister {
            containers: vec![
                ManagedContainer {
                    container_id: "running".into(),
                    exited: false,
                    exit_code: None,
                },
                ManagedContainer {
                    container_id: "done".into(),
                    exited: true,
                    exit_code: Some(0),
                },
            ],
            removed: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(RecordingSink::default());
        let janitor = ContainerJanitor::new(lister.clone(), sink.clone());

        janitor.sweep_once().await;

        assert_eq!(sink.completed.lock().unwrap().as_slice(), &[("done".to_string(), 0)]);
        assert_eq!(lister.removed.lock().unwrap().as_slice(), &["done".to_string()]);
    }

    #[tokio::test]
    async fn list_failure_does_not_panic_and_leaves_nothing_removed() {
        struct FailingLister;
        impl ContainerLister for FailingLister {
            fn list_managed(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Vec<ManagedContainer>>> + Send + '_>> {
                Box::pin(async { anyhow::bail!("docker daemon unreachable") })
            }
            fn remove_container(&self, _container_id: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
                Box::pin(async { Ok(()) })
            }
        }
        let sink = Arc::new(RecordingSink::default());
        let janitor = ContainerJanitor::new(Arc::new(FailingLister), sink.clone());
        janitor.sweep_once().await;
        assert!(sink.completed.lock().unwrap().is_empty());
    }
}

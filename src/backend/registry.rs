// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Holds named execution backends and selects one per request under a
//! [`FallbackPolicy`] (§4.6, C6). Grounded on the teacher's `PodRegistry`
//! (`broker::registry`): a `RwLock`-guarded map plus a periodic
//! all-members health sweep.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::warn;

use super::{ExecutorBackend, FallbackPolicy, RecoveredInstance};

pub const DEFAULT_BACKEND_NAME: &str = "standalone";

pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn ExecutorBackend>>>,
    fallback_policy: FallbackPolicy,
}

impl BackendRegistry {
    pub fn new(fallback_policy: FallbackPolicy) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            fallback_policy,
        }
    }

    pub fn register(&self, backend: Arc<dyn ExecutorBackend>) {
        self.backends.write().insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutorBackend>> {
        self.backends.read().get(name).cloned()
    }

    pub fn has_container_backend(&self) -> bool {
        self.backends.read().values().any(|b| b.is_container_backend())
    }

    /// Maps a requested executor type to a backend. If the named backend is
    /// unavailable, behavior is governed by `fallback_policy` (§4.6).
    pub fn get_for_executor_type(&self, requested: Option<&str>) -> Result<Arc<dyn ExecutorBackend>> {
        let requested = requested.unwrap_or(DEFAULT_BACKEND_NAME);
        if let Some(backend) = self.get(requested) {
            return Ok(backend);
        }

        match self.fallback_policy {
            FallbackPolicy::Deny => {
                bail!("backend {requested} unavailable and fallback policy is Deny")
            }
            FallbackPolicy::Warn => {
                warn!(requested = %requested, fallback = DEFAULT_BACKEND_NAME, "backend unavailable, falling back");
                self.get(DEFAULT_BACKEND_NAME)
                    .ok_or_else(|| anyhow::anyhow!("no default backend {DEFAULT_BACKEND_NAME} registered"))
            }
            FallbackPolicy::Allow => self
                .get(DEFAULT_BACKEND_NAME)
                .ok_or_else(|| anyhow::anyhow!("no default backend {DEFAULT_BACKEND_NAME} registered")),
        }
    }

    pub async fn health_check_all(&self) {
        let backends: Vec<_> = self.backends.read().values().cloned().collect();
        for backend in backends {
            if let Err(e) = backend.health_check().await {
                warn!(backend = backend.name(), error = %e, "backend health check failed");
            }
        }
    }

    pub async fn recover_all(&self) -> Vec<RecoveredInstance> {
        let backends: Vec<_> = self.backends.read().values().cloned().collect();
        let mut recovered = Vec::new();
        for backend in backends {
            match backend.recover_instances().await {
                Ok(instances) => recovered.extend(instances),
                Err(e) => warn!(backend = backend.name(), error = %e, "recover_instances failed"),
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InteractiveRunner, RuntimeCreateRequest, RuntimeInstance};
    use std::future::Future;
    use std::pin::Pin;

    struct StubBackend {
        name: &'static str,
        is_container: bool,
    }

    impl ExecutorBackend for StubBackend {
        fn name(&self) -> &str {
            self.name
        }
        fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
        fn create_instance<'a>(&'a self, _req: &'a RuntimeCreateRequest) -> Pin<Box<dyn Future<Output = Result<RuntimeInstance>> + Send + 'a>> {
            Box::pin(async { bail!("not implemented in stub") })
        }
        fn stop_instance<'a>(&'a self, _instance: &'a RuntimeInstance, _force: bool) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
        fn recover_instances(&self) -> Pin<Box<dyn Future<Output = Result<Vec<RecoveredInstance>>> + Send + '_>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn get_interactive_runner(&self) -> Option<Box<dyn InteractiveRunner>> {
            None
        }
        fn is_container_backend(&self) -> bool {
            self.is_container
        }
    }

    #[test]
    fn deny_policy_errors_when_requested_backend_missing() {
        let registry = BackendRegistry::new(FallbackPolicy::Deny);
        registry.register(Arc::new(StubBackend {
            name: "standalone",
            is_container: false,
        }));
        let err = registry.get_for_executor_type(Some("docker")).unwrap_err();
        assert!(err.to_string().contains("Deny"));
    }

    #[test]
    fn allow_policy_falls_back_silently() {
        let registry = BackendRegistry::new(FallbackPolicy::Allow);
        registry.register(Arc::new(StubBackend {
            name: "standalone",
            is_container: false,
        }));
        let backend = registry.get_for_executor_type(Some("docker")).unwrap();
        assert_eq!(backend.name(), "standalone");
    }

    #[test]
    fn has_container_backend_reflects_registered_backends() {
        let registry = BackendRegistry::new(FallbackPolicy::Allow);
        assert!(!registry.has_container_backend());
        registry.register(Arc::new(StubBackend {
            name: "docker",
            is_container: true,
        }));
        assert!(registry.has_container_backend());
    }
}

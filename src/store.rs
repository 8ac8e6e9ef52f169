// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{AgentExecution, AgentExecutionSnapshot, ContainerId, ExecutionId, Metadata, SessionId, Status};

/// Thread-safe in-memory registry of executions, indexed by execution id,
/// session id, and container id (§4.1, C1). All three indexes are kept
/// consistent on every add/remove under a single write lock; nothing
/// observable outside a write-lock critical section can see them diverge
/// (invariant I2).
pub struct ExecutionStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<ExecutionId, AgentExecution>,
    session_index: HashMap<SessionId, ExecutionId>,
    container_index: HashMap<ContainerId, ExecutionId>,
}

/// Distinct sentinel for "no such execution", so callers never have to infer
/// not-found from a generic error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFound;

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("execution not found")
    }
}

impl std::error::Error for NotFound {}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert a new execution. Secondary index entries are written only for
    /// non-empty ids, matching the session-id-always-present /
    /// container-id-sometimes-present shape of the data model.
    pub fn add(&self, execution: AgentExecution) {
        let mut inner = self.inner.write();
        let id = execution.id.clone();
        let session_id = execution.session_id.clone();
        let container_id = execution.container_id().cloned();

        inner.session_index.insert(session_id, id.clone());
        if let Some(cid) = container_id {
            inner.container_index.insert(cid, id.clone());
        }
        inner.by_id.insert(id, execution);
    }

    /// Remove an execution and every secondary index entry that points to
    /// it. A no-op, not an error, if the id is already gone (Stop then
    /// Remove is allowed to race with a concurrent double-stop).
    pub fn remove(&self, id: &ExecutionId) {
        let mut inner = self.inner.write();
        if let Some(execution) = inner.by_id.remove(id) {
            inner.session_index.remove(&execution.session_id);
            if let Some(cid) = execution.container_id() {
                inner.container_index.remove(cid);
            }
        }
    }

    pub fn get(&self, id: &ExecutionId) -> Result<AgentExecutionSnapshot, NotFound> {
        let inner = self.inner.read();
        inner.by_id.get(id).map(AgentExecution::snapshot).ok_or(NotFound)
    }

    pub fn get_by_session(&self, session_id: &SessionId) -> Result<AgentExecutionSnapshot, NotFound> {
        let inner = self.inner.read();
        let id = inner.session_index.get(session_id).ok_or(NotFound)?;
        inner.by_id.get(id).map(AgentExecution::snapshot).ok_or(NotFound)
    }

    pub fn get_by_container(&self, container_id: &ContainerId) -> Result<AgentExecutionSnapshot, NotFound> {
        let inner = self.inner.read();
        let id = inner.container_index.get(container_id).ok_or(NotFound)?;
        inner.by_id.get(id).map(AgentExecution::snapshot).ok_or(NotFound)
    }

    pub fn contains_session(&self, session_id: &SessionId) -> bool {
        self.inner.read().session_index.contains_key(session_id)
    }

    /// Returns a fresh `Vec` of snapshots; never a view into the live map.
    pub fn list(&self) -> Vec<AgentExecutionSnapshot> {
        self.inner.read().by_id.values().map(AgentExecution::snapshot).collect()
    }

    pub fn update_status(&self, id: &ExecutionId, status: Status) -> Result<(), NotFound> {
        let mut inner = self.inner.write();
        let execution = inner.by_id.get_mut(id).ok_or(NotFound)?;
        execution.status = status;
        Ok(())
    }

    pub fn update_error(&self, id: &ExecutionId, exit_code: Option<i32>, message: impl Into<String>) -> Result<(), NotFound> {
        let mut inner = self.inner.write();
        let execution = inner.by_id.get_mut(id).ok_or(NotFound)?;
        execution.exit_code = exit_code;
        execution.error_message = message.into();
        Ok(())
    }

    /// Apply `updater` to a *copy* of the execution's metadata and store the
    /// result back under the write lock, so concurrent callers can't race on
    /// the live map by mutating it in place.
    pub fn update_metadata(&self, id: &ExecutionId, updater: impl FnOnce(Metadata) -> Metadata) -> Result<(), NotFound> {
        let mut inner = self.inner.write();
        let execution = inner.by_id.get_mut(id).ok_or(NotFound)?;
        let updated = updater(execution.metadata.clone());
        execution.metadata = updated;
        Ok(())
    }

    /// Run `f` against the live execution under the write lock. The closure
    /// receives `Result<&mut AgentExecution, NotFound>` so it can propagate
    /// "not found" as a distinct outcome from whatever `f` itself might fail
    /// with.
    pub fn with_write_lock<T>(&self, id: &ExecutionId, f: impl FnOnce(Result<&mut AgentExecution, NotFound>) -> T) -> T {
        let mut inner = self.inner.write();
        let execution = inner.by_id.get_mut(id).ok_or(NotFound);
        f(execution)
    }

    pub fn with_read_lock<T>(&self, id: &ExecutionId, f: impl FnOnce(Result<&AgentExecution, NotFound>) -> T) -> T {
        let inner = self.inner.read();
        let execution = inner.by_id.get(id).ok_or(NotFound);
        f(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Placement, SessionId};
    use std::time::SystemTime;

    fn exec(session: &str, container: Option<&str>) -> AgentExecution {
        let mut e = AgentExecution::new("t1", SessionId(session.into()), "profile", "/workspace", SystemTime::now());
        if let Some(c) = container {
            e.placement = Some(Placement::Container {
                container_id: ContainerId(c.into()),
                container_ip: "10.0.0.1".into(),
            });
        }
        e
    }

    #[test]
    fn add_then_get_by_all_three_indexes() {
        let store = ExecutionStore::new();
        let e = exec("s1", Some("c1"));
        let id = e.id.clone();
        store.add(e);

        assert_eq!(store.get(&id).unwrap().id, id);
        assert_eq!(store.get_by_session(&SessionId("s1".into())).unwrap().id, id);
        assert_eq!(store.get_by_container(&ContainerId("c1".into())).unwrap().id, id);
    }

    #[test]
    fn remove_clears_all_indexes() {
        let store = ExecutionStore::new();
        let e = exec("s2", Some("c2"));
        let id = e.id.clone();
        store.add(e);
        store.remove(&id);

        assert_eq!(store.get(&id), Err(NotFound));
        assert_eq!(store.get_by_session(&SessionId("s2".into())), Err(NotFound));
        assert_eq!(store.get_by_container(&ContainerId("c2".into())), Err(NotFound));
    }

    #[test]
    fn session_without_container_has_no_container_entry() {
        let store = ExecutionStore::new();
        let e = exec("s3", None);
        let id = e.id.clone();
        store.add(e);

        assert_eq!(store.get(&id).unwrap().id, id);
        assert!(store.contains_session(&SessionId("s3".into())));
    }

    #[test]
    fn update_metadata_applies_functional_update() {
        let store = ExecutionStore::new();
        let e = exec("s4", None);
        let id = e.id.clone();
        store.add(e);

        store
            .update_metadata(&id, |mut m| {
                m.set("task_description", "hello");
                m
            })
            .unwrap();

        assert_eq!(
            store.get(&id).unwrap().metadata.task_description.as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn list_returns_independent_snapshot() {
        let store = ExecutionStore::new();
        store.add(exec("s5", None));
        let before = store.list();
        assert_eq!(before.len(), 1);
        store.add(exec("s6", None));
        assert_eq!(before.len(), 1);
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn with_write_lock_surfaces_not_found() {
        let store = ExecutionStore::new();
        let missing = ExecutionId::new();
        let result = store.with_write_lock(&missing, |e| e.is_err());
        assert!(result);
    }
}

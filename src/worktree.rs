// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Git worktree plumbing is an out-of-scope collaborator (§1); only the
//! contract `Manager::Launch` needs is modeled here (§4.10.2 step 4).
//! Creation failure is never fatal to a launch — the manager logs a
//! warning and falls back to the repository path directly (B1).

/// A provisioned (or reused) worktree: an isolated checkout path plus the
/// branch it's on, handed back to the manager for mounting into the agent
/// environment.
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub worktree_id: String,
    pub path: String,
    pub branch: String,
}

pub trait WorktreeProvider: Send + Sync {
    /// Creates a new worktree for `repository_path`, or reuses the one
    /// named by `existing_worktree_id` if the metadata already carries one.
    fn create_or_reuse(
        &self,
        repository_path: &str,
        existing_worktree_id: Option<&str>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<WorktreeHandle>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider;
    impl WorktreeProvider for FailingProvider {
        fn create_or_reuse(
            &self,
            _repository_path: &str,
            _existing_worktree_id: Option<&str>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<WorktreeHandle>> + Send + '_>> {
            Box::pin(async { anyhow::bail!("git plumbing unavailable") })
        }
    }

    #[tokio::test]
    async fn failing_provider_surfaces_an_error_the_caller_can_fall_back_on() {
        let err = FailingProvider.create_or_reuse("/repo", None).await.unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }
}

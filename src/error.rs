// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::fmt;

/// Taxonomy of errors the manager can surface. A flat enum rather than a
/// trait object: callers outside this crate need a stable kind to match on
/// without downcasting an opaque error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    BackendUnavailable,
    SidecarNotReady,
    SidecarCall,
    ProtocolInit,
    ProtocolPrompt,
    PermissionDispatch,
    WorktreeCreate,
    MCPPolicy,
    Credentials,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::SidecarNotReady => "SIDECAR_NOT_READY",
            Self::SidecarCall => "SIDECAR_CALL",
            Self::ProtocolInit => "PROTOCOL_INIT",
            Self::ProtocolPrompt => "PROTOCOL_PROMPT",
            Self::PermissionDispatch => "PERMISSION_DISPATCH",
            Self::WorktreeCreate => "WORKTREE_CREATE",
            Self::MCPPolicy => "MCP_POLICY",
            Self::Credentials => "CREDENTIALS",
        }
    }

    /// Credentials is the one kind the manager treats as warn-only: missing
    /// required env resolves to a log line, never a failed launch.
    pub fn is_warn_only(&self) -> bool {
        matches!(self, Self::Credentials)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pairs an [`ErrorKind`] with a human-readable context message. Implements
/// `std::error::Error` so it composes with `anyhow::Context` at call sites.
#[derive(Debug)]
pub struct ManagerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ManagerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ManagerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_as_str() {
        assert_eq!(ErrorKind::NotFound.to_string(), "NOT_FOUND");
        assert!(ErrorKind::Credentials.is_warn_only());
        assert!(!ErrorKind::SidecarCall.is_warn_only());
    }
}

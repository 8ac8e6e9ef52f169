// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Process-level configuration for an embedding CLI/HTTP layer to hand to
//! the manager: broker connection, subject prefix, mount-template roots,
//! and logging (§A2/A3 of the expanded design). Grounded on the teacher's
//! `clap::Parser`-derived `Config` and its `validate()` step.

use std::path::PathBuf;

use clap::Parser;

use crate::backend::FallbackPolicy;

#[derive(Debug, Parser)]
#[command(name = "execd", version, about = "Agent execution lifecycle manager")]
pub struct ManagerConfig {
    /// NATS URL the event publisher connects to.
    #[arg(long, env = "EXECD_BROKER_URL", default_value = "nats://127.0.0.1:4222")]
    pub broker_url: String,

    /// Subject prefix prepended to every published event (§4.5).
    #[arg(long, env = "EXECD_SUBJECT_PREFIX", default_value = "kandev")]
    pub subject_prefix: String,

    /// Base directory for append-only session history (§4.8). Created on
    /// startup; if that fails, history degrades to a no-op rather than
    /// failing startup.
    #[arg(long, env = "EXECD_HISTORY_DIR", default_value = "/var/lib/execd/history")]
    pub history_dir: PathBuf,

    /// Root for the `{augment_sessions}` mount-template placeholder (§6).
    /// Falls back to `/tmp` if it cannot be created.
    #[arg(long, env = "EXECD_AUGMENT_SESSIONS_DIR")]
    pub augment_sessions_dir: Option<PathBuf>,

    /// How `BackendRegistry::get_for_executor_type` behaves when the
    /// requested backend is unavailable (§4.6): allow, warn, or deny.
    #[arg(long, env = "EXECD_BACKEND_FALLBACK", default_value = "warn")]
    pub backend_fallback: String,

    /// Log format (json or text).
    #[arg(long, env = "EXECD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "EXECD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl ManagerConfig {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.backend_fallback_policy()?;
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    pub fn backend_fallback_policy(&self) -> anyhow::Result<FallbackPolicy> {
        match self.backend_fallback.to_lowercase().as_str() {
            "allow" => Ok(FallbackPolicy::Allow),
            "warn" => Ok(FallbackPolicy::Warn),
            "deny" => Ok(FallbackPolicy::Deny),
            other => anyhow::bail!("invalid backend fallback policy: {other}"),
        }
    }

    /// Resolves the `{augment_sessions}` mount-template root, creating it
    /// (or falling back to `/tmp`) if necessary (Design Note: "Global
    /// process-wide state" — the HOME-relative default is computed here,
    /// once, rather than read ambiently wherever the placeholder expands).
    pub fn resolve_augment_sessions_dir(&self) -> PathBuf {
        let candidate = self
            .augment_sessions_dir
            .clone()
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".augment/sessions")));
        match candidate {
            Some(dir) if std::fs::create_dir_all(&dir).is_ok() => dir,
            _ => PathBuf::from("/tmp"),
        }
    }
}

/// Installs a `tracing` subscriber per `log_format`/`log_level`.
pub fn init_tracing(config: &ManagerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ManagerConfig {
        ManagerConfig {
            broker_url: "nats://127.0.0.1:4222".into(),
            subject_prefix: "kandev".into(),
            history_dir: PathBuf::from("/tmp/execd-history"),
            augment_sessions_dir: None,
            backend_fallback: "warn".into(),
            log_format: "json".into(),
            log_level: "info".into(),
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_log_format() {
        let mut config = base();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_fallback_policy_parses_known_values() {
        let mut config = base();
        config.backend_fallback = "deny".into();
        assert_eq!(config.backend_fallback_policy().unwrap(), FallbackPolicy::Deny);
    }

    #[test]
    fn backend_fallback_policy_rejects_unknown_value() {
        let mut config = base();
        config.backend_fallback = "maybe".into();
        assert!(config.backend_fallback_policy().is_err());
    }
}

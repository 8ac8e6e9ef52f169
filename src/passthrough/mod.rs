// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Optional PTY-based mode where the sidecar hosts an interactive CLI; the
//! manager wires input/output and detects turn boundaries (§4.9, C9).

pub mod detect;
pub mod pty;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::detect::PromptPatternDetector;
use self::pty::{PtyExitStatus, PtyProcess};
use crate::model::ExecutionId;

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 40;
pub const CLEANUP_DELAY: Duration = Duration::from_millis(100);
pub const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Everything `PassthroughRunner` needs that a profile/config supplies.
pub struct PassthroughOptions {
    pub command: Vec<String>,
    pub resume_command: Option<Vec<String>>,
    pub workspace: String,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub prompt_pattern: regex::Regex,
    pub idle_timeout: Duration,
    pub stability_window: Duration,
    pub check_interval: Duration,
}

impl Default for PassthroughOptions {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            resume_command: None,
            workspace: String::new(),
            env: HashMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            prompt_pattern: regex::Regex::new(r"(?m)^> $").unwrap(),
            idle_timeout: Duration::from_secs(30 * 60),
            stability_window: Duration::from_millis(500),
            check_interval: Duration::from_millis(250),
        }
    }
}

/// Callbacks the runner invokes; kept narrow and explicit for the same
/// reason `StreamCallbacks` is (Design Note on closures-as-back-references).
pub trait PassthroughSink: Send + Sync {
    fn on_output(&self, id: &ExecutionId, chunk: Bytes);
    fn on_turn_complete(&self, id: &ExecutionId);
    fn on_exited(&self, id: &ExecutionId, status: PtyExitStatus);
}

pub struct PassthroughRunner {
    id: ExecutionId,
    options: PassthroughOptions,
    sink: Arc<dyn PassthroughSink>,
    client_connected: Arc<AtomicBool>,
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl PassthroughRunner {
    pub fn new(id: ExecutionId, options: PassthroughOptions, sink: Arc<dyn PassthroughSink>) -> Self {
        Self {
            id,
            options,
            sink,
            client_connected: Arc::new(AtomicBool::new(false)),
            input_tx: Mutex::new(None),
        }
    }

    pub fn set_client_connected(&self, connected: bool) {
        self.client_connected.store(connected, Ordering::SeqCst);
    }

    pub async fn write_input(&self, data: Bytes) -> anyhow::Result<()> {
        let guard = self.input_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(data).await.map_err(|_| anyhow::anyhow!("passthrough input channel closed")),
            None => Err(anyhow::anyhow!("passthrough process not running")),
        }
    }

    /// Spawns the PTY process and drives it until it exits or `shutdown`
    /// fires. `shutdown` is expected to be a token scoped to this execution
    /// (a child of the Manager's root token), since an idle-timeout trip
    /// cancels it directly rather than only returning from this call. On
    /// an unexpected exit while a client is still attached, performs the
    /// cleanup-delay / notice / restart-delay / resume dance from §4.9.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut current_command = self.options.command.clone();
        loop {
            let mut process: Box<dyn PtyProcess> = match pty::NativePty::spawn(self.id.clone(), &current_command, &self.options.env, self.options.cols, self.options.rows) {
                Ok(p) => Box::new(p),
                Err(e) => {
                    error!(execution_id = %self.id, error = %e, "failed to spawn passthrough process");
                    return;
                }
            };

            let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
            let (input_tx, input_rx) = mpsc::channel::<Bytes>(256);
            *self.input_tx.lock().await = Some(input_tx);

            let detector = Arc::new(Mutex::new(PromptPatternDetector::new(self.options.prompt_pattern.clone(), self.options.stability_window)));
            let last_output = Arc::new(Mutex::new(Instant::now()));

            let run_fut = process.run(output_tx, input_rx);
            tokio::pin!(run_fut);

            let idle_handle = {
                let last_output = last_output.clone();
                let idle_timeout = self.options.idle_timeout;
                let shutdown_tx = shutdown.clone();
                let id = self.id.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        if shutdown_tx.is_cancelled() {
                            return;
                        }
                        if last_output.lock().await.elapsed() >= idle_timeout {
                            warn!(execution_id = %id, "passthrough process idle timeout reached");
                            shutdown_tx.cancel();
                            return;
                        }
                    }
                })
            };

            let detect_handle = {
                let detector = detector.clone();
                let sink = self.sink.clone();
                let id = self.id.clone();
                let check_interval = self.options.check_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(check_interval) => {
                                if detector.lock().await.poll(Instant::now()) {
                                    sink.on_turn_complete(&id);
                                    detector.lock().await.reset();
                                }
                            }
                        }
                    }
                })
            };

            let status = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        detect_handle.abort();
                        idle_handle.abort();
                        return;
                    }
                    chunk = output_rx.recv() => {
                        match chunk {
                            Some(bytes) => {
                                *last_output.lock().await = Instant::now();
                                if let Ok(text) = std::str::from_utf8(&bytes) {
                                    detector.lock().await.on_output(text);
                                }
                                self.sink.on_output(&self.id, bytes);
                            }
                            None => {}
                        }
                    }
                    result = &mut run_fut => {
                        break result;
                    }
                }
            };
            detect_handle.abort();
            idle_handle.abort();
            *self.input_tx.lock().await = None;

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    error!(execution_id = %self.id, error = %e, "passthrough process error");
                    return;
                }
            };

            if !self.client_connected.load(Ordering::SeqCst) {
                self.sink.on_exited(&self.id, status);
                return;
            }

            // Auto-restart: client is still attached, so recover in place.
            tokio::time::sleep(CLEANUP_DELAY).await;
            self.sink.on_output(
                &self.id,
                Bytes::from_static(b"\r\n[passthrough process exited unexpectedly, attempting to resume]\r\n"),
            );
            tokio::time::sleep(RESTART_DELAY).await;

            match &self.options.resume_command {
                Some(resume) if !resume.is_empty() => {
                    info!(execution_id = %self.id, "restarting passthrough process via resume command");
                    current_command = resume.clone();
                    continue;
                }
                _ => {
                    warn!(execution_id = %self.id, "passthrough process exited and no resume command is configured");
                    self.sink.on_output(&self.id, Bytes::from_static(b"\r\n[unable to resume: no resume command configured]\r\n"));
                    self.sink.on_exited(&self.id, status);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_spec_defaults() {
        let opts = PassthroughOptions::default();
        assert_eq!(opts.cols, DEFAULT_COLS);
        assert_eq!(opts.rows, DEFAULT_ROWS);
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Turn-completion detection for passthrough mode: a prompt-pattern regex
//! match against recently-seen output, confirmed by a stability window with
//! no new bytes (§4.9). Collapsed from the teacher's tiered
//! `Detector`/`CompositeDetector` machinery (`driver::composite`) to a
//! single tier, since `PassthroughRunner` has exactly one detection source.

use std::time::{Duration, Instant};

use regex::Regex;

/// Detector configuration: the regex that indicates the CLI is waiting on
/// the user, plus how long output must stay quiet after a match before the
/// turn is considered complete.
pub struct PromptPatternDetector {
    pattern: Regex,
    stability_window: Duration,
    tail: String,
    tail_cap: usize,
    last_match_seen_at: Option<Instant>,
    last_byte_at: Instant,
}

impl PromptPatternDetector {
    pub fn new(pattern: Regex, stability_window: Duration) -> Self {
        Self {
            pattern,
            stability_window,
            tail: String::new(),
            tail_cap: 4096,
            last_match_seen_at: None,
            last_byte_at: Instant::now(),
        }
    }

    /// Feed freshly-read output through the detector. Call [`Self::poll`]
    /// afterward (or on an idle timer) to check whether the turn looks
    /// complete.
    pub fn on_output(&mut self, chunk: &str) {
        self.last_byte_at = Instant::now();
        self.tail.push_str(chunk);
        if self.tail.len() > self.tail_cap {
            let excess = self.tail.len() - self.tail_cap;
            self.tail.drain(..excess);
        }

        if self.pattern.is_match(&self.tail) {
            self.last_match_seen_at = Some(Instant::now());
        } else {
            self.last_match_seen_at = None;
        }
    }

    /// Returns true exactly once the prompt pattern has matched AND no
    /// further bytes have arrived for the stability window.
    pub fn poll(&self, now: Instant) -> bool {
        let Some(matched_at) = self.last_match_seen_at else {
            return false;
        };
        let quiet_since = now.duration_since(self.last_byte_at);
        now >= matched_at && quiet_since >= self.stability_window
    }

    /// Reset detection state, e.g. after a new prompt is sent on the PTY.
    pub fn reset(&mut self) {
        self.tail.clear();
        self.last_match_seen_at = None;
        self.last_byte_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PromptPatternDetector {
        PromptPatternDetector::new(Regex::new(r"(?m)^> $").unwrap(), Duration::from_millis(50))
    }

    #[test]
    fn does_not_fire_before_pattern_matches() {
        let mut d = detector();
        d.on_output("still working...\n");
        assert!(!d.poll(Instant::now()));
    }

    #[test]
    fn does_not_fire_immediately_after_match_within_stability_window() {
        let mut d = detector();
        d.on_output("done.\n> ");
        assert!(!d.poll(Instant::now()));
    }

    #[test]
    fn fires_once_stable_after_match() {
        let mut d = detector();
        d.on_output("done.\n> ");
        std::thread::sleep(Duration::from_millis(60));
        assert!(d.poll(Instant::now()));
    }

    #[test]
    fn new_output_after_match_clears_pending_completion() {
        let mut d = detector();
        d.on_output("done.\n> ");
        d.on_output("actually one more thing\n");
        assert!(!d.poll(Instant::now()));
    }

    #[test]
    fn reset_clears_state() {
        let mut d = detector();
        d.on_output("done.\n> ");
        std::thread::sleep(Duration::from_millis(60));
        assert!(d.poll(Instant::now()));
        d.reset();
        assert!(!d.poll(Instant::now()));
    }
}

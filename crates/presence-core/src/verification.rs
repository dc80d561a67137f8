//! Temporal verification: turns noisy per-frame match scores into one
//! confirmed mark per person per session.
//!
//! Each (session, identity) pair keeps a sliding window of the last N
//! confidences. Once the window is full and its mean clears the threshold,
//! the pair is confirmed, the window is cleared, and a cooldown starts.
//! While cooling down, qualifying windows are suppressed but keep sliding.
//!
//! State is only dropped by [`VerificationAggregator::clear_session`].

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Observations needed before a pair is evaluated.
    pub window: usize,
    /// Minimum mean confidence over a full window.
    pub threshold: f32,
    /// Minimum time between two confirmations of the same pair.
    pub cooldown: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            window: 3,
            threshold: 0.55,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// What one observation did to its (session, identity) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Window not yet full.
    Collecting { observed: usize },
    /// Window full, mean too low.
    BelowThreshold { mean: f32 },
    /// Window qualifies but the pair was confirmed too recently.
    CoolingDown { mean: f32, remaining: Duration },
    /// Mark now.
    Confirmed { mean: f32 },
}

impl Verdict {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Verdict::Confirmed { .. })
    }
}

#[derive(Default)]
struct PairState {
    window: VecDeque<f32>,
    last_mark: Option<Instant>,
}

type PairKey = (String, String);

pub struct VerificationAggregator {
    config: VerificationConfig,
    pairs: Mutex<HashMap<PairKey, PairState>>,
}

impl VerificationAggregator {
    pub fn new(mut config: VerificationConfig) -> Self {
        config.window = config.window.max(1);
        Self {
            config,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Record one observation; true means "mark attendance now".
    pub fn observe(&self, session: &str, identity: &str, confidence: f32) -> bool {
        self.observe_at(session, identity, confidence, Instant::now())
            .is_confirmed()
    }

    /// [`observe`](Self::observe) against an explicit clock, returning the
    /// full verdict.
    ///
    /// Non-finite confidences are dropped without touching the window.
    pub fn observe_at(&self, session: &str, identity: &str, confidence: f32, now: Instant) -> Verdict {
        let mut pairs = self.pairs.lock();
        if !confidence.is_finite() {
            tracing::warn!(session, identity, confidence, "ignoring non-finite confidence");
            let observed = pairs
                .get(&(session.to_owned(), identity.to_owned()))
                .map_or(0, |state| state.window.len());
            return Verdict::Collecting { observed };
        }

        let state = pairs
            .entry((session.to_owned(), identity.to_owned()))
            .or_default();

        state.window.push_back(confidence);
        while state.window.len() > self.config.window {
            state.window.pop_front();
        }

        if state.window.len() < self.config.window {
            return Verdict::Collecting {
                observed: state.window.len(),
            };
        }

        let mean = state.window.iter().sum::<f32>() / state.window.len() as f32;
        if mean < self.config.threshold {
            return Verdict::BelowThreshold { mean };
        }

        if let Some(last) = state.last_mark {
            let since = now.saturating_duration_since(last);
            if since < self.config.cooldown {
                return Verdict::CoolingDown {
                    mean,
                    remaining: self.config.cooldown - since,
                };
            }
        }

        state.last_mark = Some(now);
        state.window.clear();
        tracing::debug!(session, identity, mean, "presence confirmed");
        Verdict::Confirmed { mean }
    }

    /// Forget every window and mark belonging to `session`. Returns how many
    /// pairs were dropped.
    pub fn clear_session(&self, session: &str) -> usize {
        let mut pairs = self.pairs.lock();
        let before = pairs.len();
        pairs.retain(|(s, _), _| s != session);
        let dropped = before - pairs.len();
        tracing::debug!(session, dropped, "cleared verification state");
        dropped
    }

    /// Number of live (session, identity) pairs.
    pub fn tracked_keys(&self) -> usize {
        self.pairs.lock().len()
    }
}

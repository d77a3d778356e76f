//! Sliding 60-second token budget.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

pub const WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_OVERSHOOT: f64 = 1.2;
pub const DEFAULT_SOFT_BLOCK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenWindowSnapshot {
    pub target_tpm: u64,
    pub current_tpm: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<(Instant, u64)>,
    total: u64,
}

impl State {
    fn prune(&mut self, now: Instant) {
        while let Some(&(at, tokens)) = self.entries.front() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.entries.pop_front();
            self.total = self.total.saturating_sub(tokens);
        }
    }
}

/// Rolling tokens-per-minute tracker with soft admission.
///
/// Reservations are counted before the call they guard has finished. The
/// window only slows a caller down once usage is already past
/// `overshoot * target_tpm`, and then by a single fixed pause rather than a
/// computed wait: throughput is favoured over exact compliance.
#[derive(Debug)]
pub struct TokenWindow {
    target_tpm: u64,
    overshoot: f64,
    soft_block: Duration,
    state: Mutex<State>,
}

impl TokenWindow {
    pub fn new(target_tpm: u64) -> Self {
        Self {
            target_tpm,
            overshoot: DEFAULT_OVERSHOOT,
            soft_block: DEFAULT_SOFT_BLOCK,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_overshoot(mut self, overshoot: f64) -> Self {
        self.overshoot = overshoot;
        self
    }

    pub fn with_soft_block(mut self, pause: Duration) -> Self {
        self.soft_block = pause;
        self
    }

    pub fn target_tpm(&self) -> u64 {
        self.target_tpm
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn limit(&self) -> f64 {
        self.target_tpm as f64 * self.overshoot
    }

    /// Reserve `estimated` tokens, pausing once if the window is already over
    /// budget. Returns whether a pause was taken.
    pub fn reserve(&self, estimated: u64) -> bool {
        let over_budget = {
            let mut st = self.lock();
            st.prune(Instant::now());
            st.total as f64 > self.limit()
        };

        if over_budget {
            debug!(
                target_tpm = self.target_tpm,
                pause_ms = self.soft_block.as_millis() as u64,
                "token window over budget, pausing"
            );
            std::thread::sleep(self.soft_block);
        }

        self.record(estimated);
        over_budget
    }

    /// Add tokens to the window without any admission check.
    pub fn record(&self, tokens: u64) {
        let mut st = self.lock();
        let now = Instant::now();
        st.prune(now);
        st.entries.push_back((now, tokens));
        st.total = st.total.saturating_add(tokens);
    }

    /// Tokens reserved in the trailing 60 seconds.
    pub fn current_tpm(&self) -> u64 {
        let mut st = self.lock();
        st.prune(Instant::now());
        st.total
    }

    pub fn snapshot(&self) -> TokenWindowSnapshot {
        let mut st = self.lock();
        st.prune(Instant::now());
        TokenWindowSnapshot {
            target_tpm: self.target_tpm,
            current_tpm: st.total,
            entries: st.entries.len(),
        }
    }

    pub fn reset(&self) {
        let mut st = self.lock();
        st.entries.clear();
        st.total = 0;
    }
}

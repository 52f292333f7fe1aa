// Circuit breaker for upstream collaborators
//
// States:
// - Closed: calls pass through; consecutive failures are counted per window
// - Open: calls fail fast with `Unavailable` until `open_duration` elapses
// - HalfOpen: a single probe is let through; success closes, failure reopens
//
// Only `Unavailable` trips the breaker. Rate limits and rejected requests
// say nothing about upstream health.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::UpstreamConfig;
use crate::error::{Collaborator, UpstreamError};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub open_duration: Duration,
    pub window: Duration,
}

impl BreakerConfig {
    pub fn from_upstream(config: &UpstreamConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_duration: Duration::from_secs(config.open_duration_secs),
            window: Duration::from_secs(config.window_secs),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

struct Window {
    failures: usize,
    started: Instant,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// A probe cancelled mid-flight never reports back; after `open_duration`
    /// another one may start
    probe_started: Instant,
}

pub struct UpstreamBreaker {
    collaborator: Collaborator,
    /// Fast-path copy of the state; transitions happen under `window`
    state: AtomicU8,
    window: Mutex<Window>,
    rejected: AtomicU64,
    config: BreakerConfig,
}

impl UpstreamBreaker {
    pub fn new(collaborator: Collaborator, config: BreakerConfig) -> Self {
        Self {
            collaborator,
            state: AtomicU8::new(BreakerState::Closed as u8),
            window: Mutex::new(Window {
                failures: 0,
                started: Instant::now(),
                opened_at: None,
                probe_in_flight: false,
                probe_started: Instant::now(),
            }),
            rejected: AtomicU64::new(0),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: BreakerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether a call may proceed now
    pub fn allow(&self) -> bool {
        if self.state() == BreakerState::Closed {
            return true;
        }

        let mut window = self.window.lock();
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = window
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    self.set_state(BreakerState::HalfOpen);
                    window.probe_in_flight = true;
                    window.probe_started = Instant::now();
                    info!(collaborator = %self.collaborator, "breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if window.probe_in_flight
                    && window.probe_started.elapsed() < self.config.open_duration
                {
                    false
                } else {
                    window.probe_in_flight = true;
                    window.probe_started = Instant::now();
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        if self.state() == BreakerState::Closed {
            let mut window = self.window.lock();
            window.failures = 0;
            return;
        }
        let mut window = self.window.lock();
        window.failures = 0;
        window.opened_at = None;
        window.probe_in_flight = false;
        window.started = Instant::now();
        self.set_state(BreakerState::Closed);
        info!(collaborator = %self.collaborator, "breaker closed");
    }

    pub fn record_failure(&self) {
        let mut window = self.window.lock();
        match self.state() {
            BreakerState::Closed => {
                if window.started.elapsed() >= self.config.window {
                    window.started = Instant::now();
                    window.failures = 0;
                }
                window.failures += 1;
                if window.failures >= self.config.failure_threshold {
                    self.trip(&mut window);
                }
            }
            BreakerState::HalfOpen => self.trip(&mut window),
            BreakerState::Open => {}
        }
    }

    fn trip(&self, window: &mut Window) {
        window.opened_at = Some(Instant::now());
        window.probe_in_flight = false;
        self.set_state(BreakerState::Open);
        warn!(
            collaborator = %self.collaborator,
            failures = window.failures,
            open_for = ?self.config.open_duration,
            "breaker opened"
        );
    }

    /// Run `call` through the breaker, recording its outcome
    pub async fn call<T, F>(&self, call: F) -> Result<T, UpstreamError>
    where
        F: Future<Output = Result<T, UpstreamError>>,
    {
        if !self.allow() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::BREAKER_REJECTIONS_TOTAL
                .with_label_values(&[self.collaborator.as_str()])
                .inc();
            return Err(UpstreamError::Unavailable(format!(
                "{} circuit open",
                self.collaborator
            )));
        }

        let result = call.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(UpstreamError::Unavailable(_)) => self.record_failure(),
            Err(_) => {
                // Upstream answered; a pending half-open probe counts as healthy
                if self.state() == BreakerState::HalfOpen {
                    self.record_success();
                }
            }
        }
        result
    }
}

//! Dispatch Circuit Breaker
//!
//! Per-key failure isolation for outbound calls to agents and external
//! dependencies. Keys are agent ids or dependency names.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::domain::CircuitEvent;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - dispatch allowed
    Closed,
    /// Failure threshold exceeded - dispatch refused
    Open,
    /// Recovery period - a single probe dispatch allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the dispatch circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that trip the circuit
    pub failure_threshold: u32,
    /// Sliding window for counting failures (seconds)
    pub failure_window_secs: u64,
    /// Time to wait before transitioning from Open to HalfOpen (seconds)
    pub reset_timeout_secs: u64,
    /// Upper bound for the doubled reset timeout after failed probes (seconds)
    pub max_reset_timeout_secs: u64,
    /// Timeout applied to each wrapped outbound call (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            reset_timeout_secs: 30,
            max_reset_timeout_secs: 300,
            call_timeout_ms: 5000,
        }
    }
}

/// Result of asking a circuit for permission to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed
    Allowed,
    /// The single half-open trial; the caller must report its outcome
    Probe,
    Denied,
}

impl Permit {
    pub fn is_granted(&self) -> bool {
        !matches!(self, Permit::Denied)
    }
}

/// Persisted state of one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    /// Current open timeout; doubles after each failed probe
    pub reset_timeout_secs: u64,
    #[serde(default)]
    pub recent_failures: VecDeque<DateTime<Utc>>,
    #[serde(skip)]
    pub probe_in_flight: bool,
}

impl CircuitBreakerState {
    pub fn new(key: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            reset_timeout_secs: config.reset_timeout_secs,
            recent_failures: VecDeque::new(),
            probe_in_flight: false,
        }
    }

    fn reset_due(&self, now: DateTime<Utc>) -> bool {
        match self.opened_at {
            Some(opened_at) => now - opened_at >= Duration::seconds(self.reset_timeout_secs as i64),
            None => true,
        }
    }

    /// Whether dispatch to this key is currently refused
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.reset_due(now),
            CircuitState::HalfOpen => self.probe_in_flight,
        }
    }

    /// Ask for permission to dispatch. An expired open circuit moves to
    /// half-open and hands out its single probe.
    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> (Permit, Option<CircuitEvent>) {
        match self.state {
            CircuitState::Closed => (Permit::Allowed, None),
            CircuitState::Open => {
                if !self.reset_due(now) {
                    return (Permit::Denied, None);
                }
                let event = self.half_open();
                self.probe_in_flight = true;
                (Permit::Probe, Some(event))
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    (Permit::Denied, None)
                } else {
                    self.probe_in_flight = true;
                    (Permit::Probe, None)
                }
            }
        }
    }

    /// Give back an unused probe (the probe dispatch never happened)
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    pub fn record_success_at(&mut self, config: &CircuitBreakerConfig) -> Option<CircuitEvent> {
        match self.state {
            // Failures age out of the window instead
            CircuitState::Closed => None,
            // A late success from a dispatch started before the trip
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                info!(key = %self.key, "circuit closed after successful probe");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.recent_failures.clear();
                self.opened_at = None;
                self.probe_in_flight = false;
                self.reset_timeout_secs = config.reset_timeout_secs;
                Some(CircuitEvent::Closed {
                    key: self.key.clone(),
                })
            }
        }
    }

    pub fn record_failure_at(
        &mut self,
        now: DateTime<Utc>,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitEvent> {
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                let window = Duration::seconds(config.failure_window_secs as i64);
                self.recent_failures.push_back(now);
                while let Some(&oldest) = self.recent_failures.front() {
                    if now - oldest > window {
                        self.recent_failures.pop_front();
                    } else {
                        break;
                    }
                }
                self.failure_count = self.recent_failures.len() as u32;
                debug!(
                    key = %self.key,
                    failure_count = self.failure_count,
                    threshold = config.failure_threshold,
                    "circuit failure recorded"
                );
                if self.failure_count >= config.failure_threshold {
                    Some(self.open(now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.reset_timeout_secs = self
                    .reset_timeout_secs
                    .saturating_mul(2)
                    .min(config.max_reset_timeout_secs);
                self.failure_count = self.failure_count.saturating_add(1);
                Some(self.open(now))
            }
            // A late failure from a dispatch started before the trip
            CircuitState::Open => None,
        }
    }

    /// Move a due open circuit to half-open without taking the probe
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Option<CircuitEvent> {
        if self.state == CircuitState::Open && self.reset_due(now) {
            Some(self.half_open())
        } else {
            None
        }
    }

    fn open(&mut self, now: DateTime<Utc>) -> CircuitEvent {
        warn!(
            key = %self.key,
            failure_count = self.failure_count,
            reset_timeout_secs = self.reset_timeout_secs,
            "circuit opened"
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.recent_failures.clear();
        CircuitEvent::Opened {
            key: self.key.clone(),
            failure_count: self.failure_count,
            reset_timeout_secs: self.reset_timeout_secs,
        }
    }

    fn half_open(&mut self) -> CircuitEvent {
        info!(key = %self.key, "circuit half-open, awaiting probe");
        self.state = CircuitState::HalfOpen;
        self.probe_in_flight = false;
        CircuitEvent::HalfOpened {
            key: self.key.clone(),
        }
    }
}

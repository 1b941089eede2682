//! Error Handler
//!
//! Wraps outbound calls with the per-key circuit breaker, classifies dispatch
//! failures and owns every [`CircuitBreakerState`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerState, CircuitState, Permit};
use crate::domain::{CircuitEvent, ErrorClass};
use crate::error::{DispatchError, Result};
use crate::persistence::StateStore;

pub struct ErrorHandler {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitBreakerState>,
    store: Arc<dyn StateStore>,
    event_tx: broadcast::Sender<CircuitEvent>,
}

impl ErrorHandler {
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn StateStore>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            circuits: DashMap::new(),
            store,
            event_tx,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.event_tx.subscribe()
    }

    /// Reload circuit states from the store
    pub async fn restore(&self) -> Result<usize> {
        let states = self.store.load_circuits().await?;
        let count = states.len();
        for mut state in states {
            state.probe_in_flight = false;
            self.circuits.insert(state.key.clone(), state);
        }
        info!(count, "restored circuit breakers");
        Ok(count)
    }

    /// Map a dispatch failure onto the failure taxonomy
    pub fn classify(error: &DispatchError) -> ErrorClass {
        match error {
            DispatchError::Rejected { .. } => ErrorClass::Fatal,
            DispatchError::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            DispatchError::Timeout { .. }
            | DispatchError::Connection(_)
            | DispatchError::Server { .. }
            | DispatchError::AgentUnavailable(_)
            | DispatchError::CircuitOpen(_) => ErrorClass::Transient,
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.is_open_at(key, Utc::now())
    }

    pub fn is_open_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.circuits
            .get(key)
            .map(|cb| cb.is_open_at(now))
            .unwrap_or(false)
    }

    pub fn state(&self, key: &str) -> Option<CircuitBreakerState> {
        self.circuits.get(key).map(|cb| cb.clone())
    }

    pub fn snapshot_all(&self) -> Vec<CircuitBreakerState> {
        let mut all: Vec<_> = self.circuits.iter().map(|cb| cb.clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn open_count(&self) -> usize {
        self.circuits
            .iter()
            .filter(|cb| cb.state != CircuitState::Closed)
            .count()
    }

    pub async fn try_acquire(&self, key: &str) -> Permit {
        self.try_acquire_at(key, Utc::now()).await
    }

    /// Ask permission to dispatch to `key`. A granted [`Permit::Probe`] must
    /// be resolved with [`Self::record_outcome`] or [`Self::release_probe`].
    pub async fn try_acquire_at(&self, key: &str, now: DateTime<Utc>) -> Permit {
        let (permit, change) = match self.circuits.get_mut(key) {
            Some(mut cb) => {
                let (permit, event) = cb.try_acquire_at(now);
                (permit, event.map(|e| (e, cb.clone())))
            }
            None => (Permit::Allowed, None),
        };
        if let Some((event, snapshot)) = change {
            self.publish(event, &snapshot).await;
        }
        permit
    }

    pub fn release_probe(&self, key: &str) {
        if let Some(mut cb) = self.circuits.get_mut(key) {
            cb.release_probe();
        }
    }

    pub async fn record_outcome(&self, key: &str, success: bool) {
        self.record_outcome_at(key, success, Utc::now()).await
    }

    pub async fn record_outcome_at(&self, key: &str, success: bool, now: DateTime<Utc>) {
        if success && !self.circuits.contains_key(key) {
            return;
        }

        let (event, snapshot) = {
            let mut cb = self
                .circuits
                .entry(key.to_string())
                .or_insert_with(|| CircuitBreakerState::new(key, &self.config));
            let event = if success {
                cb.record_success_at(&self.config)
            } else {
                cb.record_failure_at(now, &self.config)
            };
            (event, cb.clone())
        };

        match event {
            Some(event) => self.publish(event, &snapshot).await,
            None => self.persist(&snapshot).await,
        }
    }

    /// Run an outbound call guarded by the circuit for `key`
    pub async fn execute<T, F>(&self, key: &str, call: F) -> std::result::Result<T, DispatchError>
    where
        F: Future<Output = std::result::Result<T, DispatchError>>,
    {
        if !self.try_acquire(key).await.is_granted() {
            debug!(key, "call refused, circuit open");
            return Err(DispatchError::CircuitOpen(key.to_string()));
        }
        self.execute_permitted(key, call).await
    }

    /// Like [`Self::execute`] for a caller that already holds a permit
    pub async fn execute_permitted<T, F>(
        &self,
        key: &str,
        call: F,
    ) -> std::result::Result<T, DispatchError>
    where
        F: Future<Output = std::result::Result<T, DispatchError>>,
    {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout {
                elapsed_ms: self.config.call_timeout_ms,
            }),
        };

        match &result {
            Ok(_) => self.record_outcome(key, true).await,
            Err(e) => match Self::classify(e) {
                ErrorClass::Transient => self.record_outcome(key, false).await,
                ErrorClass::Fatal | ErrorClass::ResourceExhausted => {
                    debug!(key, error = %e, "failure not counted against circuit");
                    self.release_probe(key);
                }
            },
        }
        result
    }

    pub async fn tick(&self) -> Vec<CircuitEvent> {
        self.tick_at(Utc::now()).await
    }

    /// Move every due open circuit to half-open
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<CircuitEvent> {
        let changed: Vec<(CircuitEvent, CircuitBreakerState)> = self
            .circuits
            .iter_mut()
            .filter_map(|mut cb| cb.tick_at(now).map(|event| (event, cb.clone())))
            .collect();

        let mut events = Vec::with_capacity(changed.len());
        for (event, snapshot) in changed {
            self.publish(event.clone(), &snapshot).await;
            events.push(event);
        }
        events
    }

    /// Operator override: close the circuit and clear its counters
    pub async fn force_close(&self, key: &str) {
        let snapshot = {
            let Some(mut cb) = self.circuits.get_mut(key) else {
                return;
            };
            if cb.state == CircuitState::Closed {
                return;
            }
            *cb = CircuitBreakerState::new(key, &self.config);
            cb.clone()
        };
        warn!(key, "circuit force-closed");
        self.publish(CircuitEvent::Closed { key: key.to_string() }, &snapshot)
            .await;
    }

    async fn publish(&self, event: CircuitEvent, snapshot: &CircuitBreakerState) {
        self.persist(snapshot).await;
        let _ = self.event_tx.send(event);
    }

    async fn persist(&self, snapshot: &CircuitBreakerState) {
        if let Err(e) = self.store.save_circuit(snapshot).await {
            warn!(key = %snapshot.key, error = %e, "failed to persist circuit state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::persistence::MockStateStore;
    use chrono::Duration as ChronoDuration;

    fn handler() -> ErrorHandler {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_secs: 30,
            call_timeout_ms: 50,
            ..Default::default()
        };
        ErrorHandler::new(config, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_probes_once() {
        let eh = handler();
        let now = Utc::now();
        let mut rx = eh.subscribe();

        for _ in 0..5 {
            eh.record_outcome_at("a1", false, now).await;
        }
        assert!(eh.is_open_at("a1", now));
        assert!(matches!(rx.recv().await.unwrap(), CircuitEvent::Opened { .. }));

        let after = now + ChronoDuration::seconds(30);
        let events = eh.tick_at(after).await;
        assert_eq!(events.len(), 1);
        assert!(!eh.is_open_at("a1", after));

        assert_eq!(eh.try_acquire_at("a1", after).await, Permit::Probe);
        assert_eq!(eh.try_acquire_at("a1", after).await, Permit::Denied);
        assert!(eh.is_open_at("a1", after));

        eh.record_outcome_at("a1", true, after).await;
        assert_eq!(eh.try_acquire_at("a1", after).await, Permit::Allowed);
    }

    #[tokio::test]
    async fn test_fatal_failures_do_not_count() {
        let eh = handler();
        for _ in 0..10 {
            let result: std::result::Result<(), _> = eh
                .execute("a1", async {
                    Err(DispatchError::Rejected {
                        status: 400,
                        reason: "malformed payload".into(),
                    })
                })
                .await;
            assert!(result.is_err());
        }
        assert!(!eh.is_open("a1"));
        assert!(eh.state("a1").is_none());
    }

    #[tokio::test]
    async fn test_execute_times_out_and_counts_transient() {
        let eh = handler();
        let result: std::result::Result<(), _> = eh
            .execute("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
        assert_eq!(eh.state("slow").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_execute_refuses_when_open() {
        let eh = handler();
        for _ in 0..5 {
            eh.record_outcome("a1", false).await;
        }
        let called = std::sync::atomic::AtomicBool::new(false);
        let result = eh
            .execute("a1", async {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DispatchError::CircuitOpen(_))));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            ErrorHandler::classify(&DispatchError::Timeout { elapsed_ms: 10 }),
            ErrorClass::Transient
        );
        assert_eq!(
            ErrorHandler::classify(&DispatchError::Server { status: 503 }),
            ErrorClass::Transient
        );
        assert_eq!(
            ErrorHandler::classify(&DispatchError::Rejected {
                status: 422,
                reason: "capability mismatch".into()
            }),
            ErrorClass::Fatal
        );
        assert_eq!(
            ErrorHandler::classify(&DispatchError::ResourceExhausted("oom".into())),
            ErrorClass::ResourceExhausted
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let mut store = MockStateStore::new();
        store
            .expect_save_circuit()
            .returning(|_| Err(crate::error::ConvoyError::Internal("disk full".into())));
        let eh = ErrorHandler::new(CircuitBreakerConfig::default(), Arc::new(store));

        eh.record_outcome("a1", false).await;
        assert_eq!(eh.state("a1").unwrap().failure_count, 1);
    }
}

//! Failure Containment
//!
//! - Circuit breaker state machine, one per agent or dependency key
//! - Error handler wrapping outbound calls and classifying failures

pub mod circuit_breaker;
pub mod error_handler;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerState, CircuitState, Permit};
pub use error_handler::ErrorHandler;

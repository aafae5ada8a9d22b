//! Notification reconciliation engine.
//!
//! Drives `NotificationRequest` objects to a terminal phase: routes each spec
//! channel to a configured delivery channel, sanitizes content, dispatches
//! through per-channel circuit breakers, records every attempt with
//! optimistic-concurrency writes and emits an audit trail.

pub mod audit;
pub mod circuit_breaker;
pub mod clock;
pub mod reconciler;
pub mod retry;
pub mod sanitizer;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod worker;

//! Per-channel circuit breakers.
//!
//! - `Closed`: dispatches flow; N consecutive real failures open the circuit.
//! - `Open`: dispatches are rejected until the cooldown elapses.
//! - `HalfOpen`: exactly one probe dispatch is let through. Success closes the
//!   circuit, failure reopens it and restarts the cooldown. A probe that never
//!   reports back expires after one cooldown.
//!
//! State is shared by every notification targeting the channel and lives
//! behind one mutex; callers only see `allow` and `record_outcome`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, to_delta, until};
use crate::telemetry;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Answer to "may I dispatch to this channel now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the single half-open probe.
    Probe,
    Rejected { retry_in: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// A state change caused by `allow` or `record_outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone)]
struct ChannelCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: DateTime<Utc>,
    probe_started: Option<DateTime<Utc>>,
}

impl ChannelCircuit {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_transition: now,
            probe_started: None,
        }
    }

    fn move_to(&mut self, to: CircuitState, now: DateTime<Utc>) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_transition = now;
        Transition {
            from,
            to,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Read-only view of one channel's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub channel: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, ChannelCircuit>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Decide whether a real dispatch to `channel` may happen now.
    pub fn allow(&self, channel: &str) -> Admission {
        let now = self.clock.now();
        let cooldown = to_delta(self.config.cooldown);
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits
            .entry(channel.to_string())
            .or_insert_with(|| ChannelCircuit::new(now));

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let reopen_at = circuit.last_transition + cooldown;
                if now < reopen_at {
                    return Admission::Rejected {
                        retry_in: until(reopen_at, now),
                    };
                }
                circuit.move_to(CircuitState::HalfOpen, now);
                circuit.probe_started = Some(now);
                drop(circuits);

                tracing::info!(channel, "Circuit half-open, allowing probe");
                telemetry::record_circuit_state(channel, CircuitState::HalfOpen);
                Admission::Probe
            }
            CircuitState::HalfOpen => match circuit.probe_started {
                Some(started) if now < started + cooldown => Admission::Rejected {
                    retry_in: until(started + cooldown, now),
                },
                _ => {
                    // Previous probe never reported back
                    circuit.probe_started = Some(now);
                    Admission::Probe
                }
            },
        }
    }

    /// Record the outcome of a real dispatch. Returns the transition it caused, if any.
    pub fn record_outcome(&self, channel: &str, success: bool) -> Option<Transition> {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let circuit = circuits
            .entry(channel.to_string())
            .or_insert_with(|| ChannelCircuit::new(now));

        let transition = if success {
            circuit.consecutive_failures = 0;
            circuit.probe_started = None;
            (circuit.state != CircuitState::Closed)
                .then(|| circuit.move_to(CircuitState::Closed, now))
        } else {
            circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            match circuit.state {
                CircuitState::HalfOpen => {
                    circuit.probe_started = None;
                    Some(circuit.move_to(CircuitState::Open, now))
                }
                CircuitState::Closed
                    if circuit.consecutive_failures >= self.config.failure_threshold =>
                {
                    Some(circuit.move_to(CircuitState::Open, now))
                }
                _ => None,
            }
        };
        drop(circuits);

        if let Some(t) = transition {
            match t.to {
                CircuitState::Open => tracing::warn!(
                    channel,
                    consecutive_failures = t.consecutive_failures,
                    from = %t.from,
                    "Circuit opened"
                ),
                _ => tracing::info!(channel, from = %t.from, "Circuit closed"),
            }
            telemetry::record_circuit_state(channel, t.to);
        }

        transition
    }

    pub fn state(&self, channel: &str) -> CircuitState {
        self.circuits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// All known breakers, sorted by channel.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<CircuitSnapshot> = circuits
            .iter()
            .map(|(channel, c)| CircuitSnapshot {
                channel: channel.clone(),
                state: c.state,
                consecutive_failures: c.consecutive_failures,
                last_transition: c.last_transition,
            })
            .collect();
        snapshot.sort_by(|a, b| a.channel.cmp(&b.channel));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breakers() -> (Arc<ManualClock>, CircuitBreakers) {
        let clock = Arc::new(ManualClock::default());
        let breakers = CircuitBreakers::new(CircuitBreakerConfig::default(), clock.clone());
        (clock, breakers)
    }

    fn fail(breakers: &CircuitBreakers, channel: &str, times: u32) -> Option<Transition> {
        let mut last = None;
        for _ in 0..times {
            last = breakers.record_outcome(channel, false).or(last);
        }
        last
    }

    #[test]
    fn test_opens_after_threshold() {
        let (_, breakers) = breakers();
        assert_eq!(fail(&breakers, "slack", 4), None);
        assert_eq!(breakers.allow("slack"), Admission::Allowed);

        let t = fail(&breakers, "slack", 1).unwrap();
        assert_eq!(t.from, CircuitState::Closed);
        assert_eq!(t.to, CircuitState::Open);
        assert_eq!(t.consecutive_failures, 5);

        assert_eq!(
            breakers.allow("slack"),
            Admission::Rejected {
                retry_in: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let (_, breakers) = breakers();
        fail(&breakers, "email", 4);
        assert_eq!(breakers.record_outcome("email", true), None);
        fail(&breakers, "email", 4);
        assert_eq!(breakers.state("email"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_one_probe() {
        let (clock, breakers) = breakers();
        fail(&breakers, "slack", 5);

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            breakers.allow("slack"),
            Admission::Rejected {
                retry_in: Duration::from_secs(30)
            }
        );

        clock.advance(Duration::from_secs(30));
        assert_eq!(breakers.allow("slack"), Admission::Probe);
        assert_eq!(breakers.state("slack"), CircuitState::HalfOpen);
        assert!(!breakers.allow("slack").is_allowed());

        let t = breakers.record_outcome("slack", true).unwrap();
        assert_eq!(t.to, CircuitState::Closed);
        assert_eq!(breakers.allow("slack"), Admission::Allowed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let (clock, breakers) = breakers();
        fail(&breakers, "slack", 5);
        clock.advance(Duration::from_secs(60));
        assert_eq!(breakers.allow("slack"), Admission::Probe);

        let t = breakers.record_outcome("slack", false).unwrap();
        assert_eq!(t.from, CircuitState::HalfOpen);
        assert_eq!(t.to, CircuitState::Open);
        assert_eq!(
            breakers.allow("slack"),
            Admission::Rejected {
                retry_in: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_abandoned_probe_expires() {
        let (clock, breakers) = breakers();
        fail(&breakers, "slack", 5);
        clock.advance(Duration::from_secs(60));
        assert_eq!(breakers.allow("slack"), Admission::Probe);

        clock.advance(Duration::from_secs(59));
        assert!(!breakers.allow("slack").is_allowed());
        clock.advance(Duration::from_secs(1));
        assert_eq!(breakers.allow("slack"), Admission::Probe);
    }

    #[test]
    fn test_channels_are_independent() {
        let (_, breakers) = breakers();
        fail(&breakers, "slack", 5);
        assert_eq!(breakers.allow("console"), Admission::Allowed);

        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].channel, "console");
        assert_eq!(snapshot[1].state, CircuitState::Open);
    }
}

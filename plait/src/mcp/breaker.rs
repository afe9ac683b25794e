//! Per-server circuit breaker: failure counting with exponential-backoff open
//! state. Shared by the setup path and the per-call dispatch path; both update
//! the same counters, which is the only coordination between them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, warn};

/// Circuit breaker tuning.
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerConfig {
    /// Failures before the circuit opens.
    pub max_failures: u32,
    /// Base backoff once open, in seconds.
    pub reset_seconds: f64,
    pub backoff_multiplier: f64,
    /// Cap on the multiplier, not on the exponent.
    pub max_multiplier_cap: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            reset_seconds: 30.0,
            backoff_multiplier: 2.0,
            max_multiplier_cap: 8.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Profile for plain-HTTP integrations, which tolerate more network noise.
    pub fn for_http() -> Self {
        Self {
            max_failures: 5,
            reset_seconds: 60.0,
            backoff_multiplier: 2.0,
            max_multiplier_cap: 16.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ServerStatus {
    failure_count: u32,
    last_failure: Instant,
}

/// Detailed status for one server: (failure_count, seconds since last failure,
/// is_circuit_open).
pub type ServerBreakerStatus = (u32, Option<f64>, bool);

/// Circuit breaker over a set of named servers.
///
/// **Interaction**: consulted when choosing servers during setup, before every
/// tool-call dispatch, and by the setup-retry loop that escalates to permanent
/// block. Mutations go through one mutex; monotonic time only.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    status: Mutex<HashMap<String, ServerStatus>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            status: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff in seconds for a given failure count:
    /// `reset_seconds * min(multiplier^(failures - max_failures), cap)`.
    fn backoff_seconds(&self, failure_count: u32) -> f64 {
        if failure_count < self.config.max_failures {
            return 0.0;
        }
        let exponent = (failure_count - self.config.max_failures) as i32;
        let multiplier = self
            .config
            .backoff_multiplier
            .powi(exponent)
            .min(self.config.max_multiplier_cap);
        self.config.reset_seconds * multiplier
    }

    /// True iff the server's circuit is open. When the backoff window has
    /// elapsed the entry is cleared (half-open pass-through) and this returns
    /// false.
    pub fn should_skip(&self, server_name: &str) -> bool {
        let mut status = self.status.lock().expect("breaker lock poisoned");
        let Some(entry) = status.get(server_name).copied() else {
            return false;
        };
        if entry.failure_count < self.config.max_failures {
            return false;
        }
        let backoff = self.backoff_seconds(entry.failure_count);
        if entry.last_failure.elapsed().as_secs_f64() > backoff {
            info!(server = server_name, backoff, "circuit breaker reset after backoff");
            status.remove(server_name);
            return false;
        }
        true
    }

    pub fn record_failure(&self, server_name: &str) {
        let mut status = self.status.lock().expect("breaker lock poisoned");
        let entry = status
            .entry(server_name.to_string())
            .or_insert(ServerStatus {
                failure_count: 0,
                last_failure: Instant::now(),
            });
        entry.failure_count += 1;
        entry.last_failure = Instant::now();

        if entry.failure_count >= self.config.max_failures {
            let backoff = self.backoff_seconds(entry.failure_count);
            warn!(
                server = server_name,
                failures = entry.failure_count,
                backoff_secs = backoff,
                "server circuit opened"
            );
        } else {
            debug!(
                server = server_name,
                failures = entry.failure_count,
                threshold = self.config.max_failures,
                "server failure recorded"
            );
        }
    }

    /// Clears all failure state for the server.
    pub fn record_success(&self, server_name: &str) {
        let mut status = self.status.lock().expect("breaker lock poisoned");
        if let Some(entry) = status.remove(server_name) {
            if entry.failure_count > 0 {
                info!(
                    server = server_name,
                    failures = entry.failure_count,
                    "server recovered"
                );
            }
        }
    }

    /// (failure_count, seconds since last failure, is_circuit_open).
    pub fn server_status(&self, server_name: &str) -> ServerBreakerStatus {
        let status = self.status.lock().expect("breaker lock poisoned");
        match status.get(server_name) {
            None => (0, None, false),
            Some(entry) => {
                let elapsed = entry.last_failure.elapsed().as_secs_f64();
                let open = entry.failure_count >= self.config.max_failures
                    && elapsed <= self.backoff_seconds(entry.failure_count);
                (entry.failure_count, Some(elapsed), open)
            }
        }
    }

    /// Names of servers currently tracked with at least one failure.
    pub fn failing_servers(&self) -> Vec<String> {
        let status = self.status.lock().expect("breaker lock poisoned");
        status
            .iter()
            .filter(|(_, s)| s.failure_count > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn reset_all(&self) {
        let mut status = self.status.lock().expect("breaker lock poisoned");
        if !status.is_empty() {
            info!(servers = status.len(), "resetting circuit breaker");
        }
        status.clear();
    }
}

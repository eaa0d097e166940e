use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
enum CircuitState {
    Closed,   // healthy
    Open,     // tripped, tried only after every healthy route
    HalfOpen, // cooldown elapsed, next request probes it
}

struct RouteCircuit {
    consecutive_failures: u32,
    state: CircuitState,
    last_failure: Option<Instant>,
}

/// Per-route failure tracking. An open circuit never removes a route from the
/// candidate set; it only demotes it behind healthy ones.
pub struct CircuitBreaker {
    states: Mutex<HashMap<i64, RouteCircuit>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    /// Returns true if closed or half-open (probe allowed).
    pub fn is_available(&self, route_id: i64) -> bool {
        let mut states = self.states.lock();
        let circuit = match states.get_mut(&route_id) {
            Some(c) => c,
            None => return true, // no state = healthy
        };

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = circuit
                    .last_failure
                    .is_some_and(|t| t.elapsed() >= self.cooldown);
                if cooled {
                    circuit.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    /// Close the circuit after a successful request.
    pub fn record_success(&self, route_id: i64) {
        let mut states = self.states.lock();
        if let Some(circuit) = states.get_mut(&route_id) {
            circuit.consecutive_failures = 0;
            circuit.state = CircuitState::Closed;
        }
    }

    /// Count a failure; opens the circuit at the threshold.
    pub fn record_failure(&self, route_id: i64) {
        let mut states = self.states.lock();
        let circuit = states.entry(route_id).or_insert(RouteCircuit {
            consecutive_failures: 0,
            state: CircuitState::Closed,
            last_failure: None,
        });

        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(Instant::now());

        // a failed probe re-opens immediately
        if circuit.consecutive_failures >= self.failure_threshold
            || circuit.state == CircuitState::HalfOpen
        {
            if circuit.state != CircuitState::Open {
                log::warn!(
                    "Circuit opened for route {} after {} consecutive failures",
                    route_id,
                    circuit.consecutive_failures
                );
            }
            circuit.state = CircuitState::Open;
        }
    }

    /// Forget a route's history (deleted or edited routes start healthy).
    pub fn reset(&self, route_id: i64) {
        self.states.lock().remove(&route_id);
    }

    pub fn clear(&self) {
        self.states.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_and_closes_on_success() {
        let breaker = CircuitBreaker::new(2, 3600);
        breaker.record_failure(7);
        assert!(breaker.is_available(7));
        breaker.record_failure(7);
        assert!(!breaker.is_available(7));

        breaker.record_success(7);
        assert!(breaker.is_available(7));
    }

    #[test]
    fn cooldown_allows_a_probe() {
        let breaker = CircuitBreaker::new(1, 0);
        breaker.record_failure(1);
        // zero cooldown: immediately half-open
        assert!(breaker.is_available(1));
        breaker.record_failure(1);
        assert!(breaker.is_available(1));
    }

    #[test]
    fn reset_forgets_failures() {
        let breaker = CircuitBreaker::new(1, 3600);
        breaker.record_failure(4);
        assert!(!breaker.is_available(4));
        breaker.reset(4);
        assert!(breaker.is_available(4));
        assert!(breaker.is_available(5));
    }
}

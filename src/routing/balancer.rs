use crate::db::models::Route;
use crate::routing::circuit::CircuitBreaker;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the candidates for a model are ordered before failover walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Rotate the starting candidate on every request for the same model.
    #[default]
    RoundRobin,
    /// Shuffle the candidates per request.
    Random,
    /// Table order: exact-model routes by id, then group members by id.
    Priority,
}

impl SelectionStrategy {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" | "rr" => Some(Self::RoundRobin),
            "random" | "shuffle" => Some(Self::Random),
            "priority" | "ordered" | "failover" => Some(Self::Priority),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Priority => "priority",
        }
    }
}

/// Per-model rotation counters for round-robin selection.
pub struct Balancer {
    counters: Mutex<HashMap<String, usize>>,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Next rotation offset for `model`.
    fn next_offset(&self, model: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut counters = self.counters.lock();
        let counter = counters.entry(model.to_string()).or_insert(0);
        let offset = *counter % len;
        *counter = counter.wrapping_add(1);
        offset
    }

    /// Order `candidates` for one request. Routes whose circuit is open keep their
    /// relative order but move behind every available route.
    pub fn order(
        &self,
        strategy: SelectionStrategy,
        model: &str,
        mut candidates: Vec<Route>,
        circuit: &CircuitBreaker,
    ) -> Vec<Route> {
        match strategy {
            SelectionStrategy::RoundRobin => {
                let offset = self.next_offset(model, candidates.len());
                candidates.rotate_left(offset);
            }
            SelectionStrategy::Random => {
                candidates.shuffle(&mut rand::rng());
            }
            SelectionStrategy::Priority => {}
        }

        let (available, tripped): (Vec<Route>, Vec<Route>) = candidates
            .into_iter()
            .partition(|route| circuit.is_available(route.id));
        if !tripped.is_empty() {
            log::debug!(
                "{} of {} routes for {} have an open circuit",
                tripped.len(),
                available.len() + tripped.len(),
                model
            );
        }
        available.into_iter().chain(tripped).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: i64) -> Route {
        Route {
            id,
            name: format!("r{}", id),
            model: "gpt-4".into(),
            api_url: "https://example.com".into(),
            api_key: String::new(),
            group: "g".into(),
            format: "openai".into(),
            enabled: true,
            created: String::new(),
            updated: String::new(),
        }
    }

    fn ids(routes: &[Route]) -> Vec<i64> {
        routes.iter().map(|r| r.id).collect()
    }

    #[test]
    fn strategy_names_parse_loosely() {
        assert_eq!(
            SelectionStrategy::from_str_loose("Round-Robin"),
            Some(SelectionStrategy::RoundRobin)
        );
        assert_eq!(
            SelectionStrategy::from_str_loose("priority"),
            Some(SelectionStrategy::Priority)
        );
        assert_eq!(SelectionStrategy::from_str_loose("weighted"), None);
        assert_eq!(SelectionStrategy::Random.as_str(), "random");
    }

    #[test]
    fn round_robin_rotates_per_model() {
        let balancer = Balancer::new();
        let circuit = CircuitBreaker::new(3, 30);
        let candidates = vec![route(1), route(2), route(3)];

        let first = balancer.order(SelectionStrategy::RoundRobin, "gpt-4", candidates.clone(), &circuit);
        let second = balancer.order(SelectionStrategy::RoundRobin, "gpt-4", candidates.clone(), &circuit);
        let other = balancer.order(SelectionStrategy::RoundRobin, "claude", candidates.clone(), &circuit);

        assert_eq!(ids(&first), vec![1, 2, 3]);
        assert_eq!(ids(&second), vec![2, 3, 1]);
        assert_eq!(ids(&other), vec![1, 2, 3]);
    }

    #[test]
    fn priority_keeps_table_order() {
        let balancer = Balancer::new();
        let circuit = CircuitBreaker::new(3, 30);
        for _ in 0..3 {
            let ordered = balancer.order(
                SelectionStrategy::Priority,
                "gpt-4",
                vec![route(1), route(2), route(3)],
                &circuit,
            );
            assert_eq!(ids(&ordered), vec![1, 2, 3]);
        }
    }

    #[test]
    fn random_is_a_permutation() {
        let balancer = Balancer::new();
        let circuit = CircuitBreaker::new(3, 30);
        let mut ordered = ids(&balancer.order(
            SelectionStrategy::Random,
            "gpt-4",
            vec![route(1), route(2), route(3), route(4)],
            &circuit,
        ));
        ordered.sort();
        assert_eq!(ordered, vec![1, 2, 3, 4]);
    }

    #[test]
    fn open_circuits_go_last() {
        let balancer = Balancer::new();
        let circuit = CircuitBreaker::new(1, 300);
        circuit.record_failure(1);

        let ordered = balancer.order(
            SelectionStrategy::Priority,
            "gpt-4",
            vec![route(1), route(2), route(3)],
            &circuit,
        );
        assert_eq!(ids(&ordered), vec![2, 3, 1]);
    }
}

//! Terminator selection strategies.
//!
//! The registry is closed at boot: `smartrouting` (default), `random`,
//! `weighted`, `sticky`. Strategies receive terminators pre-scored with
//! the biased route cost and sorted ascending (ties broken by id), and
//! observe circuit lifecycle events to maintain internal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use trellis_domain::error::CircuitFailureCause;
use trellis_domain::model::Terminator;
use trellis_domain::{Error, Result};

/// How long a terminator stays deprioritized after a failed dial.
const DIAL_FAIL_COOLDOWN: Duration = Duration::from_secs(30);

/// Cost penalty applied to a cooling terminator. A penalty rather than
/// exclusion: a clearly-cheapest terminator is still retried after a
/// transient failure.
const DIAL_FAIL_PENALTY: u32 = 100;

/// A terminator scored for one selection round:
/// `biased_cost = precedence.bias(static + dynamic + path cost)`.
#[derive(Debug, Clone)]
pub struct CostedTerminator {
    pub terminator: Terminator,
    pub route_cost: u32,
}

/// Lifecycle notifications strategies may react to.
#[derive(Debug, Clone)]
pub enum StrategyEvent {
    CircuitCreated {
        terminator_id: String,
        client_token: String,
    },
    CircuitRemoved {
        terminator_id: String,
    },
    DialFailed {
        terminator_id: String,
    },
}

/// Extra peer data a strategy wants delivered to the dialing endpoint.
pub type StrategyPeerData = HashMap<i32, Vec<u8>>;

pub trait TerminatorStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose from a non-empty, cost-ascending list.
    fn select(
        &self,
        client_token: &str,
        terminators: &[CostedTerminator],
    ) -> Result<(CostedTerminator, StrategyPeerData)>;

    fn notify_event(&self, _event: &StrategyEvent) {}
}

impl std::fmt::Debug for dyn TerminatorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminatorStrategy")
            .field("name", &self.name())
            .finish()
    }
}

fn strategy_err(name: &str, msg: &str) -> Error {
    Error::circuit(CircuitFailureCause::StrategyError, format!("{name}: {msg}"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// smartrouting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lowest biased cost wins; terminators that recently failed a dial
/// carry an extra cost penalty for a cool-down period.
#[derive(Default)]
pub struct SmartRouting {
    cooling: DashMap<String, Instant>,
}

impl SmartRouting {
    fn penalty(&self, terminator_id: &str) -> u32 {
        match self.cooling.get(terminator_id) {
            Some(entry) if entry.elapsed() < DIAL_FAIL_COOLDOWN => DIAL_FAIL_PENALTY,
            _ => 0,
        }
    }
}

impl TerminatorStrategy for SmartRouting {
    fn name(&self) -> &'static str {
        "smartrouting"
    }

    fn select(
        &self,
        _client_token: &str,
        terminators: &[CostedTerminator],
    ) -> Result<(CostedTerminator, StrategyPeerData)> {
        let chosen = terminators
            .iter()
            .min_by_key(|t| {
                (
                    t.route_cost.saturating_add(self.penalty(&t.terminator.id)),
                    t.terminator.id.clone(),
                )
            })
            .ok_or_else(|| strategy_err("smartrouting", "no terminators offered"))?;
        Ok((chosen.clone(), StrategyPeerData::new()))
    }

    fn notify_event(&self, event: &StrategyEvent) {
        match event {
            StrategyEvent::DialFailed { terminator_id } => {
                self.cooling.insert(terminator_id.clone(), Instant::now());
            }
            StrategyEvent::CircuitCreated { terminator_id, .. } => {
                self.cooling.remove(terminator_id);
            }
            StrategyEvent::CircuitRemoved { .. } => {}
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// random / weighted
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct Random;

impl TerminatorStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(
        &self,
        _client_token: &str,
        terminators: &[CostedTerminator],
    ) -> Result<(CostedTerminator, StrategyPeerData)> {
        if terminators.is_empty() {
            return Err(strategy_err("random", "no terminators offered"));
        }
        let pick = rand::thread_rng().gen_range(0..terminators.len());
        Ok((terminators[pick].clone(), StrategyPeerData::new()))
    }
}

/// Selection probability inversely proportional to biased cost.
#[derive(Default)]
pub struct Weighted;

impl TerminatorStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(
        &self,
        _client_token: &str,
        terminators: &[CostedTerminator],
    ) -> Result<(CostedTerminator, StrategyPeerData)> {
        if terminators.is_empty() {
            return Err(strategy_err("weighted", "no terminators offered"));
        }
        let max_cost = terminators
            .iter()
            .map(|t| t.route_cost as u64)
            .max()
            .unwrap_or(0);
        let weights: Vec<u64> = terminators
            .iter()
            .map(|t| max_cost + 1 - t.route_cost as u64)
            .collect();
        let total: u64 = weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0..total);
        for (terminator, weight) in terminators.iter().zip(&weights) {
            if roll < *weight {
                return Ok((terminator.clone(), StrategyPeerData::new()));
            }
            roll -= weight;
        }
        Ok((terminators[0].clone(), StrategyPeerData::new()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// sticky
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pins each client token to its previous terminator while that
/// terminator remains offered and healthy; otherwise falls back to the
/// cheapest and re-pins.
#[derive(Default)]
pub struct Sticky {
    sessions: DashMap<String, String>,
}

impl TerminatorStrategy for Sticky {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select(
        &self,
        client_token: &str,
        terminators: &[CostedTerminator],
    ) -> Result<(CostedTerminator, StrategyPeerData)> {
        if terminators.is_empty() {
            return Err(strategy_err("sticky", "no terminators offered"));
        }

        if let Some(pinned) = self.sessions.get(client_token) {
            if let Some(existing) = terminators.iter().find(|t| {
                t.terminator.id == *pinned.value() && !t.terminator.precedence.is_failed()
            }) {
                return Ok((existing.clone(), StrategyPeerData::new()));
            }
        }

        let chosen = terminators[0].clone();
        self.sessions
            .insert(client_token.to_string(), chosen.terminator.id.clone());
        Ok((chosen, StrategyPeerData::new()))
    }

    fn notify_event(&self, event: &StrategyEvent) {
        if let StrategyEvent::DialFailed { terminator_id } = event {
            self.sessions.retain(|_, pinned| pinned != terminator_id);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const DEFAULT_STRATEGY: &str = "smartrouting";

/// Process-wide strategy set, created at startup and threaded into the
/// circuit engine; tests build a fresh instance per case.
pub struct StrategyRegistry {
    strategies: Mutex<HashMap<String, Arc<dyn TerminatorStrategy>>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let registry = Self {
            strategies: Mutex::new(HashMap::new()),
        };
        registry.register(Arc::new(SmartRouting::default()));
        registry.register(Arc::new(Random));
        registry.register(Arc::new(Weighted));
        registry.register(Arc::new(Sticky::default()));
        registry
    }

    pub fn register(&self, strategy: Arc<dyn TerminatorStrategy>) {
        self.strategies
            .lock()
            .insert(strategy.name().to_string(), strategy);
    }

    /// Resolve by name; the empty string selects the default.
    pub fn get(&self, name: &str) -> Result<Arc<dyn TerminatorStrategy>> {
        let name = if name.is_empty() { DEFAULT_STRATEGY } else { name };
        self.strategies.lock().get(name).cloned().ok_or_else(|| {
            Error::circuit(
                CircuitFailureCause::InvalidStrategy,
                format!("unknown terminator strategy {name:?}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_domain::model::Precedence;

    fn costed(id: &str, cost: u32) -> CostedTerminator {
        CostedTerminator {
            terminator: Terminator {
                id: id.into(),
                service_id: "svc".into(),
                router_id: "r".into(),
                ..Default::default()
            },
            route_cost: cost,
        }
    }

    #[test]
    fn registry_resolves_all_builtins_and_default() {
        let registry = StrategyRegistry::new();
        for name in ["smartrouting", "random", "weighted", "sticky"] {
            assert_eq!(registry.get(name).unwrap().name(), name);
        }
        assert_eq!(registry.get("").unwrap().name(), DEFAULT_STRATEGY);
        let err = registry.get("nope").unwrap_err();
        assert_eq!(
            err.circuit_cause(),
            Some(CircuitFailureCause::InvalidStrategy)
        );
    }

    #[test]
    fn smart_routing_picks_cheapest() {
        let strategy = SmartRouting::default();
        let list = vec![costed("t1", 10), costed("t2", 20)];
        let (chosen, _) = strategy.select("client", &list).unwrap();
        assert_eq!(chosen.terminator.id, "t1");
    }

    #[test]
    fn smart_routing_penalizes_failed_terminators() {
        let strategy = SmartRouting::default();
        strategy.notify_event(&StrategyEvent::DialFailed {
            terminator_id: "t1".into(),
        });
        let list = vec![costed("t1", 10), costed("t2", 20)];
        let (chosen, _) = strategy.select("client", &list).unwrap();
        assert_eq!(chosen.terminator.id, "t2");

        // A clearly-cheapest terminator survives the penalty: 10 + 100
        // still beats 200.
        let list = vec![costed("t1", 10), costed("t2", 200)];
        let (chosen, _) = strategy.select("client", &list).unwrap();
        assert_eq!(chosen.terminator.id, "t1");

        // A successful circuit clears the cool-down.
        strategy.notify_event(&StrategyEvent::CircuitCreated {
            terminator_id: "t1".into(),
            client_token: "client".into(),
        });
        let list = vec![costed("t1", 10), costed("t2", 20)];
        let (chosen, _) = strategy.select("client", &list).unwrap();
        assert_eq!(chosen.terminator.id, "t1");
    }

    #[test]
    fn weighted_prefers_cheap_terminators() {
        let strategy = Weighted;
        let list = vec![costed("cheap", 1), costed("dear", 1000)];
        let mut cheap = 0;
        for _ in 0..200 {
            let (chosen, _) = strategy.select("client", &list).unwrap();
            if chosen.terminator.id == "cheap" {
                cheap += 1;
            }
        }
        assert!(cheap > 150, "cheap selected only {cheap}/200 times");
    }

    #[test]
    fn sticky_pins_and_unpins() {
        let strategy = Sticky::default();
        let list = vec![costed("t1", 10), costed("t2", 20)];
        let (first, _) = strategy.select("client-a", &list).unwrap();
        assert_eq!(first.terminator.id, "t1");

        // Pin survives a cost flip.
        let flipped = vec![costed("t2", 5), costed("t1", 50)];
        let (second, _) = strategy.select("client-a", &flipped).unwrap();
        assert_eq!(second.terminator.id, "t1");

        // Different client gets the current cheapest.
        let (other, _) = strategy.select("client-b", &flipped).unwrap();
        assert_eq!(other.terminator.id, "t2");

        // Pinned terminator disappears: fall back and re-pin.
        let gone = vec![costed("t2", 5)];
        let (third, _) = strategy.select("client-a", &gone).unwrap();
        assert_eq!(third.terminator.id, "t2");
    }

    #[test]
    fn sticky_skips_failed_precedence() {
        let strategy = Sticky::default();
        let list = vec![costed("t1", 10), costed("t2", 20)];
        strategy.select("client", &list).unwrap();

        let mut failed = costed("t1", 10);
        failed.terminator.precedence = Precedence::Failed;
        let list = vec![costed("t2", 20), failed];
        let (chosen, _) = strategy.select("client", &list).unwrap();
        assert_eq!(chosen.terminator.id, "t2");
    }

    #[test]
    fn random_covers_the_list() {
        let strategy = Random;
        let list = vec![costed("t1", 1), costed("t2", 1), costed("t3", 1)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let (chosen, _) = strategy.select("client", &list).unwrap();
            seen.insert(chosen.terminator.id.clone());
        }
        assert_eq!(seen.len(), 3);
    }
}

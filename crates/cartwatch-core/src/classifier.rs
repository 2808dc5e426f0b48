//! Abandonment classification at finalize time.
//!
//! Invoked exactly once per finalize where the cart is non-empty and the
//! session never converted. The default implementation samples a reason
//! from a configured weight table; production deployments can substitute a
//! rule-based or model-backed implementation behind the [`Classifier`]
//! trait without touching the state machine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// Carts above this value bias toward price-related reasons, matching the
/// observed production distribution.
const HIGH_VALUE_CART: f64 = 100.0;

/// Price-related reason labels eligible for the high-value bias.
const PRICE_REASONS: [&str; 3] = ["high_price", "unexpected_shipping_cost", "payment_concerns"];

/// The abandonment verdict attached to a finalized session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Reason label from the weight table.
    pub reason: String,
    /// Seconds between the first cart addition and finalize.
    pub time_in_cart_secs: u64,
    /// Whether checkout was ever initiated.
    pub checkout_initiated: bool,
}

/// Pluggable abandonment classifier.
///
/// Implementations must be safe to call from multiple worker tasks.
pub trait Classifier: Send + Sync {
    /// Produce a verdict for a finalized, non-converted session with a
    /// positive cart value. `end_ms` is the finalize time.
    fn classify(&self, session: &SessionState, end_ms: u64) -> Verdict;
}

/// Default classifier: weighted sampling over a configured reason table.
#[derive(Debug)]
pub struct WeightedClassifier {
    weights: Vec<(String, u32)>,
    rng: Mutex<StdRng>,
}

impl WeightedClassifier {
    /// Build from a weight table (reason label → relative weight).
    ///
    /// Zero-weight entries are dropped. The table must contain at least one
    /// positive weight; config validation guarantees this upstream.
    #[must_use]
    pub fn new(table: &BTreeMap<String, u32>) -> Self {
        Self::with_rng(table, StdRng::from_os_rng())
    }

    /// Build with a fixed seed for deterministic sampling in tests.
    #[must_use]
    pub fn seeded(table: &BTreeMap<String, u32>, seed: u64) -> Self {
        Self::with_rng(table, StdRng::seed_from_u64(seed))
    }

    fn with_rng(table: &BTreeMap<String, u32>, rng: StdRng) -> Self {
        let weights: Vec<(String, u32)> = table
            .iter()
            .filter(|(_, w)| **w > 0)
            .map(|(k, w)| (k.clone(), *w))
            .collect();
        Self {
            weights,
            rng: Mutex::new(rng),
        }
    }

    fn sample(&self, candidates: &[(String, u32)]) -> String {
        let total: u64 = candidates.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            return "unknown".to_string();
        }
        let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut roll = rng.random_range(0..total);
        for (reason, weight) in candidates {
            let weight = u64::from(*weight);
            if roll < weight {
                return reason.clone();
            }
            roll -= weight;
        }
        // Unreachable with a positive total; keep a sane fallback.
        candidates[candidates.len() - 1].0.clone()
    }
}

impl Classifier for WeightedClassifier {
    fn classify(&self, session: &SessionState, end_ms: u64) -> Verdict {
        // High-value carts abandon for price reasons far more often; restrict
        // the sample to the price-related labels when the table has them.
        let price_subset: Vec<(String, u32)> = if session.cart_value > HIGH_VALUE_CART {
            self.weights
                .iter()
                .filter(|(reason, _)| PRICE_REASONS.contains(&reason.as_str()))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let reason = if price_subset.is_empty() {
            self.sample(&self.weights)
        } else {
            self.sample(&price_subset)
        };

        Verdict {
            reason,
            time_in_cart_secs: session.time_in_cart_secs(end_ms),
            checkout_initiated: session.checkout_initiated,
        }
    }
}

/// Test/replay classifier: always returns the same reason.
#[derive(Debug, Clone)]
pub struct FixedClassifier {
    reason: String,
}

impl FixedClassifier {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Classifier for FixedClassifier {
    fn classify(&self, session: &SessionState, end_ms: u64) -> Verdict {
        Verdict {
            reason: self.reason.clone(),
            time_in_cart_secs: session.time_in_cart_secs(end_ms),
            checkout_initiated: session.checkout_initiated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::event::test_support::{cart_event, event};
    use crate::event::EventType;

    const T0: u64 = 1_700_000_000_000;

    fn abandoned_session(cart_value: f64) -> SessionState {
        let start = event("e1", "s1", EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 32);
        state.apply(&start);
        state.apply(&cart_event(
            "e2",
            "s1",
            EventType::AddToCart,
            T0 + 10_000,
            cart_value,
            1,
            3,
        ));
        state
    }

    #[test]
    fn verdict_reason_comes_from_table() {
        let table = EngineConfig::default().abandonment_weights;
        let classifier = WeightedClassifier::seeded(&table, 42);
        let session = abandoned_session(45.0);
        for _ in 0..50 {
            let verdict = classifier.classify(&session, T0 + 70_000);
            assert!(table.contains_key(&verdict.reason), "{}", verdict.reason);
        }
    }

    #[test]
    fn verdict_records_time_in_cart() {
        let table = EngineConfig::default().abandonment_weights;
        let classifier = WeightedClassifier::seeded(&table, 1);
        let session = abandoned_session(45.0);
        let verdict = classifier.classify(&session, T0 + 70_000);
        // Cart entered at T0+10s, finalized at T0+70s.
        assert_eq!(verdict.time_in_cart_secs, 60);
        assert!(!verdict.checkout_initiated);
    }

    #[test]
    fn high_value_carts_get_price_reasons() {
        let table = EngineConfig::default().abandonment_weights;
        let classifier = WeightedClassifier::seeded(&table, 7);
        let session = abandoned_session(250.0);
        for _ in 0..50 {
            let verdict = classifier.classify(&session, T0 + 70_000);
            assert!(
                PRICE_REASONS.contains(&verdict.reason.as_str()),
                "{}",
                verdict.reason
            );
        }
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let table = EngineConfig::default().abandonment_weights;
        let a = WeightedClassifier::seeded(&table, 99);
        let b = WeightedClassifier::seeded(&table, 99);
        let session = abandoned_session(45.0);
        for _ in 0..20 {
            assert_eq!(
                a.classify(&session, T0 + 70_000).reason,
                b.classify(&session, T0 + 70_000).reason
            );
        }
    }

    #[test]
    fn single_entry_table_always_wins() {
        let mut table = BTreeMap::new();
        table.insert("only_reason".to_string(), 1);
        let classifier = WeightedClassifier::seeded(&table, 0);
        let session = abandoned_session(45.0);
        assert_eq!(
            classifier.classify(&session, T0 + 70_000).reason,
            "only_reason"
        );
    }

    #[test]
    fn zero_weight_entries_are_never_sampled() {
        let mut table = BTreeMap::new();
        table.insert("never".to_string(), 0);
        table.insert("always".to_string(), 5);
        let classifier = WeightedClassifier::seeded(&table, 3);
        let session = abandoned_session(45.0);
        for _ in 0..50 {
            assert_eq!(classifier.classify(&session, T0 + 70_000).reason, "always");
        }
    }

    #[test]
    fn fixed_classifier_is_constant() {
        let classifier = FixedClassifier::new("test_reason");
        let session = abandoned_session(45.0);
        assert_eq!(classifier.classify(&session, T0 + 70_000).reason, "test_reason");
    }
}

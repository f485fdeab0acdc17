//! Signal resolver: collapses one tick's raw signals into the set the
//! traders act on.
//!
//! Pipeline: confidence floor -> close-family preemption -> per-direction
//! dedup -> opposite-direction cancellation -> HOLD suppression -> stable
//! priority ordering. Applying the resolver to its own output is a no-op.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{DirectionBucket, StrategySignal};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Signals below this confidence are dropped outright.
    pub min_confidence: Decimal,
    /// When any close-family signal survives the floor, emit only closes.
    pub prefer_close_signals: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_confidence: dec!(0.5),
            prefer_close_signals: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignalResolver {
    config: ResolverConfig,
}

impl SignalResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, signals: Vec<StrategySignal>) -> Vec<StrategySignal> {
        // 1. Confidence floor.
        let eligible: Vec<StrategySignal> = signals
            .into_iter()
            .filter(|s| s.confidence >= self.config.min_confidence)
            .collect();

        // 2. Close-family preemption.
        if self.config.prefer_close_signals {
            let closes: Vec<StrategySignal> = eligible
                .iter()
                .filter(|s| s.action.is_close_family())
                .cloned()
                .collect();
            if !closes.is_empty() {
                return stable_priority_sort(closes);
            }
        }

        let any_directional = eligible.iter().any(|s| !s.action.is_hold());
        let mut holds = Vec::new();
        let mut buckets: HashMap<DirectionBucket, StrategySignal> = HashMap::new();
        let mut others = Vec::new();

        for signal in eligible {
            if signal.action.is_hold() {
                holds.push(signal);
                continue;
            }
            match signal.action.bucket() {
                // 3./4. Per-bucket best; ties keep the first in input order.
                Some(bucket) => match buckets.get(&bucket) {
                    Some(held) if held.confidence >= signal.confidence => {}
                    _ => {
                        buckets.insert(bucket, signal);
                    }
                },
                // Close-family signals with preemption disabled.
                None => others.push(signal),
            }
        }

        // 5. Opposite buckets: higher confidence wins, exact ties cancel both.
        let mut survivors = others;
        for bucket in [DirectionBucket::LongOpen, DirectionBucket::Buy] {
            let opposite = bucket.opposite();
            match (buckets.remove(&bucket), buckets.remove(&opposite)) {
                (Some(a), Some(b)) => {
                    if a.confidence > b.confidence {
                        survivors.push(a);
                    } else if b.confidence > a.confidence {
                        survivors.push(b);
                    }
                    // equal: both cancelled
                }
                (Some(a), None) => survivors.push(a),
                (None, Some(b)) => survivors.push(b),
                (None, None) => {}
            }
        }

        // 6. HOLD only survives an otherwise-empty directional tick.
        if !any_directional {
            survivors.extend(holds.into_iter().take(1));
        }

        stable_priority_sort(survivors)
    }
}

fn stable_priority_sort(mut signals: Vec<StrategySignal>) -> Vec<StrategySignal> {
    signals.sort_by(|a, b| b.action.priority().cmp(&a.action.priority()));
    signals
}

//! Composite strategy: runs a list of sub-strategies and collapses their
//! results into one.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{
    SignalAction, Strategy, StrategyContext, StrategyRegistry, StrategyResult, StrategySignal,
};
use crate::error::EngineResult;

/// How sub-strategies are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositionMode {
    /// Independent runs over the same context, aggregated afterwards.
    Parallel,
    /// Chained runs; each successor sees its predecessors' result metadata in
    /// `context.metadata`.
    Sequential,
}

/// How N result lists collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Plurality by action; ties keep the earliest.
    Vote,
    /// First non-HOLD signal in sub-strategy order.
    First,
    /// Action with the highest summed confidence wins; the winner carries the
    /// mean confidence of its voters.
    Weighted,
}

pub struct CompositeStrategy {
    name: String,
    subs: Vec<Box<dyn Strategy>>,
    mode: CompositionMode,
    aggregation: AggregationMode,
}

impl CompositeStrategy {
    pub fn new(
        name: impl Into<String>,
        subs: Vec<Box<dyn Strategy>>,
        mode: CompositionMode,
        aggregation: AggregationMode,
    ) -> Self {
        Self {
            name: name.into(),
            subs,
            mode,
            aggregation,
        }
    }

    /// Instantiate every sub-strategy id from the registry.
    pub fn from_registry(
        registry: &StrategyRegistry,
        name: impl Into<String>,
        sub_ids: &[String],
        mode: CompositionMode,
        aggregation: AggregationMode,
    ) -> EngineResult<Self> {
        let subs = sub_ids
            .iter()
            .map(|id| registry.create(id))
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self::new(name, subs, mode, aggregation))
    }

    fn run_subs(&self, context: &StrategyContext) -> Vec<StrategyResult> {
        match self.mode {
            CompositionMode::Parallel => self
                .subs
                .iter()
                .map(|sub| run_captured(sub.as_ref(), context))
                .collect(),
            CompositionMode::Sequential => {
                let mut scratch = context.metadata.clone();
                let mut results = Vec::with_capacity(self.subs.len());
                for sub in &self.subs {
                    let mut chained = context.clone();
                    chained.metadata = scratch.clone();
                    let result = run_captured(sub.as_ref(), &chained);
                    for (key, value) in &result.metadata {
                        scratch.insert(key.clone(), value.clone());
                    }
                    results.push(result);
                }
                results
            }
        }
    }

    fn aggregate(&self, results: Vec<StrategyResult>) -> StrategyResult {
        let mut metadata = serde_json::Map::new();
        for result in &results {
            for (key, value) in &result.metadata {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let signals: Vec<StrategySignal> = results
            .into_iter()
            .flat_map(|r| r.signals)
            .filter(|s| !s.action.is_hold())
            .collect();

        let chosen = match self.aggregation {
            AggregationMode::First => signals.into_iter().next(),
            AggregationMode::Vote => {
                pick_by(&signals, |group| Decimal::from(group.len())).map(|(winner, _)| winner)
            }
            AggregationMode::Weighted => pick_by(&signals, |group| {
                group.iter().map(|s| s.confidence).sum::<Decimal>()
            })
            .map(|(mut winner, mean_confidence)| {
                winner.confidence = mean_confidence;
                winner
            }),
        };

        let mut result = StrategyResult::with_signals(chosen.into_iter().collect());
        result.metadata = metadata;
        result
    }
}

/// Pick the representative of the action group maximizing `score`: the
/// group's highest-confidence signal, plus the group's mean confidence. Ties
/// across groups keep the earliest group in input order.
fn pick_by<F>(signals: &[StrategySignal], score: F) -> Option<(StrategySignal, Decimal)>
where
    F: Fn(&[&StrategySignal]) -> Decimal,
{
    if signals.is_empty() {
        return None;
    }

    let mut order: Vec<SignalAction> = Vec::new();
    let mut groups: HashMap<SignalAction, Vec<&StrategySignal>> = HashMap::new();
    for signal in signals {
        if !groups.contains_key(&signal.action) {
            order.push(signal.action);
        }
        groups.entry(signal.action).or_default().push(signal);
    }

    let mut best: Option<(Decimal, SignalAction)> = None;
    for action in &order {
        let group_score = score(&groups[action]);
        match best {
            Some((top, _)) if top >= group_score => {}
            _ => best = Some((group_score, *action)),
        }
    }

    let (_, action) = best?;
    let group = &groups[&action];
    let winner = group.iter().max_by_key(|s| s.confidence).copied()?.clone();
    let mean = group.iter().map(|s| s.confidence).sum::<Decimal>() / Decimal::from(group.len());
    Some((winner, mean))
}

fn run_captured(strategy: &dyn Strategy, context: &StrategyContext) -> StrategyResult {
    match strategy.execute(context) {
        Ok(result) => result,
        Err(err) => StrategyResult::failed(err.to_string()),
    }
}

impl Strategy for CompositeStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> Vec<String> {
        vec!["composite".to_string()]
    }

    fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyResult> {
        let results = self.run_subs(context);
        Ok(self.aggregate(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::OhlcvSeries;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Fixed {
        name: &'static str,
        action: SignalAction,
        confidence: Decimal,
        metadata_key: Option<&'static str>,
    }

    impl Fixed {
        fn boxed(name: &'static str, action: SignalAction, confidence: Decimal) -> Box<dyn Strategy> {
            Box::new(Fixed {
                name,
                action,
                confidence,
                metadata_key: None,
            })
        }
    }

    impl Strategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyResult> {
            let mut result = if self.action.is_hold() {
                StrategyResult::hold()
            } else {
                StrategyResult::with_signals(vec![StrategySignal::new(
                    self.action,
                    &context.symbol,
                )
                .with_confidence(self.confidence)])
            };
            if let Some(key) = self.metadata_key {
                result.metadata.insert(key.to_string(), json!(true));
            }
            Ok(result)
        }
    }

    /// Emits LONG only when its predecessor left a marker in the scratch map.
    struct FollowsScratch;

    impl Strategy for FollowsScratch {
        fn name(&self) -> &str {
            "follows"
        }

        fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyResult> {
            if context.metadata.contains_key("regime_bull") {
                Ok(StrategyResult::with_signals(vec![StrategySignal::new(
                    SignalAction::Long,
                    &context.symbol,
                )
                .with_confidence(dec!(0.9))]))
            } else {
                Ok(StrategyResult::hold())
            }
        }
    }

    fn context() -> StrategyContext {
        StrategyContext {
            symbol: "BTC/USDT".to_string(),
            interval: "1m".parse().unwrap(),
            current_time: Utc::now(),
            market_data: OhlcvSeries::default(),
            indicators: Default::default(),
            account_balance: dec!(10000),
            positions: Default::default(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn vote_picks_the_plurality_action() {
        let composite = CompositeStrategy::new(
            "trio",
            vec![
                Fixed::boxed("a", SignalAction::Long, dec!(0.6)),
                Fixed::boxed("b", SignalAction::Long, dec!(0.8)),
                Fixed::boxed("c", SignalAction::Short, dec!(0.9)),
            ],
            CompositionMode::Parallel,
            AggregationMode::Vote,
        );

        let result = composite.execute(&context()).unwrap();
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.signals[0].action, SignalAction::Long);
        // Representative is the strongest voter.
        assert_eq!(result.signals[0].confidence, dec!(0.8));
    }

    #[test]
    fn first_takes_the_first_non_hold() {
        let composite = CompositeStrategy::new(
            "pair",
            vec![
                Fixed::boxed("a", SignalAction::Hold, dec!(1.0)),
                Fixed::boxed("b", SignalAction::Short, dec!(0.7)),
                Fixed::boxed("c", SignalAction::Long, dec!(0.99)),
            ],
            CompositionMode::Parallel,
            AggregationMode::First,
        );

        let result = composite.execute(&context()).unwrap();
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.signals[0].action, SignalAction::Short);
    }

    #[test]
    fn weighted_sums_confidence_per_action() {
        let composite = CompositeStrategy::new(
            "trio",
            vec![
                Fixed::boxed("a", SignalAction::Long, dec!(0.5)),
                Fixed::boxed("b", SignalAction::Long, dec!(0.5)),
                Fixed::boxed("c", SignalAction::Short, dec!(0.9)),
            ],
            CompositionMode::Parallel,
            AggregationMode::Weighted,
        );

        // LONG total 1.0 beats SHORT total 0.9.
        let result = composite.execute(&context()).unwrap();
        assert_eq!(result.signals[0].action, SignalAction::Long);
    }

    #[test]
    fn sequential_threads_scratch_metadata() {
        let leader = Box::new(Fixed {
            name: "regime",
            action: SignalAction::Hold,
            confidence: dec!(1.0),
            metadata_key: Some("regime_bull"),
        });

        let composite = CompositeStrategy::new(
            "chain",
            vec![leader, Box::new(FollowsScratch)],
            CompositionMode::Sequential,
            AggregationMode::First,
        );

        let result = composite.execute(&context()).unwrap();
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.signals[0].action, SignalAction::Long);
        assert!(result.metadata.contains_key("regime_bull"));
    }

    #[test]
    fn parallel_subs_do_not_see_each_other() {
        let leader = Box::new(Fixed {
            name: "regime",
            action: SignalAction::Hold,
            confidence: dec!(1.0),
            metadata_key: Some("regime_bull"),
        });

        let composite = CompositeStrategy::new(
            "split",
            vec![leader, Box::new(FollowsScratch)],
            CompositionMode::Parallel,
            AggregationMode::First,
        );

        let result = composite.execute(&context()).unwrap();
        assert!(result.signals.is_empty());
    }

    #[test]
    fn all_holds_aggregate_to_no_signals() {
        let composite = CompositeStrategy::new(
            "quiet",
            vec![
                Fixed::boxed("a", SignalAction::Hold, dec!(1.0)),
                Fixed::boxed("b", SignalAction::Hold, dec!(1.0)),
            ],
            CompositionMode::Parallel,
            AggregationMode::Vote,
        );

        let result = composite.execute(&context()).unwrap();
        assert!(result.signals.is_empty());
        assert!(result.success);
    }
}

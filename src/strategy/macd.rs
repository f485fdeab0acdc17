//! Built-in MACD signal-line cross strategy.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{
    DataRequirements, SignalAction, Strategy, StrategyContext, StrategyResult, StrategySignal,
};
use crate::data::types::Interval;
use crate::error::EngineResult;
use crate::indicators::IndicatorSpec;

/// Opens with the cross of the MACD line over its signal line and closes on
/// the opposite cross. Confidence scales with histogram magnitude relative to
/// price, clamped to `[0.55, 0.95]`.
pub struct MacdCrossStrategy {
    spec: IndicatorSpec,
}

impl MacdCrossStrategy {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            spec: IndicatorSpec::macd(fast, slow, signal),
        }
    }

    /// The indicator spec this strategy expects in the precompute set.
    pub fn indicator_spec(&self) -> IndicatorSpec {
        self.spec.clone()
    }

    fn confidence(hist: Decimal, close: Decimal) -> Decimal {
        if close.is_zero() {
            return dec!(0.55);
        }
        // One basis point of histogram-to-price is treated as full strength.
        let strength = (hist.abs() / close) * dec!(10000);
        (dec!(0.55) + strength * dec!(0.04)).min(dec!(0.95))
    }
}

impl Default for MacdCrossStrategy {
    fn default() -> Self {
        Self::new(12, 26, 9)
    }
}

impl Strategy for MacdCrossStrategy {
    fn name(&self) -> &str {
        "macd_cross"
    }

    fn version(&self) -> &str {
        "1.1.0"
    }

    fn tags(&self) -> Vec<String> {
        vec!["trend".to_string(), "momentum".to_string()]
    }

    fn data_requirements(&self, _interval: Interval) -> DataRequirements {
        DataRequirements {
            min_bars: self.spec.warmup_period() + 1,
            warmup_periods: self.spec.warmup_period(),
            prefer_closed_bar: true,
            ..Default::default()
        }
    }

    fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyResult> {
        let hist_name = format!("{}_hist", self.spec.id);
        let (Some(hist), Some(prev_hist)) = (
            context.indicator(&hist_name),
            context.indicator_ago(&hist_name, 1),
        ) else {
            return Ok(StrategyResult::hold());
        };
        let Some(close) = context.latest_close() else {
            return Ok(StrategyResult::hold());
        };

        let crossed_up = prev_hist <= Decimal::ZERO && hist > Decimal::ZERO;
        let crossed_down = prev_hist >= Decimal::ZERO && hist < Decimal::ZERO;
        let net = context.net_position();
        let confidence = Self::confidence(hist, close);

        let mut signals = Vec::new();
        if crossed_up {
            if net < Decimal::ZERO {
                signals.push(
                    StrategySignal::new(SignalAction::CloseShort, &context.symbol)
                        .with_confidence(confidence)
                        .with_reason("macd crossed above signal"),
                );
            } else if net.is_zero() {
                signals.push(
                    StrategySignal::new(SignalAction::Long, &context.symbol)
                        .with_confidence(confidence)
                        .with_reason("macd crossed above signal"),
                );
            }
        } else if crossed_down {
            if net > Decimal::ZERO {
                signals.push(
                    StrategySignal::new(SignalAction::CloseLong, &context.symbol)
                        .with_confidence(confidence)
                        .with_reason("macd crossed below signal"),
                );
            } else if net.is_zero() {
                signals.push(
                    StrategySignal::new(SignalAction::Short, &context.symbol)
                        .with_confidence(confidence)
                        .with_reason("macd crossed below signal"),
                );
            }
        }

        Ok(StrategyResult::with_signals(signals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::OhlcvSeries;
    use chrono::Utc;
    use std::collections::HashMap;

    fn context_with_hist(
        hist: &[Option<Decimal>],
        net_position: Decimal,
    ) -> StrategyContext {
        let closes: Vec<Decimal> = (0..hist.len()).map(|_| dec!(100)).collect();
        let mut market_data = OhlcvSeries::default();
        for (i, close) in closes.iter().enumerate() {
            market_data.timestamps.push(i as i64 * 60_000);
            market_data.open.push(*close);
            market_data.high.push(*close);
            market_data.low.push(*close);
            market_data.close.push(*close);
            market_data.volume.push(dec!(1));
        }

        let mut indicators = crate::indicators::IndicatorArrays::new();
        indicators.insert("macd_12_26_9_hist".to_string(), hist.to_vec());

        let mut positions = HashMap::new();
        positions.insert("BTC/USDT".to_string(), net_position);

        StrategyContext {
            symbol: "BTC/USDT".to_string(),
            interval: "1m".parse().unwrap(),
            current_time: Utc::now(),
            market_data,
            indicators,
            account_balance: dec!(10000),
            positions,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn cross_up_opens_long_when_flat() {
        let strategy = MacdCrossStrategy::default();
        let ctx = context_with_hist(&[Some(dec!(-0.5)), Some(dec!(0.5))], Decimal::ZERO);

        let result = strategy.execute(&ctx).unwrap();
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.signals[0].action, SignalAction::Long);
        assert!(result.signals[0].confidence >= dec!(0.55));
    }

    #[test]
    fn cross_down_closes_long() {
        let strategy = MacdCrossStrategy::default();
        let ctx = context_with_hist(&[Some(dec!(0.5)), Some(dec!(-0.5))], dec!(2));

        let result = strategy.execute(&ctx).unwrap();
        assert_eq!(result.signals.len(), 1);
        assert_eq!(result.signals[0].action, SignalAction::CloseLong);
    }

    #[test]
    fn no_cross_is_a_hold() {
        let strategy = MacdCrossStrategy::default();
        let ctx = context_with_hist(&[Some(dec!(0.2)), Some(dec!(0.4))], Decimal::ZERO);

        let result = strategy.execute(&ctx).unwrap();
        assert!(result.signals.is_empty());
        assert!(result.success);
    }

    #[test]
    fn warmup_yields_hold() {
        let strategy = MacdCrossStrategy::default();
        let ctx = context_with_hist(&[None, None], Decimal::ZERO);

        let result = strategy.execute(&ctx).unwrap();
        assert!(result.signals.is_empty());
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(
            MacdCrossStrategy::confidence(dec!(1000), dec!(100)),
            dec!(0.95)
        );
        assert_eq!(MacdCrossStrategy::confidence(Decimal::ZERO, dec!(100)), dec!(0.55));
    }
}

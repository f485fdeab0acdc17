//! Graded risk controller.
//!
//! Rules are evaluated every tick against equity, margin usage and the
//! day's realized PnL. Each rule carries a level and a recommended action;
//! the check result reports the maximum of both over the triggered set. The
//! engine warns on WARNING, discards new opens on STOP_TRADING and
//! force-closes plus terminates on FORCE_CLOSE.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::RiskConfig;
use crate::report::TradeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Normal,
    Warning,
    Critical,
}

/// Recommended responses, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    None,
    Warn,
    StopTrading,
    ForceClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRule {
    pub name: String,
    pub level: RiskLevel,
    pub threshold: Decimal,
    pub action: RiskAction,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckResult {
    pub level: RiskLevel,
    pub triggered_rules: Vec<RiskRule>,
    pub recommended_action: RiskAction,
    pub details: Map<String, Value>,
}

impl RiskCheckResult {
    fn normal(details: Map<String, Value>) -> Self {
        Self {
            level: RiskLevel::Normal,
            triggered_rules: Vec::new(),
            recommended_action: RiskAction::None,
            details,
        }
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.triggered_rules.iter().map(|r| r.name.clone()).collect()
    }
}

/// Everything the risk check needs from the account at one tick.
#[derive(Debug, Clone, Copy)]
pub struct RiskSnapshot {
    /// Equity including unrealized PnL.
    pub equity: Decimal,
    pub wallet_balance: Decimal,
    pub margin_locked: Decimal,
}

#[derive(Debug)]
pub struct RiskManager {
    rules: Vec<RiskRule>,
    peak_equity: Decimal,
    current_equity: Decimal,
    /// UTC date of the current day window and the equity at its first tick.
    daily_anchor: Option<(NaiveDate, Decimal)>,
}

impl RiskManager {
    pub fn new(config: &RiskConfig) -> Self {
        Self::with_rules(Self::build_rules(config))
    }

    pub fn with_rules(rules: Vec<RiskRule>) -> Self {
        Self {
            rules,
            peak_equity: Decimal::ZERO,
            current_equity: Decimal::ZERO,
            daily_anchor: None,
        }
    }

    /// Graded rule table. The daily warning tier sits at `warning_ratio` of
    /// the critical threshold, the drawdown warning tier at two thirds.
    fn build_rules(config: &RiskConfig) -> Vec<RiskRule> {
        let drawdown_warning = config.max_drawdown_pct * dec!(2) / dec!(3);
        vec![
            RiskRule {
                name: "daily_loss_warning".into(),
                level: RiskLevel::Warning,
                threshold: config.max_daily_loss_pct * config.warning_ratio,
                action: RiskAction::Warn,
                description: "daily loss approaching the limit".into(),
            },
            RiskRule {
                name: "daily_loss_critical".into(),
                level: RiskLevel::Critical,
                threshold: config.max_daily_loss_pct,
                action: RiskAction::ForceClose,
                description: "daily loss limit reached".into(),
            },
            RiskRule {
                name: "max_drawdown_warning".into(),
                level: RiskLevel::Warning,
                threshold: drawdown_warning,
                action: RiskAction::Warn,
                description: "drawdown approaching the limit".into(),
            },
            RiskRule {
                name: "max_drawdown_critical".into(),
                level: RiskLevel::Critical,
                threshold: config.max_drawdown_pct,
                action: RiskAction::ForceClose,
                description: "drawdown limit reached".into(),
            },
            RiskRule {
                name: "position_ratio".into(),
                level: RiskLevel::Warning,
                threshold: config.max_total_position_pct,
                action: RiskAction::StopTrading,
                description: "margin usage too high".into(),
            },
        ]
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    /// Evaluate every rule for the tick at `now`.
    ///
    /// `daily_pnl` is recomputed from the trade history filtered to the UTC
    /// date of `now`; the percentage basis is the equity recorded at the
    /// day's first tick, which keeps replays deterministic.
    pub fn check_risk(
        &mut self,
        snapshot: RiskSnapshot,
        trade_history: &[TradeRecord],
        now: DateTime<Utc>,
    ) -> RiskCheckResult {
        let today = now.date_naive();
        match self.daily_anchor {
            Some((date, _)) if date == today => {}
            _ => self.daily_anchor = Some((today, snapshot.equity)),
        }
        let day_start_equity = self.daily_anchor.map(|(_, e)| e).unwrap_or(snapshot.equity);

        self.current_equity = snapshot.equity;
        if snapshot.equity > self.peak_equity {
            self.peak_equity = snapshot.equity;
        }

        let daily_pnl: Decimal = trade_history
            .iter()
            .filter(|t| {
                t.exit_time
                    .map_or(false, |exit| exit.date_naive() == today)
            })
            .map(|t| t.pnl)
            .sum();
        let daily_loss_pct = if daily_pnl < Decimal::ZERO && day_start_equity > Decimal::ZERO {
            -daily_pnl / day_start_equity
        } else {
            Decimal::ZERO
        };

        let drawdown = if self.peak_equity > Decimal::ZERO {
            (self.peak_equity - snapshot.equity) / self.peak_equity
        } else {
            Decimal::ZERO
        };

        let position_ratio = if snapshot.wallet_balance > Decimal::ZERO {
            snapshot.margin_locked / snapshot.wallet_balance
        } else {
            Decimal::ZERO
        };

        let mut details = Map::new();
        details.insert("daily_pnl".into(), json!(daily_pnl.to_string()));
        details.insert("daily_loss_pct".into(), json!(daily_loss_pct.to_string()));
        details.insert("drawdown".into(), json!(drawdown.to_string()));
        details.insert("position_ratio".into(), json!(position_ratio.to_string()));
        details.insert("peak_equity".into(), json!(self.peak_equity.to_string()));

        let triggered: Vec<RiskRule> = self
            .rules
            .iter()
            .filter(|rule| {
                let measured = if rule.name.starts_with("daily_loss") {
                    daily_loss_pct
                } else if rule.name.starts_with("max_drawdown") {
                    drawdown
                } else {
                    position_ratio
                };
                measured >= rule.threshold
            })
            .cloned()
            .collect();

        if triggered.is_empty() {
            return RiskCheckResult::normal(details);
        }

        let level = triggered.iter().map(|r| r.level).max().unwrap_or(RiskLevel::Normal);
        let action = triggered
            .iter()
            .map(|r| r.action)
            .max()
            .unwrap_or(RiskAction::None);

        debug!(?level, ?action, rules = triggered.len(), "risk rules triggered");

        RiskCheckResult {
            level,
            triggered_rules: triggered,
            recommended_action: action,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(equity: Decimal) -> RiskSnapshot {
        RiskSnapshot {
            equity,
            wallet_balance: equity,
            margin_locked: Decimal::ZERO,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn record(pnl: Decimal, exit: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            trade_id: "t".into(),
            symbol: "BTC/USDT".into(),
            action: "close_long".into(),
            entry_time: exit,
            entry_price: dec!(100),
            exit_time: Some(exit),
            exit_price: Some(dec!(100)),
            quantity: dec!(1),
            pnl,
            pnl_pct: Decimal::ZERO,
            fees: Decimal::ZERO,
            holding_period_secs: Some(0),
            reason: "signal".into(),
        }
    }

    #[test]
    fn default_thresholds_match_the_rule_table() {
        let manager = RiskManager::new(&RiskConfig::default());
        let thresholds: Vec<(String, Decimal)> = manager
            .rules
            .iter()
            .map(|r| (r.name.clone(), r.threshold))
            .collect();

        assert!(thresholds.contains(&("daily_loss_warning".into(), dec!(0.035))));
        assert!(thresholds.contains(&("daily_loss_critical".into(), dec!(0.05))));
        assert!(thresholds.contains(&("max_drawdown_warning".into(), dec!(0.10))));
        assert!(thresholds.contains(&("max_drawdown_critical".into(), dec!(0.15))));
        assert!(thresholds.contains(&("position_ratio".into(), dec!(0.8))));
    }

    #[test]
    fn calm_account_is_normal() {
        let mut manager = RiskManager::new(&RiskConfig::default());
        let result = manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));
        assert_eq!(result.level, RiskLevel::Normal);
        assert_eq!(result.recommended_action, RiskAction::None);
        assert!(result.triggered_rules.is_empty());
    }

    #[test]
    fn drawdown_critical_forces_close() {
        // Scenario R1: peak 10000, equity 8490 -> drawdown 15.1%.
        let mut manager = RiskManager::new(&RiskConfig::default());
        manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));

        let result = manager.check_risk(snapshot(dec!(8490)), &[], at(1, 1));
        assert_eq!(result.level, RiskLevel::Critical);
        assert_eq!(result.recommended_action, RiskAction::ForceClose);
        assert!(result.rule_names().contains(&"max_drawdown_critical".to_string()));
    }

    #[test]
    fn drawdown_warning_tier() {
        let mut manager = RiskManager::new(&RiskConfig::default());
        manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));

        // 12% drawdown: warning fires, critical does not.
        let result = manager.check_risk(snapshot(dec!(8800)), &[], at(1, 1));
        assert_eq!(result.level, RiskLevel::Warning);
        assert_eq!(result.recommended_action, RiskAction::Warn);
        assert_eq!(result.rule_names(), vec!["max_drawdown_warning".to_string()]);
    }

    #[test]
    fn daily_loss_uses_today_only() {
        let mut manager = RiskManager::new(&RiskConfig::default());
        manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));

        let history = vec![
            record(dec!(-600), at(1, 2)), // 6% of the 10000 day anchor
            record(dec!(-900), at(2, 2)), // different day, ignored on day 1
        ];
        let result = manager.check_risk(snapshot(dec!(9400)), &history[..1], at(1, 3));
        assert_eq!(result.level, RiskLevel::Critical);
        assert!(result.rule_names().contains(&"daily_loss_critical".to_string()));
    }

    #[test]
    fn daily_window_resets_on_date_change() {
        let mut manager = RiskManager::new(&RiskConfig::default());
        manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));

        let yesterdays_loss = vec![record(dec!(-600), at(1, 2))];
        // Next UTC day: yesterday's loss no longer counts as daily loss.
        let result = manager.check_risk(snapshot(dec!(9400)), &yesterdays_loss, at(2, 0));
        assert!(!result
            .rule_names()
            .iter()
            .any(|name| name.starts_with("daily_loss")));
    }

    #[test]
    fn position_ratio_stops_trading() {
        let mut manager = RiskManager::new(&RiskConfig::default());
        let snapshot = RiskSnapshot {
            equity: dec!(10000),
            wallet_balance: dec!(10000),
            margin_locked: dec!(8500),
        };
        let result = manager.check_risk(snapshot, &[], at(1, 0));
        assert_eq!(result.level, RiskLevel::Warning);
        assert_eq!(result.recommended_action, RiskAction::StopTrading);
    }

    #[test]
    fn peak_equity_is_monotone() {
        let mut manager = RiskManager::new(&RiskConfig::default());
        manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));
        manager.check_risk(snapshot(dec!(12000)), &[], at(1, 1));
        manager.check_risk(snapshot(dec!(9000)), &[], at(1, 2));
        assert_eq!(manager.peak_equity(), dec!(12000));
    }

    #[test]
    fn action_escalation_takes_the_maximum() {
        // Force both a daily warning and a drawdown critical on one tick.
        let mut manager = RiskManager::new(&RiskConfig::default());
        manager.check_risk(snapshot(dec!(10000)), &[], at(1, 0));

        let history = vec![record(dec!(-400), at(1, 1))]; // 4% daily loss: warning
        let result = manager.check_risk(snapshot(dec!(8400)), &history, at(1, 2));
        assert_eq!(result.level, RiskLevel::Critical);
        assert_eq!(result.recommended_action, RiskAction::ForceClose);
        assert!(result.triggered_rules.len() >= 2);
    }
}

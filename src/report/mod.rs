//! Trade records, equity points and the final report.
//!
//! The builder folds the run's trade records and equity curve into return,
//! drawdown and risk-adjusted statistics. Accounting stays in `Decimal`; the
//! ratio statistics (annualized power, Sharpe family) are computed in `f64`.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::types::Interval;

/// One settled trade. Futures emit at close, event contracts at bar
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub action: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub quantity: Decimal,
    /// Net of all fees.
    pub pnl: Decimal,
    /// Net PnL over committed capital (margin or stake).
    pub pnl_pct: Decimal,
    pub fees: Decimal,
    pub holding_period_secs: Option<i64>,
    /// What closed the trade (signal, liquidation, stop_loss, ...).
    pub reason: String,
}

/// Equity sampled once per tick, after mark-to-market and stop handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub drawdown: Decimal,
    pub drawdown_pct: Decimal,
}

/// Report tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Annualization factor for the Sharpe family over daily returns.
    pub annualization_factor: u32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            annualization_factor: 365,
        }
    }
}

/// Aggregated result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub strategy_name: String,
    pub symbol: String,
    pub interval: Interval,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_days: i64,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_pnl: Decimal,
    pub total_return: Decimal,
    pub annual_return: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    /// Signed (non-positive).
    pub avg_loss: Decimal,
    pub profit_factor: f64,
    pub total_fees: Decimal,
    pub max_drawdown_pct: Decimal,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub trade_records: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Folds records + equity into a [`BacktestReport`].
pub struct ReportBuilder;

impl ReportBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        strategy_name: impl Into<String>,
        symbol: impl Into<String>,
        interval: Interval,
        initial_capital: Decimal,
        final_capital: Decimal,
        trade_records: Vec<TradeRecord>,
        equity_curve: Vec<EquityPoint>,
        config: &ReportConfig,
    ) -> BacktestReport {
        let start_time = equity_curve.first().map(|p| p.timestamp);
        let end_time = equity_curve.last().map(|p| p.timestamp);
        let duration_days = match (start_time, end_time) {
            (Some(start), Some(end)) => (end - start).num_days(),
            _ => 0,
        };

        let total_pnl = final_capital - initial_capital;
        let total_return = if initial_capital > Decimal::ZERO {
            total_pnl / initial_capital
        } else {
            Decimal::ZERO
        };
        let annual_return = annualized_return(total_return, duration_days);

        let wins: Vec<Decimal> = trade_records
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();
        let losses: Vec<Decimal> = trade_records
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();

        let win_rate = if trade_records.is_empty() {
            Decimal::ZERO
        } else {
            Decimal::from(wins.len()) / Decimal::from(trade_records.len())
        };
        let avg_win = mean(&wins);
        let avg_loss = mean(&losses);

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().copied().sum::<Decimal>().abs();
        let profit_factor = if gross_loss.is_zero() {
            if gross_profit > Decimal::ZERO {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        };

        let total_fees = trade_records.iter().map(|t| t.fees).sum();
        let max_drawdown_pct = max_drawdown(&equity_curve);

        let returns = daily_returns(&equity_curve);
        let factor = f64::from(config.annualization_factor);
        let sharpe_ratio = sharpe(&returns, factor);
        let sortino_ratio = sortino(&returns, factor);
        let calmar_ratio = calmar(annual_return, max_drawdown_pct);

        BacktestReport {
            strategy_name: strategy_name.into(),
            symbol: symbol.into(),
            interval,
            start_time,
            end_time,
            duration_days,
            initial_capital,
            final_capital,
            total_pnl,
            total_return,
            annual_return,
            total_trades: trade_records.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            total_fees,
            max_drawdown_pct,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            trade_records,
            equity_curve,
        }
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        Decimal::ZERO
    } else {
        values.iter().copied().sum::<Decimal>() / Decimal::from(values.len())
    }
}

/// `max_i (peak_i - equity_i) / peak_i` over the curve.
pub fn max_drawdown(equity_curve: &[EquityPoint]) -> Decimal {
    let mut peak = Decimal::ZERO;
    let mut worst = Decimal::ZERO;
    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - point.equity) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    worst
}

/// Resample the equity curve to UTC days (last sample per day) and return the
/// day-over-day percentage deltas.
pub fn daily_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    let mut day_closes: Vec<(i32, u32, u32, f64)> = Vec::new();
    for point in equity_curve {
        let date = point.timestamp.date_naive();
        let key = (date.year(), date.month(), date.day());
        let equity = point.equity.to_f64().unwrap_or(0.0);
        match day_closes.last_mut() {
            Some(last) if (last.0, last.1, last.2) == key => last.3 = equity,
            _ => day_closes.push((key.0, key.1, key.2, equity)),
        }
    }

    day_closes
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].3;
            let next = pair[1].3;
            if prev > 0.0 {
                Some(next / prev - 1.0)
            } else {
                None
            }
        })
        .collect()
}

fn annualized_return(total_return: Decimal, duration_days: i64) -> f64 {
    if duration_days <= 0 {
        return 0.0;
    }
    let total = total_return.to_f64().unwrap_or(0.0);
    let base = 1.0 + total;
    if base <= 0.0 {
        return -1.0;
    }
    base.powf(365.0 / duration_days as f64) - 1.0
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// `mean(r) / stdev(r) * sqrt(N)`; zero when the deviation is zero.
pub fn sharpe(returns: &[f64], annualization_factor: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let deviation = std_dev(returns);
    if deviation == 0.0 {
        return 0.0;
    }
    mean / deviation * annualization_factor.sqrt()
}

/// Sharpe with only the negative returns in the denominator.
pub fn sortino(returns: &[f64], annualization_factor: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let negatives: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if negatives.is_empty() {
        return 0.0;
    }
    let downside =
        (negatives.iter().map(|r| r.powi(2)).sum::<f64>() / negatives.len() as f64).sqrt();
    if downside == 0.0 {
        return 0.0;
    }
    mean / downside * annualization_factor.sqrt()
}

/// `annual_return / max_drawdown`; zero when the drawdown is zero.
pub fn calmar(annual_return: f64, max_drawdown_pct: Decimal) -> f64 {
    let drawdown = max_drawdown_pct.to_f64().unwrap_or(0.0);
    if drawdown == 0.0 {
        0.0
    } else {
        annual_return / drawdown
    }
}

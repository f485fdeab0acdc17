//! The run loop.
//!
//! Single-tick-at-a-time driver: one strategy call per bar, bars consumed
//! strictly monotonically, no concurrent strategy invocations. Per tick the
//! event order is `(stops.., trades.., warnings.., tick, progress?)`; the
//! run ends with exactly one `complete` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{ContractType, EventKind, ExecutionConfig, ExecutionEvent, ExecutionMode};
use crate::accounts::{FuturesAccount, SimulatedAccount};
use crate::config::AppConfig;
use crate::data::stream::{BarSource, KlineStream, RealtimeKlineSource};
use crate::data::types::{normalize_symbol, Kline, OhlcvSeries};
use crate::data::DataCenter;
use crate::error::{EngineError, EngineResult};
use crate::indicators::IndicatorEngine;
use crate::positions::{CloseReason, FuturesTradeConfig, HedgePositionManager};
use crate::report::{BacktestReport, EquityPoint, ReportBuilder, ReportConfig, TradeRecord};
use crate::risk::{RiskAction, RiskManager, RiskSnapshot};
use crate::strategy::resolver::{ResolverConfig, SignalResolver};
use crate::strategy::{Strategy, StrategyContext, StrategyResult};
use crate::traders::{EventsTradeConfig, EventsTrader, FuturesTrader};

/// Why the run left its tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    SourceExhausted,
    RiskCritical,
    Cancelled,
    Fatal,
}

impl StopCause {
    fn reason(self) -> &'static str {
        match self {
            StopCause::SourceExhausted => "session_end",
            StopCause::RiskCritical => "risk_critical",
            StopCause::Cancelled => "cancelled",
            StopCause::Fatal => "error",
        }
    }

    fn close_reason(self) -> CloseReason {
        match self {
            StopCause::SourceExhausted | StopCause::Fatal => CloseReason::SessionEnd,
            StopCause::RiskCritical => CloseReason::RiskCritical,
            StopCause::Cancelled => CloseReason::Cancelled,
        }
    }
}

/// Account-and-positions state, per contract family.
enum TraderState {
    Events {
        account: SimulatedAccount,
        trader: EventsTrader,
        cfg: EventsTradeConfig,
    },
    Futures {
        account: FuturesAccount,
        manager: HedgePositionManager,
        trader: FuturesTrader,
        cfg: FuturesTradeConfig,
    },
}

impl TraderState {
    fn cash(&self) -> Decimal {
        match self {
            TraderState::Events { account, .. } => account.cash(),
            TraderState::Futures { account, .. } => account.cash(),
        }
    }

    fn wallet_balance(&self) -> Decimal {
        match self {
            TraderState::Events { account, .. } => account.cash(),
            TraderState::Futures { account, .. } => account.wallet_balance(),
        }
    }

    fn margin_locked(&self) -> Decimal {
        match self {
            TraderState::Events { .. } => Decimal::ZERO,
            TraderState::Futures { account, .. } => account.margin_locked(),
        }
    }

    /// Equity including unrealized PnL.
    fn equity(&self) -> Decimal {
        match self {
            TraderState::Events { account, .. } => account.cash(),
            TraderState::Futures {
                account, manager, ..
            } => account.wallet_balance() + manager.total_unrealized_pnl(),
        }
    }

    fn positions_map(&self, symbol: &str) -> HashMap<String, Decimal> {
        let mut map = HashMap::new();
        if let TraderState::Futures { manager, .. } = self {
            map.insert(symbol.to_string(), manager.net_size());
        }
        map
    }
}

/// Orchestrates one strategy over one symbol in one of the three modes.
pub struct ExecutionEngine {
    app: AppConfig,
    center: Arc<DataCenter>,
}

impl ExecutionEngine {
    pub fn new(app: AppConfig) -> EngineResult<Self> {
        let center = Arc::new(DataCenter::new(app.data_center.clone())?);
        Ok(Self { app, center })
    }

    /// Build over an existing data center (tests, shared centers).
    pub fn with_data_center(app: AppConfig, center: Arc<DataCenter>) -> Self {
        Self { app, center }
    }

    pub fn data_center(&self) -> Arc<DataCenter> {
        self.center.clone()
    }

    /// Run with the default source for the configured mode, streaming events
    /// into `events`.
    pub async fn run(
        &self,
        strategy: Box<dyn Strategy>,
        config: ExecutionConfig,
        events: mpsc::Sender<ExecutionEvent>,
        cancel: broadcast::Receiver<()>,
    ) -> EngineResult<BacktestReport> {
        let source = self.build_source(strategy.as_ref(), &config)?;
        self.run_with_source(strategy, config, source, events, cancel)
            .await
    }

    /// Run and collect the event stream; convenient for replay callers.
    pub async fn run_collect(
        &self,
        strategy: Box<dyn Strategy>,
        config: ExecutionConfig,
    ) -> EngineResult<(BacktestReport, Vec<ExecutionEvent>)> {
        let (tx, mut rx) = mpsc::channel(256);
        let collector = tokio::spawn(async move {
            let mut collected = Vec::new();
            while let Some(event) = rx.recv().await {
                collected.push(event);
            }
            collected
        });

        let (_cancel_tx, cancel_rx) = broadcast::channel(1);
        let report = self.run(strategy, config, tx, cancel_rx).await;
        let events = collector.await.unwrap_or_default();
        report.map(|r| (r, events))
    }

    fn build_source(
        &self,
        strategy: &dyn Strategy,
        config: &ExecutionConfig,
    ) -> EngineResult<Box<dyn BarSource>> {
        let symbol = normalize_symbol(&config.symbol);
        let market_type = config.contract_type.market_type();

        match config.mode {
            ExecutionMode::Backtest => {
                let (start_ms, end_ms) = match (config.start_ms, config.end_ms) {
                    (Some(s), Some(e)) if s < e => (s, e),
                    _ => {
                        return Err(EngineError::Config(
                            "backtest requires start_ms < end_ms".into(),
                        ))
                    }
                };
                let warm_start = self.warmup_start(strategy, config, start_ms);
                Ok(Box::new(KlineStream::new(
                    self.center.clone(),
                    symbol,
                    config.interval,
                    config.exchange.clone(),
                    market_type,
                    warm_start,
                    end_ms,
                    self.app.engine.batch_size,
                    self.app.engine.preload_enabled,
                )))
            }
            ExecutionMode::Paper | ExecutionMode::Live => Ok(Box::new(RealtimeKlineSource::new(
                self.center.clone(),
                symbol,
                config.interval,
                config.exchange.clone(),
                market_type,
                config.end_ms,
            ))),
        }
    }

    /// Extend the range backward so indicators and the strategy see a warm
    /// window before the first tradable tick.
    ///
    /// When the strategy declares `max_timeframe_required`, the warm-up bars
    /// are sized by that coarser timeframe: a strategy resampling 1m bars
    /// into 1h candles needs its warm-up periods in hours, not minutes.
    fn warmup_start(
        &self,
        strategy: &dyn Strategy,
        config: &ExecutionConfig,
        start_ms: i64,
    ) -> i64 {
        const MONTH_SPAN_MS: i64 = 30 * 86_400_000;

        let requirements = strategy.data_requirements(config.interval);
        let indicator_warmup = self
            .indicator_specs(config)
            .ok()
            .map(|engine| engine.max_warmup())
            .unwrap_or(0);
        let warmup_bars = requirements
            .min_bars
            .max(requirements.warmup_periods)
            .max(indicator_warmup) as i64;

        let base_ms = config.interval.fixed_millis().unwrap_or(MONTH_SPAN_MS);
        let bar_ms = requirements
            .max_timeframe_required
            .map(|timeframe| timeframe.fixed_millis().unwrap_or(MONTH_SPAN_MS))
            .unwrap_or(base_ms)
            .max(base_ms);
        let warm = start_ms - warmup_bars * bar_ms - (requirements.extra_seconds as i64) * 1000;
        warm.max(0)
    }

    fn indicator_specs(&self, config: &ExecutionConfig) -> EngineResult<IndicatorEngine> {
        let names = config
            .indicators
            .clone()
            .unwrap_or_else(|| self.app.engine.default_indicators.clone());
        IndicatorEngine::from_names(&names)
    }

    fn trader_state(&self, config: &ExecutionConfig) -> TraderState {
        let symbol = normalize_symbol(&config.symbol);
        match config.contract_type {
            ContractType::Events => {
                let mut cfg = EventsTradeConfig::new(symbol);
                if let Some(stake) = config.investment_amount {
                    cfg = cfg.with_stake(stake);
                }
                if let Some(multiplier) = config.payout_multiplier {
                    cfg = cfg.with_payout(multiplier);
                }
                TraderState::Events {
                    account: SimulatedAccount::new(config.initial_capital),
                    trader: EventsTrader::new(),
                    cfg,
                }
            }
            ContractType::Futures => {
                let mut cfg = FuturesTradeConfig::from_trading(symbol.clone(), &self.app.trading);
                cfg.trailing_stop_pct = config.trailing_stop_pct;
                TraderState::Futures {
                    account: FuturesAccount::new(config.initial_capital),
                    manager: HedgePositionManager::new(symbol),
                    trader: FuturesTrader::new(),
                    cfg,
                }
            }
        }
    }

    /// Drive the full lifecycle over an explicit bar source.
    pub async fn run_with_source(
        &self,
        strategy: Box<dyn Strategy>,
        mut config: ExecutionConfig,
        mut source: Box<dyn BarSource>,
        events: mpsc::Sender<ExecutionEvent>,
        mut cancel: broadcast::Receiver<()>,
    ) -> EngineResult<BacktestReport> {
        config.speed = config.speed.min(self.app.engine.max_speed);
        let symbol = normalize_symbol(&config.symbol);
        let mut indicators = self.indicator_specs(&config)?;
        let mut state = self.trader_state(&config);
        let mut risk = RiskManager::new(&self.app.risk);
        let resolver = SignalResolver::new(ResolverConfig {
            min_confidence: config
                .min_confidence
                .unwrap_or_else(|| ResolverConfig::default().min_confidence),
            ..ResolverConfig::default()
        });

        info!(
            %symbol,
            interval = %config.interval,
            mode = ?config.mode,
            contract = ?config.contract_type,
            capital = %config.initial_capital,
            "run starting"
        );

        let mut window = OhlcvSeries::default();
        let mut trade_records: Vec<TradeRecord> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut equity_peak = Decimal::ZERO;
        let mut trading_stopped = false;
        let mut ticks: u64 = 0;
        let mut last_price: Option<Decimal> = None;
        let mut last_time = config
            .start_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        let mut critical_rules: Vec<String> = Vec::new();
        let mut fatal: Option<EngineError> = None;
        // A dropped cancel sender means "no cancellation controller".
        let mut cancel_closed = false;
        let cadence = config.flush_cadence();
        let trade_start = config.start_ms.unwrap_or(i64::MIN);

        let stop_cause = loop {
            let bar = tokio::select! {
                biased;
                received = cancel.recv(), if !cancel_closed => {
                    match received {
                        Err(broadcast::error::RecvError::Closed) => {
                            cancel_closed = true;
                            continue;
                        }
                        _ => break StopCause::Cancelled,
                    }
                }
                bar = source.next_bar() => match bar {
                    Ok(Some(bar)) => bar,
                    Ok(None) => break StopCause::SourceExhausted,
                    Err(err) => {
                        self.emit(&events, EventKind::Error, last_time, |data| {
                            data.insert("message".into(), json!(err.to_string()));
                        })
                        .await;
                        fatal = Some(err);
                        break StopCause::Fatal;
                    }
                },
            };

            window.push(&bar);
            indicators.on_close(bar.close);
            last_price = Some(bar.close);
            let tick_time = bar_close_time(&bar);
            last_time = tick_time;

            // Warm-up bars prime indicators and the window only.
            if bar.open_time < trade_start {
                continue;
            }
            ticks += 1;

            // a. + b. mark-to-market, then the stop-order sweep.
            if let TraderState::Futures {
                account,
                manager,
                cfg,
                ..
            } = &mut state
            {
                manager.mark_to_market(bar.close, bar.high, bar.low, cfg);
                for trigger in manager.check_stop_orders(&bar) {
                    let record = manager.close(
                        trigger.side,
                        trigger.trigger_price,
                        tick_time,
                        account,
                        cfg,
                        trigger.reason,
                    )?;
                    self.emit_trade(&events, &record, tick_time).await;
                    trade_records.push(record);
                }
                // Stops realize PnL: refresh the marks for the equity point.
                manager.mark_to_market(bar.close, bar.high, bar.low, cfg);
            }

            // c. equity point before the strategy runs.
            let equity = state.equity();
            equity_curve.push(equity_point(tick_time, equity, &mut equity_peak));

            // d. + e. context and strategy.
            let context = StrategyContext {
                symbol: symbol.clone(),
                interval: config.interval,
                current_time: tick_time,
                market_data: window.clone(),
                indicators: indicators.arrays().clone(),
                account_balance: state.cash(),
                positions: state.positions_map(&symbol),
                metadata: Map::new(),
            };

            let started = std::time::Instant::now();
            let mut result = match strategy.execute(&context) {
                Ok(result) => result,
                Err(err) => {
                    self.emit(&events, EventKind::Warning, tick_time, |data| {
                        data.insert("source".into(), json!("strategy"));
                        data.insert("message".into(), json!(err.to_string()));
                    })
                    .await;
                    StrategyResult::failed(err.to_string())
                }
            };
            result.execution_time_us = started.elapsed().as_micros() as u64;

            // f. resolve.
            let mut resolved = resolver.resolve(result.signals);

            // g. STOP_TRADING discards new opens; closes still pass.
            if trading_stopped {
                resolved.retain(|s| s.action.is_close_family() || s.action.is_hold());
            }

            // Outcomes are buffered so the tick's trade events all precede
            // its warning events, whatever order the signals landed in.
            let mut tick_trades: Vec<TradeRecord> = Vec::new();
            let mut tick_warnings: Vec<(String, String)> = Vec::new();
            for signal in &resolved {
                let trade_result = match &mut state {
                    TraderState::Events {
                        account,
                        trader,
                        cfg,
                    } => trader
                        .execute(signal, &bar, account, cfg)
                        .map(|(_, record)| record.into_iter().collect::<Vec<_>>()),
                    TraderState::Futures {
                        account,
                        manager,
                        trader,
                        cfg,
                    } => trader.execute(signal, bar.close, tick_time, account, manager, cfg),
                };

                match trade_result {
                    Ok(records) => tick_trades.extend(records),
                    Err(err) if err.is_trade_level() => {
                        warn!(%err, "trade attempt aborted");
                        tick_warnings.push((err.to_string(), format!("{:?}", signal.action)));
                    }
                    Err(err) => return Err(err),
                }
            }
            for record in tick_trades {
                self.emit_trade(&events, &record, tick_time).await;
                trade_records.push(record);
            }
            for (message, action) in tick_warnings {
                self.emit(&events, EventKind::Warning, tick_time, |data| {
                    data.insert("source".into(), json!("trader"));
                    data.insert("message".into(), json!(message));
                    data.insert("action".into(), json!(action));
                })
                .await;
            }

            // h. risk evaluation on the post-trade state.
            let check = risk.check_risk(
                RiskSnapshot {
                    equity: state.equity(),
                    wallet_balance: state.wallet_balance(),
                    margin_locked: state.margin_locked(),
                },
                &trade_records,
                tick_time,
            );
            match check.recommended_action {
                RiskAction::ForceClose => {
                    critical_rules = check.rule_names();
                    self.emit(&events, EventKind::Warning, tick_time, |data| {
                        data.insert("source".into(), json!("risk"));
                        data.insert("level".into(), json!("critical"));
                        data.insert("rules".into(), json!(&critical_rules));
                    })
                    .await;
                    break StopCause::RiskCritical;
                }
                RiskAction::StopTrading => {
                    if !trading_stopped {
                        trading_stopped = true;
                        self.emit(&events, EventKind::Warning, tick_time, |data| {
                            data.insert("source".into(), json!("risk"));
                            data.insert("level".into(), json!("warning"));
                            data.insert("action".into(), json!("stop_trading"));
                            data.insert("rules".into(), json!(check.rule_names()));
                        })
                        .await;
                    }
                }
                RiskAction::Warn => {
                    self.emit(&events, EventKind::Warning, tick_time, |data| {
                        data.insert("source".into(), json!("risk"));
                        data.insert("level".into(), json!("warning"));
                        data.insert("rules".into(), json!(check.rule_names()));
                    })
                    .await;
                }
                RiskAction::None => {}
            }

            // i. tick event, then progress on the flush cadence.
            self.emit(&events, EventKind::Tick, tick_time, |data| {
                data.insert(
                    "bar".into(),
                    json!({
                        "open_time": bar.open_time,
                        "open": bar.open.to_string(),
                        "high": bar.high.to_string(),
                        "low": bar.low.to_string(),
                        "close": bar.close.to_string(),
                        "volume": bar.volume.to_string(),
                    }),
                );
                data.insert("equity".into(), json!(equity.to_string()));
            })
            .await;

            if ticks % u64::from(cadence) == 0 {
                self.emit(&events, EventKind::Progress, tick_time, |data| {
                    data.insert("ticks".into(), json!(ticks));
                    data.insert("equity".into(), json!(equity.to_string()));
                    data.insert("trades".into(), json!(trade_records.len()));
                })
                .await;

                if config.mode == ExecutionMode::Backtest && config.speed > 0 {
                    if cancel.try_recv().is_ok() {
                        break StopCause::Cancelled;
                    }
                    // Replay throttle: one flush per 1000/speed ms.
                    tokio::time::sleep(Duration::from_millis(1000 / u64::from(config.speed.max(1))))
                        .await;
                }
            }
        };

        // Termination: flush open positions at the last observed price.
        if let TraderState::Futures {
            account,
            manager,
            cfg,
            ..
        } = &mut state
        {
            if manager.has_any_position() {
                let flush_price = last_price.unwrap_or(Decimal::ZERO);
                if flush_price > Decimal::ZERO {
                    let records = manager.close_all(
                        flush_price,
                        last_time,
                        account,
                        cfg,
                        stop_cause.close_reason(),
                    )?;
                    for record in records {
                        self.emit_trade(&events, &record, last_time).await;
                        trade_records.push(record);
                    }
                }
            }
        }

        // Final equity point after the flush.
        let final_equity = state.equity();
        equity_curve.push(equity_point(last_time, final_equity, &mut equity_peak));

        let report = ReportBuilder::build(
            strategy.name(),
            symbol.clone(),
            config.interval,
            config.initial_capital,
            state.wallet_balance(),
            trade_records,
            equity_curve,
            &ReportConfig::default(),
        );

        let cancelled = stop_cause == StopCause::Cancelled;
        self.emit(&events, EventKind::Complete, last_time, |data| {
            data.insert("reason".into(), json!(stop_cause.reason()));
            data.insert("cancelled".into(), json!(cancelled));
            data.insert("final_balance".into(), json!(report.final_capital.to_string()));
            data.insert("total_trades".into(), json!(report.total_trades));
            data.insert("mark_price_source".into(), json!("bar"));
            if !critical_rules.is_empty() {
                data.insert("risk_rules".into(), json!(critical_rules));
            }
        })
        .await;

        info!(
            reason = stop_cause.reason(),
            trades = report.total_trades,
            final_capital = %report.final_capital,
            "run finished"
        );

        match fatal {
            Some(err) => Err(err),
            None if cancelled => Err(EngineError::Cancelled),
            None => Ok(report),
        }
    }

    async fn emit<F>(
        &self,
        events: &mpsc::Sender<ExecutionEvent>,
        kind: EventKind,
        timestamp: DateTime<Utc>,
        fill: F,
    ) where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut data = Map::new();
        fill(&mut data);
        // A dropped receiver only mutes the stream; the run itself finishes.
        if events
            .send(ExecutionEvent::new(kind, data, timestamp))
            .await
            .is_err()
        {
            debug!("event receiver dropped");
        }
    }

    async fn emit_trade(
        &self,
        events: &mpsc::Sender<ExecutionEvent>,
        record: &TradeRecord,
        timestamp: DateTime<Utc>,
    ) {
        self.emit(events, EventKind::Trade, timestamp, |data| {
            data.insert(
                "record".into(),
                serde_json::to_value(record).unwrap_or(Value::Null),
            );
        })
        .await;
    }
}

fn bar_close_time(bar: &Kline) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(bar.close_time)
        .single()
        .unwrap_or_else(|| bar.open_datetime())
}

fn equity_point(
    timestamp: DateTime<Utc>,
    equity: Decimal,
    peak: &mut Decimal,
) -> EquityPoint {
    if equity > *peak {
        *peak = equity;
    }
    let drawdown = *peak - equity;
    let drawdown_pct = if peak.is_zero() {
        Decimal::ZERO
    } else {
        drawdown / *peak
    };
    EquityPoint {
        timestamp,
        equity,
        drawdown,
        drawdown_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::Interval;
    use crate::strategy::DataRequirements;

    struct DeclaredRequirements {
        requirements: DataRequirements,
    }

    impl Strategy for DeclaredRequirements {
        fn name(&self) -> &str {
            "declared"
        }

        fn data_requirements(&self, _interval: Interval) -> DataRequirements {
            self.requirements.clone()
        }

        fn execute(&self, _context: &StrategyContext) -> EngineResult<StrategyResult> {
            Ok(StrategyResult::hold())
        }
    }

    fn test_engine() -> ExecutionEngine {
        let app = AppConfig::default();
        let center = Arc::new(DataCenter::new(app.data_center.clone()).unwrap());
        ExecutionEngine::with_data_center(app, center)
    }

    fn requirements(warmup_periods: usize) -> DataRequirements {
        DataRequirements {
            warmup_periods,
            ..DataRequirements::default()
        }
    }

    #[test]
    fn warmup_window_sizes_by_the_base_interval() {
        let engine = test_engine();
        let strategy = DeclaredRequirements {
            requirements: requirements(50),
        };
        let config = ExecutionConfig::backtest("BTC/USDT", "1m".parse().unwrap());

        let start_ms = 1_000 * 60_000;
        let warm = engine.warmup_start(&strategy, &config, start_ms);
        assert_eq!(warm, start_ms - 50 * 60_000);
    }

    #[test]
    fn coarser_required_timeframe_widens_the_warmup_window() {
        let engine = test_engine();
        let mut declared = requirements(50);
        declared.max_timeframe_required = Some("1h".parse().unwrap());
        let strategy = DeclaredRequirements {
            requirements: declared,
        };
        let config = ExecutionConfig::backtest("BTC/USDT", "1m".parse().unwrap());

        let start_ms = 100 * 3_600_000;
        let warm = engine.warmup_start(&strategy, &config, start_ms);
        assert_eq!(warm, start_ms - 50 * 3_600_000);
    }

    #[test]
    fn finer_required_timeframe_never_shrinks_the_window() {
        let engine = test_engine();
        let mut declared = requirements(50);
        declared.max_timeframe_required = Some("1m".parse().unwrap());
        let strategy = DeclaredRequirements {
            requirements: declared,
        };
        let config = ExecutionConfig::backtest("BTC/USDT", "1h".parse().unwrap());

        let start_ms = 1_000 * 3_600_000;
        let warm = engine.warmup_start(&strategy, &config, start_ms);
        assert_eq!(warm, start_ms - 50 * 3_600_000);
    }

    #[test]
    fn extra_seconds_and_clamping_apply() {
        let engine = test_engine();
        let mut declared = requirements(10);
        declared.extra_seconds = 120;
        let strategy = DeclaredRequirements {
            requirements: declared,
        };
        let config = ExecutionConfig::backtest("BTC/USDT", "1m".parse().unwrap());

        let start_ms = 100 * 60_000;
        let warm = engine.warmup_start(&strategy, &config, start_ms);
        assert_eq!(warm, start_ms - 10 * 60_000 - 120_000);

        // Windows never extend past the epoch.
        assert_eq!(engine.warmup_start(&strategy, &config, 60_000), 0);
    }
}

//! Incremental technical indicators and the per-tick precompute stage.
//!
//! The engine configures a closed set of indicator specs per run. Each tick,
//! [`IndicatorEngine::on_close`] advances every indicator by one bar and the
//! accumulated arrays stay aligned with the close series: `arrays()[name][i]`
//! corresponds to `close[i]`. Warm-up slots are `None` until an indicator has
//! its minimum sample count.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};

/// Aligned output arrays, keyed by output name.
pub type IndicatorArrays = std::collections::HashMap<String, Vec<Option<Decimal>>>;

/// Indicator family plus parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorKind {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Macd { fast: usize, slow: usize, signal: usize },
}

/// One configured indicator. The `id` keys the output arrays; MACD derives
/// `<id>_signal` and `<id>_hist` alongside `<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorSpec {
    pub id: String,
    pub kind: IndicatorKind,
}

impl IndicatorSpec {
    pub fn sma(period: usize) -> Self {
        Self {
            id: format!("sma_{period}"),
            kind: IndicatorKind::Sma(period),
        }
    }

    pub fn ema(period: usize) -> Self {
        Self {
            id: format!("ema_{period}"),
            kind: IndicatorKind::Ema(period),
        }
    }

    pub fn rsi(period: usize) -> Self {
        Self {
            id: format!("rsi_{period}"),
            kind: IndicatorKind::Rsi(period),
        }
    }

    pub fn macd(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            id: format!("macd_{fast}_{slow}_{signal}"),
            kind: IndicatorKind::Macd { fast, slow, signal },
        }
    }
}

impl FromStr for IndicatorSpec {
    type Err = EngineError;

    /// Parses the config shorthand: `sma_20`, `ema_12`, `rsi_14`,
    /// `macd_12_26_9`.
    fn from_str(raw: &str) -> EngineResult<Self> {
        let parts: Vec<&str> = raw.split('_').collect();
        let bad = || EngineError::Config(format!("unknown indicator spec: {raw}"));
        let num = |s: &&str| s.parse::<usize>().map_err(|_| bad());

        let spec = match (parts.first().copied(), parts.len()) {
            (Some("sma"), 2) => IndicatorSpec::sma(num(&parts[1])?),
            (Some("ema"), 2) => IndicatorSpec::ema(num(&parts[1])?),
            (Some("rsi"), 2) => IndicatorSpec::rsi(num(&parts[1])?),
            (Some("macd"), 4) => {
                IndicatorSpec::macd(num(&parts[1])?, num(&parts[2])?, num(&parts[3])?)
            }
            _ => return Err(bad()),
        };
        for period in spec.periods() {
            if period == 0 {
                return Err(EngineError::Config(format!(
                    "indicator period must be >= 1: {raw}"
                )));
            }
        }
        Ok(spec)
    }
}

impl fmt::Display for IndicatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl IndicatorSpec {
    fn periods(&self) -> Vec<usize> {
        match self.kind {
            IndicatorKind::Sma(p) | IndicatorKind::Ema(p) | IndicatorKind::Rsi(p) => vec![p],
            IndicatorKind::Macd { fast, slow, signal } => vec![fast, slow, signal],
        }
    }

    /// Bars consumed before every output of this indicator is populated.
    pub fn warmup_period(&self) -> usize {
        match self.kind {
            IndicatorKind::Sma(p) | IndicatorKind::Ema(p) => p,
            IndicatorKind::Rsi(p) => p + 1,
            IndicatorKind::Macd { slow, signal, .. } => slow + signal - 1,
        }
    }
}

trait Indicator: Send {
    fn output_names(&self) -> Vec<String>;
    fn update(&mut self, close: Decimal) -> Vec<Option<Decimal>>;
    fn reset(&mut self);
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

struct Sma {
    id: String,
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl Sma {
    fn new(id: String, period: usize) -> Self {
        Self {
            id,
            period,
            window: VecDeque::with_capacity(period),
            sum: Decimal::ZERO,
        }
    }
}

impl Indicator for Sma {
    fn output_names(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn update(&mut self, close: Decimal) -> Vec<Option<Decimal>> {
        self.window.push_back(close);
        self.sum += close;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        let value = if self.window.len() == self.period {
            Some(self.sum / Decimal::from(self.period))
        } else {
            None
        };
        vec![value]
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }
}

/// Exponential moving average, seeded with the SMA of the first `period`
/// samples.
struct Ema {
    id: String,
    period: usize,
    multiplier: Decimal,
    seed: Vec<Decimal>,
    current: Option<Decimal>,
}

impl Ema {
    fn new(id: String, period: usize) -> Self {
        Self {
            id,
            period,
            multiplier: Decimal::TWO / Decimal::from(period + 1),
            seed: Vec::with_capacity(period),
            current: None,
        }
    }

    fn step(&mut self, close: Decimal) -> Option<Decimal> {
        match self.current {
            Some(prev) => {
                let next = (close - prev) * self.multiplier + prev;
                self.current = Some(next);
                Some(next)
            }
            None => {
                self.seed.push(close);
                if self.seed.len() == self.period {
                    let sum: Decimal = self.seed.iter().copied().sum();
                    let seeded = sum / Decimal::from(self.period);
                    self.current = Some(seeded);
                    Some(seeded)
                } else {
                    None
                }
            }
        }
    }
}

impl Indicator for Ema {
    fn output_names(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn update(&mut self, close: Decimal) -> Vec<Option<Decimal>> {
        vec![self.step(close)]
    }

    fn reset(&mut self) {
        self.seed.clear();
        self.current = None;
    }
}

/// Relative strength index with Wilder smoothing.
struct Rsi {
    id: String,
    period: usize,
    prev_close: Option<Decimal>,
    avg_gain: Decimal,
    avg_loss: Decimal,
    changes_seen: usize,
}

impl Rsi {
    fn new(id: String, period: usize) -> Self {
        Self {
            id,
            period,
            prev_close: None,
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            changes_seen: 0,
        }
    }
}

impl Indicator for Rsi {
    fn output_names(&self) -> Vec<String> {
        vec![self.id.clone()]
    }

    fn update(&mut self, close: Decimal) -> Vec<Option<Decimal>> {
        let prev = match self.prev_close.replace(close) {
            Some(prev) => prev,
            None => return vec![None],
        };

        let change = close - prev;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        self.changes_seen += 1;

        let period = Decimal::from(self.period);
        if self.changes_seen <= self.period {
            // Accumulate the initial simple averages.
            self.avg_gain += gain / period;
            self.avg_loss += loss / period;
            if self.changes_seen < self.period {
                return vec![None];
            }
        } else {
            self.avg_gain = (self.avg_gain * (period - Decimal::ONE) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - Decimal::ONE) + loss) / period;
        }

        let hundred = Decimal::ONE_HUNDRED;
        let value = if self.avg_loss.is_zero() {
            hundred
        } else {
            hundred - hundred / (Decimal::ONE + self.avg_gain / self.avg_loss)
        };
        vec![Some(value)]
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.avg_gain = Decimal::ZERO;
        self.avg_loss = Decimal::ZERO;
        self.changes_seen = 0;
    }
}

/// MACD line, signal line and histogram.
struct Macd {
    id: String,
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    fn new(id: String, fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(format!("{id}.fast"), fast),
            slow: Ema::new(format!("{id}.slow"), slow),
            signal: Ema::new(format!("{id}.signal"), signal),
            id,
        }
    }
}

impl Indicator for Macd {
    fn output_names(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            format!("{}_signal", self.id),
            format!("{}_hist", self.id),
        ]
    }

    fn update(&mut self, close: Decimal) -> Vec<Option<Decimal>> {
        let fast = self.fast.step(close);
        let slow = self.slow.step(close);

        let macd = match (fast, slow) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        };
        let signal = macd.and_then(|m| self.signal.step(m));
        let hist = match (macd, signal) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        };
        vec![macd, signal, hist]
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

fn build(spec: &IndicatorSpec) -> Box<dyn Indicator> {
    match spec.kind {
        IndicatorKind::Sma(p) => Box::new(Sma::new(spec.id.clone(), p)),
        IndicatorKind::Ema(p) => Box::new(Ema::new(spec.id.clone(), p)),
        IndicatorKind::Rsi(p) => Box::new(Rsi::new(spec.id.clone(), p)),
        IndicatorKind::Macd { fast, slow, signal } => {
            Box::new(Macd::new(spec.id.clone(), fast, slow, signal))
        }
    }
}

// ---------------------------------------------------------------------------
// Precompute stage
// ---------------------------------------------------------------------------

/// Holds the run's indicator set and the accumulated aligned arrays.
pub struct IndicatorEngine {
    specs: Vec<IndicatorSpec>,
    indicators: Vec<Box<dyn Indicator>>,
    arrays: IndicatorArrays,
    ticks: usize,
}

impl IndicatorEngine {
    pub fn new(specs: Vec<IndicatorSpec>) -> Self {
        let indicators: Vec<Box<dyn Indicator>> = specs.iter().map(build).collect();
        let mut arrays = IndicatorArrays::new();
        for indicator in &indicators {
            for name in indicator.output_names() {
                arrays.insert(name, Vec::new());
            }
        }
        Self {
            specs,
            indicators,
            arrays,
            ticks: 0,
        }
    }

    /// Parse config shorthand specs, e.g. `["sma_20", "macd_12_26_9"]`.
    pub fn from_names(names: &[String]) -> EngineResult<Self> {
        let specs = names
            .iter()
            .map(|name| name.parse())
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self::new(specs))
    }

    pub fn specs(&self) -> &[IndicatorSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Largest warm-up among the configured indicators.
    pub fn max_warmup(&self) -> usize {
        self.specs
            .iter()
            .map(IndicatorSpec::warmup_period)
            .max()
            .unwrap_or(0)
    }

    /// Advance every indicator by one bar close.
    pub fn on_close(&mut self, close: Decimal) {
        for indicator in &mut self.indicators {
            let names = indicator.output_names();
            let values = indicator.update(close);
            for (name, value) in names.into_iter().zip(values) {
                if let Some(column) = self.arrays.get_mut(&name) {
                    column.push(value);
                }
            }
        }
        self.ticks += 1;
    }

    /// Aligned arrays over every tick seen so far.
    pub fn arrays(&self) -> &IndicatorArrays {
        &self.arrays
    }

    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn reset(&mut self) {
        for indicator in &mut self.indicators {
            indicator.reset();
        }
        for column in self.arrays.values_mut() {
            column.clear();
        }
        self.ticks = 0;
    }
}

//! Traders map resolved signals onto account and position mutations.

pub mod events;
pub mod futures;

pub use events::{EventsTradeConfig, EventsTrader};
pub use futures::{FuturesOrder, FuturesTrader};

// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

/// Order intent. The kind says both open-vs-close and buy-vs-sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeKind {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
    StopLong,
    StopShort,
    CancelAll,
    CancelOne,
}

impl TradeKind {
    pub fn is_open(&self) -> bool {
        matches!(self, TradeKind::OpenLong | TradeKind::OpenShort)
    }

    /// Buy-side kinds add to the net position: opening a long, closing or stopping a short.
    pub fn is_buy(&self) -> bool {
        matches!(self, TradeKind::OpenLong | TradeKind::CloseShort | TradeKind::StopShort)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, TradeKind::CancelAll | TradeKind::CancelOne)
    }

    pub fn side(&self) -> Option<Side> {
        if self.is_cancel() {
            None
        } else if self.is_buy() {
            Some(Side::Buy)
        } else {
            Some(Side::Sell)
        }
    }
}

impl std::fmt::Display for TradeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeKind::OpenLong => "OpenLong",
            TradeKind::CloseLong => "CloseLong",
            TradeKind::OpenShort => "OpenShort",
            TradeKind::CloseShort => "CloseShort",
            TradeKind::StopLong => "StopLong",
            TradeKind::StopShort => "StopShort",
            TradeKind::CancelAll => "CancelAll",
            TradeKind::CancelOne => "CancelOne",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAction {
    pub id: String,
    pub symbol: String,
    pub kind: TradeKind,
    pub price: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
}

impl TradeAction {
    pub fn new(kind: TradeKind, price: Decimal, amount: Decimal) -> Self {
        Self {
            id: String::new(),
            symbol: String::new(),
            kind,
            price,
            amount,
            time: Utc::now(),
        }
    }

    pub fn cancel_all() -> Self {
        Self::new(TradeKind::CancelAll, Decimal::ZERO, Decimal::ZERO)
    }

    pub fn cancel_one(id: impl Into<String>) -> Self {
        Self::new(TradeKind::CancelOne, Decimal::ZERO, Decimal::ZERO).with_id(id)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self { self.id = id.into(); self }
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self { self.symbol = symbol.into(); self }
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self { self.time = time; self }
}

/// Fill record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub kind: TradeKind,
    pub time: DateTime<Utc>,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    pub remark: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction { #[default] Long, Short }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    /// Signed: positive long, negative short.
    pub hold: Decimal,
    pub price: Decimal,
    pub profit_ratio: Decimal,
}

impl Position {
    pub fn new(symbol: impl Into<String>, hold: Decimal, price: Decimal) -> Self {
        let direction = if hold < Decimal::ZERO { Direction::Short } else { Direction::Long };
        Self { symbol: symbol.into(), direction, hold, price, profit_ratio: Decimal::ZERO }
    }
}

/// OHLC bucket. `start` is the bucket-aligned open time in unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub turnover: Decimal,
    pub trades: i64,
}

impl Candle {
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.start, 0).unwrap_or_default()
    }

    /// Whether the candle's range touched `price`.
    pub fn touches(&self, price: Decimal) -> bool {
        self.low <= price && price <= self.high
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub balance: Decimal,
}

/// Seed for the ledger: starting total and fee rate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub balance: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub title: String,
    /// text, markdown
    pub kind: String,
    pub content: String,
}

impl NotifyEvent {
    pub fn text(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self { title: title.into(), kind: "text".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    /// Empty means global.
    pub code: String,
    pub lever: Decimal,
    pub max_lost_ratio: Decimal,
}

/// Candle request: which bins of which symbol, over which window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleParam {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exchange: String,
    pub bin_size: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchParam {
    /// Topic being watched, e.g. `candle`.
    pub kind: String,
    pub param: Option<CandleParam>,
}

impl WatchParam {
    pub fn candle(param: CandleParam) -> Self {
        Self { kind: crate::event::topic::CANDLE.to_string(), param: Some(param) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel { pub price: Decimal, pub amount: Decimal }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub buys: Vec<DepthLevel>,
    pub sells: Vec<DepthLevel>,
    pub update_time: Option<DateTime<Utc>>,
}

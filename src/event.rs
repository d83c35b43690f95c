// ===============================
// src/event.rs
// ===============================
//
// Event = routing topic + typed payload. Payloads are a closed sum type;
// handlers pull the variant they expect through the `as_*` accessors and
// get an `Error::Payload` on mismatch instead of a runtime type assertion.
//
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    Balance, BalanceInfo, Candle, CandleParam, Depth, NotifyEvent, Position, RiskLimit, Trade,
    TradeAction, WatchParam,
};
use crate::error::{Error, Result};

/// Topic catalog.
pub mod topic {
    pub const CANDLE: &str = "candle";
    pub const CANDLE_PARAM: &str = "candle_param";
    pub const ORDER: &str = "order";
    pub const ORDER_CANCEL_ALL: &str = "order_cancel_all";
    /// own fills
    pub const TRADE: &str = "trade";
    /// market-wide prints
    pub const TRADE_MARKET: &str = "trade_market";
    pub const POSITION: &str = "position";
    pub const BALANCE: &str = "balance";
    pub const BALANCE_INIT: &str = "balance_init";
    pub const RISK_LIMIT: &str = "risk_limit";
    pub const DEPTH: &str = "depth";
    pub const WATCH: &str = "watch";
    pub const NOTIFY: &str = "notify";
    /// fatal processer errors, consumed by the orchestrator
    pub const ERROR: &str = "error";

    pub const ALL: [&str; 14] = [
        CANDLE, CANDLE_PARAM, ORDER, ORDER_CANCEL_ALL, TRADE, TRADE_MARKET, POSITION, BALANCE,
        BALANCE_INIT, RISK_LIMIT, DEPTH, WATCH, NOTIFY, ERROR,
    ];
}

/// Event name marking backfill candles that must not be treated as live.
pub const RECENT: &str = "recent";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Candle(Candle),
    CandleParam(CandleParam),
    Order(TradeAction),
    Trade(Trade),
    Position(Position),
    Balance(Balance),
    BalanceInit(BalanceInfo),
    RiskLimit(RiskLimit),
    Depth(Depth),
    Watch(WatchParam),
    Notify(NotifyEvent),
    Error(String),
    Empty,
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Candle(_) => "candle",
            Payload::CandleParam(_) => "candle_param",
            Payload::Order(_) => "order",
            Payload::Trade(_) => "trade",
            Payload::Position(_) => "position",
            Payload::Balance(_) => "balance",
            Payload::BalanceInit(_) => "balance_init",
            Payload::RiskLimit(_) => "risk_limit",
            Payload::Depth(_) => "depth",
            Payload::Watch(_) => "watch",
            Payload::Notify(_) => "notify",
            Payload::Error(_) => "error",
            Payload::Empty => "empty",
        }
    }
}

/// Immutable once published; subscribers get a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub topic: String,
    pub name: String,
    pub time: DateTime<Utc>,
    pub source: String,
    /// Candle events carry their bin size here ("1m", "5m", ...).
    pub extra: Option<String>,
    pub payload: Payload,
}

macro_rules! payload_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $fn_name(&self) -> Result<&$ty> {
            match &self.payload {
                Payload::$variant(v) => Ok(v),
                other => Err(self.mismatch($label, other)),
            }
        }
    };
}

impl Event {
    pub fn new(
        topic: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            time: Utc::now(),
            source: source.into(),
            extra: None,
            payload,
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    pub fn extra(&self) -> Option<&str> {
        self.extra.as_deref()
    }

    pub fn is_recent(&self) -> bool {
        self.name == RECENT
    }

    fn mismatch(&self, expected: &'static str, got: &Payload) -> Error {
        Error::Payload { topic: self.topic.clone(), expected, got: got.kind() }
    }

    payload_accessor!(as_candle, Candle, Candle, "candle");
    payload_accessor!(as_candle_param, CandleParam, CandleParam, "candle_param");
    payload_accessor!(as_order, Order, TradeAction, "order");
    payload_accessor!(as_trade, Trade, Trade, "trade");
    payload_accessor!(as_position, Position, Position, "position");
    payload_accessor!(as_balance, Balance, Balance, "balance");
    payload_accessor!(as_balance_init, BalanceInit, BalanceInfo, "balance_init");
    payload_accessor!(as_risk_limit, RiskLimit, RiskLimit, "risk_limit");
    payload_accessor!(as_depth, Depth, Depth, "depth");
    payload_accessor!(as_watch, Watch, WatchParam, "watch");
    payload_accessor!(as_notify, Notify, NotifyEvent, "notify");
    payload_accessor!(as_error, Error, String, "error");
}

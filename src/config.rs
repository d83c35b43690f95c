// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : simtrade_rust: event-bus backtest core in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Candle replay (CSV / mock random walk) driving a virtual exchange,
          pluggable strategies, fee-aware ledger, risk guard with forced
          close, Prometheus metrics, and JSONL event recording.
=============================================================================
*/
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::bus::BusMode;
use crate::candle::{parse_bin_sizes, BinSize};
use crate::error::{Error, Result};
use crate::notify::NotifyConfig;
use crate::risk::RiskConfig;

/// Delivery mode of the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BusKind {
    /// publish runs every handler inline
    Sync,
    /// one queue + worker thread per topic
    Concurrent,
}

/// Backtest a strategy over 1m candles through the event bus.
#[derive(Parser, Clone, Debug)]
#[command(name = "simtrade", version, about)]
pub struct Args {
    /// Traded symbol
    #[arg(long, env = "SYMBOL", default_value = "BTCUSDT")]
    pub symbol: String,

    /// 1m candle CSV (start,open,high,low,close,volume[,turnover,trades]); mock walk when unset
    #[arg(long, env = "CANDLE_CSV")]
    pub candle_csv: Option<PathBuf>,

    /// Number of mock candles
    #[arg(long, env = "MOCK_CANDLES", default_value_t = 1440)]
    pub mock_candles: usize,

    /// First open price of the mock walk
    #[arg(long, env = "MOCK_PRICE", default_value = "100")]
    pub mock_price: Decimal,

    #[arg(long, env = "MOCK_SEED", default_value_t = 42)]
    pub mock_seed: u64,

    /// Starting ledger balance
    #[arg(long, env = "INIT_BALANCE", default_value = "1000")]
    pub balance: Decimal,

    /// Fee rate per fill notional
    #[arg(long, env = "FEE_RATE", default_value = "0.00075")]
    pub fee: Decimal,

    /// Registered strategy name
    #[arg(long, env = "STRATEGY", default_value = "ma_cross")]
    pub strategy: String,

    /// Strategy parameters as JSON, e.g. '{"fast":8,"slow":32}'
    #[arg(long, env = "STRATEGY_PARAMS", default_value = "null")]
    pub strategy_params: String,

    #[arg(long, env = "BUS_MODE", value_enum, default_value_t = BusKind::Sync)]
    pub bus: BusKind,

    /// Queue capacity per topic (concurrent mode)
    #[arg(long, env = "BUS_CAPACITY", default_value_t = crate::bus::DEFAULT_CAPACITY)]
    pub bus_capacity: usize,

    /// Extra bins merged from 1m, comma separated
    #[arg(long, env = "BINS", default_value = "5m,15m,1h")]
    pub bins: String,

    /// Max absolute position (0 = off)
    #[arg(long, env = "MAX_POSITION", default_value = "0")]
    pub max_position: Decimal,

    /// Max daily loss as a ratio of the initial balance (0 = off)
    #[arg(long, env = "MAX_DAILY_LOSS", default_value = "0")]
    pub max_daily_loss: Decimal,

    /// Max orders per sliding minute (0 = off)
    #[arg(long, env = "MAX_ORDER_RATE", default_value_t = 0)]
    pub max_order_rate: usize,

    /// Max relative distance from the last trade price (0 = off)
    #[arg(long, env = "PRICE_DEVIATION", default_value = "0")]
    pub price_deviation: Decimal,

    /// Append events to this JSONL file
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    /// Topics written by the recorder
    #[arg(long, env = "RECORD_TOPICS", default_value = "order,trade,position,balance,notify")]
    pub record_topics: String,

    /// Prometheus port, 0 disables
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// Grace period for queued events before the bus closes
    #[arg(long, env = "DRAIN_GRACE_MS", default_value_t = 2000)]
    pub drain_grace_ms: u64,

    /// Also log every order through the notify sink
    #[arg(long, env = "NOTIFY_ORDERS")]
    pub notify_orders: bool,
}

impl Args {
    pub fn bus_mode(&self) -> BusMode {
        match self.bus {
            BusKind::Sync => BusMode::Sync,
            BusKind::Concurrent => BusMode::Concurrent { capacity: self.bus_capacity.max(1) },
        }
    }

    pub fn bin_sizes(&self) -> Result<Vec<BinSize>> {
        parse_bin_sizes(&self.bins)
    }

    pub fn strategy_params(&self) -> Result<Value> {
        serde_json::from_str(&self.strategy_params)
            .map_err(|e| Error::Config(format!("STRATEGY_PARAMS: {e}")))
    }

    pub fn record_topics(&self) -> Vec<String> {
        self.record_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn notify_config(&self) -> NotifyConfig {
        NotifyConfig { order: self.notify_orders, ..Default::default() }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            max_position: self.max_position,
            max_daily_loss: self.max_daily_loss,
            max_order_rate: self.max_order_rate,
            price_deviation: self.price_deviation,
        }
    }
}

pub fn load() -> (Args, RiskConfig) {
    // .env dulu, supaya env fallback clap ikut terisi
    let _ = dotenv();
    let args = Args::parse();
    let risk = args.risk_config();
    (args, risk)
}

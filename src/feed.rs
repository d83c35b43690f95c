// ===============================
// src/feed.rs
// ===============================
//
// Candle source for backtests:
// - load_csv     : 1m candles from a CSV file (start,open,high,low,close,volume[,turnover,trades])
// - mock_candles : seeded random walk, same idea as the old tick mock but per minute
// - CandleFeed   : processer that replays them on a `watch` / `candle_param` request,
//                  1m first, then every merged bin that completed on that candle
//
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::candle::{parse_bin_sizes, BinSize, KlineMerge};
use crate::domain::{Candle, CandleParam};
use crate::error::Result;
use crate::event::{topic, Event, Payload};
use crate::processer::{BaseProcesser, Processer};
use crate::vex::MATCH_BIN;

#[derive(Debug, Deserialize)]
struct CsvRow {
    start: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    #[serde(default)]
    turnover: Option<Decimal>,
    #[serde(default)]
    trades: Option<i64>,
}

/// Read 1m candles. Rows are sorted by start; duplicate starts keep the first row.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let mut out = Vec::new();
    for row in rdr.deserialize::<CsvRow>() {
        let r = row?;
        // epoch millis are common in exports
        let start = if r.start > 10_000_000_000 { r.start / 1000 } else { r.start };
        out.push(Candle {
            start,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
            turnover: r.turnover.unwrap_or_default(),
            trades: r.trades.unwrap_or_default(),
        });
    }
    out.sort_by_key(|c| c.start);
    out.dedup_by_key(|c| c.start);
    info!(path = %path.as_ref().display(), candles = out.len(), "csv candles loaded");
    Ok(out)
}

/// Random-walk 1m candles, reproducible for a given seed. Prices in cents.
pub fn mock_candles(count: usize, start: DateTime<Utc>, start_price: Decimal, seed: u64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let t0 = start.timestamp() - start.timestamp().rem_euclid(60);
    let mut px: i64 = (start_price * Decimal::ONE_HUNDRED).trunc().to_i64().unwrap_or(100_00);
    let floor = (px / 2).max(1);

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let open = px;
        let step = rng.gen_range(-30..=30);
        let close = (open + step).max(floor);
        let high = open.max(close) + rng.gen_range(0..=10);
        let low = (open.min(close) - rng.gen_range(0..=10)).max(1);
        let volume = Decimal::from(rng.gen_range(1..=100));
        let close_d = Decimal::new(close, 2);
        out.push(Candle {
            start: t0 + i as i64 * 60,
            open: Decimal::new(open, 2),
            high: Decimal::new(high, 2),
            low: Decimal::new(low, 2),
            close: close_d,
            volume,
            turnover: volume * close_d,
            trades: rng.gen_range(1..=50),
        });
        px = close;
    }
    out
}

pub struct CandleFeed {
    base: BaseProcesser,
    symbol: String,
    candles: Vec<Candle>,
    bins: Vec<BinSize>,
    done_tx: Sender<usize>,
    done_rx: Receiver<usize>,
}

impl CandleFeed {
    pub fn new(symbol: impl Into<String>, candles: Vec<Candle>) -> Self {
        let (done_tx, done_rx) = bounded(1);
        Self {
            base: BaseProcesser::new("candle_feed"),
            symbol: symbol.into(),
            candles,
            bins: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    /// Extra bins merged from 1m on every replay.
    pub fn with_bins(mut self, bins: Vec<BinSize>) -> Self {
        self.bins = bins;
        self
    }

    /// Receives the number of 1m candles replayed, once per replay.
    pub fn done(&self) -> Receiver<usize> {
        self.done_rx.clone()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// First/last candle times, handy for building a watch request over everything.
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.candles.first()?;
        let last = self.candles.last()?;
        Some((first.time(), last.time() + chrono::Duration::minutes(1)))
    }

    fn on_watch(&self, ev: &Event) -> Result<()> {
        let watch = ev.as_watch()?;
        if watch.kind != topic::CANDLE {
            debug!(kind = %watch.kind, "watch kind not served by feed");
            return Ok(());
        }
        match &watch.param {
            Some(p) => self.replay(p),
            None => {
                warn!("candle watch without parameters");
                Ok(())
            }
        }
    }

    fn on_candle_param(&self, ev: &Event) -> Result<()> {
        let p = ev.as_candle_param()?.clone();
        self.replay(&p)
    }

    fn replay(&self, p: &CandleParam) -> Result<()> {
        if !p.symbol.is_empty() && p.symbol != self.symbol {
            debug!(symbol = %p.symbol, "candle request for another symbol");
            return Ok(());
        }
        let requested = match parse_bin_sizes(&p.bin_size) {
            Ok(b) => b,
            Err(e) => {
                self.base.fatal(format!("bad candle request: {e}"));
                return Ok(());
            }
        };
        let mut bins: Vec<BinSize> = self.bins.iter().chain(requested.iter()).copied().collect();
        bins.sort();
        bins.dedup();
        let mut mergers: Vec<KlineMerge> = bins
            .into_iter()
            .filter(|b| *b != BinSize::ONE_MINUTE)
            .map(|b| KlineMerge::new(BinSize::ONE_MINUTE, b))
            .collect::<Result<_>>()?;

        let (start, end) = (p.start.timestamp(), p.end.timestamp());
        let mut sent = 0usize;
        for c in self.candles.iter().filter(|c| c.start >= start && c.start < end) {
            if self.base.is_stopped() {
                warn!(sent, "feed stopped mid replay");
                break;
            }
            self.base.send_with_extra(&self.symbol, topic::CANDLE, MATCH_BIN, Payload::Candle(c.clone()));
            for m in mergers.iter_mut() {
                if let Some(k) = m.update(c) {
                    self.base.send_with_extra(&self.symbol, topic::CANDLE, &m.dst().to_string(), Payload::Candle(k));
                }
            }
            sent += 1;
        }
        info!(symbol = %self.symbol, sent, "candle replay done");
        if self.done_tx.try_send(sent).is_err() {
            debug!("previous done signal not consumed");
        }
        Ok(())
    }
}

impl Processer for CandleFeed {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.base.attach(bus);
        let name = self.base.name().to_string();
        bus.subscribe_weak(topic::WATCH, &name, &self, Self::on_watch);
        bus.subscribe_weak(topic::CANDLE_PARAM, &name, &self, Self::on_candle_param);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.base.mark_stopped();
        Ok(())
    }
}

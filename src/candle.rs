// ===============================
// src/candle.rs
// ===============================
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::domain::Candle;
use crate::error::{Error, Result};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

pub const DEFAULT_BIN_SIZES: &str = "1m, 5m, 15m, 30m, 1h, 4h, 1d";

/// Candle period in seconds. Parses `30s`, `1m`, `4h`, `1d`, `1w`; a bare
/// integer means minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinSize(i64);

impl BinSize {
    pub const ONE_MINUTE: BinSize = BinSize(MINUTE);

    pub fn from_secs(secs: i64) -> Result<Self> {
        if secs <= 0 {
            return Err(Error::BinSize(format!("{secs}s")));
        }
        Ok(Self(secs))
    }

    pub fn secs(&self) -> i64 {
        self.0
    }
}

impl FromStr for BinSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::BinSize("empty".into()));
        }
        let overflow = || Error::BinSize(s.to_string());
        if let Ok(n) = s.parse::<i64>() {
            return Self::from_secs(n.checked_mul(MINUTE).ok_or_else(overflow)?);
        }
        let split = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        let (value, unit) = s.split_at(split);
        let unit = match unit {
            "s" | "S" => 1,
            "m" => MINUTE,
            "h" | "H" => HOUR,
            "d" | "D" => DAY,
            "w" | "W" => WEEK,
            _ => return Err(Error::BinSize(s.to_string())),
        };
        let n = if value.is_empty() {
            1
        } else {
            value.parse::<i64>().map_err(|_| Error::BinSize(s.to_string()))?
        };
        let secs = n.checked_mul(unit).ok_or_else(overflow)?;
        Self::from_secs(secs).map_err(|_| overflow())
    }
}

impl fmt::Display for BinSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s % WEEK == 0 {
            write!(f, "{}w", s / WEEK)
        } else if s % DAY == 0 {
            write!(f, "{}d", s / DAY)
        } else if s % HOUR == 0 {
            write!(f, "{}h", s / HOUR)
        } else if s % MINUTE == 0 {
            write!(f, "{}m", s / MINUTE)
        } else {
            write!(f, "{s}s")
        }
    }
}

/// "1m, 5m ,1h" -> [1m, 5m, 1h]. Empty entries are skipped.
pub fn parse_bin_sizes(s: &str) -> Result<Vec<BinSize>> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(BinSize::from_str)
        .collect()
}

/// `name:binsize` label, e.g. `BTCUSDT:5m`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleName {
    pub name: String,
    pub bin_size: String,
}

impl CandleName {
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((name, bin)) => Self { name: name.to_string(), bin_size: bin.to_string() },
            None => Self { name: s.to_string(), bin_size: String::new() },
        }
    }
}

impl fmt::Display for CandleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.bin_size)
    }
}

/// Aggregates consecutive `src` candles into one `dst` candle.
///
/// A bucket is emitted when its last slot arrives and every slot was seen;
/// incomplete buckets are dropped. Candles older than the last cached one are
/// ignored, and nothing is cached before the first bucket-aligned candle.
#[derive(Debug, Clone)]
pub struct KlineMerge {
    src: i64,
    dst: i64,
    ratio: usize,
    cache: Vec<Candle>,
    first: bool,
}

impl KlineMerge {
    pub fn new(src: BinSize, dst: BinSize) -> Result<Self> {
        if dst.secs() < src.secs() || dst.secs() % src.secs() != 0 {
            return Err(Error::BinSize(format!("cannot merge {src} into {dst}")));
        }
        Ok(Self {
            src: src.secs(),
            dst: dst.secs(),
            ratio: (dst.secs() / src.secs()) as usize,
            cache: Vec::new(),
            first: true,
        })
    }

    pub fn dst(&self) -> BinSize {
        BinSize(self.dst)
    }

    pub fn need_merge(&self) -> bool {
        self.ratio != 1
    }

    pub fn update(&mut self, candle: &Candle) -> Option<Candle> {
        if !self.need_merge() {
            return Some(candle.clone());
        }
        if self.cache.last().is_some_and(|last| candle.start <= last.start) {
            return None;
        }
        if self.first && candle.start % self.dst != 0 {
            return None;
        }
        self.first = false;

        let bucket = candle.start - candle.start.rem_euclid(self.dst);
        if self.cache.first().is_some_and(|c| c.start - c.start.rem_euclid(self.dst) != bucket) {
            debug!(dropped = self.cache.len(), "incomplete bucket discarded");
            self.cache.clear();
        }
        self.cache.push(candle.clone());

        let index = (candle.start.rem_euclid(self.dst) / self.src) as usize + 1;
        if index != self.ratio {
            return None;
        }
        let cache = std::mem::take(&mut self.cache);
        if cache.len() != self.ratio {
            debug!(have = cache.len(), want = self.ratio, "cache length mismatch, skip");
            return None;
        }
        merge(&cache)
    }
}

fn merge(candles: &[Candle]) -> Option<Candle> {
    let first = candles.first()?;
    let last = candles.last()?;
    let mut out = Candle {
        start: first.start,
        open: first.open,
        high: first.high,
        low: first.low,
        close: last.close,
        volume: Decimal::ZERO,
        turnover: Decimal::ZERO,
        trades: 0,
    };
    for c in candles {
        out.high = out.high.max(c.high);
        out.low = out.low.min(c.low);
        out.volume += c.volume;
        out.turnover += c.turnover;
        out.trades += c.trades;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bs(s: &str) -> BinSize {
        s.parse().unwrap()
    }

    fn c(start: i64, i: i64) -> Candle {
        let d = Decimal::from(i);
        Candle {
            start,
            open: dec!(100) + d,
            high: dec!(200) + d,
            low: dec!(50) + d,
            close: dec!(110) + d,
            volume: dec!(1) + d,
            turnover: dec!(10),
            trades: 10 + i,
        }
    }

    #[test]
    fn test_parse_bin_size() {
        assert_eq!(bs("1m").secs(), 60);
        assert_eq!(bs("15").secs(), 900);
        assert_eq!(bs("30s").secs(), 30);
        assert_eq!(bs("4h").secs(), 4 * 3600);
        assert_eq!(bs("1d").secs(), 86400);
        assert_eq!(bs("W").secs(), 7 * 86400);
        assert_eq!(bs("h").secs(), 3600);
        assert!("".parse::<BinSize>().is_err());
        assert!("5x".parse::<BinSize>().is_err());
        assert!("am".parse::<BinSize>().is_err());
        assert!("0m".parse::<BinSize>().is_err());
    }

    #[test]
    fn test_parse_bin_size_overflow() {
        for s in ["200000000000000000m", "9223372036854775807", "99999999999999w"] {
            assert!(matches!(s.parse::<BinSize>(), Err(Error::BinSize(_))), "{s}");
        }
        assert!(parse_bin_sizes("5m,200000000000000000m").is_err());
    }

    #[test]
    fn test_bin_size_display() {
        for s in ["1m", "5m", "1h", "4h", "1d", "1w", "30s", "90m"] {
            assert_eq!(bs(s).to_string(), s);
        }
        assert_eq!(bs("60m").to_string(), "1h");
    }

    #[test]
    fn test_parse_bin_sizes_list() {
        let v = parse_bin_sizes(DEFAULT_BIN_SIZES).unwrap();
        assert_eq!(v.len(), 7);
        assert_eq!(v[0], BinSize::ONE_MINUTE);
        assert!(parse_bin_sizes("").unwrap().is_empty());
        assert!(parse_bin_sizes("1m,bogus").is_err());
    }

    #[test]
    fn test_candle_name() {
        let n = CandleName::parse("BTCUSDT:5m");
        assert_eq!(n.name, "BTCUSDT");
        assert_eq!(n.bin_size, "5m");
        assert_eq!(n.to_string(), "BTCUSDT:5m");
        assert_eq!(CandleName::parse("BTCUSDT").bin_size, "");
    }

    #[test]
    fn test_merge_5m_to_15m() {
        let mut m = KlineMerge::new(bs("5m"), bs("15m")).unwrap();
        // 300 is not 900-aligned: skipped until 900
        let starts = [300, 600, 900, 1200, 1500, 1800, 2100, 2400, 2700];
        let out: Vec<Candle> = starts
            .iter()
            .enumerate()
            .filter_map(|(i, s)| m.update(&c(*s, i as i64)))
            .collect();
        assert_eq!(out.len(), 2);
        let k = &out[0];
        assert_eq!(k.start, 900);
        assert_eq!(k.open, dec!(102));
        assert_eq!(k.close, dec!(114));
        assert_eq!(k.high, dec!(204));
        assert_eq!(k.low, dec!(52));
        assert_eq!(k.volume, dec!(12));
        assert_eq!(k.turnover, dec!(30));
        assert_eq!(k.trades, 12 + 13 + 14);
        assert_eq!(out[1].start, 1800);
    }

    #[test]
    fn test_merge_drops_incomplete_bucket() {
        let mut m = KlineMerge::new(bs("1m"), bs("5m")).unwrap();
        // bucket [0,300) misses 120
        for s in [0, 60, 180, 240] {
            assert!(m.update(&c(s, 0)).is_none());
        }
        // bucket [300,600) complete; stray cache must not leak in
        let mut got = None;
        for s in [300, 360, 420, 480, 540] {
            got = m.update(&c(s, 0));
        }
        assert_eq!(got.map(|k| k.start), Some(300));
    }

    #[test]
    fn test_merge_ignores_out_of_order() {
        let mut m = KlineMerge::new(bs("1m"), bs("2m")).unwrap();
        assert!(m.update(&c(120, 0)).is_none());
        assert!(m.update(&c(60, 0)).is_none());
        assert!(m.update(&c(120, 0)).is_none());
        assert_eq!(m.update(&c(180, 0)).map(|k| k.start), Some(120));
    }

    #[test]
    fn test_merge_identity_and_invalid() {
        let mut m = KlineMerge::new(bs("1m"), bs("1m")).unwrap();
        assert!(!m.need_merge());
        assert_eq!(m.update(&c(7, 0)).map(|k| k.start), Some(7));
        assert!(KlineMerge::new(bs("5m"), bs("7m")).is_err());
        assert!(KlineMerge::new(bs("5m"), bs("1m")).is_err());
    }
}

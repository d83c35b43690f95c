// ===============================
// src/risk.rs
// ===============================
//
// Risk guard: observes order / trade / position / balance traffic and reacts
// after the fact. It never intercepts an order on its way to the exchange;
// a violation produces a cancel-all (and, on breach, a forced close) that
// travels the same bus.
//
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::domain::{NotifyEvent, TradeAction, TradeKind};
use crate::error::Result;
use crate::event::{topic, Event, Payload};
use crate::metrics::{gauge_value, RISK_BREACHES, RISK_CANCELS, RISK_DAILY_PNL};
use crate::processer::{BaseProcesser, Processer};

pub const RISK_CLOSE_ID: &str = "risk-close";

/// Limits; a zero disables the corresponding check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskConfig {
    pub max_position: Decimal,
    /// Ratio of the initial balance, e.g. 0.1 = 10%.
    pub max_daily_loss: Decimal,
    /// Orders per sliding minute.
    pub max_order_rate: usize,
    /// Relative distance from the last trade price, e.g. 0.05 = 5%.
    pub price_deviation: Decimal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("order rate limit exceeded ({count}/{limit} per minute)")]
    OrderRate { count: usize, limit: usize },
    #[error("position limit exceeded (estimated {estimated}, limit {limit})")]
    Position { estimated: Decimal, limit: Decimal },
    #[error("price deviation exceeded ({deviation} > {limit})")]
    PriceDeviation { deviation: Decimal, limit: Decimal },
    #[error("daily loss limit exceeded (ratio {ratio}, limit {limit})")]
    DailyLoss { ratio: Decimal, limit: Decimal },
    #[error("position limit breached (position {position}, limit {limit})")]
    PositionBreach { position: Decimal, limit: Decimal },
}

impl RiskError {
    fn label(&self) -> &'static str {
        match self {
            RiskError::OrderRate { .. } => "order_rate",
            RiskError::Position { .. } => "position",
            RiskError::PriceDeviation { .. } => "price_deviation",
            RiskError::DailyLoss { .. } => "daily_loss",
            RiskError::PositionBreach { .. } => "position_breach",
        }
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug)]
struct RiskState {
    position: Decimal,
    last_price: Decimal,
    daily_pnl: Decimal,
    day_start: NaiveDate,
    balance_init: Decimal,
    balance: Decimal,
    order_times: VecDeque<DateTime<Utc>>,
    // once set, order checks are skipped until the next UTC day
    breached: bool,
    lever: Decimal,
    total_pnl: Decimal,
    trade_count: u64,
    reject_count: u64,
}

impl RiskState {
    fn new(today: NaiveDate) -> Self {
        Self {
            position: Decimal::ZERO,
            last_price: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            day_start: today,
            balance_init: Decimal::ZERO,
            balance: Decimal::ZERO,
            order_times: VecDeque::new(),
            breached: false,
            lever: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            trade_count: 0,
            reject_count: 0,
        }
    }

    /// Lazy day rollover, driven by incoming trade/balance events.
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.day_start {
            info!(%today, daily_pnl = %self.daily_pnl, "risk: new trading day");
            self.daily_pnl = Decimal::ZERO;
            self.day_start = today;
            self.breached = false;
        }
    }
}

pub struct RiskManager {
    base: BaseProcesser,
    symbol: String,
    config: RiskConfig,
    clock: Clock,
    state: Mutex<RiskState>,
}

impl RiskManager {
    pub fn new(symbol: impl Into<String>, config: RiskConfig) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let today = clock().date_naive();
        Self {
            base: BaseProcesser::new("risk"),
            symbol: symbol.into(),
            config,
            clock,
            state: Mutex::new(RiskState::new(today)),
        }
    }

    /// Replace the wall clock (tests, replays).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        let today = clock().date_naive();
        self.state.get_mut().day_start = today;
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn reject_count(&self) -> u64 {
        self.state.lock().reject_count
    }

    pub fn trade_count(&self) -> u64 {
        self.state.lock().trade_count
    }

    pub fn breached(&self) -> bool {
        self.state.lock().breached
    }

    pub fn last_price(&self) -> Decimal {
        self.state.lock().last_price
    }

    pub fn position(&self) -> Decimal {
        self.state.lock().position
    }

    pub fn balance_init(&self) -> Decimal {
        self.state.lock().balance_init
    }

    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    pub fn lever(&self) -> Decimal {
        self.state.lock().lever
    }

    pub fn daily_pnl(&self) -> Decimal {
        self.state.lock().daily_pnl
    }

    pub fn total_pnl(&self) -> Decimal {
        self.state.lock().total_pnl
    }

    fn check_order(&self, st: &mut RiskState, act: &TradeAction) -> Option<RiskError> {
        let cfg = &self.config;

        if cfg.max_order_rate > 0 {
            let now = (self.clock)();
            let cutoff = now - Duration::minutes(1);
            while st.order_times.front().is_some_and(|t| *t <= cutoff) {
                st.order_times.pop_front();
            }
            if st.order_times.len() >= cfg.max_order_rate {
                return Some(RiskError::OrderRate {
                    count: st.order_times.len(),
                    limit: cfg.max_order_rate,
                });
            }
            st.order_times.push_back(now);
        }

        if cfg.max_position > Decimal::ZERO && act.kind.is_open() {
            let estimated = if act.kind.is_buy() {
                st.position + act.amount
            } else {
                st.position - act.amount
            };
            if estimated.abs() > cfg.max_position {
                return Some(RiskError::Position { estimated, limit: cfg.max_position });
            }
        }

        if cfg.price_deviation > Decimal::ZERO
            && st.last_price > Decimal::ZERO
            && act.price > Decimal::ZERO
        {
            let deviation = (act.price - st.last_price).abs() / st.last_price;
            if deviation > cfg.price_deviation {
                return Some(RiskError::PriceDeviation { deviation, limit: cfg.price_deviation });
            }
        }
        None
    }

    fn on_order(&self, ev: &Event) -> Result<()> {
        let act = ev.as_order()?;
        if act.kind.is_cancel() {
            return Ok(());
        }
        let violation = {
            let mut st = self.state.lock();
            if st.breached {
                return Ok(());
            }
            let v = self.check_order(&mut st, act);
            if v.is_some() {
                st.reject_count += 1;
            }
            v
        };
        if let Some(v) = violation {
            self.trigger_cancel(&v);
        }
        Ok(())
    }

    fn on_trade(&self, ev: &Event) -> Result<()> {
        let tr = ev.as_trade()?;
        let now = (self.clock)();
        let mut st = self.state.lock();
        st.trade_count += 1;
        st.last_price = tr.price;
        st.roll_day(now);
        Ok(())
    }

    fn on_position(&self, ev: &Event) -> Result<()> {
        let pos = ev.as_position()?;
        let mut st = self.state.lock();
        st.position = pos.hold;
        st.last_price = pos.price;
        Ok(())
    }

    fn on_balance(&self, ev: &Event) -> Result<()> {
        let balance = ev.as_balance()?;
        let now = (self.clock)();
        let breach = {
            let mut st = self.state.lock();
            st.roll_day(now);

            let old = st.balance;
            st.balance = balance.balance;
            if st.balance_init > Decimal::ZERO && old > Decimal::ZERO {
                let pnl = st.balance - old;
                st.daily_pnl += pnl;
                st.total_pnl += pnl;
            }
            RISK_DAILY_PNL.set(gauge_value(st.daily_pnl));

            let cfg = &self.config;
            let mut reason = None;
            if !st.breached && cfg.max_daily_loss > Decimal::ZERO && st.balance_init > Decimal::ZERO {
                let ratio = -st.daily_pnl / st.balance_init;
                if ratio > cfg.max_daily_loss {
                    reason = Some(RiskError::DailyLoss { ratio, limit: cfg.max_daily_loss });
                }
            }
            if reason.is_none()
                && !st.breached
                && cfg.max_position > Decimal::ZERO
                && st.position.abs() > cfg.max_position
            {
                reason = Some(RiskError::PositionBreach {
                    position: st.position,
                    limit: cfg.max_position,
                });
            }
            if reason.is_some() {
                st.breached = true;
            }
            reason.map(|r| (r, st.position, st.last_price))
        };
        if let Some((reason, position, price)) = breach {
            self.trigger_breach(&reason, position, price);
        }
        Ok(())
    }

    fn on_balance_init(&self, ev: &Event) -> Result<()> {
        let info = ev.as_balance_init()?;
        let mut st = self.state.lock();
        st.balance_init = info.balance;
        st.balance = info.balance;
        Ok(())
    }

    fn on_risk_limit(&self, ev: &Event) -> Result<()> {
        let limit = ev.as_risk_limit()?;
        self.state.lock().lever = limit.lever;
        Ok(())
    }

    // Called without the state lock: the cancel order re-enters on_order on a sync bus.
    fn trigger_cancel(&self, reason: &RiskError) {
        warn!(symbol = %self.symbol, %reason, "risk: cancel all");
        RISK_CANCELS.with_label_values(&[reason.label()]).inc();
        self.base.send(topic::ORDER, topic::ORDER, Payload::Order(TradeAction::cancel_all()));
        self.base.send(
            "risk",
            topic::NOTIFY,
            Payload::Notify(NotifyEvent::text("Risk Control", format!("Orders cancelled: {reason}"))),
        );
    }

    fn trigger_breach(&self, reason: &RiskError, position: Decimal, last_price: Decimal) {
        warn!(symbol = %self.symbol, %reason, %position, %last_price, "risk: BREACH, force close");
        RISK_BREACHES.inc();
        self.base.send(topic::ORDER, topic::ORDER, Payload::Order(TradeAction::cancel_all()));
        if !position.is_zero() {
            let kind = if position > Decimal::ZERO { TradeKind::CloseLong } else { TradeKind::CloseShort };
            let close = TradeAction::new(kind, last_price, position.abs())
                .with_id(RISK_CLOSE_ID)
                .with_symbol(self.symbol.clone())
                .with_time((self.clock)());
            self.base.send(topic::ORDER, topic::ORDER, Payload::Order(close));
        }
        self.base.send(
            "risk",
            topic::NOTIFY,
            Payload::Notify(NotifyEvent::text(
                "Risk Control - BREACH",
                format!("Risk limit breached: {reason}. All orders cancelled, position force closed."),
            )),
        );
    }
}

impl Processer for RiskManager {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.base.attach(bus);
        let name = self.base.name().to_string();
        bus.subscribe_weak(topic::TRADE, &name, &self, Self::on_trade);
        bus.subscribe_weak(topic::POSITION, &name, &self, Self::on_position);
        bus.subscribe_weak(topic::BALANCE, &name, &self, Self::on_balance);
        bus.subscribe_weak(topic::BALANCE_INIT, &name, &self, Self::on_balance_init);
        bus.subscribe_weak(topic::RISK_LIMIT, &name, &self, Self::on_risk_limit);
        bus.subscribe_weak(topic::ORDER, &name, &self, Self::on_order);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let c = &self.config;
        info!(
            symbol = %self.symbol,
            max_position = %c.max_position,
            max_daily_loss = %c.max_daily_loss,
            max_order_rate = c.max_order_rate,
            price_deviation = %c.price_deviation,
            "risk manager started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.base.mark_stopped() {
            return Ok(());
        }
        let st = self.state.lock();
        info!(
            trades = st.trade_count,
            rejects = st.reject_count,
            total_pnl = %st.total_pnl,
            "risk manager stats"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Balance, BalanceInfo, Position, RiskLimit, Side, Trade};
    use crate::processers::Processers;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration as StdDuration;

    #[derive(Default)]
    struct Collected {
        orders: Vec<TradeAction>,
        notifies: Vec<NotifyEvent>,
    }

    struct Pipeline {
        _ps: Processers,
        sender: Arc<BaseProcesser>,
        rm: Arc<RiskManager>,
        got: Arc<Mutex<Collected>>,
    }

    fn pipeline_with(rm: RiskManager) -> Pipeline {
        let ps = Processers::new_sync();
        let sender = Arc::new(BaseProcesser::new("sender"));
        let rm = Arc::new(rm);
        ps.add(sender.clone());
        ps.add(rm.clone());
        let got = Arc::new(Mutex::new(Collected::default()));
        let g = got.clone();
        ps.bus().subscribe(topic::ORDER, "collector", move |e| {
            g.lock().orders.push(e.as_order()?.clone());
            Ok(())
        });
        let g = got.clone();
        ps.bus().subscribe(topic::NOTIFY, "collector", move |e| {
            g.lock().notifies.push(e.as_notify()?.clone());
            Ok(())
        });
        ps.start().unwrap();
        Pipeline { _ps: ps, sender, rm, got }
    }

    fn pipeline(cfg: RiskConfig) -> Pipeline {
        pipeline_with(RiskManager::new("BTCUSDT", cfg))
    }

    impl Pipeline {
        fn order(&self, kind: TradeKind, amount: Decimal, price: Decimal) {
            self.sender.send("order", topic::ORDER, Payload::Order(TradeAction::new(kind, price, amount)));
        }

        fn balance_init(&self, balance: Decimal) {
            self.sender.send(
                "balance_init",
                topic::BALANCE_INIT,
                Payload::BalanceInit(BalanceInfo { balance, fee: Decimal::ZERO }),
            );
        }

        fn balance(&self, balance: Decimal) {
            self.sender.send(
                "balance",
                topic::BALANCE,
                Payload::Balance(Balance { currency: String::new(), balance }),
            );
        }

        fn position(&self, hold: Decimal, price: Decimal) {
            self.sender.send("position", topic::POSITION, Payload::Position(Position::new("BTCUSDT", hold, price)));
        }

        fn trade(&self, price: Decimal) {
            let tr = Trade {
                id: "t".into(),
                kind: TradeKind::OpenLong,
                time: Utc::now(),
                price,
                amount: dec!(1),
                side: Side::Buy,
                remark: String::new(),
            };
            self.sender.send("trade", topic::TRADE, Payload::Trade(tr));
        }

        fn count(&self, kind: TradeKind) -> usize {
            self.got.lock().orders.iter().filter(|o| o.kind == kind).count()
        }
    }

    /// Runs `f` on another thread and fails if it does not return in time.
    fn no_deadlock<F: FnOnce() + Send + 'static>(f: F) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            f();
            let _ = tx.send(());
        });
        rx.recv_timeout(StdDuration::from_secs(3)).expect("DEADLOCK: handler re-entered while locked");
    }

    #[test]
    fn test_new_risk_manager() {
        let cfg = RiskConfig {
            max_position: dec!(10),
            max_daily_loss: dec!(0.1),
            max_order_rate: 60,
            price_deviation: dec!(0.05),
        };
        let rm = RiskManager::new("BTCUSDT", cfg.clone());
        assert_eq!(rm.name(), "risk");
        assert_eq!(rm.config(), &cfg);
        assert!(!rm.breached());
    }

    #[test]
    fn test_sync_no_deadlock_order_rate_limit() {
        let p = Arc::new(pipeline(RiskConfig { max_order_rate: 2, ..Default::default() }));
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        let p2 = p.clone();
        no_deadlock(move || p2.order(TradeKind::OpenLong, dec!(1), dec!(100)));
        assert_eq!(p.count(TradeKind::CancelAll), 1);
    }

    #[test]
    fn test_sync_no_deadlock_daily_loss_breach() {
        let p = Arc::new(pipeline(RiskConfig { max_daily_loss: dec!(0.05), ..Default::default() }));
        p.balance_init(dec!(100000));
        p.position(dec!(5), dec!(50000));
        let p2 = p.clone();
        no_deadlock(move || p2.balance(dec!(94000)));
        assert_eq!(p.count(TradeKind::CancelAll), 1);
        assert_eq!(p.count(TradeKind::CloseLong), 1);
    }

    #[test]
    fn test_order_rate_limit() {
        let p = pipeline(RiskConfig { max_order_rate: 3, ..Default::default() });
        for _ in 0..3 {
            p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        }
        assert_eq!(p.rm.reject_count(), 0);
        assert_eq!(p.count(TradeKind::CancelAll), 0);

        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        assert_eq!(p.rm.reject_count(), 1);
        assert_eq!(p.count(TradeKind::CancelAll), 1);
        // not a breach: orders keep flowing
        assert!(!p.rm.breached());
    }

    #[test]
    fn test_order_rate_window_slides() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()));
        let n = now.clone();
        let rm = RiskManager::new("BTCUSDT", RiskConfig { max_order_rate: 2, ..Default::default() })
            .with_clock(Arc::new(move || *n.lock()));
        let p = pipeline_with(rm);
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        *now.lock() += Duration::seconds(61);
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        assert_eq!(p.rm.reject_count(), 0);
    }

    #[test]
    fn test_position_limit_pre_check() {
        let p = pipeline(RiskConfig { max_position: dec!(5), ..Default::default() });
        p.position(dec!(4), dec!(100));
        p.order(TradeKind::OpenLong, dec!(2), dec!(100));
        assert_eq!(p.rm.reject_count(), 1);
        assert_eq!(p.count(TradeKind::CancelAll), 1);
    }

    #[test]
    fn test_position_limit_allows_within_limit() {
        let p = pipeline(RiskConfig { max_position: dec!(5), ..Default::default() });
        p.position(dec!(3), dec!(100));
        p.order(TradeKind::OpenLong, dec!(1.5), dec!(100));
        assert_eq!(p.rm.reject_count(), 0);
    }

    #[test]
    fn test_short_open_reduces_estimate() {
        let p = pipeline(RiskConfig { max_position: dec!(5), ..Default::default() });
        p.position(dec!(4), dec!(100));
        p.order(TradeKind::OpenShort, dec!(2), dec!(100));
        assert_eq!(p.rm.reject_count(), 0);
        p.order(TradeKind::OpenShort, dec!(10), dec!(100));
        assert_eq!(p.rm.reject_count(), 1);
    }

    #[test]
    fn test_price_deviation() {
        let p = pipeline(RiskConfig { price_deviation: dec!(0.05), ..Default::default() });
        p.trade(dec!(100));
        p.order(TradeKind::OpenLong, dec!(1), dec!(106.1));
        assert_eq!(p.rm.reject_count(), 1);
        assert_eq!(p.count(TradeKind::CancelAll), 1);
    }

    #[test]
    fn test_price_deviation_within_limit() {
        let p = pipeline(RiskConfig { price_deviation: dec!(0.05), ..Default::default() });
        p.trade(dec!(100));
        p.order(TradeKind::OpenLong, dec!(1), dec!(103));
        assert_eq!(p.rm.reject_count(), 0);
    }

    #[test]
    fn test_daily_loss_breach() {
        let p = pipeline(RiskConfig { max_daily_loss: dec!(0.1), ..Default::default() });
        p.balance_init(dec!(100000));
        p.position(dec!(2), dec!(50000));
        p.balance(dec!(89000));
        assert!(p.rm.breached());
        assert_eq!(p.count(TradeKind::CancelAll), 1);

        let got = p.got.lock();
        let close: Vec<_> = got.orders.iter().filter(|o| o.kind == TradeKind::CloseLong).collect();
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].symbol, "BTCUSDT");
        assert_eq!(close[0].id, RISK_CLOSE_ID);
        assert_eq!(close[0].amount, dec!(2));
        assert_eq!(close[0].price, dec!(50000));
        assert!(!got.notifies.is_empty());
        assert!(got.notifies[0].content.contains("daily loss"));
    }

    #[test]
    fn test_daily_loss_breach_short_position() {
        let p = pipeline(RiskConfig { max_daily_loss: dec!(0.05), ..Default::default() });
        p.balance_init(dec!(100000));
        p.position(dec!(-3), dec!(50000));
        p.balance(dec!(94000));
        assert!(p.rm.breached());
        assert_eq!(p.count(TradeKind::CloseShort), 1);
    }

    #[test]
    fn test_no_breach_within_limit() {
        let p = pipeline(RiskConfig { max_daily_loss: dec!(0.1), ..Default::default() });
        p.balance_init(dec!(100000));
        p.balance(dec!(95000));
        assert!(!p.rm.breached());
        assert_eq!(p.rm.daily_pnl(), dec!(-5000));
    }

    #[test]
    fn test_cancel_all_skipped() {
        let p = pipeline(RiskConfig { max_order_rate: 1, ..Default::default() });
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        p.sender.send("cancel", topic::ORDER, Payload::Order(TradeAction::cancel_all()));
        p.sender.send("cancel", topic::ORDER, Payload::Order(TradeAction::cancel_one("x")));
        assert_eq!(p.rm.reject_count(), 0);
    }

    #[test]
    fn test_breached_stops_monitoring() {
        let p = pipeline(RiskConfig {
            max_daily_loss: dec!(0.05),
            max_position: dec!(100),
            max_order_rate: 1,
            ..Default::default()
        });
        p.balance_init(dec!(100000));
        p.position(dec!(2), dec!(50000));
        p.balance(dec!(94000));
        assert!(p.rm.breached());

        let before = p.rm.reject_count();
        for _ in 0..5 {
            p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        }
        assert_eq!(p.rm.reject_count(), before);
    }

    #[test]
    fn test_breach_resets_on_next_day() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap()));
        let n = now.clone();
        let rm = RiskManager::new("BTCUSDT", RiskConfig { max_daily_loss: dec!(0.05), max_order_rate: 1, ..Default::default() })
            .with_clock(Arc::new(move || *n.lock()));
        let p = pipeline_with(rm);
        p.balance_init(dec!(1000));
        p.balance(dec!(900));
        assert!(p.rm.breached());

        // same day: still breached
        p.trade(dec!(100));
        assert!(p.rm.breached());

        *now.lock() += Duration::minutes(2);
        p.trade(dec!(100));
        assert!(!p.rm.breached());
        assert_eq!(p.rm.daily_pnl(), Decimal::ZERO);

        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        assert_eq!(p.rm.reject_count(), 1);
    }

    #[test]
    fn test_trade_updates_price_and_count() {
        let p = pipeline(RiskConfig::default());
        p.trade(dec!(42000));
        assert_eq!(p.rm.last_price(), dec!(42000));
        assert_eq!(p.rm.trade_count(), 1);
    }

    #[test]
    fn test_balance_init_sets_state() {
        let p = pipeline(RiskConfig::default());
        p.balance_init(dec!(50000));
        assert_eq!(p.rm.balance_init(), dec!(50000));
        assert_eq!(p.rm.balance(), dec!(50000));
    }

    #[test]
    fn test_risk_limit_sets_lever() {
        let p = pipeline(RiskConfig::default());
        p.sender.send(
            "risk",
            topic::RISK_LIMIT,
            Payload::RiskLimit(RiskLimit { code: String::new(), lever: dec!(10), max_lost_ratio: Decimal::ZERO }),
        );
        assert_eq!(p.rm.lever(), dec!(10));
    }

    #[test]
    fn test_position_breach_on_balance_update() {
        let p = pipeline(RiskConfig { max_position: dec!(5), ..Default::default() });
        p.balance_init(dec!(100000));
        p.position(dec!(8), dec!(100));
        p.balance(dec!(100000));
        assert!(p.rm.breached());
        assert_eq!(p.count(TradeKind::CancelAll), 1);
        assert_eq!(p.count(TradeKind::CloseLong), 1);
    }

    #[test]
    fn test_mixed_traffic_counts() {
        let p = pipeline(RiskConfig {
            max_position: dec!(100),
            max_daily_loss: dec!(0.5),
            max_order_rate: 1000,
            price_deviation: dec!(0.5),
        });
        p.balance_init(dec!(100000));
        p.trade(dec!(100));
        for i in 0..100 {
            let i = Decimal::from(i);
            p.order(TradeKind::OpenLong, dec!(0.1), dec!(100) + i * dec!(0.01));
            p.balance(dec!(100000) - i * dec!(10));
            p.position(i * dec!(0.1), dec!(100));
            p.trade(dec!(100) + i * dec!(0.01));
        }
        assert_eq!(p.rm.trade_count(), 101);
        assert_eq!(p.rm.reject_count(), 0);
        assert!(!p.rm.breached());
    }

    #[test]
    fn test_stop_logs_stats_once() {
        let p = pipeline(RiskConfig { max_order_rate: 1, ..Default::default() });
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        p.order(TradeKind::OpenLong, dec!(1), dec!(100));
        assert_eq!(p.rm.reject_count(), 1);
        p.rm.stop().unwrap();
        p.rm.stop().unwrap();
    }

    #[test]
    fn test_close_order_not_checked_by_position_limit() {
        let p = pipeline(RiskConfig { max_position: dec!(5), ..Default::default() });
        p.position(dec!(4), dec!(100));
        p.order(TradeKind::CloseLong, dec!(10), dec!(100));
        assert_eq!(p.rm.reject_count(), 0);
    }

    #[test]
    fn test_zero_config_disables_all_checks() {
        let p = pipeline(RiskConfig::default());
        p.balance_init(dec!(100000));
        p.trade(dec!(100));
        for _ in 0..100 {
            p.order(TradeKind::OpenLong, dec!(1000), dec!(999));
        }
        p.balance(dec!(1));
        assert_eq!(p.rm.reject_count(), 0);
        assert!(!p.rm.breached());
    }
}

// ===============================
// tests/pipeline.rs
// ===============================
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};

use simtrade_rust::domain::{BalanceInfo, Candle, CandleParam, TradeAction, TradeKind, WatchParam};
use simtrade_rust::event::{topic, Event, Payload};
use simtrade_rust::feed::CandleFeed;
use simtrade_rust::ledger::Ledger;
use simtrade_rust::processer::BaseProcesser;
use simtrade_rust::processers::Processers;
use simtrade_rust::risk::{RiskConfig, RiskManager};
use simtrade_rust::strategy::{Strategy, StrategyContext, StrategyProcesser};
use simtrade_rust::vex::VirtualExchange;
use simtrade_rust::Result;

const SYM: &str = "BTCUSDT";

fn candle(start: i64, low: Decimal, high: Decimal, close: Decimal) -> Candle {
    Candle { start, open: close, high, low, close, volume: dec!(1), turnover: close, trades: 1 }
}

/// Sends the planned order on the n-th 1m candle.
struct Script {
    step: usize,
    plan: Vec<(usize, TradeKind, Decimal, Decimal)>,
}

impl Strategy for Script {
    fn name(&self) -> &str {
        "script"
    }

    fn on_candle(&mut self, ctx: &mut StrategyContext, _c: &Candle, bin: &str) -> Result<()> {
        if bin != "1m" {
            return Ok(());
        }
        for (_, kind, price, amount) in self.plan.iter().filter(|p| p.0 == self.step) {
            match kind {
                TradeKind::OpenLong => ctx.open_long(*price, *amount),
                TradeKind::CloseLong => ctx.close_long(*price, *amount),
                TradeKind::OpenShort => ctx.open_short(*price, *amount),
                TradeKind::CloseShort => ctx.close_short(*price, *amount),
                TradeKind::StopLong => ctx.stop_long(*price, *amount),
                TradeKind::StopShort => ctx.stop_short(*price, *amount),
                TradeKind::CancelAll => ctx.cancel_all(),
                TradeKind::CancelOne => {}
            }
        }
        self.step += 1;
        Ok(())
    }
}

struct Backtest {
    ps: Processers,
    feed: Arc<CandleFeed>,
    vex: Arc<VirtualExchange>,
    risk: Arc<RiskManager>,
    driver: Arc<BaseProcesser>,
}

fn backtest(candles: Vec<Candle>, plan: Vec<(usize, TradeKind, Decimal, Decimal)>, risk: RiskConfig) -> Backtest {
    let ps = Processers::new_sync();
    let feed = Arc::new(CandleFeed::new(SYM, candles));
    let vex = Arc::new(VirtualExchange::with_ledger(SYM, Ledger::new(dec!(1000), Decimal::ZERO)));
    let risk = Arc::new(RiskManager::new(SYM, risk));
    let strat = Arc::new(StrategyProcesser::new(SYM, Box::new(Script { step: 0, plan })));
    let driver = Arc::new(BaseProcesser::new("driver"));
    ps.add(feed.clone());
    ps.add(vex.clone());
    ps.add(risk.clone());
    ps.add(strat);
    ps.add(driver.clone());
    ps.start().unwrap();
    driver.send(SYM, topic::BALANCE_INIT, Payload::BalanceInit(BalanceInfo { balance: dec!(1000), fee: Decimal::ZERO }));
    Backtest { ps, feed, vex, risk, driver }
}

impl Backtest {
    fn replay(&self) -> usize {
        let (start, end) = self.feed.range().unwrap();
        let param = CandleParam { start, end, exchange: String::new(), bin_size: "1m".into(), symbol: SYM.into() };
        let done = self.feed.done();
        self.driver.send("watch", topic::WATCH, Payload::Watch(WatchParam::candle(param)));
        done.recv_timeout(Duration::from_secs(2)).unwrap()
    }
}

#[test]
fn test_sync_long_round_trip() {
    let candles = vec![
        candle(0, dec!(100), dec!(100), dec!(100)),
        candle(60, dec!(99), dec!(111), dec!(110)),
        candle(120, dec!(105), dec!(115), dec!(110)),
    ];
    let plan = vec![
        (0, TradeKind::OpenLong, dec!(100), dec!(1)),
        (1, TradeKind::CloseLong, dec!(110), dec!(1)),
    ];
    let bt = backtest(candles, plan, RiskConfig::default());
    let balances = Arc::new(Mutex::new(Vec::new()));
    let b = balances.clone();
    bt.ps.bus().subscribe(topic::BALANCE, "tap", move |e| {
        b.lock().push(e.as_balance()?.balance);
        Ok(())
    });

    assert_eq!(bt.replay(), 3);

    let trades = bt.vex.trades();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].time.timestamp(), 61);
    assert_eq!(trades[1].time.timestamp(), 121);
    assert_eq!(trades[0].remark, "vex-1");
    assert_eq!(bt.vex.position(), Decimal::ZERO);
    assert_eq!(bt.vex.balance(), dec!(1010));
    // equity only moves on the round trip
    assert_eq!(*balances.lock(), vec![dec!(1000), dec!(1010)]);
    assert_eq!(bt.risk.trade_count(), 2);
    assert_eq!(bt.risk.total_pnl(), dec!(10));

    bt.ps.stop().unwrap();
    bt.ps.wait_close(Duration::from_millis(10));
}

#[test]
fn test_risk_cancel_on_order_does_not_deadlock() {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let candles = vec![
            candle(0, dec!(100), dec!(100), dec!(100)),
            candle(60, dec!(90), dec!(110), dec!(100)),
        ];
        let plan = vec![(0, TradeKind::OpenLong, dec!(100), dec!(1))];
        let cfg = RiskConfig { max_position: dec!(0.5), ..Default::default() };
        let bt = backtest(candles, plan, cfg);
        let notes = Arc::new(Mutex::new(0usize));
        let n = notes.clone();
        bt.ps.bus().subscribe(topic::NOTIFY, "tap", move |_| {
            *n.lock() += 1;
            Ok(())
        });
        bt.replay();
        tx.send((bt.vex.trades().len(), bt.vex.pending().len(), bt.risk.reject_count(), *notes.lock()))
            .ok();
    });
    let (trades, pending, rejects, notes) = rx.recv_timeout(Duration::from_secs(3)).expect("pipeline deadlocked");
    assert_eq!(trades, 0);
    assert_eq!(pending, 0);
    assert_eq!(rejects, 1);
    assert_eq!(notes, 1);
}

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn forward(tx: Sender<Decimal>) -> impl Fn(&Event) -> Result<()> + Send + Sync + 'static {
    move |e: &Event| {
        tx.send(e.as_trade()?.price).ok();
        Ok(())
    }
}

#[test]
fn test_concurrent_pipeline() {
    let ps = Processers::new(64);
    let vex = Arc::new(VirtualExchange::with_ledger(SYM, Ledger::new(dec!(1000), Decimal::ZERO)));
    let risk = Arc::new(RiskManager::new(SYM, RiskConfig::default()));
    let driver = Arc::new(BaseProcesser::new("driver"));
    ps.add(vex.clone());
    ps.add(risk.clone());
    ps.add(driver.clone());
    let (tx, rx) = unbounded();
    ps.bus().subscribe(topic::TRADE, "tap", forward(tx));
    ps.start().unwrap();

    driver.send(SYM, topic::BALANCE_INIT, Payload::BalanceInit(BalanceInfo { balance: dec!(1000), fee: Decimal::ZERO }));

    driver.send(SYM, topic::ORDER, Payload::Order(TradeAction::new(TradeKind::OpenLong, dec!(100), dec!(1))));
    assert!(wait_until(Duration::from_secs(2), || vex.pending().len() == 1));
    driver.send_with_extra(SYM, topic::CANDLE, "1m", Payload::Candle(candle(0, dec!(95), dec!(105), dec!(101))));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), dec!(100));

    driver.send(SYM, topic::ORDER, Payload::Order(TradeAction::new(TradeKind::CloseLong, dec!(103), dec!(1))));
    assert!(wait_until(Duration::from_secs(2), || vex.pending().len() == 1));
    driver.send_with_extra(SYM, topic::CANDLE, "1m", Payload::Candle(candle(60, dec!(100), dec!(106), dec!(104))));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), dec!(103));

    assert_eq!(vex.balance(), dec!(1003));
    assert!(wait_until(Duration::from_secs(2), || risk.trade_count() == 2));
    assert!(wait_until(Duration::from_secs(2), || risk.total_pnl() == dec!(3)));

    ps.stop().unwrap();
    ps.wait_close(Duration::from_secs(1));
    assert!(ps.bus().is_closed());
}

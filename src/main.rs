// ===============================
// src/main.rs
// ===============================
/*
 cargo run --release -- --strategy ma_cross --strategy-params '{"fast":8,"slow":32}'
 CANDLE_CSV=data/btc_1m.csv MAX_DAILY_LOSS=0.05 RECORD_FILE=out/events.jsonl cargo run

 curl -s localhost:9898/metrics | egrep '^(vex_|risk_|strategy_)'
*/
/*
=============================================================================
Project : simtrade_rust: event-bus backtest core in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Candle replay (CSV / mock random walk) driving a virtual exchange,
          pluggable strategies, fee-aware ledger, risk guard with forced
          close, Prometheus metrics, and JSONL event recording.
=============================================================================
*/
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use simtrade_rust::domain::{BalanceInfo, CandleParam, WatchParam};
use simtrade_rust::event::{topic, Payload};
use simtrade_rust::feed::{self, CandleFeed};
use simtrade_rust::ledger::Ledger;
use simtrade_rust::notify::NotifySink;
use simtrade_rust::processer::{BaseProcesser, Processer};
use simtrade_rust::processers::Processers;
use simtrade_rust::recorder::{self, RecorderProcesser};
use simtrade_rust::risk::RiskManager;
use simtrade_rust::strategy::{StrategyProcesser, StrategyRegistry};
use simtrade_rust::vex::{VirtualExchange, MATCH_BIN};
use simtrade_rust::{config, metrics, Result};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "backtest failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // ---- Load config & limits ----
    let (args, risk_cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    if args.metrics_port != 0 {
        metrics::serve_metrics(args.metrics_port);
    }

    // ---- Candles ----
    let candles = match &args.candle_csv {
        Some(path) => feed::load_csv(path)?,
        None => {
            let start = Utc::now() - ChronoDuration::minutes(args.mock_candles as i64);
            feed::mock_candles(args.mock_candles, start, args.mock_price, args.mock_seed)
        }
    };
    let strategy = StrategyRegistry::default().create(&args.strategy, &args.strategy_params()?)?;

    info!(
        symbol = %args.symbol,
        candles = candles.len(),
        strategy = %args.strategy,
        bus = ?args.bus,
        balance = %args.balance,
        fee = %args.fee,
        "startup config"
    );

    // ---- Processers (stop runs in reverse) ----
    let ps = Processers::with_mode(args.bus_mode());
    ps.set_error_callback(|e| error!(error = %e, "fatal, shutting down"));

    let feed = Arc::new(CandleFeed::new(args.symbol.clone(), candles).with_bins(args.bin_sizes()?));
    let vex = Arc::new(VirtualExchange::with_ledger(args.symbol.clone(), Ledger::new(args.balance, args.fee)));
    let risk = Arc::new(RiskManager::new(args.symbol.clone(), risk_cfg));
    let strat = Arc::new(StrategyProcesser::new(args.symbol.clone(), strategy));
    let notify = Arc::new(NotifySink::new(args.notify_config()));
    let driver = Arc::new(BaseProcesser::new("backtest"));

    ps.add(feed.clone());
    ps.add(vex.clone());
    ps.add(risk.clone());
    ps.add(strat.clone());
    ps.add(notify.clone());

    // ---- Recorder (optional) ----
    let writer = match args.record_file.clone() {
        Some(path) => {
            let (rec, rx) = RecorderProcesser::new(args.record_topics(), 8192);
            ps.add(Arc::new(rec));
            Some(tokio::spawn(recorder::run(rx, path)))
        }
        None => None,
    };
    ps.add(driver.clone());

    ps.start()?;

    driver.send(
        &args.symbol,
        topic::BALANCE_INIT,
        Payload::BalanceInit(BalanceInfo { balance: args.balance, fee: args.fee }),
    );

    // ---- Replay ----
    if let Some((start, end)) = feed.range() {
        let param = CandleParam {
            start,
            end,
            exchange: "vex".into(),
            bin_size: MATCH_BIN.into(),
            symbol: args.symbol.clone(),
        };
        let done = feed.done();
        let d = driver.clone();
        // sync bus replays inline on the publishing thread
        let replay = tokio::task::spawn_blocking(move || {
            d.send("watch", topic::WATCH, Payload::Watch(WatchParam::candle(param)));
            loop {
                match done.recv_timeout(Duration::from_millis(200)) {
                    Ok(n) => return Some(n),
                    Err(_) if d.is_stopped() => return None,
                    Err(_) => {}
                }
            }
        });
        select! {
            r = replay => match r {
                Ok(Some(n)) => info!(candles = n, "replay finished"),
                Ok(None) => warn!("replay interrupted"),
                Err(e) => error!(error = %e, "replay task failed"),
            },
            _ = tokio::signal::ctrl_c() => warn!("ctrl-c, stopping"),
        }
    } else {
        warn!("no candles to replay");
    }

    // ---- Settle & shutdown ----
    let grace = args.drain_grace();
    if !ps.bus().wait_idle(grace) {
        warn!(in_flight = ps.bus().in_flight(), "candle backlog not settled before close_all");
    }
    if let Err(e) = vex.close_all() {
        warn!(error = %e, "close_all failed");
    }
    ps.bus().wait_idle(grace);

    info!(
        trades = vex.trades().len(),
        balance = %vex.balance(),
        equity = %vex.equity(),
        fee_total = %vex.fee_total(),
        risk_rejects = risk.reject_count(),
        total_pnl = %risk.total_pnl(),
        breached = risk.breached(),
        "backtest summary"
    );

    if let Err(e) = ps.stop() {
        warn!(error = %e, "stop reported errors");
    }
    ps.wait_close(grace);

    if let Some(h) = writer {
        match h.await {
            Ok(Ok(n)) => info!(lines = n, "recorder flushed"),
            Ok(Err(e)) => warn!(error = %e, "recorder failed"),
            Err(e) => warn!(error = %e, "recorder task failed"),
        }
    }
    info!(strategy = %strat.name(), "done");
    Ok(())
}

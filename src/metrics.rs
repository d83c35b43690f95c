// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Bus --------
pub static EVENTS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_events_published_total", "events accepted by the bus"),
        &["topic"],
    )
    .expect("bus_events_published_total")
});

pub static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "bus_events_dropped_total",
            "events dropped (no subscriber, bus not started or closed)",
        ),
        &["topic"],
    )
    .expect("bus_events_dropped_total")
});

pub static HANDLER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_handler_errors_total", "subscriber callbacks that returned Err"),
        &["topic"],
    )
    .expect("bus_handler_errors_total")
});

// -------- Virtual exchange --------
pub static ORDERS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("vex_orders_total", "orders queued by the virtual exchange")
        .expect("vex_orders_total")
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("vex_fills_total", "simulated fills"), &["kind"])
        .expect("vex_fills_total")
});

pub static REJECTED_FILLS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "vex_rejected_fills_total",
        "fills skipped because the ledger refused them",
    )
    .expect("vex_rejected_fills_total")
});

pub static BALANCE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("ledger_balance", "ledger total per symbol"), &["symbol"])
        .expect("ledger_balance")
});

pub static POSITION: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("ledger_position", "signed net position"), &["symbol"])
        .expect("ledger_position")
});

// -------- Risk --------
pub static RISK_CANCELS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_cancels_total", "cancel-all commands issued by the risk guard"),
        &["reason"],
    )
    .expect("risk_cancels_total")
});

pub static RISK_BREACHES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("risk_breaches_total", "daily breaches with forced close")
        .expect("risk_breaches_total")
});

pub static RISK_DAILY_PNL: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("risk_daily_pnl", "realized PnL since the last UTC day boundary")
        .expect("risk_daily_pnl")
});

// -------- Strategy --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("strategy_actions_total", "orders queued by strategies"),
        &["strategy"],
    )
    .expect("strategy_actions_total")
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(EVENTS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(HANDLER_ERRORS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(REJECTED_FILLS.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(POSITION.clone())),
        REGISTRY.register(Box::new(RISK_CANCELS.clone())),
        REGISTRY.register(Box::new(RISK_BREACHES.clone())),
        REGISTRY.register(Box::new(RISK_DAILY_PNL.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
    ] {
        // AlreadyReg on a second init is fine
        let _ = m;
    }
}

/// Decimal -> f64 for gauges; lossy, display only.
pub fn gauge_value(v: Decimal) -> f64 {
    v.to_f64().unwrap_or_default()
}

/// Registry snapshot in Prometheus text format.
pub fn encode_metrics() -> Vec<u8> {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

/// Full HTTP/1.1 reply for the request line `GET <path> ...`.
fn render_response(request: &str) -> Vec<u8> {
    let path = request.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = match path.split('?').next().unwrap_or(path) {
        "/" | "/metrics" => ("200 OK", encode_metrics()),
        _ => ("404 Not Found", b"not found\n".to_vec()),
    };
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(&body);
    out
}

fn respond(mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut req = [0u8; 1024];
    let n = stream.read(&mut req)?;
    let head = String::from_utf8_lossy(&req[..n]);
    let line = head.lines().next().unwrap_or_default();
    stream.write_all(&render_response(line))?;
    stream.flush()
}

/// Run the metrics responder on its own OS thread.
pub fn serve_metrics(port: u16) {
    let spawned = thread::Builder::new()
        .name("metrics".into())
        .spawn(move || {
            let addr = format!("0.0.0.0:{port}");
            let listener = match TcpListener::bind(&addr) {
                Ok(l) => l,
                Err(e) => {
                    error!(%addr, error = %e, "metrics bind failed");
                    return;
                }
            };
            info!("metrics listening on http://{addr}/metrics");

            for conn in listener.incoming() {
                match conn {
                    Ok(stream) => {
                        if let Err(e) = respond(stream) {
                            debug!(error = %e, "metrics client error");
                        }
                    }
                    Err(e) => warn!(error = %e, "metrics accept error"),
                }
            }
        });
    if let Err(e) = spawned {
        error!(error = %e, "metrics thread spawn failed");
    }
}

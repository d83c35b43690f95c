// ===============================
// src/vex.rs
// ===============================
//
// Virtual exchange: candle-driven fill simulation for backtests.
//
// Lock discipline: every handler mutates state and builds its outgoing
// events while holding `state`, drops the guard, then publishes. A sync-bus
// subscriber that reacts to a fill by sending an order back here must find
// the lock free.
//
use chrono::Duration;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::domain::{Balance, Candle, Position, Side, Trade, TradeAction, TradeKind};
use crate::error::Result;
use crate::event::{topic, Event, Payload};
use crate::ledger::Ledger;
use crate::metrics::{gauge_value, BALANCE, FILLS, ORDERS, POSITION, REJECTED_FILLS};
use crate::processer::{BaseProcesser, Processer};

/// Only this bin drives matching.
pub const MATCH_BIN: &str = "1m";

#[derive(Debug, Default)]
struct ExchangeState {
    candle: Option<Candle>,
    // orders received since the current candle
    order_index: i64,
    orders: VecDeque<TradeAction>,
    ledger: Ledger,
    position: Decimal,
    trades: Vec<Trade>,
    next_order_id: u64,
}

impl ExchangeState {
    /// A close/stop order must oppose the current net position.
    fn can_reduce(&self, kind: TradeKind) -> bool {
        if self.position.is_zero() {
            return false;
        }
        let long = self.position > Decimal::ZERO;
        long != kind.is_buy()
    }
}

pub struct VirtualExchange {
    base: BaseProcesser,
    symbol: String,
    state: Mutex<ExchangeState>,
}

impl VirtualExchange {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_ledger(symbol, Ledger::default())
    }

    pub fn with_ledger(symbol: impl Into<String>, ledger: Ledger) -> Self {
        Self {
            base: BaseProcesser::new("vexchange"),
            symbol: symbol.into(),
            state: Mutex::new(ExchangeState { ledger, ..Default::default() }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn position(&self) -> Decimal {
        self.state.lock().position
    }

    /// Free balance (ledger total).
    pub fn balance(&self) -> Decimal {
        self.state.lock().ledger.total()
    }

    pub fn equity(&self) -> Decimal {
        self.state.lock().ledger.equity()
    }

    pub fn fee_total(&self) -> Decimal {
        self.state.lock().ledger.fee_total()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.state.lock().trades.clone()
    }

    pub fn pending(&self) -> Vec<TradeAction> {
        self.state.lock().orders.iter().cloned().collect()
    }

    fn balance_event(&self, ledger: &Ledger) -> Event {
        BALANCE.with_label_values(&[self.symbol.as_str()]).set(gauge_value(ledger.equity()));
        self.base.create_event(
            &self.symbol,
            topic::BALANCE,
            Payload::Balance(Balance { currency: self.symbol.clone(), balance: ledger.equity() }),
        )
    }

    fn position_event(&self, st: &ExchangeState, last_price: Decimal) -> Event {
        POSITION.with_label_values(&[self.symbol.as_str()]).set(gauge_value(st.position));
        let mut pos = Position::new(self.symbol.clone(), st.position, last_price);
        let entry = st.ledger.entry_price();
        if let (Some(c), false) = (&st.candle, entry.is_zero()) {
            let ratio = (c.close - entry) / entry;
            pos.profit_ratio = if st.position < Decimal::ZERO { -ratio } else { ratio };
        }
        self.base.create_event(&self.symbol, topic::POSITION, Payload::Position(pos))
    }

    /// One matching pass over the queue, FIFO. Returns the events to publish
    /// once the caller has released the lock.
    fn match_orders(&self, st: &mut ExchangeState) -> Vec<Event> {
        let Some(candle) = st.candle.clone() else { return Vec::new() };
        if st.orders.is_empty() {
            return Vec::new();
        }
        let open_time = candle.time();
        let mut filled: Vec<Trade> = Vec::new();
        let mut keep = VecDeque::with_capacity(st.orders.len());

        for order in std::mem::take(&mut st.orders) {
            if !order.kind.is_open() && !st.can_reduce(order.kind) {
                keep.push_back(order);
                continue;
            }
            if !candle.touches(order.price) {
                keep.push_back(order);
                continue;
            }
            let Some(side) = order.kind.side() else {
                warn!(kind = %order.kind, "unsupported action in queue");
                continue;
            };
            let trade = Trade {
                id: st.trades.len().to_string(),
                kind: order.kind,
                time: open_time + Duration::seconds(filled.len() as i64 + 1),
                price: order.price,
                amount: order.amount,
                side,
                remark: order.id.clone(),
            };
            match st.ledger.add_trade(&trade) {
                Ok(profit) => {
                    st.position = st.ledger.position();
                    st.trades.push(trade.clone());
                    FILLS.with_label_values(&[&order.kind.to_string()]).inc();
                    debug!(id = %trade.id, kind = %trade.kind, price = %trade.price, amount = %trade.amount, %profit, "fill");
                    filled.push(trade);
                }
                Err(e) => {
                    REJECTED_FILLS.inc();
                    debug!(order = %order.id, error = %e, "fill skipped");
                    keep.push_back(order);
                }
            }
        }
        st.orders = keep;

        let Some(last) = filled.last().map(|t| t.price) else { return Vec::new() };
        // chronological: earliest fill first
        let mut out: Vec<Event> = filled
            .into_iter()
            .map(|t| self.base.create_event("trade", topic::TRADE, Payload::Trade(t)))
            .collect();
        out.push(self.position_event(st, last));
        out.push(self.balance_event(&st.ledger));
        out
    }

    fn publish_all(&self, events: Vec<Event>) {
        for ev in events {
            self.base.publish(ev);
        }
    }

    fn on_candle(&self, ev: &Event) -> Result<()> {
        let candle = ev.as_candle()?;
        if ev.is_recent() || ev.extra() != Some(MATCH_BIN) {
            return Ok(());
        }
        let events = {
            let mut st = self.state.lock();
            st.candle = Some(candle.clone());
            st.order_index = 0;
            self.match_orders(&mut st)
        };
        self.publish_all(events);
        Ok(())
    }

    fn on_order(&self, ev: &Event) -> Result<()> {
        let mut act = ev.as_order()?.clone();
        if !act.symbol.is_empty() && act.symbol != self.symbol {
            debug!(symbol = %act.symbol, "order for another symbol ignored");
            return Ok(());
        }
        let mut st = self.state.lock();
        match act.kind {
            TradeKind::CancelAll => {
                let dropped = st.orders.len();
                st.orders.clear();
                info!(dropped, "cancel all");
                return Ok(());
            }
            TradeKind::CancelOne => {
                match st.orders.iter().position(|o| o.id == act.id) {
                    Some(i) => {
                        st.orders.remove(i);
                        debug!(id = %act.id, "order cancelled");
                    }
                    None => debug!(id = %act.id, "cancel for unknown order"),
                }
                return Ok(());
            }
            _ => {}
        }
        if act.amount <= Decimal::ZERO {
            warn!(kind = %act.kind, amount = %act.amount, "order with non-positive amount dropped");
            return Ok(());
        }
        if let Some(c) = &st.candle {
            act.time = c.time() + Duration::seconds(st.order_index);
            let instant = match act.kind {
                TradeKind::StopLong => act.price >= c.close,
                TradeKind::StopShort => act.price <= c.close,
                _ => false,
            };
            if instant {
                warn!(kind = %act.kind, price = %act.price, close = %c.close, "invalid stop order");
                return Ok(());
            }
        }
        if act.id.is_empty() {
            st.next_order_id += 1;
            act.id = format!("vex-{}", st.next_order_id);
        }
        st.order_index += 1;
        st.orders.push_back(act);
        ORDERS.inc();
        Ok(())
    }

    fn on_cancel_all(&self, _ev: &Event) -> Result<()> {
        let mut st = self.state.lock();
        let dropped = st.orders.len();
        st.orders.clear();
        info!(dropped, "cancel all (topic)");
        Ok(())
    }

    fn on_balance_init(&self, ev: &Event) -> Result<()> {
        let info = ev.as_balance_init()?;
        let event = {
            let mut st = self.state.lock();
            st.ledger.set_total(info.balance);
            st.ledger.set_fee_rate(info.fee);
            self.balance_event(&st.ledger)
        };
        info!(balance = %info.balance, fee = %info.fee, "balance init");
        self.base.publish(event);
        Ok(())
    }

    /// Settle any open position at the current candle close.
    pub fn close_all(&self) -> Result<()> {
        let events = {
            let mut st = self.state.lock();
            if st.position.is_zero() {
                return Ok(());
            }
            let Some(candle) = st.candle.clone() else {
                warn!("close all without a candle");
                return Ok(());
            };
            let (kind, side) = if st.position > Decimal::ZERO {
                (TradeKind::CloseLong, Side::Sell)
            } else {
                (TradeKind::CloseShort, Side::Buy)
            };
            let trade = Trade {
                id: st.trades.len().to_string(),
                kind,
                time: candle.time() + Duration::seconds(1),
                price: candle.close,
                amount: st.position.abs(),
                side,
                remark: "close_all".into(),
            };
            st.ledger.add_trade(&trade)?;
            st.position = st.ledger.position();
            st.trades.push(trade.clone());
            FILLS.with_label_values(&[&kind.to_string()]).inc();
            vec![
                self.base.create_event("trade", topic::TRADE, Payload::Trade(trade)),
                self.position_event(&st, candle.close),
                self.balance_event(&st.ledger),
            ]
        };
        self.publish_all(events);
        Ok(())
    }
}

impl Processer for VirtualExchange {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.base.attach(bus);
        let name = self.base.name().to_string();
        bus.subscribe_weak(topic::CANDLE, &name, &self, Self::on_candle);
        bus.subscribe_weak(topic::ORDER, &name, &self, Self::on_order);
        bus.subscribe_weak(topic::ORDER_CANCEL_ALL, &name, &self, Self::on_cancel_all);
        bus.subscribe_weak(topic::BALANCE_INIT, &name, &self, Self::on_balance_init);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let event = self.balance_event(&self.state.lock().ledger);
        self.base.publish(event);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.base.mark_stopped() {
            return Ok(());
        }
        let st = self.state.lock();
        info!(
            symbol = %self.symbol,
            trades = st.trades.len(),
            pending = st.orders.len(),
            balance = %st.ledger.total(),
            fee_total = %st.ledger.fee_total(),
            "vexchange stopped"
        );
        Ok(())
    }
}

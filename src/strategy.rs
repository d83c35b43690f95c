// ===============================
// src/strategy.rs
// ===============================
//
// Strategy side of the bus:
// - Strategy          : callback hooks (candle, trade, position, balance, market trade, depth)
// - StrategyContext   : what a hook may read (position, balance, last price) and queue (orders, notify)
// - StrategyProcesser : owns one strategy, feeds it from the bus, publishes queued actions
// - StrategyRegistry  : name -> factory(JSON params); builtin `ma_cross`
//
// Catatan: action yang di-queue oleh hook baru dikirim setelah lock strategi dilepas,
// jadi subscriber sync yang membalas (vex, risk) tidak ketemu lock yang masih dipegang.
//
use ahash::AHashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::Bus;
use crate::domain::{Balance, Candle, Depth, NotifyEvent, Position, Trade, TradeAction, TradeKind};
use crate::error::{Error, Result};
use crate::event::{topic, Event, Payload};
use crate::metrics::SIGNALS;
use crate::processer::{BaseProcesser, Processer};

/// Hooks called by [`StrategyProcesser`]. All default to no-op.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// `bin` is the candle's bin size label (`1m`, `5m`, ...).
    fn on_candle(&mut self, _ctx: &mut StrategyContext, _candle: &Candle, _bin: &str) -> Result<()> {
        Ok(())
    }

    fn on_trade(&mut self, _ctx: &mut StrategyContext, _trade: &Trade) -> Result<()> {
        Ok(())
    }

    fn on_position(&mut self, _ctx: &mut StrategyContext, _pos: &Position) -> Result<()> {
        Ok(())
    }

    fn on_balance(&mut self, _ctx: &mut StrategyContext, _balance: &Balance) -> Result<()> {
        Ok(())
    }

    fn on_trade_market(&mut self, _ctx: &mut StrategyContext, _trade: &Trade) -> Result<()> {
        Ok(())
    }

    fn on_depth(&mut self, _ctx: &mut StrategyContext, _depth: &Depth) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StrategyContext {
    symbol: String,
    position: Decimal,
    balance: Decimal,
    last_price: Decimal,
    actions: Vec<(&'static str, Payload)>,
}

impl StrategyContext {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self { symbol: symbol.into(), ..Default::default() }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Signed net position from the last `position` event.
    pub fn position(&self) -> Decimal {
        self.position
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn last_price(&self) -> Decimal {
        self.last_price
    }

    fn order(&mut self, kind: TradeKind, price: Decimal, amount: Decimal) {
        let act = TradeAction::new(kind, price, amount).with_symbol(self.symbol.clone());
        self.actions.push((topic::ORDER, Payload::Order(act)));
    }

    pub fn open_long(&mut self, price: Decimal, amount: Decimal) {
        self.order(TradeKind::OpenLong, price, amount);
    }

    pub fn close_long(&mut self, price: Decimal, amount: Decimal) {
        self.order(TradeKind::CloseLong, price, amount);
    }

    pub fn open_short(&mut self, price: Decimal, amount: Decimal) {
        self.order(TradeKind::OpenShort, price, amount);
    }

    pub fn close_short(&mut self, price: Decimal, amount: Decimal) {
        self.order(TradeKind::CloseShort, price, amount);
    }

    pub fn stop_long(&mut self, price: Decimal, amount: Decimal) {
        self.order(TradeKind::StopLong, price, amount);
    }

    pub fn stop_short(&mut self, price: Decimal, amount: Decimal) {
        self.order(TradeKind::StopShort, price, amount);
    }

    pub fn cancel_all(&mut self) {
        let act = TradeAction::cancel_all().with_symbol(self.symbol.clone());
        self.actions.push((topic::ORDER, Payload::Order(act)));
    }

    pub fn cancel_order(&mut self, id: impl Into<String>) {
        let act = TradeAction::cancel_one(id).with_symbol(self.symbol.clone());
        self.actions.push((topic::ORDER, Payload::Order(act)));
    }

    pub fn notify(&mut self, title: impl Into<String>, content: impl Into<String>) {
        self.actions.push((topic::NOTIFY, Payload::Notify(NotifyEvent::text(title, content))));
    }

    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }

    fn take_actions(&mut self) -> Vec<(&'static str, Payload)> {
        std::mem::take(&mut self.actions)
    }
}

struct Runner {
    strategy: Box<dyn Strategy>,
    ctx: StrategyContext,
}

pub struct StrategyProcesser {
    base: BaseProcesser,
    strategy_name: String,
    symbol: String,
    runner: Mutex<Runner>,
}

impl StrategyProcesser {
    pub fn new(symbol: impl Into<String>, strategy: Box<dyn Strategy>) -> Self {
        let symbol = symbol.into();
        let strategy_name = strategy.name().to_string();
        Self {
            base: BaseProcesser::new(format!("strategy:{strategy_name}")),
            strategy_name,
            runner: Mutex::new(Runner { strategy, ctx: StrategyContext::new(symbol.clone()) }),
            symbol,
        }
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    /// Run one hook under the lock, publish what it queued after releasing it.
    fn dispatch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Strategy, &mut StrategyContext) -> Result<()>,
    {
        let (res, actions) = {
            let mut guard = self.runner.lock();
            let Runner { strategy, ctx } = &mut *guard;
            let res = f(strategy.as_mut(), ctx);
            (res, ctx.take_actions())
        };
        for (t, payload) in actions {
            if t == topic::ORDER {
                SIGNALS.with_label_values(&[self.strategy_name.as_str()]).inc();
            }
            self.base.send(&self.symbol, t, payload);
        }
        res
    }

    fn on_candle(&self, ev: &Event) -> Result<()> {
        let candle = ev.as_candle()?;
        if ev.is_recent() {
            return Ok(());
        }
        let bin = ev.extra().unwrap_or_default().to_string();
        self.dispatch(|s, ctx| {
            ctx.last_price = candle.close;
            s.on_candle(ctx, candle, &bin)
        })
    }

    fn on_trade(&self, ev: &Event) -> Result<()> {
        let trade = ev.as_trade()?;
        self.dispatch(|s, ctx| s.on_trade(ctx, trade))
    }

    fn on_position(&self, ev: &Event) -> Result<()> {
        let pos = ev.as_position()?;
        if !pos.symbol.is_empty() && pos.symbol != self.symbol {
            return Ok(());
        }
        self.dispatch(|s, ctx| {
            ctx.position = pos.hold;
            s.on_position(ctx, pos)
        })
    }

    fn on_balance(&self, ev: &Event) -> Result<()> {
        let bal = ev.as_balance()?;
        self.dispatch(|s, ctx| {
            ctx.balance = bal.balance;
            s.on_balance(ctx, bal)
        })
    }

    fn on_trade_market(&self, ev: &Event) -> Result<()> {
        let trade = ev.as_trade()?;
        self.dispatch(|s, ctx| s.on_trade_market(ctx, trade))
    }

    fn on_depth(&self, ev: &Event) -> Result<()> {
        let depth = ev.as_depth()?;
        self.dispatch(|s, ctx| s.on_depth(ctx, depth))
    }
}

impl Processer for StrategyProcesser {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.base.attach(bus);
        let name = self.base.name().to_string();
        bus.subscribe_weak(topic::CANDLE, &name, &self, Self::on_candle);
        bus.subscribe_weak(topic::TRADE, &name, &self, Self::on_trade);
        bus.subscribe_weak(topic::POSITION, &name, &self, Self::on_position);
        bus.subscribe_weak(topic::BALANCE, &name, &self, Self::on_balance);
        bus.subscribe_weak(topic::TRADE_MARKET, &name, &self, Self::on_trade_market);
        bus.subscribe_weak(topic::DEPTH, &name, &self, Self::on_depth);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        info!(strategy = %self.strategy_name, symbol = %self.symbol, "strategy started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.base.mark_stopped() {
            let r = self.runner.lock();
            info!(
                strategy = %self.strategy_name,
                position = %r.ctx.position,
                balance = %r.ctx.balance,
                "strategy stopped"
            );
        }
        Ok(())
    }
}

pub type StrategyFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Strategy>> + Send + Sync>;

/// Name -> factory. Params are free-form JSON; `null` means defaults.
pub struct StrategyRegistry {
    factories: AHashMap<String, StrategyFactory>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self { factories: AHashMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::empty();
        r.register(MaCross::NAME, |params| Ok(Box::new(MaCross::from_params(params)?)));
        r
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        if self.factories.insert(name.to_string(), Box::new(factory)).is_some() {
            debug!(%name, "strategy factory replaced");
        }
    }

    pub fn create(&self, name: &str, params: &Value) -> Result<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))?;
        factory(params)
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.factories.keys().cloned().collect();
        v.sort();
        v
    }
}

// -----------------------------------------------------------------------------
// MOVING AVERAGE CROSSOVER (trend following) di close candle
//    Golden cross (SMA fast naik menembus slow) -> tutup short, buka long
//    Dead cross   (SMA fast turun menembus slow) -> tutup long, buka short
//    min_edge : selisih minimum fast-slow supaya cross dianggap valid
//    cooldown : jumlah candle minimum antar sinyal
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaCrossParams {
    pub fast: usize,
    pub slow: usize,
    pub min_edge: Decimal,
    pub cooldown: u32,
    pub amount: Decimal,
    pub bin: String,
}

impl Default for MaCrossParams {
    fn default() -> Self {
        Self {
            fast: 16,
            slow: 64,
            min_edge: Decimal::ZERO,
            cooldown: 0,
            amount: Decimal::ONE,
            bin: "1m".into(),
        }
    }
}

pub struct MaCross {
    p: MaCrossParams,
    fast_win: VecDeque<Decimal>,
    slow_win: VecDeque<Decimal>,
    fast_sum: Decimal,
    slow_sum: Decimal,
    prev_sign: i8,
    since_last: u32,
}

impl MaCross {
    pub const NAME: &'static str = "ma_cross";

    pub fn new(p: MaCrossParams) -> Result<Self> {
        if p.fast == 0 || p.fast >= p.slow {
            return Err(Error::Config(format!("ma_cross: need 0 < fast < slow, got {}/{}", p.fast, p.slow)));
        }
        if p.amount <= Decimal::ZERO {
            return Err(Error::Config(format!("ma_cross: amount must be positive, got {}", p.amount)));
        }
        Ok(Self {
            fast_win: VecDeque::with_capacity(p.fast),
            slow_win: VecDeque::with_capacity(p.slow),
            fast_sum: Decimal::ZERO,
            slow_sum: Decimal::ZERO,
            prev_sign: 0,
            since_last: p.cooldown,
            p,
        })
    }

    pub fn from_params(params: &Value) -> Result<Self> {
        let p = if params.is_null() {
            MaCrossParams::default()
        } else {
            serde_json::from_value(params.clone())?
        };
        Self::new(p)
    }

    fn push(win: &mut VecDeque<Decimal>, sum: &mut Decimal, cap: usize, v: Decimal) {
        if win.len() == cap {
            if let Some(x) = win.pop_front() {
                *sum -= x;
            }
        }
        win.push_back(v);
        *sum += v;
    }
}

impl Strategy for MaCross {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_candle(&mut self, ctx: &mut StrategyContext, candle: &Candle, bin: &str) -> Result<()> {
        if bin != self.p.bin {
            return Ok(());
        }
        let px = candle.close;
        Self::push(&mut self.fast_win, &mut self.fast_sum, self.p.fast, px);
        Self::push(&mut self.slow_win, &mut self.slow_sum, self.p.slow, px);
        self.since_last = self.since_last.saturating_add(1);

        if self.slow_win.len() < self.p.slow {
            return Ok(());
        }
        let diff = self.fast_sum / Decimal::from(self.p.fast) - self.slow_sum / Decimal::from(self.p.slow);
        if diff.is_zero() || diff.abs() < self.p.min_edge {
            return Ok(());
        }
        let sign: i8 = if diff > Decimal::ZERO { 1 } else { -1 };

        // sign pertama setelah window penuh: catat saja, belum ada cross
        if self.prev_sign == 0 {
            self.prev_sign = sign;
            return Ok(());
        }
        if sign == self.prev_sign || self.since_last < self.p.cooldown {
            return Ok(());
        }
        self.prev_sign = sign;
        self.since_last = 0;

        let pos = ctx.position();
        if sign > 0 {
            if pos < Decimal::ZERO {
                ctx.close_short(px, pos.abs());
            }
            if pos <= Decimal::ZERO {
                ctx.open_long(px, self.p.amount);
            }
        } else {
            if pos > Decimal::ZERO {
                ctx.close_long(px, pos);
            }
            if pos >= Decimal::ZERO {
                ctx.open_short(px, self.p.amount);
            }
        }
        debug!(%diff, %px, sign, "ma cross");
        Ok(())
    }
}

// ===============================
// src/notify.rs
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::error::Result;
use crate::event::{topic, Event, Payload};
use crate::processer::{BaseProcesser, Processer};

/// Which topics the sink renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyConfig {
    pub trade: bool,
    pub order: bool,
    pub balance: bool,
    pub notify: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { trade: true, order: false, balance: true, notify: true }
    }
}

/// Human-readable line for an event, `None` when there is nothing to say.
pub fn render(ev: &Event) -> Option<String> {
    match &ev.payload {
        Payload::Trade(t) => Some(format!(
            "TRADE {} {}@{} ({})",
            t.kind, t.amount, t.price, t.time.format("%Y-%m-%d %H:%M:%S")
        )),
        Payload::Order(o) if o.kind.is_cancel() => {
            Some(if o.id.is_empty() { format!("ORDER {}", o.kind) } else { format!("ORDER {} {}", o.kind, o.id) })
        }
        Payload::Order(o) => Some(format!("ORDER {} {}@{} from {}", o.kind, o.amount, o.price, ev.source)),
        Payload::Balance(b) => Some(format!("BALANCE {} {}", b.currency, b.balance)),
        Payload::Notify(n) => Some(format!("{}: {}", n.title, n.content)),
        _ => None,
    }
}

pub struct NotifySink {
    base: BaseProcesser,
    cfg: NotifyConfig,
    sent: AtomicU64,
}

impl NotifySink {
    pub fn new(cfg: NotifyConfig) -> Self {
        Self { base: BaseProcesser::new("notify"), cfg, sent: AtomicU64::new(0) }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn on_event(&self, ev: &Event) -> Result<()> {
        let Some(line) = render(ev) else {
            warn!(topic = %ev.topic, payload = ev.payload.kind(), "nothing to render");
            return Ok(());
        };
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(target: "notify", "{line}");
        Ok(())
    }
}

impl Processer for NotifySink {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.base.attach(bus);
        let name = self.base.name().to_string();
        for (on, t) in [
            (self.cfg.trade, topic::TRADE),
            (self.cfg.order, topic::ORDER),
            (self.cfg.balance, topic::BALANCE),
            (self.cfg.notify, topic::NOTIFY),
        ] {
            if on {
                bus.subscribe_weak(t, &name, &self, Self::on_event);
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.base.mark_stopped() {
            info!(sent = self.sent(), "notify sink stopped");
        }
        Ok(())
    }
}

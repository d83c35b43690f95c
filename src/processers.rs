// ===============================
// src/processers.rs
// ===============================
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::bus::{Bus, BusMode, DEFAULT_CAPACITY};
use crate::error::{Error, Result};
use crate::event::{topic, Event};
use crate::processer::Processer;

pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

struct Shared {
    handlers: RwLock<Vec<Arc<dyn Processer>>>,
    error_cb: RwLock<Option<ErrorCallback>>,
    stopping: AtomicBool,
}

/// Owns the bus and the ordered processer list.
///
/// `start`: init every processer (subscriptions only), activate the bus,
/// then start each one in registration order. `stop` goes in reverse so
/// downstream consumers stop before their producers.
pub struct Processers {
    bus: Bus,
    shared: Arc<Shared>,
    started: Mutex<bool>,
}

impl Default for Processers {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Processers {
    pub fn new(capacity: usize) -> Self {
        Self::with_bus(Bus::new_concurrent(capacity))
    }

    pub fn new_sync() -> Self {
        Self::with_bus(Bus::new_sync())
    }

    pub fn with_mode(mode: BusMode) -> Self {
        Self::with_bus(Bus::new(mode))
    }

    fn with_bus(bus: Bus) -> Self {
        Self {
            bus,
            shared: Arc::new(Shared {
                handlers: RwLock::new(Vec::new()),
                error_cb: RwLock::new(None),
                stopping: AtomicBool::new(false),
            }),
            started: Mutex::new(false),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn set_error_callback<F>(&self, f: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.shared.error_cb.write() = Some(Arc::new(f));
    }

    pub fn add(&self, p: Arc<dyn Processer>) {
        self.shared.handlers.write().push(p);
    }

    pub fn adds<I>(&self, ps: I)
    where
        I: IntoIterator<Item = Arc<dyn Processer>>,
    {
        self.shared.handlers.write().extend(ps);
    }

    pub fn len(&self) -> usize {
        self.shared.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start(&self) -> Result<()> {
        let mut started = self.started.lock();
        if *started {
            return Ok(());
        }
        let handlers: Vec<_> = self.shared.handlers.read().clone();

        for p in &handlers {
            p.clone().init(&self.bus).map_err(|e| Error::Processer {
                name: p.name().to_string(),
                reason: format!("init: {e}"),
            })?;
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        self.bus.subscribe(topic::ERROR, "processers", move |ev| {
            if let Some(shared) = weak.upgrade() {
                shared.on_error(ev);
            }
            Ok(())
        });

        self.bus.start();

        for p in &handlers {
            p.start().map_err(|e| Error::Processer {
                name: p.name().to_string(),
                reason: format!("start: {e}"),
            })?;
        }
        *started = true;
        info!(count = handlers.len(), "processers started");
        Ok(())
    }

    /// Stop all processers. Does not close the bus.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop_all()
    }

    /// Grace period for queued and in-flight events, then close the bus.
    /// Returns early once the bus is idle.
    pub fn wait_close(&self, grace: Duration) {
        if !self.bus.wait_idle(grace) {
            warn!(?grace, in_flight = self.bus.in_flight(), "bus not idle before close");
        }
        self.bus.close();
    }
}

impl Shared {
    fn on_error(&self, ev: &Event) {
        let reason = match ev.as_error() {
            Ok(r) => r.clone(),
            Err(e) => e.to_string(),
        };
        let err = Error::Processer { name: ev.source.clone(), reason };
        error!(error = %err, "fatal processer error, stopping");
        let cb = self.error_cb.read().clone();
        if let Some(cb) = cb {
            cb(&err);
        }
        if let Err(e) = self.stop_all() {
            warn!(error = %e, "stop after fatal error");
        }
    }

    fn stop_all(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handlers: Vec<_> = self.handlers.read().clone();
        let mut errs = Vec::new();
        for p in handlers.iter().rev() {
            if let Err(e) = p.stop() {
                errs.push(format!("stop {}: {e}", p.name()));
            }
        }
        info!(count = handlers.len(), failed = errs.len(), "processers stopped");
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errs.join("; ")))
        }
    }
}

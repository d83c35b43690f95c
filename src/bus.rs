// ===============================
// src/bus.rs
// ===============================
//
// Topic-keyed pub/sub with two delivery strategies:
//   * Concurrent: one bounded crossbeam queue + one dispatch thread per topic.
//     Publishers only block when a topic queue is full.
//   * Sync: subscribers run inline on the publisher's stack, in order.
//
// Subscriber lists are copy-on-write `Arc<Vec<_>>`. Dispatch clones the
// snapshot and drops the registry lock before calling anyone, so a callback
// may publish (or subscribe) again without deadlocking the bus itself.
//
use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::event::Event;
use crate::metrics::{EVENTS_DROPPED, EVENTS_PUBLISHED, HANDLER_ERRORS};

pub type Callback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Sync,
    Concurrent { capacity: usize },
}

#[derive(Clone)]
struct Subscriber {
    name: String,
    callback: Callback,
}

struct BusInner {
    mode: BusMode,
    subscribers: RwLock<AHashMap<String, Arc<Vec<Subscriber>>>>,
    senders: RwLock<AHashMap<String, Sender<Event>>>,
    // queues created before start(), waiting for their worker
    pending: Mutex<Vec<(String, Receiver<Event>)>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
    // accepted by publish and not yet fully dispatched
    in_flight: AtomicUsize,
}

/// Cheap clonable handle; all clones share one registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("mode", &self.inner.mode)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BusInner {
    fn snapshot(&self, topic: &str) -> Option<Arc<Vec<Subscriber>>> {
        self.subscribers.read().get(topic).cloned()
    }

    fn dispatch(&self, subs: &[Subscriber], event: &Event) {
        for sub in subs {
            if let Err(e) = (sub.callback)(event) {
                error!(topic = %event.topic, subscriber = %sub.name, error = %e, "handler failed");
                HANDLER_ERRORS.with_label_values(&[event.topic.as_str()]).inc();
            }
        }
    }

    fn done_one(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn spawn_worker(inner: Weak<BusInner>, topic: String, rx: Receiver<Event>) -> Option<JoinHandle<()>> {
    let name = format!("bus-{topic}");
    let spawned = thread::Builder::new().name(name).spawn(move || {
        // ends once every sender is dropped (close) and the queue is drained
        for event in rx.iter() {
            let Some(inner) = inner.upgrade() else { break };
            // fresh snapshot per event: late subscribers are picked up
            if let Some(subs) = inner.snapshot(&topic) {
                inner.dispatch(&subs, &event);
            }
            // after dispatch, so follow-on publishes are counted first
            inner.done_one();
        }
        debug!(%topic, "bus worker exit");
    });
    match spawned {
        Ok(h) => Some(h),
        Err(e) => {
            error!(error = %e, "bus worker spawn failed");
            None
        }
    }
}

impl Bus {
    pub fn new(mode: BusMode) -> Self {
        Self {
            inner: Arc::new(BusInner {
                mode,
                subscribers: RwLock::new(AHashMap::new()),
                senders: RwLock::new(AHashMap::new()),
                pending: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn new_sync() -> Self {
        Self::new(BusMode::Sync)
    }

    pub fn new_concurrent(capacity: usize) -> Self {
        Self::new(BusMode::Concurrent { capacity: capacity.max(1) })
    }

    pub fn mode(&self) -> BusMode {
        self.inner.mode
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register `callback` on `topic`. Registration order is delivery order.
    pub fn subscribe<F>(&self, topic: &str, name: &str, callback: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        if self.is_closed() {
            warn!(%topic, subscriber = %name, "subscribe on closed bus ignored");
            return;
        }
        {
            let mut map = self.inner.subscribers.write();
            let slot = map.entry(topic.to_string()).or_default();
            let mut next: Vec<Subscriber> = (**slot).clone();
            next.push(Subscriber { name: name.to_string(), callback: Arc::new(callback) });
            *slot = Arc::new(next);
        }
        debug!(%topic, subscriber = %name, "subscribed");

        if let BusMode::Concurrent { capacity } = self.inner.mode {
            self.ensure_queue(topic, capacity);
        }
    }

    /// Subscribe a method of a shared component without keeping it alive.
    pub fn subscribe_weak<P>(&self, topic: &str, name: &str, target: &Arc<P>, f: fn(&P, &Event) -> Result<()>)
    where
        P: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(target);
        self.subscribe(topic, name, move |ev| match weak.upgrade() {
            Some(p) => f(&p, ev),
            None => Ok(()),
        });
    }

    fn ensure_queue(&self, topic: &str, capacity: usize) {
        let mut senders = self.inner.senders.write();
        if senders.contains_key(topic) {
            return;
        }
        let (tx, rx) = bounded::<Event>(capacity);
        senders.insert(topic.to_string(), tx);
        drop(senders);

        // pending lock orders this against start()
        let mut pending = self.inner.pending.lock();
        if self.is_started() {
            drop(pending);
            if let Some(h) = spawn_worker(Arc::downgrade(&self.inner), topic.to_string(), rx) {
                self.inner.workers.lock().push(h);
            }
        } else {
            pending.push((topic.to_string(), rx));
        }
    }

    /// Activate dispatch. Idempotent.
    pub fn start(&self) {
        let pending: Vec<_> = {
            let mut guard = self.inner.pending.lock();
            if self.inner.started.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        let mut handles = Vec::with_capacity(pending.len());
        for (topic, rx) in pending {
            if let Some(h) = spawn_worker(Arc::downgrade(&self.inner), topic, rx) {
                handles.push(h);
            }
        }
        self.inner.workers.lock().extend(handles);
        info!(mode = ?self.inner.mode, "bus started");
    }

    /// At-most-once delivery. Never returns subscriber errors to the caller.
    pub fn publish(&self, event: Event) {
        let topic = event.topic.clone();
        if self.is_closed() || !self.is_started() {
            debug!(%topic, name = %event.name, "bus inactive, event dropped");
            EVENTS_DROPPED.with_label_values(&[topic.as_str()]).inc();
            return;
        }
        let subs = match self.inner.snapshot(&topic) {
            Some(s) if !s.is_empty() => s,
            _ => {
                debug!(%topic, name = %event.name, "no subscriber, event dropped");
                EVENTS_DROPPED.with_label_values(&[topic.as_str()]).inc();
                return;
            }
        };
        EVENTS_PUBLISHED.with_label_values(&[topic.as_str()]).inc();
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);

        match self.inner.mode {
            BusMode::Sync => {
                self.inner.dispatch(&subs, &event);
                self.inner.done_one();
            }
            BusMode::Concurrent { .. } => {
                let tx = self.inner.senders.read().get(&topic).cloned();
                let Some(tx) = tx else {
                    self.inner.done_one();
                    EVENTS_DROPPED.with_label_values(&[topic.as_str()]).inc();
                    return;
                };
                // blocks while the topic queue is full
                if tx.send(event).is_err() {
                    self.inner.done_one();
                    debug!(%topic, "topic queue closed, event dropped");
                    EVENTS_DROPPED.with_label_values(&[topic.as_str()]).inc();
                }
            }
        }
    }

    /// Stop dispatch: queued events are drained, then workers exit.
    /// Callers wanting in-flight work to finish wait before calling this.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.senders.write().clear();
        self.inner.pending.lock().clear();

        let handles: Vec<_> = std::mem::take(&mut *self.inner.workers.lock());
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() == me {
                continue;
            }
            if h.join().is_err() {
                warn!("bus worker panicked");
            }
        }
        self.inner.subscribers.write().clear();
        info!("bus closed");
    }

    /// Events accepted by `publish` whose handlers have not all returned.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Poll until no event is queued or being dispatched, or `timeout` passes.
    /// A handler's follow-on publishes count before its own event is released,
    /// so idle means the whole cascade has settled.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.snapshot(topic).map(|s| s.len()).unwrap_or(0)
    }

}

// ===============================
// src/processer.rs
// ===============================
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

use crate::bus::Bus;
use crate::error::Result;
use crate::event::{topic, Event, Payload};

/// Lifecycle of every component living on the bus.
///
/// `init` is the registration phase: subscribe here, publish nothing.
/// `start` runs after the bus is active. `stop` must be idempotent and
/// must not block.
pub trait Processer: Send + Sync {
    fn name(&self) -> &str;

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()>;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared plumbing embedded by concrete processers: name, bus handle,
/// publish helpers and the fatal signal.
#[derive(Debug)]
pub struct BaseProcesser {
    name: String,
    bus: OnceCell<Bus>,
    stopped: AtomicBool,
}

impl BaseProcesser {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), bus: OnceCell::new(), stopped: AtomicBool::new(false) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep the bus handle. A second attach is ignored.
    pub fn attach(&self, bus: &Bus) {
        if self.bus.set(bus.clone()).is_err() {
            warn!(processer = %self.name, "already attached to a bus");
        }
    }

    pub fn bus(&self) -> Option<&Bus> {
        self.bus.get()
    }

    pub fn create_event(&self, name: &str, topic: &str, payload: Payload) -> Event {
        Event::new(topic, name, self.name.as_str(), payload)
    }

    pub fn publish(&self, event: Event) {
        match self.bus.get() {
            Some(bus) => bus.publish(event),
            None => warn!(processer = %self.name, topic = %event.topic, "not attached, event dropped"),
        }
    }

    pub fn send(&self, name: &str, topic: &str, payload: Payload) {
        self.publish(self.create_event(name, topic, payload));
    }

    pub fn send_with_extra(&self, name: &str, topic: &str, extra: &str, payload: Payload) {
        self.publish(self.create_event(name, topic, payload).with_extra(extra));
    }

    /// Report an unrecoverable condition; the orchestrator shuts everything down.
    pub fn fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(processer = %self.name, %reason, "fatal");
        self.send(&self.name, topic::ERROR, Payload::Error(reason));
    }

    /// Returns true only for the first call.
    pub fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Plain sender: a processer with no subscriptions, handy for drivers and tests.
impl Processer for BaseProcesser {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.attach(bus);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.mark_stopped();
        Ok(())
    }
}

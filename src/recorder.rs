// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder:
// - RecorderProcesser subscribe ke daftar topic, setiap Event di-clone ke channel tokio (bounded).
//   Kalau channel penuh event di-drop dan dihitung; bus tidak pernah ikut blocking.
// - run() adalah writer async: append ke file .jsonl lewat BufWriter,
//   flush periodik tiap 1s dan tiap 1000 event, parent directory dibuat otomatis,
//   write gagal -> reopen file sekali lalu lanjut.
// - stop() melepas sender, writer flush lalu selesai.
//
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{self, error::TrySendError},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::error::Result;
use crate::event::Event;
use crate::processer::{BaseProcesser, Processer};

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

pub struct RecorderProcesser {
    base: BaseProcesser,
    topics: Vec<String>,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl RecorderProcesser {
    /// Returns the processer and the receiving end for [`run`].
    pub fn new<I, S>(topics: I, capacity: usize) -> (Self, mpsc::Receiver<Event>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let p = Self {
            base: BaseProcesser::new("recorder"),
            topics: topics.into_iter().map(Into::into).collect(),
            tx: Mutex::new(Some(tx)),
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (p, rx)
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn on_event(&self, ev: &Event) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else { return Ok(()) };
        match tx.try_send(ev.clone()) {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %ev.topic, "recorder queue full, event dropped");
            }
            Err(TrySendError::Closed(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %ev.topic, "recorder writer gone, event dropped");
            }
        }
        Ok(())
    }
}

impl Processer for RecorderProcesser {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn init(self: Arc<Self>, bus: &Bus) -> Result<()> {
        self.base.attach(bus);
        let name = self.base.name().to_string();
        for t in &self.topics {
            bus.subscribe_weak(t, &name, &self, Self::on_event);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.tx.lock().take().is_some() {
            info!(recorded = self.recorded(), dropped = self.dropped(), "recorder stopped");
        }
        Ok(())
    }
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<tokio::fs::File>> {
    // Pastikan parent directory ada (kalau ada)
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

/// Drain `rx` into `path` until every sender is gone. Returns the number of lines written.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) -> Result<u64> {
    info!(%path, "recorder: started");
    let mut writer = open_writer(&path).await.map_err(|e| {
        error!(error = %e, %path, "recorder: open failed");
        e
    })?;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    // channel closed: flush dan keluar
                    writer.flush().await?;
                    info!(written, "recorder: channel closed, stopped");
                    return Ok(written);
                };
                let line = match serde_json::to_vec(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, topic = %ev.topic, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(error = %e, "recorder: write failed, attempting reopen");
                    writer = open_writer(&path).await?;
                    // coba lagi sekali setelah reopen
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(error = %e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }
                written += 1;
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    if let Err(e) = writer.flush().await {
                        warn!(error = %e, "recorder: flush failed");
                    }
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                if since_last_flush > 0 {
                    if let Err(e) = writer.flush().await {
                        warn!(error = %e, "recorder: flush failed");
                    }
                    since_last_flush = 0;
                }
            }
        }
    }
}

//! Progress instrumentation - transfer-speed meter, elapsed time, and
//! the remaining-time estimator with smoothing and nice-step rounding.
//! All of it is plain data + math so it stays unit-testable without a UI.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ops::events::OperationEvent;
use tokio::sync::broadcast;

// ─── Speed meter ─────────────────────────────────────────────────────

/// Sliding-window transfer-speed meter. Samples older than the window
/// are dropped; speed is bytes-in-window over window span.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.add_at(bytes, Instant::now());
    }

    fn add_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.bytes_in_window += bytes;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, b)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.bytes_in_window -= b;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current speed in bytes per second; 0 until enough history exists.
    pub fn bytes_per_sec(&mut self) -> u64 {
        self.bytes_per_sec_at(Instant::now())
    }

    fn bytes_per_sec_at(&mut self, now: Instant) -> u64 {
        self.evict(now);
        let Some(&(oldest, _)) = self.samples.front() else {
            return 0;
        };
        let span = now.duration_since(oldest).as_millis() as u64;
        if span < 100 {
            return 0; // too little history for a stable number
        }
        self.bytes_in_window * 1000 / span
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.bytes_in_window = 0;
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

// ─── ETA smoothing ───────────────────────────────────────────────────

/// Remaining-time estimator. Blends each raw estimate with the previous
/// one and rounds to a "nice" step so the displayed value does not
/// flicker: `secs = (2*raw + last) / 3`, then rounded to the nearest
/// step from {1,2,5,10,20,40} x 60^k (roughly a 10% granularity).
#[derive(Debug, Default)]
pub struct EtaEstimator {
    last: Option<u64>,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Feed remaining bytes and current speed; returns smoothed seconds,
    /// or `None` when no estimate is possible.
    pub fn update(&mut self, remaining: u64, bytes_per_sec: u64) -> Option<u64> {
        if bytes_per_sec == 0 {
            return None;
        }
        // one second extra so the operation ends at "1 sec", not "0 sec"
        let raw = remaining / bytes_per_sec + 1;
        let blended = match self.last {
            Some(last) => (2 * raw + last) / 3,
            None => raw,
        };
        let rounded = round_to_nice_step(blended);
        self.last = Some(rounded);
        Some(rounded)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Round seconds to the nearest step from {1,2,5,10,20,40} x 60^k.
pub fn round_to_nice_step(secs: u64) -> u64 {
    let mut dif = (secs + 5) / 10;
    let mut expon = 0u32;
    while dif >= 50 {
        dif /= 60;
        expon += 1;
    }
    dif = if dif <= 1 {
        1
    } else if dif <= 3 {
        2
    } else if dif <= 7 {
        5
    } else if dif < 15 {
        10
    } else if dif < 30 {
        20
    } else {
        40
    };
    for _ in 0..expon {
        dif *= 60;
    }
    (secs + dif / 2) / dif * dif
}

// ─── Shared live counters ────────────────────────────────────────────

/// Live transfer accounting shared between an operation and the transfer
/// control handles its workers hand to the connection layer.
#[derive(Debug)]
pub struct ProgressShared {
    transferred: AtomicU64,
    total: AtomicU64,
    speed: Mutex<SpeedMeter>,
    started: Instant,
}

impl ProgressShared {
    pub fn new() -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total: AtomicU64::new(0),
            speed: Mutex::new(SpeedMeter::default()),
            started: Instant::now(),
        }
    }

    pub fn add_transferred(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        if let Ok(mut meter) = self.speed.lock() {
            meter.add(bytes);
        }
    }

    /// Roll back bytes counted for a transfer that was abandoned and
    /// will restart from scratch.
    pub fn retract_transferred(&self, bytes: u64) {
        self.transferred.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn add_total(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn bytes_per_sec(&self) -> u64 {
        match self.speed.lock() {
            Ok(mut meter) => meter.bytes_per_sec(),
            Err(_) => 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for ProgressShared {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Disk-space advisory ─────────────────────────────────────────────

/// Free-space probe supplied by the embedder (platform glue stays out of
/// the engine). Returns free bytes on the volume holding `path`, or
/// `None` when unknown.
pub type FreeSpaceProbe = Arc<dyn Fn(&std::path::Path) -> Option<u64> + Send + Sync>;

/// Spawn the advisory disk-space monitor for a download operation.
///
/// Periodically compares free space on the target volume against the
/// bytes still to transfer and publishes [`OperationEvent::DiskSpaceWarning`]
/// when it falls short. Advisory only: it never blocks or aborts an
/// in-flight transfer. The task ends when every event receiver is gone.
pub fn spawn_disk_space_monitor(
    progress: Arc<ProgressShared>,
    events: broadcast::Sender<OperationEvent>,
    target_dir: PathBuf,
    probe: FreeSpaceProbe,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let total = progress.total();
            let transferred = progress.transferred();
            let needed = total.saturating_sub(transferred);
            if needed == 0 {
                continue;
            }
            if let Some(free) = probe(&target_dir) {
                if free < needed
                    && events
                        .send(OperationEvent::DiskSpaceWarning { free, needed })
                        .is_err()
                {
                    return; // no receivers left, operation dialog is gone
                }
            }
        }
    })
}

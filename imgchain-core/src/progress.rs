use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Advisory progress counters shared between sessions and a display layer.
///
/// Sessions only ever add to the totals, so several disks restored
/// concurrently can report into one reporter. Nothing here affects
/// correctness.
#[derive(Clone)]
pub struct ProgressReporter {
    enabled: bool,
    interval: Duration,
    stage: Arc<Mutex<String>>,
    links_done: Arc<AtomicU64>,
    links_total: Arc<AtomicU64>,
    bytes_done: Arc<AtomicU64>,
    bytes_total: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub stage: String,
    pub links_done: u64,
    pub links_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ProgressReporter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            interval: Duration::from_secs(5),
            stage: Arc::new(Mutex::new(String::new())),
            links_done: Arc::new(AtomicU64::new(0)),
            links_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn set_stage(&self, s: &str) {
        if let Ok(mut stage) = self.stage.lock() {
            *stage = s.to_string();
        }
    }

    pub fn add_links_total(&self, n: u64) {
        self.links_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_link(&self) {
        self.links_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_total(&self, n: u64) {
        self.bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: self.stage.lock().map(|s| s.clone()).unwrap_or_default(),
            links_done: self.links_done.load(Ordering::Relaxed),
            links_total: self.links_total.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the ticker thread that logs a line every interval until [`stop`](Self::stop).
    pub fn start(&self) {
        if !self.enabled || self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(this.interval);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                let s = this.snapshot();
                info!(
                    elapsed_s = t0.elapsed().as_secs(),
                    stage = %s.stage,
                    links = format_args!("{}/{}", s.links_done, s.links_total),
                    percent = s.percent() as i32,
                    "progress"
                );
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

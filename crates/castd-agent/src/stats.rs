#[cfg(target_os = "linux")]
use std::sync::OnceLock;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use castd_process::Totals;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::Supervisor;

pub const HISTORY_CAPACITY: usize = 100;

/// Process-wide monotonic counters.
#[derive(Debug, Default)]
pub struct Counters {
    started: AtomicU64,
    stopped: AtomicU64,
    errors: AtomicU64,
    bandwidth_bytes: AtomicU64,
}

impl Counters {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bandwidth(&self, bytes: u64) {
        self.bandwidth_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn totals(&self) -> Totals {
        Totals {
            total_started: self.started.load(Ordering::Relaxed),
            total_stopped: self.stopped.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            bandwidth_bytes: self.bandwidth_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime: u64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
    pub cpu_count: usize,
    pub load: [f64; 3],
    pub active_count: usize,
}

/// Fixed-capacity FIFO of snapshots; the oldest is evicted on overflow.
#[derive(Debug)]
pub struct StatsHistory {
    capacity: usize,
    snapshots: VecDeque<Snapshot>,
}

impl Default for StatsHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl StatsHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, snapshot: Snapshot) {
        while self.snapshots.len() >= self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(target_os = "linux")]
async fn read_self_rss_bytes() -> Option<u64> {
    let s = tokio::fs::read_to_string("/proc/self/statm").await.ok()?;
    let resident_pages: u64 = s.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_self_rss_bytes() -> Option<u64> {
    None
}

#[cfg(unix)]
fn load_average() -> [f64; 3] {
    let mut out = [0.0f64; 3];
    let n = unsafe { libc::getloadavg(out.as_mut_ptr(), 3) };
    if n < 3 { [0.0; 3] } else { out }
}

#[cfg(not(unix))]
fn load_average() -> [f64; 3] {
    [0.0; 3]
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub async fn take_snapshot(started_at: Instant, active_count: usize) -> Snapshot {
    let rss = read_self_rss_bytes().await.unwrap_or(0);
    let memory_mb = (rss as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
    Snapshot {
        timestamp: Utc::now(),
        uptime: started_at.elapsed().as_secs(),
        memory_mb,
        cpu_count: cpu_count(),
        load: load_average(),
        active_count,
    }
}

/// Appends a snapshot to the supervisor's history every `stats_interval`.
pub struct StatsSampler {
    supervisor: Supervisor,
}

impl StatsSampler {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn spawn(self) {
        let interval = self.supervisor.settings().stats_interval();
        let shutdown = self.supervisor.shutdown_token();
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    pub async fn tick(&self) {
        let active = self.supervisor.active_count().await;
        let snapshot = take_snapshot(self.supervisor.started_at(), active).await;
        self.supervisor.record_snapshot(snapshot).await;
    }
}

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use castd_process::{ChannelId, ChannelState, RunId, StreamSummary};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};

use crate::worker::WorkerHandle;

/// One live channel. Presence in the registry means a worker is starting or
/// running for it.
#[derive(Debug)]
pub struct ChannelEntry {
    pub run_id: RunId,
    pub state: ChannelState,
    // None while `Starting`.
    pub worker: Option<WorkerHandle>,
    pub started_at: Instant,
    pub last_access_at: Instant,
    pub intentional_stop: bool,
    pub retry_count: u32,
    pub input_source: String,
    pub work_dir: PathBuf,
}

impl ChannelEntry {
    pub fn starting(
        run_id: RunId,
        input_source: String,
        work_dir: PathBuf,
        retry_count: u32,
        now: Instant,
    ) -> Self {
        Self {
            run_id,
            state: ChannelState::Starting,
            worker: None,
            started_at: now,
            last_access_at: now,
            intentional_stop: false,
            retry_count,
            input_source,
            work_dir,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access_at)
    }

    pub fn summary(&self, now: Instant) -> StreamSummary {
        StreamSummary {
            uptime_seconds: now.saturating_duration_since(self.started_at).as_secs(),
            idle_seconds: self.idle_for(now).as_secs(),
        }
    }
}

/// Read-only copy of an entry for callers outside the registry lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryView {
    pub run_id: RunId,
    pub state: ChannelState,
    pub pid: Option<u32>,
    pub intentional_stop: bool,
    pub retry_count: u32,
    pub input_source: String,
    pub work_dir: PathBuf,
}

pub type ChannelTable = HashMap<ChannelId, ChannelEntry>;

/// Channel id -> entry. Every read and mutation goes through the one mutex,
/// so an existence check and the insert that follows it cannot interleave
/// with another start for the same id.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<ChannelTable>>,
}

impl Registry {
    pub async fn lock(&self) -> MutexGuard<'_, ChannelTable> {
        self.inner.lock().await
    }

    pub async fn contains(&self, channel: &ChannelId) -> bool {
        self.inner.lock().await.contains_key(channel)
    }

    /// Refreshes `last_access_at`; false if the channel is absent.
    pub async fn touch(&self, channel: &ChannelId, now: Instant) -> bool {
        let mut map = self.inner.lock().await;
        let Some(e) = map.get_mut(channel) else {
            return false;
        };
        e.last_access_at = now;
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn channels(&self) -> Vec<ChannelId> {
        let mut out: Vec<ChannelId> = self.inner.lock().await.keys().cloned().collect();
        out.sort_unstable();
        out
    }

    pub async fn view(&self, channel: &ChannelId) -> Option<EntryView> {
        let map = self.inner.lock().await;
        map.get(channel).map(|e| EntryView {
            run_id: e.run_id,
            state: e.state,
            pid: e.worker.as_ref().and_then(|w| w.pid),
            intentional_stop: e.intentional_stop,
            retry_count: e.retry_count,
            input_source: e.input_source.clone(),
            work_dir: e.work_dir.clone(),
        })
    }

    pub async fn summaries(&self, now: Instant) -> BTreeMap<String, StreamSummary> {
        let map = self.inner.lock().await;
        map.iter()
            .map(|(id, e)| (id.to_string(), e.summary(now)))
            .collect()
    }
}

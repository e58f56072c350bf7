use std::{collections::BTreeMap, sync::Arc, time::Duration};

use castd_process::{StreamSummary, Totals};
use serde::Serialize;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Settings,
    logs::LogHub,
    registry::Registry,
    stats::{Counters, Snapshot, StatsHistory},
};

struct Shared {
    settings: Settings,
    registry: Registry,
    counters: Counters,
    logs: LogHub,
    history: Mutex<StatsHistory>,
    started_at: Instant,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle to the supervisor state shared by the HTTP layer,
/// the lifecycle controller and the background loops.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Shared>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub system: Option<Snapshot>,
    pub active_streams: BTreeMap<String, StreamSummary>,
    pub totals: Totals,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        let logs = LogHub::new(settings.log_backlog_lines);
        Self {
            inner: Arc::new(Shared {
                settings,
                registry: Registry::default(),
                counters: Counters::default(),
                logs,
                history: Mutex::new(StatsHistory::default()),
                started_at: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    pub fn logs(&self) -> &LogHub {
        &self.inner.logs
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.registry.len().await
    }

    pub async fn record_snapshot(&self, snapshot: Snapshot) {
        self.inner.history.lock().await.push(snapshot);
    }

    pub async fn history(&self) -> Vec<Snapshot> {
        self.inner.history.lock().await.iter().cloned().collect()
    }

    pub async fn stats_report(&self) -> StatsReport {
        let system = self.inner.history.lock().await.latest().cloned();
        StatsReport {
            system,
            active_streams: self.inner.registry.summaries(Instant::now()).await,
            totals: self.inner.counters.totals(),
        }
    }

    /// Emits a supervisor line to the log hub and to tracing.
    pub(crate) async fn note(&self, line: String) {
        tracing::info!(target: "castd::lifecycle", "{line}");
        self.inner.logs.emit(format!("[castd] {line}")).await;
    }

    /// Refuses new starts, stops every channel and waits (bounded) for the
    /// exit observers to drain the registry.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let channels = self.inner.registry.channels().await;
        for channel in &channels {
            self.stop_stream(channel).await;
        }

        let deadline = Instant::now() + self.settings().stop_grace() + Duration::from_secs(2);
        while !self.inner.registry.is_empty().await {
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.inner.registry.len().await,
                    "shutdown deadline reached with workers still registered"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stats_report_starts_empty() {
        let sup = Supervisor::new(Settings::default());
        let report = sup.stats_report().await;
        assert!(report.system.is_none());
        assert!(report.active_streams.is_empty());
        assert_eq!(report.totals, Totals::default());

        let v = serde_json::to_value(&report).unwrap();
        assert!(v.get("activeStreams").is_some());
        assert_eq!(v["totals"]["totalStarted"], 0);
    }

    #[tokio::test]
    async fn shutdown_with_no_channels_returns_promptly() {
        let sup = Supervisor::new(Settings::default());
        sup.shutdown().await;
        assert!(sup.is_shutting_down());
    }
}

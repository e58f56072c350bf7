use castd_process::ChannelId;
use tokio::time::Instant;

use crate::Supervisor;

/// Periodically stops channels nobody has touched for `idle_timeout`.
#[derive(Clone)]
pub struct Reaper {
    supervisor: Supervisor,
}

impl Reaper {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn spawn(self) {
        let interval = self.supervisor.settings().reap_interval();
        let shutdown = self.supervisor.shutdown_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let reaped = self.sweep().await;
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), "reaper stopped idle channels");
                }
            }
        });
    }

    pub async fn sweep(&self) -> Vec<ChannelId> {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> Vec<ChannelId> {
        let threshold = self.supervisor.settings().idle_timeout();
        self.supervisor.stop_idle(now, threshold).await
    }
}

use std::time::Duration;

use castd_process::ChannelId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Supervisor, error::SupervisorError};

/// Linear backoff between manifest polls: `initial`, then `+step` per
/// attempt, never above `cap`.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next: Duration,
    step: Duration,
    cap: Duration,
}

impl PollBackoff {
    pub fn new(initial: Duration, step: Duration, cap: Duration) -> Self {
        Self {
            next: initial.min(cap),
            step,
            cap,
        }
    }
}

impl Iterator for PollBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let cur = self.next;
        self.next = self.next.saturating_add(self.step).min(self.cap);
        Some(cur)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready(Vec<u8>),
    NotReady,
    /// The consumer went away; nothing to report.
    Cancelled,
}

/// Activates the channel if needed and polls for a non-empty manifest until
/// it appears, the wait budget runs out, or `cancel` fires.
pub async fn wait_for_manifest(
    sup: &Supervisor,
    raw_channel: &str,
    cancel: &CancellationToken,
) -> Result<WaitOutcome, SupervisorError> {
    let channel = ChannelId::parse(raw_channel)?;

    if !sup.registry().touch(&channel, Instant::now()).await {
        // Failures are logged by the lifecycle controller; the consumer only
        // sees "not ready".
        if let Err(err) = sup.start_stream(&channel).await {
            tracing::debug!(channel = %channel, error = %err, "activation failed");
            return Ok(WaitOutcome::NotReady);
        }
    }

    let settings = sup.settings();
    let path = settings.manifest_path(&channel);
    let deadline = Instant::now() + settings.wait_budget();
    let mut backoff = PollBackoff::new(
        Duration::from_millis(settings.wait_initial_ms),
        Duration::from_millis(settings.wait_step_ms),
        Duration::from_millis(settings.wait_cap_ms),
    );
    let shutdown = sup.shutdown_token();

    loop {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }

        if let Ok(bytes) = tokio::fs::read(&path).await
            && !bytes.is_empty()
        {
            sup.counters().add_bandwidth(bytes.len() as u64);
            return Ok(WaitOutcome::Ready(bytes));
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(channel = %channel, "manifest not ready within wait budget");
            return Ok(WaitOutcome::NotReady);
        }
        let pause = backoff
            .next()
            .unwrap_or_default()
            .min(deadline.saturating_duration_since(now));

        tokio::select! {
            _ = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            _ = shutdown.cancelled() => return Ok(WaitOutcome::NotReady),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

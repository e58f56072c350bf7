use std::{path::Path, process::ExitStatus, time::Duration};

use castd_process::{ChannelId, ChannelState, ExitTransition, RunId};
use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::mpsc,
    time::Instant,
};

use crate::{
    Supervisor,
    error::SupervisorError,
    logs::LogHub,
    registry::{ChannelEntry, ChannelTable},
    source,
    worker::{self, Signal, WorkerHandle, WorkerSpec},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { run_id: RunId },
    AlreadyActive,
}

fn forward_lines<R>(reader: R, logs: LogHub, channel: ChannelId)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Raw bytes: worker output is not guaranteed UTF-8, and the pipe must
        // keep draining or the worker dies on SIGPIPE.
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::debug!(target: "castd::worker", channel = %channel, "{}", line.trim_end());
                    logs.emit(line).await;
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "worker output read failed");
                    break;
                }
            }
        }
    });
}

async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove work dir");
        }
    }
}

fn describe_exit(res: &std::io::Result<ExitStatus>) -> String {
    match res {
        Ok(status) => match status.code() {
            Some(code) => format!("exit_code={code}"),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(sig) = status.signal() {
                        return format!("signal={sig}");
                    }
                }
                "exit_code=?".to_string()
            }
        },
        Err(e) => format!("wait failed: {e}"),
    }
}

/// Marks the entry as intentionally stopped and asks its worker to exit,
/// escalating after `grace`. An entry still `Starting` is signalled by the
/// start path once its worker exists.
pub(crate) fn request_stop(entry: &mut ChannelEntry, grace: Duration) {
    entry.intentional_stop = true;
    if let Some(w) = &entry.worker {
        w.signal(Signal::Terminate);
        w.schedule_kill(grace);
    }
}

/// Hands the worker to its `Starting` entry and promotes it to `Running`.
/// Returns true when the worker was asked to stop straight away: either a
/// stop arrived while starting, or the entry is gone and the orphan has to
/// be terminated so its observer can reap it.
fn install_worker(entry: Option<&mut ChannelEntry>, handle: WorkerHandle, grace: Duration) -> bool {
    match entry {
        Some(e) => {
            e.worker = Some(handle);
            e.state = ChannelState::Running;
            if e.intentional_stop {
                request_stop(e, grace);
            }
            e.intentional_stop
        }
        None => {
            handle.signal(Signal::Terminate);
            handle.schedule_kill(grace);
            true
        }
    }
}

impl Supervisor {
    /// Idempotent: returns `AlreadyActive` without side effects when the
    /// channel already has an entry.
    pub async fn start_stream(
        &self,
        channel: &ChannelId,
    ) -> Result<StartOutcome, SupervisorError> {
        self.start_run(channel, 0).await
    }

    fn start_boxed(
        &self,
        channel: ChannelId,
        retry_count: u32,
    ) -> BoxFuture<'static, Result<StartOutcome, SupervisorError>> {
        let sup = self.clone();
        Box::pin(async move { sup.start_run(&channel, retry_count).await })
    }

    async fn start_run(
        &self,
        channel: &ChannelId,
        retry_count: u32,
    ) -> Result<StartOutcome, SupervisorError> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.registry().contains(channel).await {
            return Ok(StartOutcome::AlreadyActive);
        }

        let settings = self.settings();
        let input = match source::resolve(&settings.source_path(channel), channel).await {
            Ok(v) => v,
            Err(err) => {
                self.note(format!("start skipped: channel={channel} {err}"))
                    .await;
                return Err(err);
            }
        };

        let run_id = RunId::new();
        let work_dir = settings.work_dir(channel);
        {
            let mut map = self.registry().lock().await;
            if map.contains_key(channel) {
                return Ok(StartOutcome::AlreadyActive);
            }
            map.insert(
                channel.clone(),
                ChannelEntry::starting(
                    run_id,
                    input.clone(),
                    work_dir.clone(),
                    retry_count,
                    Instant::now(),
                ),
            );
        }

        let child = match self.launch(channel, &input, &work_dir).await {
            Ok(v) => v,
            Err(err) => {
                {
                    let mut map = self.registry().lock().await;
                    if map.get(channel).is_some_and(|e| e.run_id == run_id) {
                        map.remove(channel);
                        remove_work_dir(&work_dir).await;
                    }
                }
                self.counters().record_error();
                tracing::error!(channel = %channel, %run_id, error = %err, "worker launch failed");
                self.note(format!("start failed: channel={channel} {err}"))
                    .await;
                return Err(err);
            }
        };

        self.attach(channel, run_id, retry_count, child).await;
        Ok(StartOutcome::Started { run_id })
    }

    async fn launch(
        &self,
        channel: &ChannelId,
        input: &str,
        work_dir: &Path,
    ) -> Result<Child, SupervisorError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|source| SupervisorError::WorkDir {
                path: work_dir.to_path_buf(),
                source,
            })?;

        let spec = WorkerSpec::build(self.settings(), channel, input, work_dir);
        tracing::debug!(channel = %channel, program = %spec.program, args = ?spec.args, "spawning worker");
        worker::spawn(&spec)
    }

    /// Promotes the `Starting` entry to `Running`, wires output forwarding
    /// and hands the child to its exit observer.
    async fn attach(&self, channel: &ChannelId, run_id: RunId, retry_count: u32, mut child: Child) {
        let pid = child.id();
        if let Some(out) = child.stdout.take() {
            forward_lines(out, self.logs().clone(), channel.clone());
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, self.logs().clone(), channel.clone());
        }

        let (handle, signals) = WorkerHandle::new(run_id, pid);
        let stop_requested = {
            let mut map = self.registry().lock().await;
            let entry = map.get_mut(channel).filter(|e| e.run_id == run_id);
            if entry.is_none() {
                tracing::warn!(channel = %channel, %run_id, "entry vanished before worker attached");
            }
            install_worker(entry, handle, self.settings().stop_grace())
        };

        self.counters().record_started();
        tracing::info!(channel = %channel, %run_id, ?pid, retry = retry_count, "worker started");
        self.note(format!(
            "started: channel={channel} run={run_id} pid={} retry={retry_count}",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        ))
        .await;
        if stop_requested {
            self.note(format!("stop requested during start: channel={channel}"))
                .await;
        }

        tokio::spawn(self.clone().observe_exit(channel.clone(), run_id, child, signals));
    }

    /// Intentional stop. Returns false (and does nothing) when the channel has
    /// no entry; teardown completes in the exit observer.
    pub async fn stop_stream(&self, channel: &ChannelId) -> bool {
        let stopped = {
            let mut map = self.registry().lock().await;
            match map.get_mut(channel) {
                Some(e) => {
                    request_stop(e, self.settings().stop_grace());
                    true
                }
                None => false,
            }
        };
        if stopped {
            self.note(format!("stop requested: channel={channel}")).await;
        }
        stopped
    }

    /// The single transition point from alive to absent for one run.
    async fn observe_exit(
        self,
        channel: ChannelId,
        run_id: RunId,
        child: Child,
        signals: mpsc::Receiver<Signal>,
    ) {
        let res = worker::wait_with_signals(child, signals).await;
        let exit = describe_exit(&res);

        let (transition, runtime) = {
            let mut map = self.registry().lock().await;
            let entry = match map.remove(&channel) {
                Some(e) if e.run_id == run_id => e,
                Some(other) => {
                    map.insert(channel.clone(), other);
                    tracing::warn!(channel = %channel, %run_id, "exit observed for a superseded run");
                    return;
                }
                None => {
                    tracing::warn!(channel = %channel, %run_id, "exit observed without a registry entry");
                    return;
                }
            };
            self.counters().record_stopped();
            // Still under the lock: a fresh start cannot recreate the dir
            // until the old output is gone.
            remove_work_dir(&entry.work_dir).await;
            (
                ExitTransition::decide(
                    entry.intentional_stop,
                    entry.retry_count,
                    self.settings().max_retries,
                ),
                entry.started_at.elapsed(),
            )
        };

        tracing::info!(
            channel = %channel,
            %run_id,
            state = ?transition.state(),
            runtime_ms = runtime.as_millis() as u64,
            "worker exited ({exit})"
        );

        match transition {
            ExitTransition::Intentional => {
                self.note(format!("stopped: channel={channel} {exit}")).await;
            }
            ExitTransition::Retry { next_retry } => {
                self.counters().record_error();
                let delay = self.settings().restart_delay();
                self.note(format!(
                    "crashed: channel={channel} {exit}; restart in {}ms (attempt {next_retry}/{})",
                    delay.as_millis(),
                    self.settings().max_retries
                ))
                .await;
                self.schedule_restart(channel, next_retry, delay);
            }
            ExitTransition::Exhausted { retries } => {
                self.counters().record_error();
                tracing::error!(channel = %channel, retries, "worker restart budget exhausted");
                self.note(format!(
                    "fatal: channel={channel} {exit}; gave up after {retries} restarts"
                ))
                .await;
            }
        }
    }

    fn schedule_restart(&self, channel: ChannelId, retry_count: u32, delay: Duration) {
        let sup = self.clone();
        let shutdown = self.shutdown_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match sup.start_boxed(channel.clone(), retry_count).await {
                Ok(StartOutcome::Started { run_id }) => {
                    tracing::info!(channel = %channel, %run_id, retry = retry_count, "auto-restart triggered");
                }
                Ok(StartOutcome::AlreadyActive) => {
                    tracing::debug!(channel = %channel, "auto-restart skipped, channel already active");
                }
                Err(err) => {
                    tracing::warn!(channel = %channel, error = %err, "auto-restart failed");
                }
            }
        });
    }

    /// Marks every channel idle longer than `threshold` at `now` as
    /// intentionally stopped. The idle check and the stop happen under one
    /// registry lock, so a concurrent touch either wins or loses as a whole.
    pub async fn stop_idle(&self, now: Instant, threshold: Duration) -> Vec<ChannelId> {
        let grace = self.settings().stop_grace();
        let reaped: Vec<ChannelId> = {
            let mut map = self.registry().lock().await;
            idle_channels(&map, now, threshold)
                .into_iter()
                .inspect(|id| {
                    if let Some(e) = map.get_mut(id) {
                        request_stop(e, grace);
                    }
                })
                .collect()
        };
        for channel in &reaped {
            self.note(format!("idle stop: channel={channel}")).await;
        }
        reaped
    }
}

fn idle_channels(map: &ChannelTable, now: Instant, threshold: Duration) -> Vec<ChannelId> {
    let mut out: Vec<ChannelId> = map
        .iter()
        .filter(|(_, e)| !e.intentional_stop && e.idle_for(now) > threshold)
        .map(|(id, _)| id.clone())
        .collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn idle_channels_uses_strict_threshold_and_skips_stopping() {
        let t0 = Instant::now();
        let mut map = ChannelTable::new();
        let mk = |retry| {
            ChannelEntry::starting(RunId::new(), "x://y".to_string(), PathBuf::from("/tmp"), retry, t0)
        };
        map.insert(ChannelId::parse("a").unwrap(), mk(0));
        map.insert(ChannelId::parse("b").unwrap(), mk(0));
        let mut stopping = mk(0);
        stopping.intentional_stop = true;
        map.insert(ChannelId::parse("c").unwrap(), stopping);
        if let Some(b) = map.get_mut(&ChannelId::parse("b").unwrap()) {
            b.last_access_at = t0 + Duration::from_secs(100);
        }

        let threshold = Duration::from_secs(120);
        assert!(idle_channels(&map, t0 + threshold, threshold).is_empty());
        assert_eq!(
            idle_channels(&map, t0 + Duration::from_secs(121), threshold),
            vec![ChannelId::parse("a").unwrap()]
        );
    }

    #[test]
    fn request_stop_flags_starting_entry() {
        let mut e = ChannelEntry::starting(
            RunId::new(),
            "x://y".to_string(),
            PathBuf::from("/tmp"),
            0,
            Instant::now(),
        );
        request_stop(&mut e, Duration::from_secs(5));
        assert!(e.intentional_stop);
        assert!(e.worker.is_none());
    }

    #[tokio::test]
    async fn install_worker_promotes_entry() {
        let mut e = ChannelEntry::starting(
            RunId::new(),
            "x://y".to_string(),
            PathBuf::from("/tmp"),
            0,
            Instant::now(),
        );
        let (handle, mut rx) = WorkerHandle::new(e.run_id, Some(42));

        assert!(!install_worker(Some(&mut e), handle, Duration::from_secs(5)));
        assert_eq!(e.state, ChannelState::Running);
        assert_eq!(e.worker.as_ref().and_then(|w| w.pid), Some(42));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn install_worker_honours_stop_requested_while_starting() {
        let mut e = ChannelEntry::starting(
            RunId::new(),
            "x://y".to_string(),
            PathBuf::from("/tmp"),
            0,
            Instant::now(),
        );
        request_stop(&mut e, Duration::from_secs(5));
        let (handle, mut rx) = WorkerHandle::new(e.run_id, Some(42));

        assert!(install_worker(Some(&mut e), handle, Duration::from_secs(5)));
        assert_eq!(rx.try_recv().ok(), Some(Signal::Terminate));
    }

    #[tokio::test]
    async fn orphaned_worker_is_terminated() {
        let (handle, mut rx) = WorkerHandle::new(RunId::new(), Some(42));

        assert!(install_worker(None, handle, Duration::from_millis(50)));
        assert_eq!(rx.try_recv().ok(), Some(Signal::Terminate));
        // The kill timer keeps the sender alive until it escalates.
        assert_eq!(rx.recv().await, Some(Signal::Kill));
    }

    #[cfg(unix)]
    #[test]
    fn describe_exit_reports_code_or_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(describe_exit(&Ok(ExitStatus::from_raw(1 << 8))), "exit_code=1");
        assert_eq!(describe_exit(&Ok(ExitStatus::from_raw(9))), "signal=9");
    }
}

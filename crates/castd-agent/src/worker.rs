use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use castd_process::{ChannelId, RunId};
use tokio::{
    process::{Child, Command},
    sync::mpsc,
};

use crate::{config::Settings, error::SupervisorError};

/// Resolved invocation for one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl WorkerSpec {
    /// Expands `{input}`, `{dir}` and `{channel}` in the configured argument
    /// template. Same inputs always give the same invocation.
    pub fn build(settings: &Settings, channel: &ChannelId, input: &str, dir: &Path) -> Self {
        let dir_str = dir.display().to_string();
        let args = settings
            .worker_args
            .iter()
            .map(|a| {
                a.replace("{input}", input)
                    .replace("{dir}", &dir_str)
                    .replace("{channel}", channel.as_str())
            })
            .collect();

        Self {
            program: settings.worker_program.clone(),
            args,
            cwd: dir.to_path_buf(),
        }
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, take the worker with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

pub fn spawn(spec: &WorkerSpec) -> Result<Child, SupervisorError> {
    let mut cmd = Command::new(&spec.program);
    cmd.current_dir(&spec.cwd)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own session so signals reach the whole process group.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: spec.program.clone(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Registry-side handle to a running worker.
///
/// The `Child` itself lives in the exit observer task; signals are routed
/// through it so they can only reach a process that has not been reaped yet.
#[derive(Debug)]
pub struct WorkerHandle {
    pub run_id: RunId,
    pub pid: Option<u32>,
    signals: mpsc::Sender<Signal>,
}

impl WorkerHandle {
    pub fn new(run_id: RunId, pid: Option<u32>) -> (Self, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(4);
        (
            Self {
                run_id,
                pid,
                signals: tx,
            },
            rx,
        )
    }

    /// Returns false once the worker has already been reaped.
    pub fn signal(&self, sig: Signal) -> bool {
        self.signals.try_send(sig).is_ok()
    }

    /// Escalates to `SIGKILL` after `grace`. The timer is bound to this run:
    /// it finishes early as soon as the observer for this run goes away.
    pub fn schedule_kill(&self, grace: Duration) {
        let tx = self.signals.clone();
        let run_id = self.run_id;
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {}
                _ = tokio::time::sleep(grace) => {
                    if tx.send(Signal::Kill).await.is_ok() {
                        tracing::warn!(%run_id, grace_ms = grace.as_millis() as u64, "worker ignored SIGTERM, sending SIGKILL");
                    }
                }
            }
        });
    }
}

fn deliver(child: &mut Child, pgid: Option<i32>, sig: Signal) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        let signo = match sig {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(-pgid, signo) };
        if rc == 0 {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = (pgid, sig);

    if let Err(err) = child.start_kill() {
        tracing::warn!(%err, "failed to kill worker");
    }
}

/// Waits for the child to exit while applying signals addressed to it.
pub async fn wait_with_signals(
    mut child: Child,
    mut signals: mpsc::Receiver<Signal>,
) -> std::io::Result<ExitStatus> {
    let pgid = child.id().map(|p| p as i32);
    loop {
        tokio::select! {
            res = child.wait() => return res,
            Some(sig) = signals.recv() => deliver(&mut child, pgid, sig),
        }
    }
}

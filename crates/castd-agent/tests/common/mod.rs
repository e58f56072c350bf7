#![allow(dead_code)]

use std::{future::Future, path::Path, time::Duration};

use castd_agent::{Supervisor, config::Settings};
use castd_process::ChannelId;
use tempfile::TempDir;

/// Settings with shortened timings and a `/bin/sh` worker. The script sees
/// the input url as `$1` and the work dir as `$2`.
pub fn settings(root: &Path, script: &str) -> Settings {
    Settings {
        data_root: root.join("data"),
        sources_dir: root.join("channels"),
        worker_program: "/bin/sh".to_string(),
        worker_args: vec![
            "-c".to_string(),
            script.to_string(),
            "castd-worker".to_string(),
            "{input}".to_string(),
            "{dir}".to_string(),
        ],
        stop_grace_ms: 400,
        restart_delay_ms: 50,
        wait_budget_ms: 1500,
        wait_initial_ms: 50,
        wait_step_ms: 50,
        wait_cap_ms: 200,
        ..Settings::default()
    }
}

pub fn write_source(root: &Path, channel: &str, body: &str) {
    let dir = root.join("channels");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{channel}.txt")), body).unwrap();
}

pub struct Fixture {
    pub tmp: TempDir,
    pub sup: Supervisor,
    pub channel: ChannelId,
}

pub fn fixture(script: &str) -> Fixture {
    fixture_with(script, |_| {})
}

pub fn fixture_with(script: &str, tweak: impl FnOnce(&mut Settings)) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    write_source(tmp.path(), "news1", "# news\nhttps://example.com/feed.m3u8\n");
    let mut s = settings(tmp.path(), script);
    tweak(&mut s);
    Fixture {
        sup: Supervisor::new(s),
        channel: ChannelId::parse("news1").unwrap(),
        tmp,
    }
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

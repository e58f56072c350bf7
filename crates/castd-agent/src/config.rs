use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use castd_process::ChannelId;
use serde::Deserialize;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

/// What the manifest endpoint answers when the worker output is not ready
/// within the wait budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotReadyPolicy {
    /// 503 with `Retry-After`.
    Status,
    /// 200 with the configured placeholder manifest (503 if unreadable).
    Placeholder,
}

impl NotReadyPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "status" => Some(Self::Status),
            "placeholder" => Some(Self::Placeholder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub data_root: PathBuf,
    pub sources_dir: PathBuf,
    pub url_prefix: String,
    pub manifest_name: String,
    pub worker_program: String,
    // Placeholders: {input}, {dir}, {channel}.
    pub worker_args: Vec<String>,
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub stop_grace_ms: u64,
    pub restart_delay_ms: u64,
    pub max_retries: u32,
    pub wait_budget_ms: u64,
    pub wait_initial_ms: u64,
    pub wait_step_ms: u64,
    pub wait_cap_ms: u64,
    pub not_ready: NotReadyPolicy,
    pub placeholder_manifest: Option<PathBuf>,
    pub log_backlog_lines: usize,
    pub log_dir: Option<PathBuf>,
}

fn default_worker_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-i",
        "{input}",
        "-c",
        "copy",
        "-f",
        "hls",
        "-hls_time",
        "4",
        "-hls_list_size",
        "6",
        "-hls_flags",
        "delete_segments+independent_segments",
        "-hls_base_url",
        "{channel}/",
        "-hls_segment_filename",
        "{dir}/seg_%05d.ts",
        "{dir}/index.m3u8",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            data_root: PathBuf::from("data"),
            sources_dir: PathBuf::from("channels"),
            url_prefix: "live".to_string(),
            manifest_name: "index.m3u8".to_string(),
            worker_program: "ffmpeg".to_string(),
            worker_args: default_worker_args(),
            idle_timeout_secs: 120,
            reap_interval_secs: 15,
            stats_interval_secs: 5,
            stop_grace_ms: 5000,
            restart_delay_ms: 5000,
            max_retries: 3,
            wait_budget_ms: 15_000,
            wait_initial_ms: 1000,
            wait_step_ms: 500,
            wait_cap_ms: 3000,
            not_ready: NotReadyPolicy::Status,
            placeholder_manifest: None,
            log_backlog_lines: 500,
            log_dir: None,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file named by `CASTD_CONFIG`, then `CASTD_*`
    /// environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = match env_string("CASTD_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_env();
        settings.clamp_ranges();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut settings: Self =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        settings.clamp_ranges();
        Ok(settings)
    }

    /// Keeps timings and sizes inside the ranges the background loops need.
    fn clamp_ranges(&mut self) {
        self.idle_timeout_secs = self.idle_timeout_secs.clamp(10, 24 * 60 * 60);
        self.reap_interval_secs = self.reap_interval_secs.clamp(1, 10 * 60);
        self.stats_interval_secs = self.stats_interval_secs.clamp(1, 10 * 60);
        self.stop_grace_ms = self.stop_grace_ms.clamp(100, 60_000);
        self.restart_delay_ms = self.restart_delay_ms.clamp(100, 10 * 60 * 1000);
        self.max_retries = self.max_retries.min(100);
        self.wait_budget_ms = self.wait_budget_ms.clamp(1000, 120_000);
        self.wait_cap_ms = self.wait_cap_ms.clamp(50, 60_000);
        self.wait_initial_ms = self.wait_initial_ms.clamp(10, self.wait_cap_ms);
        self.wait_step_ms = self.wait_step_ms.min(self.wait_cap_ms);
        self.log_backlog_lines = self.log_backlog_lines.clamp(10, 50_000);
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("CASTD_LISTEN_ADDR").and_then(|v| v.parse().ok()) {
            self.listen_addr = v;
        }
        if let Some(v) = env_string("CASTD_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = env_string("CASTD_SOURCES_DIR") {
            self.sources_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("CASTD_URL_PREFIX") {
            self.url_prefix = v.trim_matches('/').to_string();
        }
        if let Some(v) = env_string("CASTD_WORKER_PROGRAM") {
            self.worker_program = v;
        }
        if let Some(v) = env_u64("CASTD_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = v;
        }
        if let Some(v) = env_u64("CASTD_REAP_INTERVAL_SECS") {
            self.reap_interval_secs = v;
        }
        if let Some(v) = env_u64("CASTD_STATS_INTERVAL_SECS") {
            self.stats_interval_secs = v;
        }
        if let Some(v) = env_u64("CASTD_STOP_GRACE_MS") {
            self.stop_grace_ms = v;
        }
        if let Some(v) = env_u64("CASTD_RESTART_DELAY_MS") {
            self.restart_delay_ms = v;
        }
        if let Some(v) = env_u64("CASTD_MAX_RETRIES") {
            self.max_retries = v.min(100) as u32;
        }
        if let Some(v) = env_u64("CASTD_WAIT_BUDGET_MS") {
            self.wait_budget_ms = v;
        }
        if let Some(v) = env_string("CASTD_NOT_READY").and_then(|v| NotReadyPolicy::parse(&v)) {
            self.not_ready = v;
        }
        if let Some(v) = env_string("CASTD_PLACEHOLDER_MANIFEST") {
            self.placeholder_manifest = Some(PathBuf::from(v));
        }
        if let Some(v) = env_u64("CASTD_LOG_BACKLOG_LINES") {
            self.log_backlog_lines = v.min(50_000) as usize;
        }
        if let Some(v) = env_string("CASTD_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
    }

    pub fn work_dir(&self, channel: &ChannelId) -> PathBuf {
        self.data_root.join("streams").join(channel.as_str())
    }

    pub fn manifest_path(&self, channel: &ChannelId) -> PathBuf {
        self.work_dir(channel).join(&self.manifest_name)
    }

    pub fn source_path(&self, channel: &ChannelId) -> PathBuf {
        self.sources_dir.join(format!("{}.txt", channel.as_str()))
    }

    /// Extension the manifest route matches on (`m3u8` for `index.m3u8`).
    pub fn manifest_ext(&self) -> &str {
        Path::new(&self.manifest_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("m3u8")
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_supervision_constants() {
        let s = Settings::default();
        assert_eq!(s.idle_timeout(), Duration::from_secs(120));
        assert_eq!(s.reap_interval(), Duration::from_secs(15));
        assert_eq!(s.stats_interval(), Duration::from_secs(5));
        assert_eq!(s.stop_grace(), Duration::from_secs(5));
        assert_eq!(s.restart_delay(), Duration::from_secs(5));
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.wait_budget(), Duration::from_secs(15));
        assert_eq!(s.not_ready, NotReadyPolicy::Status);
    }

    #[test]
    fn paths_are_scoped_per_channel() {
        let s = Settings {
            data_root: PathBuf::from("/srv/castd"),
            sources_dir: PathBuf::from("/etc/castd/channels"),
            ..Settings::default()
        };
        let id = ChannelId::parse("news1").unwrap();
        assert_eq!(s.work_dir(&id), PathBuf::from("/srv/castd/streams/news1"));
        assert_eq!(
            s.manifest_path(&id),
            PathBuf::from("/srv/castd/streams/news1/index.m3u8")
        );
        assert_eq!(
            s.source_path(&id),
            PathBuf::from("/etc/castd/channels/news1.txt")
        );
        assert_eq!(s.manifest_ext(), "m3u8");
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let s: Settings = toml::from_str(
            r#"
            url_prefix = "hls"
            idle_timeout_secs = 30
            not_ready = "placeholder"
            placeholder_manifest = "/srv/placeholder.m3u8"
            "#,
        )
        .unwrap();
        assert_eq!(s.url_prefix, "hls");
        assert_eq!(s.idle_timeout_secs, 30);
        assert_eq!(s.not_ready, NotReadyPolicy::Placeholder);
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.worker_program, "ffmpeg");
    }

    #[test]
    fn file_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("castd.toml");
        std::fs::write(
            &path,
            r#"
            reap_interval_secs = 0
            stats_interval_secs = 0
            wait_cap_ms = 0
            wait_initial_ms = 0
            stop_grace_ms = 1
            idle_timeout_secs = 999999
            "#,
        )
        .unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.reap_interval(), Duration::from_secs(1));
        assert_eq!(s.stats_interval(), Duration::from_secs(1));
        assert_eq!(s.wait_cap_ms, 50);
        assert_eq!(s.wait_initial_ms, 10);
        assert_eq!(s.stop_grace(), Duration::from_millis(100));
        assert_eq!(s.idle_timeout(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(s.wait_budget(), Duration::from_secs(15));
    }

    #[test]
    fn defaults_survive_clamping() {
        let mut s = Settings::default();
        s.clamp_ranges();
        assert_eq!(s.idle_timeout_secs, 120);
        assert_eq!(s.wait_initial_ms, 1000);
        assert_eq!(s.wait_step_ms, 500);
        assert_eq!(s.wait_cap_ms, 3000);
        assert_eq!(s.log_backlog_lines, 500);
    }

    #[test]
    fn not_ready_policy_parse_is_case_insensitive() {
        assert_eq!(NotReadyPolicy::parse(" Status "), Some(NotReadyPolicy::Status));
        assert_eq!(
            NotReadyPolicy::parse("PLACEHOLDER"),
            Some(NotReadyPolicy::Placeholder)
        );
        assert_eq!(NotReadyPolicy::parse("maybe"), None);
    }
}

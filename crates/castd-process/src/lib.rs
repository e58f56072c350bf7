use std::fmt;

/// Stable channel identifier, restricted to `[A-Za-z0-9_-]+`.
///
/// NOTE: The id is used both as a map key and as a directory name under the
/// data root, so anything outside that charset is rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidChannelId(pub String);

impl fmt::Display for InvalidChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid channel id: {:?}", self.0)
    }
}

impl std::error::Error for InvalidChannelId {}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl ChannelId {
    pub fn parse(raw: &str) -> Result<Self, InvalidChannelId> {
        if raw.is_empty() || !raw.chars().all(is_safe_char) {
            return Err(InvalidChannelId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = InvalidChannelId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifies one spawned worker. A channel gets a fresh `RunId` per spawn,
/// including retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-channel lifecycle. `Absent` is not a variant: a channel without a
/// registry entry is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Starting,
    Running,
    ExitedIntentional,
    ExitedCrashRetrying,
    ExitedCrashExhausted,
}

/// Decision taken by the exit observer once a worker has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTransition {
    Intentional,
    Retry { next_retry: u32 },
    Exhausted { retries: u32 },
}

impl ExitTransition {
    pub fn decide(intentional: bool, retry_count: u32, max_retries: u32) -> Self {
        if intentional {
            Self::Intentional
        } else if retry_count < max_retries {
            Self::Retry {
                next_retry: retry_count.saturating_add(1),
            }
        } else {
            Self::Exhausted {
                retries: retry_count,
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        match self {
            Self::Intentional => ChannelState::ExitedIntentional,
            Self::Retry { .. } => ChannelState::ExitedCrashRetrying,
            Self::Exhausted { .. } => ChannelState::ExitedCrashExhausted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_started: u64,
    pub total_stopped: u64,
    pub total_errors: u64,
    pub bandwidth_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_accepts_word_chars_and_dash() {
        for ok in ["news1", "a", "Sports_HD", "ch-7", "__", "0"] {
            assert!(ChannelId::parse(ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn channel_id_rejects_unsafe_input() {
        for bad in ["", "../etc", "a b", "ch.1", "news/1", "caf\u{e9}", "x\n"] {
            assert!(ChannelId::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn run_id_is_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn intentional_exit_never_retries() {
        let t = ExitTransition::decide(true, 0, 3);
        assert_eq!(t, ExitTransition::Intentional);
        assert_eq!(t.state(), ChannelState::ExitedIntentional);
    }

    #[test]
    fn crash_retries_until_budget_is_spent() {
        assert_eq!(
            ExitTransition::decide(false, 0, 3),
            ExitTransition::Retry { next_retry: 1 }
        );
        assert_eq!(
            ExitTransition::decide(false, 2, 3),
            ExitTransition::Retry { next_retry: 3 }
        );
        let t = ExitTransition::decide(false, 3, 3);
        assert_eq!(t, ExitTransition::Exhausted { retries: 3 });
        assert_eq!(t.state(), ChannelState::ExitedCrashExhausted);
    }

    #[test]
    fn totals_serialize_camel_case() {
        let v = serde_json::to_value(Totals {
            total_started: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(v["totalStarted"], 1);
        assert_eq!(v["bandwidthBytes"], 0);
    }
}

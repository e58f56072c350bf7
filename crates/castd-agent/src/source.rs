use std::{io::ErrorKind, path::Path};

use castd_process::ChannelId;

use crate::error::SupervisorError;

fn looks_like_url(s: &str) -> bool {
    let Some((scheme, rest)) = s.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && !rest.is_empty()
        && !s.chars().any(char::is_whitespace)
}

/// First non-empty line that is not a `#` comment, if it is a URL.
pub fn parse_source(text: &str) -> Option<String> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))?;
    looks_like_url(line).then(|| line.to_string())
}

/// Resolves a channel to its upstream URL from `<sources_dir>/<id>.txt`.
pub async fn resolve(path: &Path, channel: &ChannelId) -> Result<String, SupervisorError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SupervisorError::SourceMissing {
                channel: channel.to_string(),
                path: path.to_path_buf(),
            });
        }
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "failed to read source config");
            return Err(SupervisorError::SourceMalformed {
                channel: channel.to_string(),
                path: path.to_path_buf(),
            });
        }
    };

    parse_source(&text).ok_or_else(|| SupervisorError::SourceMalformed {
        channel: channel.to_string(),
        path: path.to_path_buf(),
    })
}

use std::path::PathBuf;

use castd_process::InvalidChannelId;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid channel id: {0:?}")]
    InvalidIdentifier(String),

    #[error("no source configured for channel {channel} ({})", path.display())]
    SourceMissing { channel: String, path: PathBuf },

    #[error("source config for channel {channel} has no usable url ({})", path.display())]
    SourceMalformed { channel: String, path: PathBuf },

    #[error("prepare work dir {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl From<InvalidChannelId> for SupervisorError {
    fn from(value: InvalidChannelId) -> Self {
        Self::InvalidIdentifier(value.0)
    }
}

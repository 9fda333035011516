use crate::stream::{Track, TrackRole};

pub type RecordResult<T> = Result<T, RecordError>;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The encoder rejected the requested format. Fatal to that adapter only.
    #[error("{role} encoder rejected its configuration: {cause:#}")]
    Configuration {
        role: TrackRole,
        cause: anyhow::Error,
    },

    /// An encoder, drain or write operation failed at runtime.
    #[error("{role} encoder failed: {cause:#}")]
    Capability {
        role: TrackRole,
        cause: anyhow::Error,
    },

    /// A resource could not be stopped or released during teardown.
    #[error("failed to release {resource}: {cause:#}")]
    ResourceRelease {
        resource: &'static str,
        cause: anyhow::Error,
    },

    #[error("container error: {0:#}")]
    Container(anyhow::Error),

    #[error("multiplexer already started")]
    MuxerStarted,

    #[error("multiplexer stopped")]
    MuxerStopped,

    #[error("multiplexer does not expect a {0} track")]
    UnexpectedTrack(TrackRole),

    #[error("track {0} is not registered")]
    UnknownTrack(Track),

    #[error("expected track count must be 1 or 2, got {0}")]
    InvalidTrackCount(usize),

    #[error("capture grant has been revoked")]
    GrantRevoked,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}

impl RecordError {
    pub fn configuration(role: TrackRole, cause: impl Into<anyhow::Error>) -> Self {
        Self::Configuration {
            role,
            cause: cause.into(),
        }
    }

    pub fn capability(role: TrackRole, cause: impl Into<anyhow::Error>) -> Self {
        Self::Capability {
            role,
            cause: cause.into(),
        }
    }

    pub fn release(resource: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::ResourceRelease {
            resource,
            cause: cause.into(),
        }
    }
}

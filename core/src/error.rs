/// Error types for the sync engine
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Identity resolution error: {0}")]
    IdentityResolution(String),

    #[error("Channel connection error: {0}")]
    ChannelConnection(String),

    #[error("Snapshot fetch error: {0}")]
    SnapshotFetch(String),

    #[error("Mutation error: {0}")]
    Mutation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync engine stopped")]
    EngineStopped,
}

/// Coarse error category, safe to hand to a UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IdentityResolution,
    ChannelConnection,
    SnapshotFetch,
    Mutation,
    Config,
    Io,
    Serialization,
    EngineStopped,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::IdentityResolution(_) => ErrorKind::IdentityResolution,
            SyncError::ChannelConnection(_) => ErrorKind::ChannelConnection,
            SyncError::SnapshotFetch(_) => ErrorKind::SnapshotFetch,
            SyncError::Mutation(_) => ErrorKind::Mutation,
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::Io(_) => ErrorKind::Io,
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::EngineStopped => ErrorKind::EngineStopped,
        }
    }
}

impl ErrorKind {
    /// Same spelling as the serialized form
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::IdentityResolution => "identity_resolution",
            ErrorKind::ChannelConnection => "channel_connection",
            ErrorKind::SnapshotFetch => "snapshot_fetch",
            ErrorKind::Mutation => "mutation",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::EngineStopped => "engine_stopped",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

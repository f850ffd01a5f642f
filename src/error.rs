use thiserror::Error;

/// Domain errors surfaced across component boundaries.
///
/// Internal bus/coordinator failures are handled and logged at their origin
/// (see the error handling design); this enum only carries the cases callers
/// actually need to branch on.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("node is in lockdown")]
    LockdownActive,

    #[error("write gate is closed")]
    GateClosed,

    #[error("node {requested} rejected RPC targeted at {targeted}")]
    WrongTarget { requested: String, targeted: String },

    #[error("snapshot command {0} timed out waiting for quorum")]
    SnapshotTimeout(String),

    #[error("peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type FabricResult<T> = std::result::Result<T, FabricError>;

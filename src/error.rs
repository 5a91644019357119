// Error types shared across the broker and peer cores.

use thiserror::Error;

/// Top-level error for fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sys(#[from] nix::Error),

    #[error("peer {0} is gone")]
    PeerGone(u64),

    #[error("malformed wire frame")]
    MalformedFrame,

    #[error("no available peer ids")]
    Full,
}

pub type Result<T> = std::result::Result<T, FabricError>;

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("unknown election implementation: {0}")]
    UnknownElection(String),

    #[error("peer channel closed")]
    ChannelClosed,

    #[error("peer channel at capacity")]
    ChannelFull,

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("frame of {0} bytes exceeds limit")]
    OversizedFrame(usize),

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlotillaError>;

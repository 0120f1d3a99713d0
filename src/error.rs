//! Crate-wide error type.
//!
//! The abstract error kinds from the design doc collapse into one flat
//! enum: front-end heads, the pool, and the tunnel session all need to
//! match on a handful of these variants to decide how to respond to the
//! local client, so a flat `thiserror` enum (rather than a tree of nested
//! per-subsystem types) keeps call sites simple.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out waiting for CONNECT response")]
    StreamOpenTimeout,

    #[error("remote refused connection: {0}")]
    ConnectionRefused(String),

    #[error("invalid CONNECT response from remote")]
    InvalidResponse,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("local protocol error: {0}")]
    LocalProtocol(String),

    #[error("pool exhausted")]
    PoolExhausted,

    #[error("pool is closed")]
    PoolClosed,

    #[error("warmup failed: 0 of {0} tunnels connected")]
    WarmupFailed(usize),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

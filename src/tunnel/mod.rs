//! The secure tunnel session and its multiplexer.
//!
//! [`session::Tunnel`] owns one authenticated, encrypted WebSocket
//! connection and the stream table multiplexed inside it; [`stream::Stream`]
//! is the per-destination handle handed to front-end heads. The pool
//! ([`crate::pool`]) is the only thing that creates and discards tunnels.

pub mod protocol;
pub mod session;
pub mod stream;
pub mod writer;

pub use session::{Tunnel, TunnelBackend};
pub use stream::Stream;

//! A local SOCKS5/HTTP-CONNECT front end that tunnels traffic to a remote
//! peer over an authenticated, encrypted WebSocket.
//!
//! [`Supervisor`] is the entry point: construct one, call `start` with a
//! validated [`Config`], and it warms up a [`TunnelPool`] of [`Tunnel`]s and
//! binds the two loopback listeners. Each accepted client gets a
//! multiplexed [`Stream`] pulled from the pool and relayed through
//! [`copier`].

pub mod config;
pub mod copier;
pub mod crypto;
pub mod error;
pub mod http_connect;
pub mod pool;
pub mod socks5;
pub mod supervisor;
pub mod tunnel;

pub use config::{Cli, Config};
pub use error::{Error, Result};
pub use pool::{PoolConfig, TunnelPool};
pub use supervisor::{State, Supervisor};
pub use tunnel::{Stream, Tunnel};

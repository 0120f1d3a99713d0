//! The tunnel pool: a small set of warm tunnels, least-loaded selection,
//! health pruning, and an upper bound on concurrent tunnels.
//!
//! Grounded on the teacher's `app.rs` orchestration style (state held
//! behind `Arc`, mutation serialized through an async `Mutex`) adapted to
//! the single `Vec<Arc<Tunnel>>` this spec calls for instead of the
//! teacher's per-server connection fan-out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::tunnel::{Stream, Tunnel};

/// `min_size` warmup target, `max_size` hard cap. Typical values per
/// spec.md section 4.4: `min_size` 2, `max_size` 5-10.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 5,
        }
    }
}

/// Quiescence delay enforced after `cleanup` before the pool is usable
/// again.
const CLEANUP_QUIESCENCE: Duration = Duration::from_millis(500);

/// Ceiling on the whole `open_stream` attempt (creation plus handshake),
/// matching the "pool wait-for-free" timeout in spec.md section 5.
const POOL_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct PoolStats {
    pub tunnels_created: AtomicU64,
    pub streams_opened: AtomicU64,
}

pub struct TunnelPool {
    config: Config,
    pool_config: PoolConfig,
    tunnels: Mutex<Vec<std::sync::Arc<Tunnel>>>,
    cleaning: AtomicBool,
    stats: PoolStats,
}

impl TunnelPool {
    pub fn new(config: Config, pool_config: PoolConfig) -> Self {
        Self {
            config,
            pool_config,
            tunnels: Mutex::new(Vec::new()),
            cleaning: AtomicBool::new(false),
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.tunnels_created.load(Ordering::Relaxed),
            self.stats.streams_opened.load(Ordering::Relaxed),
        )
    }

    pub async fn len(&self) -> usize {
        self.tunnels.lock().await.len()
    }

    /// Serially attempt to create `min_size` tunnels. Fails `WarmupFailed`
    /// only if every attempt failed.
    pub async fn warmup(&self) -> Result<()> {
        let mut created = 0usize;
        for i in 0..self.pool_config.min_size {
            match Tunnel::connect(&self.config).await {
                Ok(tunnel) => {
                    self.tunnels.lock().await.push(tunnel);
                    self.stats.tunnels_created.fetch_add(1, Ordering::Relaxed);
                    created += 1;
                }
                Err(e) => {
                    warn!(index = i, error = %e, "warmup tunnel failed");
                }
            }
        }
        if created == 0 {
            return Err(Error::WarmupFailed(self.pool_config.min_size));
        }
        info!(
            created,
            requested = self.pool_config.min_size,
            "pool warmup complete"
        );
        Ok(())
    }

    /// Open a stream to `host:port`, following the five-step algorithm in
    /// spec.md section 4.4. Bounded by [`POOL_WAIT_TIMEOUT`] overall.
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<Stream> {
        if self.cleaning.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        tokio::time::timeout(POOL_WAIT_TIMEOUT, self.open_stream_inner(host, port))
            .await
            .unwrap_or(Err(Error::PoolExhausted))
    }

    async fn open_stream_inner(&self, host: &str, port: u16) -> Result<Stream> {
        // Step 1: try every currently-healthy tunnel in order.
        let snapshot: Vec<_> = self.tunnels.lock().await.clone();
        for tunnel in &snapshot {
            if !tunnel.is_healthy() {
                continue;
            }
            match tunnel.open_stream(host, port).await {
                Ok(stream) => {
                    self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
                    return Ok(stream);
                }
                Err(Error::ConnectionRefused(reason)) => {
                    return Err(Error::ConnectionRefused(reason))
                }
                Err(_) => continue,
            }
        }

        // Step 2: prune unhealthy tunnels.
        self.prune_unhealthy().await;

        // Step 3: create a fresh tunnel if there's room.
        let len = self.tunnels.lock().await.len();
        if len < self.pool_config.max_size {
            if let Ok(tunnel) = Tunnel::connect(&self.config).await {
                let mut table = self.tunnels.lock().await;
                if table.len() < self.pool_config.max_size {
                    table.push(tunnel.clone());
                }
                drop(table);
                self.stats.tunnels_created.fetch_add(1, Ordering::Relaxed);
                if let Ok(stream) = tunnel.open_stream(host, port).await {
                    self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
                    return Ok(stream);
                }
            }
        }

        // Step 4: pick the healthy tunnel with the smallest active-stream
        // count. Concurrent callers may race here; each independently
        // picks a candidate and the worst case is uneven load, not an
        // invariant violation.
        let candidate = {
            let table = self.tunnels.lock().await;
            table
                .iter()
                .filter(|t| t.is_healthy())
                .min_by_key(|t| t.active_stream_count())
                .cloned()
        };
        if let Some(tunnel) = candidate {
            if let Ok(stream) = tunnel.open_stream(host, port).await {
                self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
                return Ok(stream);
            }
        }

        Err(Error::PoolExhausted)
    }

    async fn prune_unhealthy(&self) {
        let mut to_close = Vec::new();
        {
            let mut table = self.tunnels.lock().await;
            table.retain(|t| {
                if t.is_healthy() {
                    true
                } else {
                    to_close.push(t.clone());
                    false
                }
            });
        }
        for tunnel in to_close {
            tunnel.close().await;
        }
    }

    /// Close every tunnel, clear the table, and enforce a short
    /// quiescence delay before the pool accepts new operations. A
    /// `cleanup` that runs while another is in progress is a no-op.
    pub async fn cleanup(&self) {
        if self.cleaning.swap(true, Ordering::AcqRel) {
            return;
        }
        let tunnels = {
            let mut table = self.tunnels.lock().await;
            std::mem::take(&mut *table)
        };
        for tunnel in tunnels {
            tunnel.close().await;
        }
        tokio::time::sleep(CLEANUP_QUIESCENCE).await;
        self.cleaning.store(false, Ordering::Release);
    }

    pub async fn rebuild(&self) -> Result<()> {
        self.cleanup().await;
        self.warmup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            name: "test".to_string(),
            sni_host: "nonexistent.invalid".to_string(),
            proxy_ip: None,
            ws_path: "/tunnel".to_string(),
            server_port: 443,
            socks_port: 1080,
            http_port: 8080,
            psk: [1u8; 32],
        }
    }

    #[tokio::test]
    async fn warmup_fails_when_no_tunnel_connects() {
        let pool = TunnelPool::new(sample_config(), PoolConfig { min_size: 2, max_size: 5 });
        let err = pool.warmup().await.unwrap_err();
        assert!(matches!(err, Error::WarmupFailed(2)));
    }

    #[tokio::test]
    async fn open_stream_fails_closed_during_cleanup() {
        let pool = TunnelPool::new(sample_config(), PoolConfig { min_size: 1, max_size: 2 });
        pool.cleaning.store(true, Ordering::Release);
        let err = pool.open_stream("example.com", 80).await.unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[tokio::test]
    async fn cleanup_during_cleanup_is_a_no_op() {
        let pool = TunnelPool::new(sample_config(), PoolConfig { min_size: 1, max_size: 2 });
        pool.cleaning.store(true, Ordering::Release);
        pool.cleanup().await;
        // The flag should remain true: the concurrent cleanup() call
        // returned immediately without touching it.
        assert!(pool.cleaning.load(Ordering::Acquire));
    }
}

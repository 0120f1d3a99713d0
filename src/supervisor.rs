//! Owns the pool and the two loopback listeners; `start`/`stop` are the
//! only entry points an outer shell needs, per spec.md section 4.8.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::{PoolConfig, TunnelPool};
use crate::{copier, http_connect, socks5};

/// Capacity of the log broadcast channel; slow/absent subscribers simply
/// miss older lines rather than backing up the logging path.
const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Running,
}

struct Listeners {
    socks: JoinHandle<()>,
    http: JoinHandle<()>,
}

/// Orchestrates pool warmup and the two front-end listeners. `start` and
/// `stop` are idempotent against concurrent calls.
pub struct Supervisor {
    pool_config: PoolConfig,
    log_tx: broadcast::Sender<String>,
    running: AtomicBool,
    listeners: tokio::sync::Mutex<Option<Listeners>>,
    pool: tokio::sync::Mutex<Option<Arc<TunnelPool>>>,
}

impl Supervisor {
    pub fn new(pool_config: PoolConfig) -> Arc<Self> {
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Arc::new(Self {
            pool_config,
            log_tx,
            running: AtomicBool::new(false),
            listeners: tokio::sync::Mutex::new(None),
            pool: tokio::sync::Mutex::new(None),
        })
    }

    /// Subscribe to the rendered log line stream for the lifetime of the
    /// supervisor; this is the "log sink" spec.md section 7 says a GUI
    /// shell consumes for short, stable, PSK-free failure strings.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    /// A `tracing_subscriber::Layer` that republishes each event as one
    /// pre-formatted line on this supervisor's broadcast channel. Install
    /// it alongside the usual `fmt`/`EnvFilter` layers in `main.rs`.
    pub fn log_layer(&self) -> BroadcastLogLayer {
        BroadcastLogLayer {
            tx: self.log_tx.clone(),
        }
    }

    pub fn state(&self) -> State {
        if self.running.load(Ordering::Acquire) {
            State::Running
        } else {
            State::Stopped
        }
    }

    /// Warm up the pool and bind both listeners. Rolls back (no listeners
    /// bound, pool torn down) if warmup fails. A `start` while already
    /// running is a no-op.
    pub async fn start(&self, config: Config) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.start_inner(config).await {
            self.running.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// The fallible body of `start`. Every error path here leaves no
    /// listeners bound and no pool installed; `start` resets `running` on
    /// any `Err` so a later `start` call is not a no-op.
    async fn start_inner(&self, config: Config) -> Result<()> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let pool = Arc::new(TunnelPool::new(config.clone(), self.pool_config));
        if let Err(e) = pool.warmup().await {
            warn!(error = %e, "pool warmup failed, start aborted");
            return Err(e);
        }

        let socks_listener = TcpListener::bind(("127.0.0.1", config.socks_port))
            .await
            .map_err(|e| Error::Config(format!("failed to bind socks5 listener: {e}")))?;
        let http_listener = TcpListener::bind(("127.0.0.1", config.http_port))
            .await
            .map_err(|e| Error::Config(format!("failed to bind http connect listener: {e}")))?;

        let socks = tokio::spawn(accept_loop(socks_listener, pool.clone(), Front::Socks5));
        let http = tokio::spawn(accept_loop(http_listener, pool.clone(), Front::HttpConnect));

        *self.pool.lock().await = Some(pool);
        *self.listeners.lock().await = Some(Listeners { socks, http });

        info!(
            socks_port = config.socks_port,
            http_port = config.http_port,
            "supervisor started"
        );
        Ok(())
    }

    /// Close both listeners, close every tunnel and stream, and reset to
    /// `Stopped`. A `stop` while already stopped is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(listeners) = self.listeners.lock().await.take() {
            listeners.socks.abort();
            listeners.http.abort();
        }
        if let Some(pool) = self.pool.lock().await.take() {
            pool.cleanup().await;
        }

        info!("supervisor stopped");
    }
}

#[derive(Clone, Copy)]
enum Front {
    Socks5,
    HttpConnect,
}

async fn accept_loop(listener: TcpListener, pool: Arc<TunnelPool>, front: Front) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = socket.set_nodelay(true);
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, pool, front).await {
                warn!(peer = %peer, error = %e, "client session ended with error");
            }
        });
    }
}

async fn handle_client(mut socket: TcpStream, pool: Arc<TunnelPool>, front: Front) -> Result<()> {
    let target = match front {
        Front::Socks5 => match socks5::handshake(&mut socket).await {
            Ok(t) => t,
            Err(e) => return Err(e),
        },
        Front::HttpConnect => {
            let mut reader = BufReader::new(socket);
            let target = match http_connect::read_connect_request(&mut reader).await {
                Ok(t) => t,
                Err(e) => return Err(e),
            };
            return handle_http_connect(reader, target, pool).await;
        }
    };

    match pool.open_stream(&target.host, target.port).await {
        Ok(stream) => {
            socks5::write_success(&mut socket)
                .await
                .map_err(|e| Error::LocalProtocol(e.to_string()))?;
            copier::run(socket, Arc::new(stream)).await;
            Ok(())
        }
        Err(e) => {
            socks5::write_failure_for(&mut socket, &e).await;
            Err(e)
        }
    }
}

async fn handle_http_connect(
    mut reader: BufReader<TcpStream>,
    target: http_connect::Target,
    pool: Arc<TunnelPool>,
) -> Result<()> {
    match pool.open_stream(&target.host, target.port).await {
        Ok(stream) => {
            tokio::io::AsyncWriteExt::write_all(&mut reader, http_connect::RESPONSE_200)
                .await
                .map_err(|e| Error::LocalProtocol(e.to_string()))?;
            // Keep the `BufReader` wrapper rather than unwrapping to the
            // bare socket: any bytes the client pipelined right after the
            // CONNECT headers are already sitting in its internal buffer.
            copier::run(reader, Arc::new(stream)).await;
            Ok(())
        }
        Err(e) => {
            let _ = tokio::io::AsyncWriteExt::write_all(&mut reader, http_connect::RESPONSE_502)
                .await;
            Err(e)
        }
    }
}

/// Renders each event as one line (`level target: message`) and republishes
/// it on the supervisor's broadcast channel. Never carries span/field
/// values that might hold key material; only the formatted message.
pub struct BroadcastLogLayer {
    tx: broadcast::Sender<String>,
}

impl<S: Subscriber> Layer<S> for BroadcastLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);
        let line = format!("{} {}: {}", event.metadata().level(), event.metadata().target(), message);
        let _ = self.tx.send(line);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.0, "{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn sample_config(socks_port: u16, http_port: u16) -> Config {
        Config {
            name: "test".to_string(),
            sni_host: "nonexistent.invalid".to_string(),
            proxy_ip: None,
            ws_path: "/tunnel".to_string(),
            server_port: 443,
            socks_port,
            http_port,
            psk: [1u8; 32],
        }
    }

    #[tokio::test]
    async fn start_fails_and_stays_stopped_when_warmup_fails() {
        let supervisor = Supervisor::new(PoolConfig {
            min_size: 1,
            max_size: 2,
        });
        let err = supervisor
            .start(sample_config(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(supervisor.state(), State::Stopped);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let supervisor = Supervisor::new(PoolConfig::default());
        supervisor.stop().await;
        assert_eq!(supervisor.state(), State::Stopped);
    }
}

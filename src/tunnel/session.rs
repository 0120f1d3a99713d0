//! A single authenticated, encrypted WebSocket tunnel session.
//!
//! Connect, handshake, and the receive loop all live here; everything that
//! mutates tunnel-wide state (the stream table, activity timestamp) is
//! touched only from the receive loop or under the streams mutex, so a
//! `Tunnel` never needs more than short, uncontended locks. Treat one
//! `Tunnel` as a single-mutator actor over its own WebSocket and stream
//! table, per spec.md section 9.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto;
use crate::error::{Error, Result};

use super::protocol::{parse_stream_reply, MuxFrame, StreamReply, HANDSHAKE_TOKEN_LEN};
use super::stream::Stream;
use super::writer::{self, FrameSender};

/// Authoritative timeouts from spec.md section 5.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_AGE: Duration = Duration::from_secs(30 * 60);

const PING_CONFIRM_ATTEMPTS: u32 = 3;
const PING_CONFIRM_SPACING: Duration = Duration::from_millis(500);

const DIAL_RETRY_ATTEMPTS: u32 = 3;
const DIAL_RETRY_BASE: Duration = Duration::from_secs(1);
const DIAL_RETRY_CAP: Duration = Duration::from_secs(5);

/// Trait seam between a [`Stream`] and its owning tunnel, so stream-level
/// code can be tested against a fake without a real socket.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    async fn send_data(&self, stream_id: u32, data: Bytes) -> Result<()>;
    async fn close_stream(&self, stream_id: u32);
    fn is_healthy(&self) -> bool;
}

enum StreamEntry {
    /// Awaiting the remote's `OK`/`ERR` reply. `data_tx` is created up front
    /// (before the `CONNECT` frame is even sent) so that if the remote's
    /// first data frame arrives on the same poll as its `OK` reply, the
    /// inbox already exists and `dispatch` can hand it straight to `Open`
    /// instead of dropping it.
    Pending {
        ready_tx: oneshot::Sender<std::result::Result<(), String>>,
        data_tx: mpsc::Sender<Bytes>,
    },
    Open(mpsc::Sender<Bytes>),
}

struct Streams {
    table: Mutex<HashMap<u32, StreamEntry>>,
    next_id: AtomicU32,
}

impl Streams {
    fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Stream ids are assigned by a monotonic per-tunnel counter starting
    /// at 1; the `u32` space is treated as effectively infinite.
    fn alloc_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// One live tunnel: a dedicated writer task, a receive/demux loop, and a
/// keepalive task, all sharing this handle.
pub struct Tunnel {
    id: u64,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    frame_tx: FrameSender,
    streams: Streams,
    alive: AtomicBool,
    active_count: AtomicU32,
    connected_at: Instant,
    last_activity_ms: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference to this tunnel's own `Arc`, so `open_stream` can hand
    /// streams an `Arc<dyn TunnelBackend>` without taking `self` by `Arc`.
    self_weak: Weak<Tunnel>,
}

impl Tunnel {
    /// Dial the remote, complete the TLS + WebSocket + auth handshake, and
    /// spawn the tunnel's background tasks. Retries the whole dial with
    /// exponential backoff (1, 2, 4s, capped at 5s) up to three attempts;
    /// once a tunnel is established, failures are the pool's problem, not
    /// the session's.
    pub async fn connect(config: &Config) -> Result<Arc<Tunnel>> {
        let mut last_err = Error::Dial("no attempt made".to_string());
        for attempt in 0..DIAL_RETRY_ATTEMPTS {
            match Self::connect_once(config).await {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "tunnel dial attempt failed");
                    last_err = e;
                }
            }
            if attempt + 1 < DIAL_RETRY_ATTEMPTS {
                let delay = DIAL_RETRY_BASE
                    .saturating_mul(1 << attempt)
                    .min(DIAL_RETRY_CAP);
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err)
    }

    async fn connect_once(config: &Config) -> Result<Arc<Tunnel>> {
        tokio::time::timeout(CONNECT_TIMEOUT, Self::dial_and_handshake(config))
            .await
            .map_err(|_| Error::Dial("connect timed out".to_string()))?
    }

    async fn dial_and_handshake(config: &Config) -> Result<Arc<Tunnel>> {
        let target: SocketAddr =
            tokio::net::lookup_host((config.effective_host(), config.server_port))
                .await
                .map_err(|e| Error::Dial(format!("dns lookup failed: {e}")))?
                .next()
                .ok_or_else(|| Error::Dial("dns lookup returned no addresses".to_string()))?;

        let tcp = TcpStream::connect(target)
            .await
            .map_err(|e| Error::Dial(format!("tcp connect to {target} failed: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let tls_stream = tls_connect(config, tcp).await?;

        // Host header (and with it, virtual-host routing on the remote)
        // must always be sni_host, regardless of what we dialed.
        let request_url = format!(
            "wss://{}:{}{}",
            config.sni_host, config.server_port, config.ws_path
        );
        let mut request = request_url
            .into_client_request()
            .map_err(|e| Error::Dial(format!("invalid tunnel url: {e}")))?;
        request.headers_mut().insert(
            "User-Agent",
            "veilproxy/1".parse().expect("static header value is valid"),
        );

        let (ws_stream, _response) = tokio_tungstenite::client_async(request, tls_stream)
            .await
            .map_err(|e| Error::Dial(format!("websocket upgrade failed: {e}")))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();

        confirm_websocket_open(&mut ws_sink, &mut ws_read).await?;

        let (send_key, recv_key) =
            run_auth_handshake(&config.psk, &mut ws_sink, &mut ws_read).await?;

        let (frame_tx, writer_handle) = writer::spawn_writer(ws_sink);

        let now = Instant::now();
        let tunnel = Arc::new_cyclic(|weak| Tunnel {
            id: rand::random(),
            send_key,
            recv_key,
            frame_tx,
            streams: Streams::new(),
            alive: AtomicBool::new(true),
            active_count: AtomicU32::new(0),
            connected_at: now,
            last_activity_ms: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            self_weak: weak.clone(),
        });

        let recv_handle = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move {
                tunnel.receive_loop(ws_read).await;
            })
        };
        let keepalive_handle = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move {
                tunnel.keepalive_loop().await;
            })
        };

        {
            let mut tasks = tunnel.tasks.lock().await;
            tasks.push(writer_handle);
            tasks.push(recv_handle);
            tasks.push(keepalive_handle);
        }

        info!(tunnel_id = tunnel.id, host = %config.effective_host(), sni = %config.sni_host, "tunnel established");
        Ok(tunnel)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_healthy(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        let now_ms = self.connected_at.elapsed().as_millis() as u64;
        if now_ms > MAX_AGE.as_millis() as u64 {
            return false;
        }
        let last = self.last_activity_ms.load(Ordering::Acquire);
        now_ms.saturating_sub(last) < IDLE_TIMEOUT.as_millis() as u64
    }

    pub fn active_stream_count(&self) -> u32 {
        self.active_count.load(Ordering::Acquire)
    }

    /// Force this tunnel's last-activity clock back by `secs`, for pool
    /// eviction tests that need a deterministically stale tunnel without
    /// waiting out the real idle timeout.
    #[cfg(test)]
    pub fn test_backdate_activity(&self, secs: u64) {
        let now_ms = self.connected_at.elapsed().as_millis() as u64;
        let backdated = now_ms.saturating_sub(secs * 1000);
        self.last_activity_ms.store(backdated, Ordering::Release);
    }

    fn touch_activity(&self) {
        let now_ms = self.connected_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    /// Open a new multiplexed stream to `host:port`. Blocks until the
    /// remote confirms or refuses the connect, or until it times out.
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<Stream> {
        if !self.is_healthy() {
            return Err(Error::ConnectionClosed);
        }

        let stream_id = self.streams.alloc_id();
        let (ready_tx, ready_rx) = oneshot::channel();
        // The data channel is built before the CONNECT frame is even sent,
        // so there is no window in which an inbound frame for this id could
        // arrive and find no inbox: dispatch() moves this exact sender into
        // StreamEntry::Open the moment it sees the OK reply, under the same
        // lock hold that removes the Pending entry.
        let (data_tx, data_rx) = mpsc::channel(128);
        {
            let mut table = self.streams.table.lock().await;
            table.insert(stream_id, StreamEntry::Pending { ready_tx, data_tx });
        }

        let frame = MuxFrame::connect(stream_id, host, port);
        if let Err(e) = self.send_sealed(frame.encode()).await {
            self.streams.table.lock().await.remove(&stream_id);
            return Err(e);
        }

        match tokio::time::timeout(STREAM_OPEN_TIMEOUT, ready_rx).await {
            Err(_) => {
                self.streams.table.lock().await.remove(&stream_id);
                Err(Error::StreamOpenTimeout)
            }
            Ok(Err(_)) => {
                self.streams.table.lock().await.remove(&stream_id);
                Err(Error::ConnectionClosed)
            }
            Ok(Ok(Err(reason))) => {
                // dispatch() already removed the Pending entry on ERR/invalid
                // reply without reinstating it; nothing left to clean up.
                Err(Error::ConnectionRefused(reason))
            }
            Ok(Ok(Ok(()))) => {
                // dispatch() already swapped the table entry to Open(data_tx)
                // before waking this oneshot, so data_rx is live now.
                self.active_count.fetch_add(1, Ordering::AcqRel);
                let backend = self
                    .self_weak
                    .upgrade()
                    .expect("tunnel outlives its own open_stream call") as Arc<dyn TunnelBackend>;
                Ok(Stream::new(stream_id, backend, data_rx))
            }
        }
    }

    /// Close the tunnel: mark it dead and fail every pending stream, then
    /// let the writer/receive/keepalive tasks unwind on their own once
    /// `alive` is false. Idempotent.
    pub async fn close(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let mut table = self.streams.table.lock().await;
            for (_, entry) in table.drain() {
                if let StreamEntry::Pending { ready_tx, .. } = entry {
                    let _ = ready_tx.send(Err("tunnel closed".to_string()));
                }
                // Either variant's data_tx is simply dropped; the Stream on
                // the other end observes the channel closing and
                // Stream::read reports ConnectionClosed.
            }
        }
    }

    async fn send_sealed(&self, plaintext: Bytes) -> Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let sealed = crypto::seal(&self.send_key, &plaintext);
        self.frame_tx
            .send(Bytes::from(sealed))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn receive_loop<S>(self: Arc<Self>, mut ws_read: S)
    where
        S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(msg) = ws_read.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!(tunnel_id = self.id, error = %e, "tunnel websocket read error");
                    break;
                }
            };
            let ciphertext = match msg {
                Message::Binary(data) => data,
                Message::Close(_) => {
                    info!(tunnel_id = self.id, "tunnel received websocket close");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => {
                    continue;
                }
            };

            let plaintext = match crypto::open(&self.recv_key, &ciphertext) {
                Ok(p) => p,
                Err(e) => {
                    warn!(tunnel_id = self.id, error = %e, "tunnel frame decryption failed, dropping connection");
                    break;
                }
            };

            let frame = match MuxFrame::decode(Bytes::from(plaintext)) {
                Ok(f) => f,
                Err(e) => {
                    warn!(tunnel_id = self.id, error = %e, "malformed mux frame, dropping connection");
                    break;
                }
            };

            self.touch_activity();
            self.dispatch(frame).await;
        }

        self.close().await;
        debug!(tunnel_id = self.id, "tunnel receive loop exited");
    }

    /// Deliver one inbound frame to its stream: interpret it as the
    /// CONNECT reply if the stream is pending, otherwise append it to the
    /// open stream's inbox. Frames for unknown stream ids are dropped
    /// silently, matching spec.md section 4.2's receive loop.
    async fn dispatch(&self, frame: MuxFrame) {
        let mut table = self.streams.table.lock().await;
        match table.remove(&frame.stream_id) {
            Some(StreamEntry::Pending { ready_tx, data_tx }) => {
                // On OK, reinstate the entry as Open under this same lock
                // hold before releasing it, so a data frame pipelined right
                // behind OK always finds an inbox — never a dead `None`.
                let result = match parse_stream_reply(&frame.payload) {
                    StreamReply::Ok => {
                        table.insert(frame.stream_id, StreamEntry::Open(data_tx));
                        Ok(())
                    }
                    StreamReply::Err(reason) => Err(reason),
                    StreamReply::Invalid => Err("invalid response".to_string()),
                };
                drop(table);
                let _ = ready_tx.send(result);
            }
            Some(StreamEntry::Open(tx)) => {
                table.insert(frame.stream_id, StreamEntry::Open(tx.clone()));
                drop(table);
                let _ = tx.send(frame.payload).await;
            }
            None => {}
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.alive.load(Ordering::Acquire) {
                break;
            }
            let now_ms = self.connected_at.elapsed().as_millis() as u64;
            let last = self.last_activity_ms.load(Ordering::Acquire);
            if now_ms.saturating_sub(last) > IDLE_TIMEOUT.as_millis() as u64 {
                info!(tunnel_id = self.id, "tunnel idle past threshold, closing");
                self.close().await;
                break;
            }
            if self.frame_tx.send_ping().await.is_err() {
                break;
            }
        }
        debug!(tunnel_id = self.id, "tunnel keepalive task exiting");
    }
}

#[async_trait]
impl TunnelBackend for Tunnel {
    async fn send_data(&self, stream_id: u32, data: Bytes) -> Result<()> {
        self.send_sealed(MuxFrame::new(stream_id, data).encode())
            .await
    }

    async fn close_stream(&self, stream_id: u32) {
        let had_entry = {
            let mut table = self.streams.table.lock().await;
            table.remove(&stream_id).is_some()
        };
        if had_entry {
            self.active_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn is_healthy(&self) -> bool {
        Tunnel::is_healthy(self)
    }
}

async fn tls_connect(
    config: &Config,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(config.sni_host.clone())
        .map_err(|_| Error::Dial(format!("invalid sni hostname: {}", config.sni_host)))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Dial(format!("tls handshake failed: {e}")))
}

/// Confirm the WebSocket actually opened by exchanging a ping/pong, up to
/// three attempts spaced half a second apart.
async fn confirm_websocket_open<Sink, Read>(sink: &mut Sink, read: &mut Read) -> Result<()>
where
    Sink: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    Read: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    for _ in 0..PING_CONFIRM_ATTEMPTS {
        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
            tokio::time::sleep(PING_CONFIRM_SPACING).await;
            continue;
        }
        let wait = tokio::time::timeout(PING_CONFIRM_SPACING, read.next()).await;
        match wait {
            Ok(Some(Ok(_))) => return Ok(()),
            _ => continue,
        }
    }
    Err(Error::Dial(
        "websocket did not confirm open after 3 ping attempts".to_string(),
    ))
}

/// Run the strict-order handshake from spec.md section 4.2: exchange
/// random 32-byte tokens, derive the key pair, then exchange HMAC tags
/// proving possession of the PSK. Each receive step has its own 10s
/// ceiling.
async fn run_auth_handshake<Sink, Read>(
    psk: &[u8; 32],
    sink: &mut Sink,
    read: &mut Read,
) -> Result<([u8; 32], [u8; 32])>
where
    Sink: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    Read: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut client_pub = [0u8; HANDSHAKE_TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut client_pub);
    sink.send(Message::Binary(client_pub.to_vec().into()))
        .await
        .map_err(|e| Error::Dial(format!("failed to send client_pub: {e}")))?;

    let server_pub_bytes = recv_binary(read, HANDSHAKE_STEP_TIMEOUT).await?;
    if server_pub_bytes.len() != HANDSHAKE_TOKEN_LEN {
        return Err(Error::Handshake(format!(
            "invalid server key: expected {} bytes, got {}",
            HANDSHAKE_TOKEN_LEN,
            server_pub_bytes.len()
        )));
    }
    let mut server_pub = [0u8; HANDSHAKE_TOKEN_LEN];
    server_pub.copy_from_slice(&server_pub_bytes);

    let (send_key, recv_key) = crypto::derive_keys(psk, &client_pub, &server_pub);

    let auth_tag = crypto::hmac_sha256(&send_key, b"auth");
    sink.send(Message::Binary(auth_tag.to_vec().into()))
        .await
        .map_err(|e| Error::Dial(format!("failed to send auth tag: {e}")))?;

    let ok_tag = recv_binary(read, HANDSHAKE_STEP_TIMEOUT).await?;
    if !crypto::verify_hmac(&recv_key, b"ok", &ok_tag) {
        return Err(Error::Handshake("auth failed".to_string()));
    }

    Ok((send_key, recv_key))
}

async fn recv_binary<Read>(read: &mut Read, timeout: Duration) -> Result<Vec<u8>>
where
    Read: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::Handshake("handshake receive timed out".to_string()));
        }
        match tokio::time::timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return Ok(data.to_vec()),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(Error::Handshake(
                    "remote closed connection during handshake".to_string(),
                ))
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(Error::Dial(format!("websocket read error: {e}"))),
            Err(_) => return Err(Error::Handshake("handshake receive timed out".to_string())),
        }
    }
}

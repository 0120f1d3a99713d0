//! A single multiplexed stream inside a tunnel.
//!
//! The stream's inbox is an `mpsc::Receiver<Bytes>` fed by the owning
//! tunnel's receive loop; that channel already gives us "at most one
//! parked reader, FIFO delivery, and ConnectionClosed on sender drop" for
//! free, which is exactly the contract spec.md section 4.3 asks for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

use super::session::TunnelBackend;

/// A bidirectional byte channel multiplexed inside one tunnel, bound to a
/// single destination `host:port`.
pub struct Stream {
    id: u32,
    backend: Arc<dyn TunnelBackend>,
    inbox: Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl Stream {
    pub(super) fn new(id: u32, backend: Arc<dyn TunnelBackend>, inbox: mpsc::Receiver<Bytes>) -> Self {
        Self {
            id,
            backend,
            inbox: Mutex::new(inbox),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read the next frame. Parks the caller while the inbox is empty;
    /// fails with [`Error::ConnectionClosed`] once the stream (or its
    /// tunnel) has closed and no more data is coming.
    pub async fn read(&self) -> Result<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(payload) => Ok(payload),
            None => {
                self.closed.store(true, Ordering::Release);
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Send `data` through the owning tunnel, framed under this stream id.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        self.backend.send_data(self.id, data).await
    }

    /// Idempotent. Removes the stream from its tunnel's table and fails
    /// any parked reader with `ConnectionClosed`.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.backend.close_stream(self.id).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeBackend {
        healthy: AtomicBool,
        closes: AtomicU32,
    }

    #[async_trait]
    impl TunnelBackend for FakeBackend {
        async fn send_data(&self, _stream_id: u32, _data: Bytes) -> Result<()> {
            Ok(())
        }
        async fn close_stream(&self, _stream_id: u32) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn fake_backend() -> Arc<FakeBackend> {
        Arc::new(FakeBackend {
            healthy: AtomicBool::new(true),
            closes: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn read_delivers_frames_in_order() {
        let (tx, rx) = mpsc::channel(8);
        let stream = Stream::new(1, fake_backend(), rx);
        tx.send(Bytes::from_static(b"1")).await.unwrap();
        tx.send(Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(stream.read().await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(stream.read().await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn read_fails_after_sender_dropped() {
        let (tx, rx) = mpsc::channel::<Bytes>(8);
        let stream = Stream::new(1, fake_backend(), rx);
        drop(tx);
        assert!(matches!(stream.read().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_subsequent_reads() {
        let (_tx, rx) = mpsc::channel::<Bytes>(8);
        let backend = fake_backend();
        let stream = Stream::new(1, backend.clone(), rx);
        stream.close().await;
        stream.close().await;
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(stream.read().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn send_fails_once_closed() {
        let (_tx, rx) = mpsc::channel::<Bytes>(8);
        let stream = Stream::new(1, fake_backend(), rx);
        stream.close().await;
        assert!(matches!(
            stream.send(Bytes::from_static(b"x")).await,
            Err(Error::ConnectionClosed)
        ));
    }
}

//! Dedicated WebSocket writer task.
//!
//! All frame writes go through an mpsc channel to a single writer task, so
//! stream handlers, the keepalive task, and the handshake never contend on
//! the WebSocket sink directly.

use bytes::Bytes;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

/// What the writer task writes: either an already-sealed ciphertext frame
/// or a bare WebSocket ping used for keepalive.
enum WriteJob {
    Frame(Bytes),
    Ping,
}

/// Sender half — cloned by streams and the keepalive task. Carries raw
/// ciphertext (already sealed by the caller) so the writer task itself
/// never touches key material.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<WriteJob>,
}

impl FrameSender {
    pub async fn send(&self, ciphertext: Bytes) -> Result<(), mpsc::error::SendError<()>> {
        self.tx
            .send(WriteJob::Frame(ciphertext))
            .await
            .map_err(|_| mpsc::error::SendError(()))
    }

    pub async fn send_ping(&self) -> Result<(), mpsc::error::SendError<()>> {
        self.tx
            .send(WriteJob::Ping)
            .await
            .map_err(|_| mpsc::error::SendError(()))
    }
}

/// Spawn the writer task. Returns the sender and a JoinHandle for cleanup.
pub fn spawn_writer<S>(mut sink: S) -> (FrameSender, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<WriteJob>(256);

    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let message = match job {
                WriteJob::Frame(ciphertext) => Message::Binary(ciphertext.into()),
                WriteJob::Ping => Message::Ping(Vec::new().into()),
            };
            if let Err(e) = sink.send(message).await {
                error!(error = %e, "failed to write frame to tunnel websocket");
                break;
            }
        }
        debug!("tunnel writer task exiting");
        let _ = sink.close().await;
    });

    (FrameSender { tx }, handle)
}

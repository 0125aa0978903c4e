//! Transport layer: the byte-duplex contract the framers consume
//!
//! A transport is an ordered byte channel with explicit lifecycle
//! (open, close, destroy is permanent) and a single-consumer event
//! stream. Every inbound burst carries a [`ReplyHandle`] routed to the
//! peer that sent it, which is how one UDP socket or TCP listener can
//! serve many peers through one server instance. All outbound bytes of a
//! connection funnel through one writer task, so replies and writes never
//! interleave mid-frame.

pub mod memory;
pub mod serial;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{ModbusError, ModbusResult};

/// Read buffer size for the socket transports
const READ_BUF_SIZE: usize = 512;

/// Marker distinguishing serial lines from network sockets
///
/// The RTU framer derives its 3.5T inter-frame gap from the baud rate of
/// serial transports; network transports frame per burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial { baud_rate: u32 },
    Net,
}

/// One queued outbound write
pub(crate) struct Outbound {
    pub bytes: Bytes,
    /// Datagram destination; `None` targets the connected peer
    pub target: Option<SocketAddr>,
    /// Flush acknowledgement for `write`; replies go unacknowledged
    pub ack: Option<oneshot::Sender<ModbusResult<()>>>,
}

/// Handle for answering the peer a data event originated from
///
/// Cheap to clone. The suppressed handle drops everything written to it;
/// the server uses it for broadcast dispatch, where handlers run but no
/// response may reach the wire.
#[derive(Clone)]
pub struct ReplyHandle {
    tx: Option<mpsc::UnboundedSender<Outbound>>,
    target: Option<SocketAddr>,
}

impl ReplyHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx: Some(tx),
            target: None,
        }
    }

    pub(crate) fn to_peer(tx: mpsc::UnboundedSender<Outbound>, target: SocketAddr) -> Self {
        Self {
            tx: Some(tx),
            target: Some(target),
        }
    }

    /// A handle that drops everything written to it
    pub fn suppressed() -> Self {
        Self {
            tx: None,
            target: None,
        }
    }

    /// Queue bytes for the originating peer. Fire-and-forget; write
    /// failures surface on the transport's error event.
    pub fn send(&self, bytes: Bytes) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Outbound {
                bytes,
                target: self.target,
                ack: None,
            });
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Events emitted by a transport
pub enum TransportEvent {
    /// Inbound byte burst plus the handle answering its sender
    Data { bytes: Bytes, reply: ReplyHandle },
    /// A transport-level failure; the connection may close right after
    Error(ModbusError),
    /// The transport is no longer delivering events
    Closed,
}

/// Transport contract consumed by the client and server roles
#[async_trait]
pub trait ModbusTransport: Send {
    /// Open the transport. Idempotent while open; fails with
    /// [`ModbusError::Destroyed`] after `destroy`.
    async fn open(&mut self) -> ModbusResult<()>;

    /// Write bytes to the peer; completes when flushed. Fails with
    /// [`ModbusError::NotOpen`] when the transport is closed.
    async fn write(&mut self, bytes: Bytes) -> ModbusResult<()>;

    /// Next transport event. Returns [`TransportEvent::Closed`] once the
    /// transport is closed or was never opened.
    async fn recv(&mut self) -> TransportEvent;

    /// Close the transport. Idempotent.
    async fn close(&mut self) -> ModbusResult<()>;

    /// Destroy the transport. Permanent; subsequent opens fail.
    async fn destroy(&mut self) -> ModbusResult<()>;

    fn is_open(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    fn kind(&self) -> TransportKind;
}

/// Queue a write through a connection's writer task and await the flush.
pub(crate) async fn write_through(
    tx: &mpsc::UnboundedSender<Outbound>,
    bytes: Bytes,
) -> ModbusResult<()> {
    let (ack_tx, ack_rx) = oneshot::channel();
    tx.send(Outbound {
        bytes,
        target: None,
        ack: Some(ack_tx),
    })
    .map_err(|_| ModbusError::NotOpen)?;
    ack_rx.await.map_err(|_| ModbusError::NotOpen)?
}

/// Spawn the reader and writer tasks of one stream-oriented connection.
///
/// The reader forwards bursts to `events` with a reply handle cloned onto
/// `out_tx`; the writer drains `out_rx`. Both stop on `shutdown` or when
/// their half of the stream fails.
pub(crate) fn spawn_stream_io<R, W>(
    mut read_half: R,
    mut write_half: W,
    events: mpsc::UnboundedSender<TransportEvent>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown: &broadcast::Sender<()>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.recv() => break,
                outbound = out_rx.recv() => {
                    let Some(outbound) = outbound else { break };
                    let result = async {
                        write_half.write_all(&outbound.bytes).await?;
                        write_half.flush().await?;
                        Ok::<_, std::io::Error>(())
                    }
                    .await;
                    match result {
                        Ok(()) => {
                            if let Some(ack) = outbound.ack {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Err(err) => {
                            if let Some(ack) = outbound.ack {
                                let _ = ack.send(Err(ModbusError::io(err.to_string())));
                            }
                            break;
                        }
                    }
                }
            }
        }
    });

    let mut reader_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            tokio::select! {
                _ = reader_shutdown.recv() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        let _ = events.send(TransportEvent::Data {
                            bytes: Bytes::copy_from_slice(&buf[..n]),
                            reply: ReplyHandle::new(out_tx.clone()),
                        });
                    }
                    Err(err) => {
                        let _ = events.send(TransportEvent::Error(ModbusError::io(err.to_string())));
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                },
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppressed_reply_drops_silently() {
        let reply = ReplyHandle::suppressed();
        assert!(reply.is_suppressed());
        // Nothing to assert beyond "does not panic": there is no channel.
        reply.send(Bytes::from_static(b"ignored"));
    }

    #[tokio::test]
    async fn test_reply_handle_routes_to_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = ReplyHandle::new(tx);
        assert!(!reply.is_suppressed());
        reply.send(Bytes::from_static(&[0x01, 0x02]));

        let outbound = rx.recv().await.unwrap();
        assert_eq!(outbound.bytes.as_ref(), &[0x01, 0x02]);
        assert!(outbound.target.is_none());
        assert!(outbound.ack.is_none());
    }
}

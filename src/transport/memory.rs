/// In-memory transport pair
///
/// Two cross-wired endpoints: whatever one side writes arrives at the
/// other as a data event whose reply handle routes straight back. Used by
/// the integration tests and useful for in-process device simulation.
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ModbusError, ModbusResult};
use crate::transport::{
    write_through, ModbusTransport, Outbound, ReplyHandle, TransportEvent, TransportKind,
};

/// One endpoint of an in-memory duplex pair
pub struct MemoryTransport {
    kind: TransportKind,
    open: bool,
    destroyed: bool,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Writes addressed to the peer endpoint
    peer_inbox: mpsc::UnboundedSender<Outbound>,
    /// Direct line to the peer's event stream, for close notification
    peer_events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    /// Create a cross-wired pair of network-kind endpoints
    pub fn pair() -> (Self, Self) {
        Self::pair_with_kind(TransportKind::Net, TransportKind::Net)
    }

    /// Create a pair with explicit transport kinds, e.g. to simulate a
    /// serial line for RTU gap handling
    pub fn pair_with_kind(a_kind: TransportKind, b_kind: TransportKind) -> (Self, Self) {
        let (a_event_tx, a_event_rx) = mpsc::unbounded_channel();
        let (b_event_tx, b_event_rx) = mpsc::unbounded_channel();
        let (a_inbox_tx, a_inbox_rx) = mpsc::unbounded_channel::<Outbound>();
        let (b_inbox_tx, b_inbox_rx) = mpsc::unbounded_channel::<Outbound>();

        // Each forwarder turns bytes addressed to an endpoint into a data
        // event carrying a reply handle onto the opposite inbox.
        Self::spawn_forwarder(a_inbox_rx, a_event_tx.clone(), b_inbox_tx.clone());
        Self::spawn_forwarder(b_inbox_rx, b_event_tx.clone(), a_inbox_tx.clone());

        let a = Self {
            kind: a_kind,
            open: false,
            destroyed: false,
            events: a_event_rx,
            peer_inbox: b_inbox_tx,
            peer_events: b_event_tx,
        };
        let b = Self {
            kind: b_kind,
            open: false,
            destroyed: false,
            events: b_event_rx,
            peer_inbox: a_inbox_tx,
            peer_events: a_event_tx,
        };
        (a, b)
    }

    fn spawn_forwarder(
        mut inbox: mpsc::UnboundedReceiver<Outbound>,
        events: mpsc::UnboundedSender<TransportEvent>,
        reply_inbox: mpsc::UnboundedSender<Outbound>,
    ) {
        tokio::spawn(async move {
            while let Some(outbound) = inbox.recv().await {
                let delivered = events.send(TransportEvent::Data {
                    bytes: outbound.bytes,
                    reply: ReplyHandle::new(reply_inbox.clone()),
                });
                if let Some(ack) = outbound.ack {
                    let _ = ack.send(match delivered {
                        Ok(()) => Ok(()),
                        Err(_) => Err(ModbusError::connection("peer endpoint dropped")),
                    });
                }
            }
        });
    }
}

#[async_trait]
impl ModbusTransport for MemoryTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        if self.destroyed {
            return Err(ModbusError::Destroyed);
        }
        self.open = true;
        Ok(())
    }

    async fn write(&mut self, bytes: Bytes) -> ModbusResult<()> {
        if !self.open {
            return Err(ModbusError::NotOpen);
        }
        write_through(&self.peer_inbox, bytes).await
    }

    async fn recv(&mut self) -> TransportEvent {
        if !self.open {
            return TransportEvent::Closed;
        }
        self.events.recv().await.unwrap_or(TransportEvent::Closed)
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.open {
            self.open = false;
            let _ = self.peer_events.send(TransportEvent::Closed);
        }
        Ok(())
    }

    async fn destroy(&mut self) -> ModbusResult<()> {
        self.close().await?;
        self.destroyed = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.open().await.unwrap();
        b.open().await.unwrap();

        a.write(Bytes::from_static(&[1, 2, 3])).await.unwrap();
        match b.recv().await {
            TransportEvent::Data { bytes, reply } => {
                assert_eq!(bytes.as_ref(), &[1, 2, 3]);
                // Reply goes straight back to a.
                reply.send(Bytes::from_static(&[4, 5]));
            }
            _ => panic!("expected data event"),
        }
        match a.recv().await {
            TransportEvent::Data { bytes, .. } => assert_eq!(bytes.as_ref(), &[4, 5]),
            _ => panic!("expected data event"),
        }
    }

    #[tokio::test]
    async fn test_write_requires_open() {
        let (mut a, _b) = MemoryTransport::pair();
        let err = a.write(Bytes::from_static(&[0])).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotOpen));
    }

    #[tokio::test]
    async fn test_destroy_is_permanent() {
        let (mut a, _b) = MemoryTransport::pair();
        a.open().await.unwrap();
        a.destroy().await.unwrap();
        assert!(a.is_destroyed());
        let err = a.open().await.unwrap_err();
        assert_eq!(format!("{err}"), "Port is destroyed");
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.open().await.unwrap();
        b.open().await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(b.recv().await, TransportEvent::Closed));
        // close is idempotent
        a.close().await.unwrap();
    }
}

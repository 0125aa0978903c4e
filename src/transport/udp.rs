/// UDP transport
///
/// Works in two modes: *connected* (client) with a fixed peer address, or
/// *bound* (server) where every datagram's source becomes the target of
/// its reply handle. One socket serves any number of peers in bound mode.
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use crate::error::{ModbusError, ModbusResult};
use crate::transport::{
    write_through, ModbusTransport, Outbound, ReplyHandle, TransportEvent, TransportKind,
};

/// Largest datagram the reader accepts
const MAX_DATAGRAM: usize = 512;

/// Modbus UDP transport
pub struct UdpTransport {
    bind_address: SocketAddr,
    peer: Option<SocketAddr>,
    open: bool,
    destroyed: bool,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl UdpTransport {
    /// Client mode: an ephemeral local socket talking to one peer
    pub fn connected(peer: SocketAddr) -> Self {
        let bind_address = if peer.is_ipv4() {
            "0.0.0.0:0".parse().expect("static address")
        } else {
            "[::]:0".parse().expect("static address")
        };
        Self {
            bind_address,
            peer: Some(peer),
            open: false,
            destroyed: false,
            events: None,
            outbound: None,
            shutdown: None,
        }
    }

    /// Server mode: a bound socket answering whoever sends
    pub fn bound(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            peer: None,
            open: false,
            destroyed: false,
            events: None,
            outbound: None,
            shutdown: None,
        }
    }
}

#[async_trait]
impl ModbusTransport for UdpTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        if self.destroyed {
            return Err(ModbusError::Destroyed);
        }
        if self.open {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;
        let socket = Arc::new(socket);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (shutdown_tx, mut writer_shutdown) = broadcast::channel(1);

        let default_peer = self.peer;
        let writer_socket = socket.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.recv() => break,
                    outbound = out_rx.recv() => {
                        let Some(outbound) = outbound else { break };
                        let result = match outbound.target.or(default_peer) {
                            Some(target) => writer_socket
                                .send_to(&outbound.bytes, target)
                                .await
                                .map(|_| ())
                                .map_err(|e| ModbusError::io(e.to_string())),
                            None => Err(ModbusError::internal(
                                "bound UDP transport cannot write without a peer",
                            )),
                        };
                        if let Some(ack) = outbound.ack {
                            let _ = ack.send(result);
                        }
                    }
                }
            }
        });

        let reader_socket = socket;
        let reader_out = out_tx.clone();
        let mut reader_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = reader_shutdown.recv() => break,
                    received = reader_socket.recv_from(&mut buf) => match received {
                        Ok((n, source)) => {
                            let _ = event_tx.send(TransportEvent::Data {
                                bytes: Bytes::copy_from_slice(&buf[..n]),
                                reply: ReplyHandle::to_peer(reader_out.clone(), source),
                            });
                        }
                        Err(err) => {
                            let _ = event_tx.send(TransportEvent::Error(ModbusError::io(err.to_string())));
                            let _ = event_tx.send(TransportEvent::Closed);
                            break;
                        }
                    },
                }
            }
        });

        self.events = Some(event_rx);
        self.outbound = Some(out_tx);
        self.shutdown = Some(shutdown_tx);
        self.open = true;
        debug!("UDP transport open on {}", self.bind_address);
        Ok(())
    }

    async fn write(&mut self, bytes: Bytes) -> ModbusResult<()> {
        if !self.open {
            return Err(ModbusError::NotOpen);
        }
        let outbound = self.outbound.as_ref().ok_or(ModbusError::NotOpen)?;
        write_through(outbound, bytes).await
    }

    async fn recv(&mut self) -> TransportEvent {
        if !self.open {
            return TransportEvent::Closed;
        }
        match self.events.as_mut() {
            Some(events) => events.recv().await.unwrap_or(TransportEvent::Closed),
            None => TransportEvent::Closed,
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.open = false;
        self.outbound = None;
        self.events = None;
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
        TransportKind::Net
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_and_bound_exchange() {
        let mut server = UdpTransport::bound("127.0.0.1:0".parse().unwrap());
        // Learn an ephemeral port first.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = probe.local_addr().unwrap();
        drop(probe);
        server.bind_address = address;
        server.open().await.unwrap();

        let mut client = UdpTransport::connected(address);
        client.open().await.unwrap();

        client.write(Bytes::from_static(&[0xAA])).await.unwrap();
        match server.recv().await {
            TransportEvent::Data { bytes, reply } => {
                assert_eq!(bytes.as_ref(), &[0xAA]);
                reply.send(Bytes::from_static(&[0xBB]));
            }
            _ => panic!("expected data event"),
        }
        match client.recv().await {
            TransportEvent::Data { bytes, .. } => assert_eq!(bytes.as_ref(), &[0xBB]),
            _ => panic!("expected data event"),
        }

        client.close().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_write() {
        let mut transport = UdpTransport::connected("127.0.0.1:502".parse().unwrap());
        assert!(matches!(
            transport.write(Bytes::from_static(&[0])).await.unwrap_err(),
            ModbusError::NotOpen
        ));
    }
}

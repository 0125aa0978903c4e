/// TCP transports
///
/// `TcpTransport` is a client socket connecting to one server.
/// `TcpServerTransport` is a listener: every accepted connection feeds the
/// same event stream, and each data event's reply handle writes back to
/// the connection it arrived on.
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use crate::error::{ModbusError, ModbusResult};
use crate::transport::{
    spawn_stream_io, write_through, ModbusTransport, Outbound, TransportEvent, TransportKind,
};

/// Modbus TCP client transport
pub struct TcpTransport {
    address: SocketAddr,
    open: bool,
    destroyed: bool,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl TcpTransport {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            open: false,
            destroyed: false,
            events: None,
            outbound: None,
            shutdown: None,
        }
    }

    /// Create a transport from an address string like "127.0.0.1:502"
    pub fn from_address(address: &str) -> ModbusResult<Self> {
        let address = address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid address: {e}")))?;
        Ok(Self::new(address))
    }

    /// The configured server address
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        if self.destroyed {
            return Err(ModbusError::Destroyed);
        }
        if self.open {
            return Ok(());
        }

        let stream = TcpStream::connect(self.address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to connect to {}: {}", self.address, e))
        })?;
        let (read_half, write_half) = stream.into_split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        spawn_stream_io(
            read_half,
            write_half,
            event_tx,
            out_tx.clone(),
            out_rx,
            &shutdown_tx,
        );

        self.events = Some(event_rx);
        self.outbound = Some(out_tx);
        self.shutdown = Some(shutdown_tx);
        self.open = true;
        debug!("TCP transport connected to {}", self.address);
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

/// Modbus TCP server transport (listener)
pub struct TcpServerTransport {
    bind_address: SocketAddr,
    open: bool,
    destroyed: bool,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl TcpServerTransport {
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            open: false,
            destroyed: false,
            events: None,
            shutdown: None,
        }
    }

    /// Create a transport from a bind address string like "0.0.0.0:502"
    pub fn from_address(address: &str) -> ModbusResult<Self> {
        let bind_address = address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid bind address: {e}")))?;
        Ok(Self::new(bind_address))
    }
}

#[async_trait]
impl ModbusTransport for TcpServerTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        if self.destroyed {
            return Err(ModbusError::Destroyed);
        }
        if self.open {
            return Ok(());
        }

        let listener = TcpListener::bind(self.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind to {}: {}", self.bind_address, e))
        })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut accept_shutdown) = broadcast::channel(1);

        let accept_events = event_tx;
        let accept_shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted connection from {peer}");
                            let (read_half, write_half) = stream.into_split();
                            let (out_tx, out_rx) = mpsc::unbounded_channel();
                            spawn_stream_io(
                                read_half,
                                write_half,
                                accept_events.clone(),
                                out_tx,
                                out_rx,
                                &accept_shutdown_tx,
                            );
                        }
                        Err(err) => {
                            error!("failed to accept connection: {err}");
                        }
                    },
                }
            }
        });

        self.events = Some(event_rx);
        self.shutdown = Some(shutdown_tx);
        self.open = true;
        debug!("TCP server transport listening on {}", self.bind_address);
        Ok(())
    }

    async fn write(&mut self, _bytes: Bytes) -> ModbusResult<()> {
        // A listener has no default peer; responses go through the reply
        // handle of the request they answer.
        Err(ModbusError::internal(
            "listener transport cannot write without a peer",
        ))
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

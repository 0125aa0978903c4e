/// Serial transport
///
/// Backed by tokio-serial. Reports `TransportKind::Serial` with its baud
/// rate so the RTU framer can derive the 3.5T inter-frame gap.
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::sync::{broadcast, mpsc};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use crate::error::{ModbusError, ModbusResult};
use crate::transport::{
    spawn_stream_io, write_through, ModbusTransport, Outbound, TransportEvent, TransportKind,
};

/// Serial line configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl SerialConfig {
    /// 8N1 configuration at the given baud rate
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// Modbus serial transport
pub struct SerialTransport {
    config: SerialConfig,
    open: bool,
    destroyed: bool,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            open: false,
            destroyed: false,
            events: None,
            outbound: None,
            shutdown: None,
        }
    }

    /// 8N1 transport on the given port
    pub fn from_path(path: &str, baud_rate: u32) -> Self {
        Self::new(SerialConfig::new(path, baud_rate))
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl ModbusTransport for SerialTransport {
    async fn open(&mut self) -> ModbusResult<()> {
        if self.destroyed {
            return Err(ModbusError::Destroyed);
        }
        if self.open {
            return Ok(());
        }

        let stream = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity)
            .open_native_async()
            .map_err(|e| {
                ModbusError::connection(format!("Failed to open {}: {}", self.config.path, e))
            })?;
        let (read_half, write_half) = tokio::io::split(stream);

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
        debug!(
            "serial transport open on {} at {} baud",
            self.config.path, self.config.baud_rate
        );
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
        TransportKind::Serial {
            baud_rate: self.config.baud_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_reports_baud_rate() {
        let transport = SerialTransport::from_path("/dev/ttyUSB0", 19_200);
        assert_eq!(
            transport.kind(),
            TransportKind::Serial { baud_rate: 19_200 }
        );
        assert!(!transport.is_open());
        assert!(!transport.is_destroyed());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::from_path("/dev/does-not-exist", 9600);
        assert!(transport.open().await.is_err());
        // The transport stays usable for a later retry.
        assert!(!transport.is_open());
    }
}

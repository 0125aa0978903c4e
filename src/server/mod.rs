//! Modbus server (slave)
//!
//! Owns a registry of unit models and a framer, consumes frames from the
//! transport's event stream, and dispatches each one to the matching
//! model's function-code handler. Responses are written through the reply
//! handle of the burst that carried the request, so one server instance
//! behind a TCP listener or a bound UDP socket answers every peer
//! correctly.
//!
//! Broadcast frames (unit 0) are dispatched to every registered model in
//! parallel and never answered. Frames for unregistered units are ignored
//! silently.

mod handlers;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::future::join_all;
use log::{debug, error, info};
use tokio::time::{sleep_until, Instant};

use crate::codec::ascii::AsciiFramer;
use crate::codec::rtu::{FrameGap, RtuFramer};
use crate::codec::tcp::MbapFramer;
use crate::codec::{Framer, FramerEvent};
use crate::error::{ModbusError, ModbusResult};
use crate::model::ServerModel;
use crate::protocol::{Adu, BROADCAST_UNIT};
use crate::transport::{ModbusTransport, ReplyHandle, TransportEvent};

/// Shared registry of unit models, keyed by unit address
///
/// Clones share the same underlying map, so a handle kept by the host
/// keeps working after the server moved into its serve task.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    inner: Arc<RwLock<BTreeMap<u8, ServerModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model; unit addresses are unique
    pub fn add(&self, model: ServerModel) -> ModbusResult<()> {
        let mut models = self.inner.write().unwrap();
        if models.contains_key(&model.unit_id()) {
            return Err(ModbusError::configuration(format!(
                "unit {} already registered",
                model.unit_id()
            )));
        }
        models.insert(model.unit_id(), model);
        Ok(())
    }

    /// Remove and return a model
    pub fn remove(&self, unit_id: u8) -> Option<ServerModel> {
        self.inner.write().unwrap().remove(&unit_id)
    }

    pub fn contains(&self, unit_id: u8) -> bool {
        self.inner.read().unwrap().contains_key(&unit_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    fn get(&self, unit_id: u8) -> Option<ServerModel> {
        self.inner.read().unwrap().get(&unit_id).cloned()
    }

    fn all(&self) -> Vec<ServerModel> {
        self.inner.read().unwrap().values().cloned().collect()
    }
}

/// Generic Modbus server over any transport and framing variant
pub struct ModbusServer<T: ModbusTransport> {
    transport: T,
    framer: Box<dyn Framer>,
    models: ModelRegistry,
}

impl<T: ModbusTransport> ModbusServer<T> {
    /// Create a server with an explicit framer
    pub fn new(transport: T, framer: Box<dyn Framer>) -> Self {
        Self {
            transport,
            framer,
            models: ModelRegistry::new(),
        }
    }

    /// RTU framing; the 3.5T gap is derived from the transport kind
    pub fn rtu(transport: T) -> Self {
        let kind = transport.kind();
        Self::new(transport, Box::new(RtuFramer::new(kind)))
    }

    /// RTU framing with an explicit inter-frame gap override
    pub fn rtu_with_gap(transport: T, gap: FrameGap) -> Self {
        let kind = transport.kind();
        Self::new(transport, Box::new(RtuFramer::with_gap(gap, kind)))
    }

    /// ASCII framing
    pub fn ascii(transport: T) -> Self {
        Self::new(transport, Box::new(AsciiFramer::new()))
    }

    /// MBAP framing for TCP or UDP transports
    pub fn tcp(transport: T) -> Self {
        Self::new(transport, Box::new(MbapFramer::new()))
    }

    /// Register a unit model
    pub fn add(&self, model: ServerModel) -> ModbusResult<()> {
        self.models.add(model)
    }

    /// Remove a unit model
    pub fn remove(&self, unit_id: u8) -> Option<ServerModel> {
        self.models.remove(unit_id)
    }

    /// A registry handle that stays valid after the server moves into
    /// its serve task
    pub fn models(&self) -> ModelRegistry {
        self.models.clone()
    }

    pub async fn open(&mut self) -> ModbusResult<()> {
        self.transport.open().await
    }

    pub async fn close(&mut self) -> ModbusResult<()> {
        self.framer.reset();
        self.transport.close().await
    }

    pub async fn destroy(&mut self) -> ModbusResult<()> {
        self.framer.reset();
        self.transport.destroy().await
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_destroyed(&self) -> bool {
        self.transport.is_destroyed()
    }

    /// Process inbound frames until the transport closes.
    ///
    /// RTU framing needs a quiet interval to delimit frames: the loop
    /// restarts the 3.5T timer after every burst and hands expiry to the
    /// framer.
    pub async fn serve(&mut self) -> ModbusResult<()> {
        info!("Modbus server serving {} unit model(s)", self.models.len());
        let mut silence_deadline: Option<Instant> = None;
        let mut last_reply: Option<ReplyHandle> = None;

        loop {
            let event = match silence_deadline {
                Some(deadline) => tokio::select! {
                    event = self.transport.recv() => Some(event),
                    _ = sleep_until(deadline) => None,
                },
                None => Some(self.transport.recv().await),
            };

            match event {
                // 3.5T expired: the accumulated buffer is one frame.
                None => {
                    silence_deadline = None;
                    let events = self.framer.silence_elapsed();
                    let reply = last_reply.clone().unwrap_or_else(ReplyHandle::suppressed);
                    self.process(events, &reply).await;
                }
                Some(TransportEvent::Data { bytes, reply }) => {
                    let events = self.framer.accept(&bytes);
                    silence_deadline = match self.framer.silence_interval() {
                        Some(gap) if !gap.is_zero() => Some(Instant::now() + gap),
                        _ => None,
                    };
                    self.process(events, &reply).await;
                    last_reply = Some(reply);
                }
                Some(TransportEvent::Error(err)) => {
                    error!("transport error: {err}");
                }
                Some(TransportEvent::Closed) => {
                    self.framer.reset();
                    info!("Modbus server transport closed");
                    return Ok(());
                }
            }
        }
    }

    async fn process(&mut self, events: Vec<FramerEvent>, reply: &ReplyHandle) {
        for event in events {
            if let FramerEvent::Frame(adu) = event {
                self.dispatch(adu, reply).await;
            }
        }
    }

    async fn dispatch(&mut self, adu: Adu, reply: &ReplyHandle) {
        if adu.unit_id == BROADCAST_UNIT {
            // Every model runs its handler; all responses are suppressed.
            let models = self.models.all();
            debug!(
                "broadcast function 0x{:02X} dispatched to {} model(s)",
                adu.function,
                models.len()
            );
            join_all(
                models
                    .into_iter()
                    .map(|model| handlers::handle_function(model, adu.clone())),
            )
            .await;
            return;
        }

        let Some(model) = self.models.get(adu.unit_id) else {
            debug!("ignoring request for unregistered unit {}", adu.unit_id);
            return;
        };

        if let Some((function, payload)) = handlers::handle_function(model, adu.clone()).await {
            let response = Adu {
                transaction_id: adu.transaction_id,
                unit_id: adu.unit_id,
                function,
                data: Bytes::from(payload),
                raw: Bytes::new(),
            };
            let frame = self.framer.encode(&response);
            reply.send(frame);
        }
    }
}

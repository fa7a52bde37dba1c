//! GATT server state and event dispatch.
//!
//! [`AdvServer`] owns everything the BLE side mutates: attribute values,
//! the pending request slot, the connection and advertising state, the
//! worker engine and the application context. The firmware serializes
//! access to it (one event or tick at a time).

use heapless::Vec;

use crate::config::{COMMAND_DELAY_SECS, MAX_ATTRIBUTES};
use crate::error::Error;
use crate::worker::{Tick, Worker, WorkerEngine};

use super::advertising::{AdvEvent, AdvertisingController};
use super::attribute::{AttrId, AttrUuid, AttrValue, Registry};
use super::connection::ConnectionState;
use super::request::{PendingKind, PendingOp, ReadRequest, Ticket, WriteRequest};
use super::{Application, ConnHandle, ConnParams, DisconnectReason, GattLink, PeerAddress};

/// Event reported by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BleEvent<'a> {
    Connected { conn: ConnHandle, peer: PeerAddress },
    /// `reason` is the HCI code, when the engine reports one.
    Disconnected { conn: ConnHandle, reason: Option<u8> },
    /// Read authorize request.
    Read(ReadRequest),
    /// Write authorize request.
    Write(WriteRequest<'a>),
    /// Committed write on a non-authorized attribute.
    Written { conn: ConnHandle, uuid: AttrUuid },
    ConnParamUpdate { conn: ConnHandle, params: ConnParams },
    SysAttrMissing { conn: ConnHandle },
    GattClientTimeout { conn: ConnHandle },
    GattServerTimeout { conn: ConnHandle },
    Advertising(AdvEvent),
}

impl BleEvent<'_> {
    pub fn conn(&self) -> Option<ConnHandle> {
        match *self {
            BleEvent::Connected { conn, .. }
            | BleEvent::Disconnected { conn, .. }
            | BleEvent::Written { conn, .. }
            | BleEvent::ConnParamUpdate { conn, .. }
            | BleEvent::SysAttrMissing { conn }
            | BleEvent::GattClientTimeout { conn }
            | BleEvent::GattServerTimeout { conn } => Some(conn),
            BleEvent::Read(req) => Some(req.conn),
            BleEvent::Write(req) => Some(req.conn),
            BleEvent::Advertising(_) => None,
        }
    }
}

pub struct AdvServer<C: 'static, L> {
    pub(crate) registry: Registry<C>,
    pub(crate) values: Vec<AttrValue, MAX_ATTRIBUTES>,
    pub(crate) pending: Option<PendingOp>,
    /// Last ticket handed out.
    pub(crate) tickets: u16,
    pub(crate) conn: ConnectionState,
    pub(crate) adv: AdvertisingController,
    pub(crate) workers: WorkerEngine<C>,
    pub(crate) reboot: bool,
    pub(crate) app: C,
    pub(crate) link: L,
}

impl<C: 'static, L: GattLink> AdvServer<C, L> {
    pub fn new(registry: Registry<C>, app: C, link: L) -> Self {
        let mut values = Vec::new();
        for desc in registry.iter() {
            // The registry holds at most MAX_ATTRIBUTES entries.
            let _ = values.push(AttrValue::new(desc.size, desc.initial_len()));
        }
        Self {
            registry,
            values,
            pending: None,
            tickets: 0,
            conn: ConnectionState::new(),
            adv: AdvertisingController::new(),
            workers: WorkerEngine::new(),
            reboot: false,
            app,
            link,
        }
    }

    /// Append a background worker.
    pub fn register_worker(&mut self, worker: Worker<C>) -> Result<(), Error> {
        self.workers.register(worker)
    }

    /// Start fast advertising and the worker clock.
    pub fn start(&mut self) {
        info!("Starting: {} attributes, {} workers", self.registry.len(), self.workers.len());
        self.workers.start();
        let mode = self.adv.start();
        self.link.start_advertising(mode, self.adv.config());
    }

    pub fn registry(&self) -> &Registry<C> {
        &self.registry
    }

    /// Current value of an attribute.
    ///
    /// # Panics
    ///
    /// When `id` is not in the registry.
    pub fn value(&self, id: AttrId) -> &AttrValue {
        &self.values[self.registry.get(id).id.index()]
    }

    /// Mutable access to an attribute value, to fill in the content of a
    /// deferred read before [`AdvServer::complete_read`].
    ///
    /// # Panics
    ///
    /// When `id` is not in the registry.
    pub fn value_mut(&mut self, id: AttrId) -> &mut AttrValue {
        &mut self.values[self.registry.get(id).id.index()]
    }

    pub fn pending(&self) -> Option<&PendingOp> {
        self.pending.as_ref()
    }

    /// Ticket of the deferred operation, to hand to whoever completes it.
    pub fn pending_ticket(&self) -> Option<Ticket> {
        self.pending.as_ref().map(|op| op.ticket)
    }

    pub(crate) fn issue_ticket(&mut self) -> Ticket {
        self.tickets = self.tickets.wrapping_add(1);
        Ticket(self.tickets)
    }

    pub fn workers(&self) -> &WorkerEngine<C> {
        &self.workers
    }

    pub fn app(&self) -> &C {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut C {
        &mut self.app
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Reset the device once the current peer is gone.
    pub fn request_reboot(&mut self) {
        self.reboot = true;
    }

    /// Gate for events tied to a connection.
    ///
    /// A foreign link (a second peer) is closed right away.
    pub(crate) fn accepts(&mut self, conn: ConnHandle) -> bool {
        match self.conn.handle() {
            None => {
                error!("Event on closed connection {}", conn.0);
                false
            }
            Some(current) if current != conn => {
                info!("Connection handle mismatch: {} != {}", conn.0, current.0);
                if let Err(error) = self.link.disconnect(conn, DisconnectReason::RemoteUserTerminated) {
                    error!("Disconnect of handle {} failed: {:?}", conn.0, error);
                }
                false
            }
            Some(_) => true,
        }
    }
}

impl<C: Application + 'static, L: GattLink> AdvServer<C, L> {
    /// Dispatch a protocol engine event.
    pub fn handle_event(&mut self, event: BleEvent<'_>) {
        match event {
            BleEvent::Connected { conn, peer } => match self.conn.handle() {
                Some(current) => {
                    warn!("Second connection {} while {} is active", conn.0, current.0);
                    if let Err(error) =
                        self.link.disconnect(conn, DisconnectReason::RemoteUserTerminated)
                    {
                        error!("Disconnect of handle {} failed: {:?}", conn.0, error);
                    }
                }
                None => self.on_connected(conn, &peer),
            },
            BleEvent::Disconnected { conn, reason } => match self.conn.handle() {
                Some(current) if current != conn => {
                    info!("Foreign connection {} closed", conn.0);
                }
                _ => self.on_disconnected(conn, reason),
            },
            BleEvent::Read(req) => self.on_read_request(&req),
            BleEvent::Write(req) => self.on_write_request(&req),
            BleEvent::Written { conn, uuid } => self.on_write_event(conn, &uuid),
            BleEvent::ConnParamUpdate { conn, params } => {
                if self.accepts(conn) {
                    info!(
                        "Connection parameters: interval {}-{}, latency {}, timeout {}",
                        params.min_interval,
                        params.max_interval,
                        params.slave_latency,
                        params.sup_timeout
                    );
                }
            }
            BleEvent::SysAttrMissing { conn } => {
                if self.accepts(conn) {
                    self.link.set_default_sys_attrs(conn);
                }
            }
            BleEvent::GattClientTimeout { conn } | BleEvent::GattServerTimeout { conn } => {
                if self.accepts(conn) {
                    warn!("GATT timeout on connection {}", conn.0);
                    self.disconnect();
                }
            }
            BleEvent::Advertising(event) => self.on_advertising_event(event),
        }
    }

    /// Periodic worker tick, every `WORKER_PACE_SECS`.
    pub fn tick(&mut self) {
        match self.workers.advance() {
            Tick::Stalled => {
                if self.conn.is_connected() && !self.conn.is_closing() {
                    warn!("Connection stalled at {}", self.workers.time());
                    self.disconnect();
                }
            }
            Tick::Run => self.workers.resume(&mut self.app),
            Tick::Idle | Tick::Busy => {}
        }
        self.expire_pending();
    }

    /// A deferred worker finished; run the rest of the chain.
    pub fn worker_done(&mut self) {
        if !self.workers.is_running() {
            warn!("Worker completion while the chain is idle");
            return;
        }
        self.workers.resume(&mut self.app);
    }

    /// Fail a deferred request that outlived `COMMAND_DELAY_SECS`.
    fn expire_pending(&mut self) {
        let Some(op) = &self.pending else {
            return;
        };
        if self.workers.time().wrapping_sub(op.started_at) <= COMMAND_DELAY_SECS {
            return;
        }
        error!("Deferred request on attribute {} timed out", op.attr.0);
        let kind = op.kind;
        match kind {
            PendingKind::Read => self.finish_read(Err(Error::Internal)),
            PendingKind::Write => self.finish_write(Err(Error::Internal), None),
        }
    }

    /// Consume reboot requests raised by the application.
    pub(crate) fn reboot_requested(&mut self) -> bool {
        if self.app.take_reboot_request() {
            self.reboot = true;
        }
        self.reboot
    }
}

//! SoftDevice glue.
//!
//! Builds the vendor GATT table from the attribute registry, forwards
//! SoftDevice callbacks to the shared [`AdvServer`] and implements
//! [`GattLink`] on top of the deferred read/write replies.

use core::cell::RefCell;

use bleadv::ble::attribute::CCCD_UUID;
use bleadv::ble::service::{Advertiser, REGISTRY};
use bleadv::ble::{
    AdvMode, AdvServer, AdvertisingConfig, AttrUuid, BleEvent, ConnHandle, DisconnectReason,
    GattLink, ReadReply, ReadRequest, ReplySlot, WriteOp, WriteReply, WriteRequest,
};
use bleadv::config::{ATTR_STORAGE_SIZE, MAX_ATTRIBUTES, SERVICE_UUID, VENDOR_UUID_BASE};
use bleadv::Error;
use defmt::{error, info, warn};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::builder::ServiceBuilder;
use nrf_softdevice::ble::gatt_server::characteristic::{Attribute, Metadata, Properties};
use nrf_softdevice::ble::gatt_server::{
    self, DeferredReadReply, DeferredWriteReply, RegisterError,
};
use nrf_softdevice::ble::{Connection, GattError, Uuid};
use nrf_softdevice::{raw, Softdevice};

pub type Server = AdvServer<Advertiser, SdLink>;

/// Request to (re)start advertising, consumed by the advertising task.
#[derive(Clone, Copy)]
pub struct AdvRequest {
    pub mode: AdvMode,
    pub config: AdvertisingConfig,
}

pub static ADV_REQUEST: Signal<CriticalSectionRawMutex, AdvRequest> = Signal::new();

static SERVER: Mutex<CriticalSectionRawMutex, RefCell<Option<Server>>> =
    Mutex::new(RefCell::new(None));

pub fn install(server: Server) {
    SERVER.lock(|cell| cell.replace(Some(server)));
}

/// Run `f` on the shared server. `None` before [`install`].
pub fn with_server<R>(f: impl FnOnce(&mut Server) -> R) -> Option<R> {
    SERVER.lock(|cell| cell.borrow_mut().as_mut().map(f))
}

/// 128-bit UUID of a vendor alias, little-endian.
pub fn vendor_uuid_bytes(alias: u16) -> [u8; 16] {
    let mut bytes = VENDOR_UUID_BASE;
    bytes[12..14].copy_from_slice(&alias.to_le_bytes());
    bytes
}

pub fn vendor_uuid(alias: u16) -> Uuid {
    Uuid::new_128(&vendor_uuid_bytes(alias))
}

/// [`GattLink`] over the SoftDevice.
pub struct SdLink {
    conn: Option<Connection>,
    read_reply: ReplySlot<DeferredReadReply>,
    write_reply: ReplySlot<DeferredWriteReply>,
}

impl SdLink {
    pub const fn new() -> Self {
        Self {
            conn: None,
            read_reply: ReplySlot::new(),
            write_reply: ReplySlot::new(),
        }
    }

    pub fn attach(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }

    pub fn detach(&mut self) {
        self.conn = None;
        self.read_reply = ReplySlot::new();
        self.write_reply = ReplySlot::new();
    }

    /// Handle of the attached connection.
    pub fn handle(&self) -> Option<ConnHandle> {
        self.conn.as_ref().and_then(Connection::handle).map(ConnHandle)
    }
}

impl GattLink for SdLink {
    fn reply_read(&mut self, _conn: ConnHandle, reply: &ReadReply<'_>) {
        let Some(deferred) = self.read_reply.take() else {
            warn!("Read reply without a request");
            return;
        };
        let value = match GattError::from_result(reply.status.raw()) {
            Ok(()) => Ok(reply.update.then_some(reply.data)),
            Err(err) => Err(err),
        };
        if let Err(err) = deferred.reply(value) {
            error!("Read reply failed: {:?}", err);
        }
    }

    fn reply_write(&mut self, _conn: ConnHandle, reply: &WriteReply<'_>) {
        let Some(deferred) = self.write_reply.take() else {
            warn!("Write reply without a request");
            return;
        };
        let value = match GattError::from_result(reply.status.raw()) {
            Ok(()) => Ok(reply.update.then_some(reply.data)),
            Err(err) => Err(err),
        };
        if let Err(err) = deferred.reply(value) {
            error!("Write reply failed: {:?}", err);
        }
    }

    fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason) -> Result<(), Error> {
        let ret = unsafe { raw::sd_ble_gap_disconnect(conn.0, reason.hci_code()) };
        if ret != raw::NRF_SUCCESS {
            warn!("sd_ble_gap_disconnect: {}", ret);
            return Err(Error::Io);
        }
        Ok(())
    }

    fn start_advertising(&mut self, mode: AdvMode, config: &AdvertisingConfig) {
        ADV_REQUEST.signal(AdvRequest {
            mode,
            config: *config,
        });
    }

    fn reboot(&mut self) {
        cortex_m::peripheral::SCB::sys_reset();
    }
}

/// GATT table: maps SoftDevice handles to attribute UUIDs.
pub struct GattTable {
    handles: Vec<(u16, AttrUuid), { 2 * MAX_ATTRIBUTES }>,
}

impl GattTable {
    /// Register the vendor service described by the registry.
    pub fn build(sd: &mut Softdevice) -> Result<Self, RegisterError> {
        let mut service = ServiceBuilder::new(sd, vendor_uuid(SERVICE_UUID))?;
        let mut handles = Vec::new();
        let zeros = [0u8; ATTR_STORAGE_SIZE];

        for desc in REGISTRY.iter() {
            let perm = desc.permission;
            let props = perm.props();
            let mut properties = Properties::new();
            if props.read {
                properties = properties.read();
            }
            if props.write {
                properties = properties.write();
            }
            if props.notify {
                properties = properties.notify();
            }

            let mut attr = Attribute::new(&zeros[..desc.size]);
            if desc.varsize {
                attr = attr.variable_len(desc.size as u16);
            }
            if perm.read_authorized() {
                attr = attr.deferred_read();
            }
            if perm.write_authorized() {
                attr = attr.deferred_write();
            }

            let uuid = desc.uuid();
            let chr = service.add_characteristic(vendor_uuid(uuid.uuid), attr, Metadata::new(properties))?;
            let chr = chr.build();
            info!("GATT: {} -> handle {}", desc.label, chr.value_handle);

            let _ = handles.push((chr.value_handle, uuid));
            if chr.cccd_handle != 0 {
                let _ = handles.push((chr.cccd_handle, AttrUuid::bluetooth(CCCD_UUID)));
            }
        }

        let _ = service.build();
        Ok(Self { handles })
    }

    fn uuid(&self, handle: u16) -> Option<AttrUuid> {
        self.handles
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, uuid)| *uuid)
    }
}

fn current_handle(server: &Server) -> Option<ConnHandle> {
    server.link().handle()
}

impl gatt_server::Server for GattTable {
    type Event = ();

    fn on_write(
        &self,
        conn: &Connection,
        handle: u16,
        _op: gatt_server::WriteOp,
        _offset: usize,
        _data: &[u8],
    ) -> Option<Self::Event> {
        let (Some(conn), Some(uuid)) = (conn.handle(), self.uuid(handle)) else {
            return None;
        };
        with_server(|server| {
            server.handle_event(BleEvent::Written {
                conn: ConnHandle(conn),
                uuid,
            })
        });
        None
    }

    fn on_deferred_read(
        &self,
        handle: u16,
        offset: usize,
        reply: DeferredReadReply,
    ) -> Option<Self::Event> {
        let uuid = self.uuid(handle)?;
        with_server(|server| {
            let Some(conn) = current_handle(server) else {
                return;
            };
            let displaced = server.link_mut().read_reply.park(reply);
            server.handle_event(BleEvent::Read(ReadRequest {
                conn,
                uuid,
                offset: offset as u16,
            }));
            server.link_mut().read_reply.restore(displaced);
        });
        None
    }

    fn on_deferred_write(
        &self,
        handle: u16,
        op: gatt_server::WriteOp,
        offset: usize,
        data: &[u8],
        reply: DeferredWriteReply,
    ) -> Option<Self::Event> {
        let uuid = self.uuid(handle)?;
        let Some(op) = WriteOp::from_gatts_op(op as u8) else {
            warn!("Unknown write operation on handle {}", handle);
            return None;
        };
        with_server(|server| {
            let Some(conn) = current_handle(server) else {
                return;
            };
            let displaced = server.link_mut().write_reply.park(reply);
            server.handle_event(BleEvent::Write(WriteRequest {
                conn,
                uuid,
                op,
                offset: offset as u16,
                data,
            }));
            server.link_mut().write_reply.restore(displaced);
        });
        None
    }
}

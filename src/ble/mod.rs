//! Bluetooth Low Energy subsystem.
//!
//! This module drives the vendor GATT service in **Peripheral** role:
//!
//! 1. **Attribute registry** - immutable description of every vendor
//!    characteristic, plus the error record attribute.
//! 2. **Request engine** - authorizes read/write requests before the
//!    SoftDevice commits them, completing them immediately or later.
//! 3. **Connection & advertising control** - tracks the single peer link,
//!    the fast/slow/sleep advertising modes and the stalled-link watchdog.
//!
//! The protocol engine itself (SoftDevice) sits behind [`GattLink`]; the
//! firmware forwards its events through [`AdvServer::handle_event`].

pub mod advertising;
pub mod attribute;
pub mod connection;
pub mod error_record;
pub mod request;
pub mod server;
pub mod service;

#[cfg(test)]
mod tests;

use core::fmt::Write;

use heapless::String;

use crate::error::Error;

pub use advertising::{AdvEvent, AdvMode, AdvertisingConfig, AdvertisingController};
pub use attribute::{
    AttrId, AttrUuid, AttrValue, AttributeDescriptor, CharProps, Permission, Reader, Registry,
    UuidKind, Writer,
};
pub use error_record::{ErrorRecord, ERROR_RECORD_SIZE};
pub use request::{
    PendingKind, PendingOp, ReadReply, ReadRequest, Ticket, WriteOp, WriteReply, WriteRequest,
};
pub use server::{AdvServer, BleEvent};

/// Connection handle assigned by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

/// BLE device address, least significant byte first (over-the-air order).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress(pub [u8; 6]);

impl PeerAddress {
    /// Human-readable form, most significant byte first (`aa:bb:cc:dd:ee:ff`).
    pub fn to_str(&self) -> String<17> {
        let mut s = String::new();
        for (ix, byte) in self.0.iter().rev().enumerate() {
            if ix > 0 {
                let _ = s.push(':');
            }
            let _ = write!(&mut s, "{:02x}", byte);
        }
        s
    }
}

/// Status codes carried by authorize replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    /// No client-facing equivalent exists for an internally aborted request;
    /// Bluetooth Core v4.2 Vol 3 Part F 3.3 allows this one.
    UnlikelyError,
    /// Application error range: prepared/queued writes are not supported.
    FeatureNotSupported,
}

/// First application-defined ATT error (SoftDevice GATT status encoding).
const GATT_STATUS_APP_BEGIN: u16 = 0x0180;

impl GattStatus {
    /// SoftDevice GATT status value (`BLE_GATT_STATUS_*`).
    pub const fn raw(self) -> u16 {
        match self {
            GattStatus::Success => 0x0000,
            GattStatus::ReadNotPermitted => 0x0102,
            GattStatus::WriteNotPermitted => 0x0103,
            GattStatus::UnlikelyError => 0x010E,
            GattStatus::FeatureNotSupported => GATT_STATUS_APP_BEGIN + 2,
        }
    }
}

/// HCI reason sent with a locally initiated disconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    RemoteUserTerminated,
}

impl DisconnectReason {
    pub const fn hci_code(self) -> u8 {
        match self {
            DisconnectReason::RemoteUserTerminated => 0x13,
        }
    }
}

/// Connection parameters as reported by a parameter update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub slave_latency: u16,
    pub sup_timeout: u16,
}

/// Operations the request engine needs from the protocol engine.
///
/// Every accepted authorize request gets exactly one `reply_*` call.
pub trait GattLink {
    /// Answer a read authorize request.
    fn reply_read(&mut self, conn: ConnHandle, reply: &ReadReply<'_>);

    /// Answer a write authorize request.
    fn reply_write(&mut self, conn: ConnHandle, reply: &WriteReply<'_>);

    /// Terminate a link. The disconnection is confirmed later by a
    /// `Disconnected` event; an error means the request was not taken.
    fn disconnect(&mut self, conn: ConnHandle, reason: DisconnectReason) -> Result<(), Error>;

    /// (Re)start connectable advertising.
    fn start_advertising(&mut self, mode: AdvMode, config: &AdvertisingConfig);

    /// Install default system attributes (CCCD states) for a link.
    fn set_default_sys_attrs(&mut self, _conn: ConnHandle) {}

    /// Reset the device. Only called once the peer is gone.
    fn reboot(&mut self);
}

/// Reply handle of a deferred request, held by a [`GattLink`] until the
/// engine answers it.
///
/// A request arriving while another one is pending is answered at once
/// (busy). Its handle is parked over the pending one for the duration of
/// the dispatch, then the pending handle is put back with [`restore`].
///
/// [`restore`]: ReplySlot::restore
pub struct ReplySlot<R> {
    held: Option<R>,
}

impl<R> ReplySlot<R> {
    pub const fn new() -> Self {
        Self { held: None }
    }

    /// Hold the reply handle of an incoming request; returns the one it
    /// displaced.
    pub fn park(&mut self, reply: R) -> Option<R> {
        self.held.replace(reply)
    }

    /// Give back a handle displaced by [`park`](Self::park) once the
    /// incoming request has been dispatched.
    pub fn restore(&mut self, displaced: Option<R>) {
        if displaced.is_none() {
            return;
        }
        if self.held.is_some() {
            error!("Two deferred replies held, dropping the older one");
            return;
        }
        self.held = displaced;
    }

    pub fn take(&mut self) -> Option<R> {
        self.held.take()
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl<R> Default for ReplySlot<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hooks into the application logic that owns the attribute handlers.
pub trait Application {
    /// Consume a reboot request raised by a writer.
    fn take_reboot_request(&mut self) -> bool {
        false
    }
}

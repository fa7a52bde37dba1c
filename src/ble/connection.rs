//! Peer link tracking.
//!
//! At most one peer is connected at a time. Connection and disconnection
//! hand the background workers off to/from the BLE side and resolve a
//! pending reboot: the device only resets once the peer is gone.

use super::server::AdvServer;
use super::{Application, ConnHandle, DisconnectReason, GattLink, PeerAddress};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionState {
    handle: Option<ConnHandle>,
    /// A local disconnection was requested and not confirmed yet.
    closing: bool,
}

impl ConnectionState {
    pub const fn new() -> Self {
        Self {
            handle: None,
            closing: false,
        }
    }

    pub fn handle(&self) -> Option<ConnHandle> {
        self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

impl<C: Application + 'static, L: GattLink> AdvServer<C, L> {
    /// A peer connected.
    pub fn on_connected(&mut self, conn: ConnHandle, peer: &PeerAddress) {
        info!("Connected: {} (handle {})", peer.to_str().as_str(), conn.0);
        self.reboot = false;
        self.adv.on_connected();
        self.workers.set_ble_active(true);
        self.conn = ConnectionState {
            handle: Some(conn),
            closing: false,
        };
    }

    /// The peer left, or a connection attempt failed.
    pub fn on_disconnected(&mut self, conn: ConnHandle, reason: Option<u8>) {
        info!("Disconnected: handle {} reason {:?}", conn.0, reason);
        if self.pending.take().is_some() {
            warn!("Pending operation dropped on disconnection");
        }
        self.conn = ConnectionState::new();
        self.workers.set_ble_active(false);

        if self.reboot_requested() {
            warn!("Rebooting");
            self.link.reboot();
            return;
        }

        let mode = self.adv.start();
        self.link.start_advertising(mode, self.adv.config());
    }

    /// Close the current link, if any. Repeated calls are ignored until
    /// the disconnection is reported; a refused request may be retried.
    pub fn disconnect(&mut self) {
        let Some(conn) = self.conn.handle() else {
            return;
        };
        if self.conn.closing {
            return;
        }
        info!("Disconnecting handle {}", conn.0);
        match self.link.disconnect(conn, DisconnectReason::RemoteUserTerminated) {
            Ok(()) => self.conn.closing = true,
            Err(error) => error!("Disconnect of handle {} failed: {:?}", conn.0, error),
        }
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.conn
    }
}

//! Error record attribute.
//!
//! The last recorded failure is kept in attribute slot 0 as an 8-byte
//! record, so a client can fetch details after a rejected request:
//!
//! | byte | field                                 |
//! |------|---------------------------------------|
//! | 0    | error code (negative, see [`Error`])  |
//! | 1    | attribute id the failure relates to   |
//! | 2    | internal sub-state marker             |
//! | 3    | internal component marker             |
//! | 4..8 | extra payload, little-endian          |

use crate::error::Error;

use super::attribute::{AttrId, AttributeDescriptor};
use super::server::AdvServer;
use super::GattLink;

/// Encoded size of an [`ErrorRecord`].
pub const ERROR_RECORD_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorRecord {
    pub errno: i8,
    pub attr: u8,
    pub state: u8,
    pub comp: u8,
    pub payload: u32,
}

impl ErrorRecord {
    pub const fn new(error: Error, attr: AttrId) -> Self {
        Self {
            errno: error.code(),
            attr: attr.0,
            state: 0,
            comp: 0,
            payload: 0,
        }
    }

    pub fn encode(&self) -> [u8; ERROR_RECORD_SIZE] {
        let mut buf = [0u8; ERROR_RECORD_SIZE];
        buf[0] = self.errno as u8;
        buf[1] = self.attr;
        buf[2] = self.state;
        buf[3] = self.comp;
        buf[4..].copy_from_slice(&self.payload.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ERROR_RECORD_SIZE {
            return None;
        }
        Some(Self {
            errno: buf[0] as i8,
            attr: buf[1],
            state: buf[2],
            comp: buf[3],
            payload: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn error(&self) -> Option<Error> {
        Error::from_code(self.errno)
    }
}

impl<C: 'static, L: GattLink> AdvServer<C, L> {
    /// Store `error` into the error record, tagged with `attr`.
    ///
    /// An unknown `attr` is replaced by the error attribute's own id.
    /// Returns the error attribute descriptor.
    pub fn record_error(&mut self, error: Error, attr: AttrId) -> &'static AttributeDescriptor<C> {
        self.record_error_detail(ErrorRecord::new(error, attr))
    }

    /// As [`AdvServer::record_error`], with sub-state markers and payload.
    pub fn record_error_detail(&mut self, mut record: ErrorRecord) -> &'static AttributeDescriptor<C> {
        if self.registry.lookup(AttrId(record.attr)).is_none() {
            record.attr = AttrId::ERROR.0;
        }
        warn!("Error recorded: errno {} on attribute {}", record.errno, record.attr);
        let desc = self.registry.get(AttrId::ERROR);
        // Slot 0 is validated to hold exactly one record.
        let _ = self.values[AttrId::ERROR.index()].set(&record.encode());
        desc
    }

    /// Last recorded error.
    pub fn last_error(&self) -> ErrorRecord {
        ErrorRecord::decode(self.values[AttrId::ERROR.index()].as_bytes()).unwrap_or_default()
    }
}

//! Attribute registry.
//!
//! Every vendor characteristic is described once, in a `'static` table of
//! [`AttributeDescriptor`]s. The table is validated when the [`Registry`] is
//! built in a `const` context, so a malformed table fails the build instead
//! of misbehaving on the air.
//!
//! Slot 0 is reserved for the error record attribute (see
//! [`super::error_record`]).

use crate::config::{
    ATTR_LABEL_SIZE, ATTR_STORAGE_SIZE, CHAR_UUID_BASE, MAX_ATTRIBUTES, TRANSIENT_STORAGE_SIZE,
};
use crate::error::{Error, HandlerResult};

use super::error_record::ERROR_RECORD_SIZE;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: u16 = 0x2902;

/// Attribute identifier: index into the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttrId(pub u8);

impl AttrId {
    /// The error record attribute.
    pub const ERROR: AttrId = AttrId(0);

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// 16-bit UUID alias of the attribute within the vendor base.
    pub const fn uuid(self) -> AttrUuid {
        AttrUuid::vendor(CHAR_UUID_BASE + self.0 as u16)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UuidKind {
    /// Bluetooth SIG assigned number.
    Bluetooth,
    /// Alias within the vendor 128-bit base.
    Vendor,
}

/// UUID of an attribute as reported by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttrUuid {
    pub kind: UuidKind,
    pub uuid: u16,
}

impl AttrUuid {
    pub const fn vendor(uuid: u16) -> Self {
        Self {
            kind: UuidKind::Vendor,
            uuid,
        }
    }

    pub const fn bluetooth(uuid: u16) -> Self {
        Self {
            kind: UuidKind::Bluetooth,
            uuid,
        }
    }
}

/// Characteristic properties advertised in the GATT table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// Access class of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Permission {
    /// Readable, value served by the protocol engine without authorization.
    ReadOnly,
    /// Readable, every read is authorized and refreshed by a reader.
    ReadOnDemand,
    /// As [`Permission::ReadOnDemand`], and the peer may subscribe.
    ReadNotify,
    /// Write-capable, every write is authorized.
    Write,
}

impl Permission {
    pub const fn props(self) -> CharProps {
        match self {
            Permission::ReadOnly | Permission::ReadOnDemand => CharProps {
                read: true,
                write: false,
                notify: false,
            },
            Permission::ReadNotify => CharProps {
                read: true,
                write: false,
                notify: true,
            },
            Permission::Write => CharProps {
                read: false,
                write: true,
                notify: false,
            },
        }
    }

    /// Reads go through the request engine.
    pub const fn read_authorized(self) -> bool {
        matches!(self, Permission::ReadOnDemand | Permission::ReadNotify)
    }

    /// Writes go through the request engine.
    pub const fn write_authorized(self) -> bool {
        matches!(self, Permission::Write)
    }
}

/// Refreshes an attribute value before it is read.
pub type Reader<C> = fn(&mut C, &mut AttrValue) -> HandlerResult;

/// Validates and applies a written payload.
pub type Writer<C> = fn(&mut C, &[u8]) -> HandlerResult;

/// Immutable description of one attribute.
pub struct AttributeDescriptor<C> {
    pub id: AttrId,
    /// Storage size; exact write length for fixed-size attributes.
    pub size: usize,
    /// Value length may vary from 0 up to `size`.
    pub varsize: bool,
    pub permission: Permission,
    pub reader: Option<Reader<C>>,
    pub writer: Option<Writer<C>>,
    /// User description exposed to the peer.
    pub label: &'static str,
}

impl<C> AttributeDescriptor<C> {
    pub const fn uuid(&self) -> AttrUuid {
        self.id.uuid()
    }

    /// Length of a freshly initialized value.
    pub const fn initial_len(&self) -> usize {
        if self.varsize {
            0
        } else {
            self.size
        }
    }
}

/// Backing storage of an attribute value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrValue {
    data: [u8; ATTR_STORAGE_SIZE],
    size: usize,
    len: usize,
}

impl AttrValue {
    pub const fn new(size: usize, len: usize) -> Self {
        Self {
            data: [0; ATTR_STORAGE_SIZE],
            size,
            len,
        }
    }

    /// Meaningful content.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole storage, regardless of the meaningful length.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_len(&mut self, len: usize) -> Result<(), Error> {
        if len > self.size {
            return Err(Error::Overflow);
        }
        self.len = len;
        Ok(())
    }

    /// Replace the content.
    pub fn set(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.commit(0, bytes)
    }

    /// Store `bytes` at `offset`; the length becomes `offset + bytes.len()`.
    pub fn commit(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let end = offset + bytes.len();
        if end > self.size {
            return Err(Error::Overflow);
        }
        self.data[offset..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }
}

/// Validated attribute table.
pub struct Registry<C: 'static> {
    table: &'static [AttributeDescriptor<C>],
}

impl<C: 'static> Clone for Registry<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: 'static> Copy for Registry<C> {}

impl<C: 'static> Registry<C> {
    /// Validate `table`.
    ///
    /// Meant for `const` items: a malformed table is a build error.
    pub const fn new(table: &'static [AttributeDescriptor<C>]) -> Self {
        assert!(!table.is_empty(), "attribute table is empty");
        assert!(table.len() <= MAX_ATTRIBUTES, "too many attributes");
        assert!(
            table[0].size == ERROR_RECORD_SIZE && !table[0].varsize,
            "slot 0 must hold the error record"
        );
        let mut ix = 0;
        while ix < table.len() {
            let desc = &table[ix];
            assert!(desc.id.0 as usize == ix, "attribute id does not match its slot");
            assert!(desc.size > 0, "attribute has no storage");
            assert!(desc.size <= ATTR_STORAGE_SIZE, "attribute storage too large");
            assert!(desc.label.len() <= ATTR_LABEL_SIZE, "attribute label too long");
            if desc.writer.is_some() {
                assert!(
                    desc.size <= TRANSIENT_STORAGE_SIZE,
                    "writable attribute exceeds transient storage"
                );
            }
            ix += 1;
        }
        Self { table }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'static, AttributeDescriptor<C>> {
        self.table.iter()
    }

    pub fn lookup(&self, id: AttrId) -> Option<&'static AttributeDescriptor<C>> {
        self.table.get(id.index())
    }

    /// Descriptor of a known attribute.
    ///
    /// # Panics
    ///
    /// When `id` is outside of the table: callers only hold ids coming from
    /// the table itself, anything else is a programming error.
    pub fn get(&self, id: AttrId) -> &'static AttributeDescriptor<C> {
        match self.lookup(id) {
            Some(desc) => desc,
            None => panic!("invalid attribute id {}", id.0),
        }
    }

    /// Map a UUID reported by the protocol engine to an attribute.
    pub fn resolve(&self, uuid: &AttrUuid) -> Result<&'static AttributeDescriptor<C>, Error> {
        if uuid.kind != UuidKind::Vendor || uuid.uuid < CHAR_UUID_BASE {
            return Err(Error::InvalidUuid);
        }
        let ix = uuid.uuid - CHAR_UUID_BASE;
        if ix > u8::MAX as u16 {
            return Err(Error::InvalidUuid);
        }
        self.lookup(AttrId(ix as u8)).ok_or(Error::InvalidUuid)
    }
}

//! Vendor GATT service of the advertiser.
//!
//! | id | UUID   | access         | content                         |
//! |----|--------|----------------|---------------------------------|
//! | 0  | 0x1001 | read, notify   | last error record (8 bytes)     |
//! | 1  | 0x1002 | read on demand | software version string         |
//! | 2  | 0x1003 | write          | `0x01` reboots once disconnected |

use crate::config::SW_VERSION;
use crate::error::{Error, HandlerResult, Outcome};

use super::attribute::{AttrId, AttrValue, AttributeDescriptor, Permission, Registry};
use super::error_record::ERROR_RECORD_SIZE;
use super::Application;

pub const ATTR_ERROR: AttrId = AttrId::ERROR;
pub const ATTR_VERSION: AttrId = AttrId(1);
pub const ATTR_REBOOT: AttrId = AttrId(2);

/// Value to write into the reboot attribute.
pub const REBOOT_MAGIC: u8 = 0x01;

const VERSION_SIZE: usize = 16;

/// Application context of the advertiser service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Advertiser {
    reboot: bool,
}

impl Advertiser {
    pub const fn new() -> Self {
        Self { reboot: false }
    }
}

impl Application for Advertiser {
    fn take_reboot_request(&mut self) -> bool {
        core::mem::take(&mut self.reboot)
    }
}

fn read_version(_: &mut Advertiser, value: &mut AttrValue) -> HandlerResult {
    value.set(SW_VERSION.as_bytes())?;
    Ok(Outcome::Done)
}

fn write_reboot(app: &mut Advertiser, data: &[u8]) -> HandlerResult {
    match data {
        [REBOOT_MAGIC] => {
            app.reboot = true;
            Ok(Outcome::Done)
        }
        _ => Err(Error::OutOfRange),
    }
}

static ATTRIBUTES: [AttributeDescriptor<Advertiser>; 3] = [
    AttributeDescriptor {
        id: ATTR_ERROR,
        size: ERROR_RECORD_SIZE,
        varsize: false,
        permission: Permission::ReadNotify,
        reader: None,
        writer: None,
        label: "Error",
    },
    AttributeDescriptor {
        id: ATTR_VERSION,
        size: VERSION_SIZE,
        varsize: true,
        permission: Permission::ReadOnDemand,
        reader: Some(read_version),
        writer: None,
        label: "Version",
    },
    AttributeDescriptor {
        id: ATTR_REBOOT,
        size: 1,
        varsize: false,
        permission: Permission::Write,
        reader: None,
        writer: Some(write_reboot),
        label: "Reboot",
    },
];

/// Attribute registry of the advertiser service.
pub static REGISTRY: Registry<Advertiser> = Registry::new(&ATTRIBUTES);

//! Application-wide constants and compile-time configuration.
//!
//! All timing budgets, advertising parameters and GATT identifiers live
//! here so they can be tuned in one place.

// Background workers

/// Period of the worker engine timer (seconds).
pub const WORKER_PACE_SECS: u32 = 5;

/// Delay without any serviced BLE request after which a connection is
/// considered stalled and closed (seconds).
pub const STALL_DELAY_SECS: u32 = 120;

/// Budget for a deferred request to complete (seconds).
/// ATT allows 30 s at most.
pub const COMMAND_DELAY_SECS: u32 = 10;

/// Maximum number of background workers.
pub const MAX_WORKERS: usize = 4;

// Advertising

/// BLE TX power on the connection (dBm).
pub const TX_POWER_DBM: i8 = 4;

/// Fast advertising window after disconnection, i.e. the delay before the
/// device enters sleep mode (seconds).
pub const ADV_FAST_TIMEOUT_SECS: u32 = 3600;

/// Slow advertising window (seconds).
pub const ADV_SLOW_TIMEOUT_SECS: u32 = 3600;

/// Fast advertising interval (in 0.625 ms units). 320 = 200 ms.
pub const ADV_FAST_INTERVAL: u32 = 320;

/// Slow advertising interval (in 0.625 ms units). 1600 = 1 s.
pub const ADV_SLOW_INTERVAL: u32 = 1600;

/// GAP device name - keep it *very* short, it shares the advertising payload.
pub const DEVICE_NAME: &str = "Adv";

// Connection parameters

/// Preferred connection interval range (in 1.25 ms units).
/// 6 = 7.5 ms, 12 = 15 ms.
pub const CONN_INTERVAL_MIN: u16 = 6;
pub const CONN_INTERVAL_MAX: u16 = 12;

/// Slave latency (number of connection events the peripheral can skip).
pub const CONN_SLAVE_LATENCY: u16 = 3;

/// Supervision timeout (in 10 ms units). 200 = 2 s.
pub const CONN_SUP_TIMEOUT: u16 = 200;

// GATT

/// Vendor service UUID (16-bit alias within the vendor base).
pub const SERVICE_UUID: u16 = 0x0071;

/// UUID of the first vendor characteristic; attribute `n` uses `BASE + n`.
pub const CHAR_UUID_BASE: u16 = 0x1001;

/// 128-bit vendor UUID base, little-endian as the SoftDevice expects it:
/// `38d1xxxx-7b25-11e9-8f9e-2a86e4085a59`.
pub const VENDOR_UUID_BASE: [u8; 16] = [
    0x59, 0x5a, 0x08, 0xe4, 0x86, 0x2a, 0x9e, 0x8f, 0xe9, 0x11, 0x25, 0x7b, 0x00, 0x00, 0xd1, 0x38,
];

/// Maximum number of vendor attributes in the registry.
pub const MAX_ATTRIBUTES: usize = 8;

/// Largest attribute value (fits a default ATT MTU of 23 bytes).
pub const ATTR_STORAGE_SIZE: usize = 20;

/// Transient storage for write payloads that outlive their request.
/// Every writable attribute must fit in here.
pub const TRANSIENT_STORAGE_SIZE: usize = 16;

/// Maximum length of an attribute user description.
pub const ATTR_LABEL_SIZE: usize = 16;

/// Software version exposed through the version attribute.
pub const SW_VERSION: &str = env!("CARGO_PKG_VERSION");

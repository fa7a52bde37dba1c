//! bleadv - BLE advertiser GATT engine.
//!
//! The protocol logic is hardware independent and tested on the host:
//!
//! Usage: `cargo test --lib` / `cargo test`
//!
//! Note: The embedded binary (`src/main.rs`, feature `embedded`) wires this
//! library to the nRF52832 SoftDevice. This lib.rs is `no_std` outside of
//! tests so both builds share the same code.

#![cfg_attr(not(test), no_std)]

// Must stay first: the logging macros are used by every module below.
#[macro_use]
mod fmt;

pub mod ble;
pub mod config;
pub mod error;
pub mod worker;

pub use ble::{AdvServer, BleEvent, GattLink};
pub use error::{Error, HandlerResult, Outcome};

//! Advertising and sleep mode control.
//!
//! After a disconnection the device advertises fast for
//! `ADV_FAST_TIMEOUT_SECS`, then slow for `ADV_SLOW_TIMEOUT_SECS`. When the
//! slow window runs out the device is entering sleep: requests are refused
//! with [`Error::Abort`](crate::error::Error::Abort) and slow advertising is
//! restarted from the baseline parameters.

use crate::config;

use super::server::AdvServer;
use super::GattLink;

/// Connectable advertising mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvMode {
    Fast,
    Slow,
}

/// Advertising event reported by the protocol engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdvEvent {
    /// Fast window started.
    Fast,
    /// Fast window exhausted, slow window started.
    Slow,
    /// Slow window exhausted.
    Idle,
    Directed,
    DirectedHighDuty,
    FastWhitelist,
    SlowWhitelist,
    WhitelistRequest,
    PeerAddressRequest,
}

/// Advertising parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvertisingConfig {
    /// 0.625 ms units.
    pub fast_interval: u32,
    pub fast_timeout_secs: u32,
    /// 0.625 ms units.
    pub slow_interval: u32,
    pub slow_timeout_secs: u32,
}

impl AdvertisingConfig {
    pub const BASELINE: Self = Self {
        fast_interval: config::ADV_FAST_INTERVAL,
        fast_timeout_secs: config::ADV_FAST_TIMEOUT_SECS,
        slow_interval: config::ADV_SLOW_INTERVAL,
        slow_timeout_secs: config::ADV_SLOW_TIMEOUT_SECS,
    };
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self::BASELINE
    }
}

/// Tracks the advertising mode and the sleep flag.
#[derive(Clone, Debug)]
pub struct AdvertisingController {
    config: AdvertisingConfig,
    mode: Option<AdvMode>,
    entering_sleep: bool,
}

impl AdvertisingController {
    pub const fn new() -> Self {
        Self {
            config: AdvertisingConfig::BASELINE,
            mode: None,
            entering_sleep: false,
        }
    }

    pub fn config(&self) -> &AdvertisingConfig {
        &self.config
    }

    /// Tune the running parameters; restored on the next connection.
    pub fn config_mut(&mut self) -> &mut AdvertisingConfig {
        &mut self.config
    }

    /// Current mode, `None` while connected or before start.
    pub fn mode(&self) -> Option<AdvMode> {
        self.mode
    }

    pub fn entering_sleep(&self) -> bool {
        self.entering_sleep
    }

    /// Returns the mode to start.
    pub fn start(&mut self) -> AdvMode {
        self.set_mode(Some(AdvMode::Fast));
        AdvMode::Fast
    }

    /// Peer connected: advertising stops and sleep is called off.
    pub fn on_connected(&mut self) {
        self.set_mode(None);
        self.config.fast_timeout_secs = AdvertisingConfig::BASELINE.fast_timeout_secs;
        if self.entering_sleep {
            info!("Adv: leaving sleep");
            self.entering_sleep = false;
        }
    }

    /// Apply an advertising event. Returns the mode to restart, if any.
    pub fn on_event(&mut self, event: AdvEvent) -> Option<AdvMode> {
        match event {
            AdvEvent::Fast => {
                self.set_mode(Some(AdvMode::Fast));
                None
            }
            AdvEvent::Slow => {
                self.set_mode(Some(AdvMode::Slow));
                None
            }
            AdvEvent::Idle => {
                info!("Adv: entering sleep");
                self.entering_sleep = true;
                self.config.fast_timeout_secs = AdvertisingConfig::BASELINE.fast_timeout_secs;
                self.set_mode(Some(AdvMode::Slow));
                Some(AdvMode::Slow)
            }
            other => {
                info!("Adv: {:?}", other);
                None
            }
        }
    }

    fn set_mode(&mut self, mode: Option<AdvMode>) {
        if self.mode != mode {
            info!("Adv: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }
}

impl Default for AdvertisingController {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static, L: GattLink> AdvServer<C, L> {
    /// Handle an advertising event.
    pub fn on_advertising_event(&mut self, event: AdvEvent) {
        if let Some(mode) = self.adv.on_event(event) {
            self.link.start_advertising(mode, self.adv.config());
        }
    }

    /// Advertising controller, e.g. to tune the running parameters.
    pub fn advertising(&mut self) -> &mut AdvertisingController {
        &mut self.adv
    }

    pub fn entering_sleep(&self) -> bool {
        self.adv.entering_sleep()
    }
}

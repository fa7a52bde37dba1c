//! Background worker engine.
//!
//! A periodic tick (every `WORKER_PACE_SECS`) drives a short, fixed list of
//! workers while no peer is connected. Workers run one after the other; a
//! worker answering [`Outcome::Deferred`] holds the chain until it calls
//! back through [`crate::ble::AdvServer::worker_done`].
//!
//! While a peer is connected the engine is disabled and the tick only
//! watches for a stalled link: no serviced request for `STALL_DELAY_SECS`.

use heapless::Vec;

use crate::config::{MAX_WORKERS, STALL_DELAY_SECS, WORKER_PACE_SECS};
use crate::error::{Error, HandlerResult, Outcome};

/// Worker routine.
pub type Routine<C> = fn(&mut C) -> HandlerResult;

/// A background task run from the worker tick.
pub struct Worker<C> {
    pub name: &'static str,
    /// Minimum delay between two runs (seconds).
    pub pace_secs: u32,
    pub run: Routine<C>,
}

struct Slot<C> {
    worker: Worker<C>,
    last_run: Option<u32>,
}

impl<C> Slot<C> {
    fn is_due(&self, time: u32) -> bool {
        self.last_run
            .map_or(true, |last| time.wrapping_sub(last) >= self.worker.pace_secs)
    }
}

/// What a tick should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tick {
    /// Connected, link alive.
    Idle,
    /// Connected, no serviced request for too long.
    Stalled,
    /// Previous run still in progress.
    Busy,
    /// Run the worker chain.
    Run,
}

/// Decide whether a connection is stalled.
pub fn is_stalled(time: u32, last_activity: u32, threshold_secs: u32) -> bool {
    time.wrapping_sub(last_activity) > threshold_secs
}

pub struct WorkerEngine<C> {
    enabled: bool,
    running: bool,
    time: u32,
    last_activity: u32,
    next: usize,
    workers: Vec<Slot<C>, MAX_WORKERS>,
}

impl<C> WorkerEngine<C> {
    pub const fn new() -> Self {
        Self {
            enabled: false,
            running: false,
            time: 0,
            last_activity: 0,
            next: 0,
            workers: Vec::new(),
        }
    }

    /// Append a worker to the chain.
    pub fn register(&mut self, worker: Worker<C>) -> Result<(), Error> {
        info!("Worker registered: {}", worker.name);
        self.workers
            .push(Slot {
                worker,
                last_run: None,
            })
            .map_err(|_| Error::Overflow)
    }

    /// Reset the clock and enable the engine (no peer yet).
    pub fn start(&mut self) {
        self.time = 0;
        self.last_activity = 0;
        self.running = false;
        self.enabled = true;
    }

    /// A peer connected (`true`) or left (`false`).
    pub fn set_ble_active(&mut self, active: bool) {
        self.enabled = !active;
        if active {
            // A deferred worker completing later is ignored.
            self.running = false;
            self.feed();
        }
    }

    /// Record a serviced BLE request.
    pub fn feed(&mut self) {
        self.last_activity = self.time;
    }

    /// Seconds since start.
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn last_activity(&self) -> u32 {
        self.last_activity
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Advance the clock by one pace.
    pub fn advance(&mut self) -> Tick {
        self.time = self.time.wrapping_add(WORKER_PACE_SECS);
        if !self.enabled {
            if is_stalled(self.time, self.last_activity, STALL_DELAY_SECS) {
                return Tick::Stalled;
            }
            return Tick::Idle;
        }
        if self.running {
            warn!("Worker chain still running at {}", self.time);
            return Tick::Busy;
        }
        self.running = true;
        self.next = 0;
        Tick::Run
    }

    /// Run the remaining workers until one defers or the chain ends.
    pub fn resume(&mut self, ctx: &mut C) {
        while let Some(slot) = self.workers.get_mut(self.next) {
            self.next += 1;
            if !slot.is_due(self.time) {
                continue;
            }
            slot.last_run = Some(self.time);
            match (slot.worker.run)(ctx) {
                Ok(Outcome::Done) => {}
                Ok(Outcome::Deferred) => {
                    debug!("Worker {} deferred", slot.worker.name);
                    return;
                }
                Err(error) => error!("Worker {} failed: {:?}", slot.worker.name, error),
            }
        }
        self.running = false;
    }
}

impl<C> Default for WorkerEngine<C> {
    fn default() -> Self {
        Self::new()
    }
}

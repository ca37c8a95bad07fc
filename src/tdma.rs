//! TDMA scheduler
//!
//! Splits each superframe into `nslots` slots of equal length. Every
//! superframe event rearms the timers of all assigned slots relative to the
//! new epoch; [`Tdma::poll`] hands out the slots that are due. Timers run on
//! the platform's monotonic microseconds, the radio times of a slot come from
//! [`Tdma::tx_slot_start`] and [`Tdma::rx_slot_start`].
//!
//! Slot 0 starts at the epoch itself, which is when the clock calibration
//! packet is on air.

use heapless::Vec;

use crate::configs::TdmaConfig;
use crate::error::Error;
use crate::logging::{trace, warn};
use crate::mac::{Device, Epoch};
use crate::radio::Radio;
use crate::time::TIME_MAX;


/// Maximum number of slots per superframe
pub const TDMA_MAX_SLOTS: usize = 64;


stats! {
    /// Counters of the scheduler
    pub struct TdmaStats {
        superframe,
        fallback,
        aborted,
        dispatched,
        dropped_slots,
        queue_full,
    }
}


/// Handed to a slot callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotEvent {
    /// Index of the slot
    pub index: u16,
    /// The epoch the slot was scheduled from
    pub epoch: Epoch,
    /// Platform time the slot starts at
    pub scheduled_us: u64,
    /// Platform time the slot was handed out
    pub dispatched_us: u64,
}

/// A slot callback, called with the owner of the scheduler
pub type SlotCallback<C> = fn(&mut C, &SlotEvent);


struct Slot<C> {
    callback: SlotCallback<C>,
    /// Platform time the timer fires
    timer: Option<u64>,
}

impl<C> Clone for Slot<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Slot<C> {}


/// A TDMA scheduler, `C` is whatever owns it
pub struct Tdma<C> {
    config: TdmaConfig,
    initialized: bool,
    slots: [Option<Slot<C>>; TDMA_MAX_SLOTS],
    epoch: Epoch,
    fallback: Option<u64>,
    misses: u16,

    /// Statistics
    pub stats: TdmaStats,
}

impl<C> Tdma<C> {
    /// Creates a scheduler that needs [`Tdma::init`] before use
    pub fn new() -> Self {
        Tdma {
            config: TdmaConfig::default(),
            initialized: false,
            slots: [None; TDMA_MAX_SLOTS],
            epoch: Epoch::default(),
            fallback: None,
            misses: 0,
            stats: TdmaStats::default(),
        }
    }

    /// Prepares the scheduler for `config.nslots` slots
    pub fn init(&mut self, config: TdmaConfig) -> Result<(), Error> {
        if config.nslots == 0 || config.nslots as usize > TDMA_MAX_SLOTS {
            return Err(Error::InvalidConfiguration);
        }
        self.stop();
        self.config = config;
        self.initialized = true;
        Ok(())
    }

    /// Cancels every timer and releases every slot
    pub fn stop(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.fallback = None;
        self.misses = 0;
        self.initialized = false;
    }

    /// Returns `true` once initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The configuration
    pub fn config(&self) -> &TdmaConfig {
        &self.config
    }

    /// The epoch the timers run from
    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    /// Consecutive superframes that ran on the fallback timer
    pub fn misses(&self) -> u16 {
        self.misses
    }

    /// Assigns `callback` to slot `index`
    ///
    /// Assigning an assigned slot replaces its callback. The slot is armed
    /// right away if an epoch is known.
    pub fn assign_slot(&mut self, index: u16, callback: SlotCallback<C>) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if index >= self.config.nslots {
            return Err(Error::SlotOutOfRange { index });
        }
        let timer = self.fallback.map(|_| self.slot_timer(index));
        self.slots[index as usize] = Some(Slot { callback, timer });
        Ok(())
    }

    /// Stops the timer of slot `index` and frees the slot
    ///
    /// Releasing a free or out-of-range slot does nothing.
    pub fn release_slot(&mut self, index: u16) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = None;
        }
    }

    /// Returns `true` if slot `index` has a callback
    pub fn is_assigned(&self, index: u16) -> bool {
        matches!(self.slots.get(index as usize), Some(Some(_)))
    }

    /// Length of a slot in platform microseconds
    pub fn slot_period_us(&self) -> u64 {
        self.epoch.period_us() / self.config.nslots as u64
    }

    /// Length of a slot in DTU
    pub fn slot_period_dtu(&self) -> f64 {
        self.epoch.period_dtu() as f64 / self.config.nslots as f64
    }

    /// Platform time slot `index` starts at
    pub fn slot_start_us(&self, index: u16) -> u64 {
        self.epoch.os_us + index as u64 * self.slot_period_us()
    }

    fn slot_timer(&self, index: u16) -> u64 {
        self.slot_start_us(index).saturating_sub(self.config.os_latency_us as u64)
    }

    /// Rearms every assigned slot from `epoch`
    pub fn superframe(&mut self, epoch: &Epoch) {
        if !self.initialized {
            return;
        }
        stat_inc!(self.stats, superframe);
        self.misses = 0;
        self.epoch = *epoch;
        self.rearm();
    }

    fn rearm(&mut self) {
        for index in 0..self.config.nslots {
            let timer = self.slot_timer(index);
            if let Some(slot) = self.slots[index as usize].as_mut() {
                slot.timer = Some(timer);
            }
        }
        self.fallback = Some(
            self.epoch.os_us + self.epoch.period_us() + self.config.fallback_margin_us as u64,
        );
    }

    fn cancel(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.timer = None;
        }
        self.fallback = None;
    }

    /// Runs the fallback timer, if it expired
    ///
    /// The stale epoch is carried one period forward, up to the miss
    /// tolerance. Beyond that the cycle is aborted until the next superframe.
    fn check_fallback(&mut self, now_us: u64) {
        match self.fallback {
            Some(fallback) if fallback <= now_us => {}
            _ => return,
        }
        stat_inc!(self.stats, fallback);
        self.misses = self.misses.saturating_add(1);

        if self.misses > self.config.miss_tolerance {
            warn!("tdma: no superframe for {} periods, stopping", self.misses);
            stat_inc!(self.stats, aborted);
            self.cancel();
            return;
        }

        let period_dtu = self.epoch.period_dtu();
        self.epoch.local = (self.epoch.local + period_dtu) & TIME_MAX;
        self.epoch.master = self.epoch.master.wrapping_add(period_dtu);
        self.epoch.os_us += self.epoch.period_us();
        self.rearm();
    }

    /// Hands out the slots due at `now_us`, in slot order
    ///
    /// A slot handed out later than the maximum dispatch latency after its
    /// start is dropped instead.
    pub fn poll(&mut self, now_us: u64) -> Vec<(SlotCallback<C>, SlotEvent), TDMA_MAX_SLOTS> {
        let mut due = Vec::new();
        if !self.initialized {
            return due;
        }
        self.check_fallback(now_us);

        for index in 0..self.config.nslots {
            let scheduled_us = self.slot_start_us(index);
            let slot = match self.slots[index as usize].as_mut() {
                Some(slot) => slot,
                None => continue,
            };
            match slot.timer {
                Some(timer) if timer <= now_us => slot.timer = None,
                _ => continue,
            }

            let late = now_us.saturating_sub(scheduled_us);
            if late > self.config.max_dispatch_latency_us as u64 {
                warn!("tdma: slot {} {} us late, dropped", index, late);
                stat_inc!(self.stats, dropped_slots);
                continue;
            }

            let event = SlotEvent {
                index,
                epoch: self.epoch,
                scheduled_us,
                dispatched_us: now_us,
            };
            trace!("tdma: slot {}", index);
            stat_inc!(self.stats, dispatched);
            if due.push((slot.callback, event)).is_err() {
                stat_inc!(self.stats, queue_full);
            }
        }
        due
    }

    /// Radio time a transmission in slot `idx` should start at
    ///
    /// `idx` may be fractional to place a transmission inside a slot. The
    /// offset from the epoch is corrected for the clock skew, so it lands on
    /// target in the master's time base.
    pub fn tx_slot_start<R: Radio>(&self, dev: &Device<R>, idx: f64) -> u64 {
        let offset = dev.clock.wcs.dtu_time_adjust(idx * self.slot_period_dtu());
        (self.epoch.local + offset) & TIME_MAX
    }

    /// Radio time the receiver should turn on for slot `idx`
    ///
    /// One preamble earlier than [`Tdma::tx_slot_start`].
    pub fn rx_slot_start<R: Radio>(&self, dev: &Device<R>, idx: f64) -> u64 {
        let shr = dev.phy().shr_duration().value();
        self.tx_slot_start(dev, idx).wrapping_sub(shr) & TIME_MAX
    }
}

impl<C> Default for Tdma<C> {
    fn default() -> Self {
        Tdma::new()
    }
}

//! The device and the chain of services listening to it
//!
//! A [`Device`] is one radio together with its identity, PHY configuration
//! and clock reference. Services implement [`MacInterface`] to see the
//! radio's events; the [`InterfaceChain`] orders them, and dispatch stops at
//! the first service that claims an event.

use heapless::Vec;
use ieee802154::mac::{ExtendedAddress, PanId, ShortAddress};

use crate::configs::{PhyConfig, WcsConfig};
use crate::error::{Error, RadioStatus};
use crate::radio::Radio;
use crate::time::{dtu_to_micros, wrapping_delta, Duration, DELAYED_TX_MASK, TIME_MAX};
use crate::wcs::Wcs;


/// Role bits of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Role(pub u16);

impl Role {
    /// Fixed node with a known position
    pub const ANCHOR: Role = Role(0x0001);
    /// Mobile node
    pub const TAG: Role = Role(0x0002);
    /// Repeats clock calibration and association frames
    pub const RELAY: Role = Role(0x0004);
    /// Hands out addresses
    pub const PAN_MASTER: Role = Role(0x0008);
    /// Transmits clock calibration packets
    pub const CCP_MASTER: Role = Role(0x0010);

    /// Returns `true` if all bits of `other` are set
    pub fn contains(&self, other: Role) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`
    pub fn insert(&mut self, other: Role) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`
    pub fn remove(&mut self, other: Role) {
        self.0 &= !other.0;
    }
}


/// Announces configuration changes
///
/// Every change bumps a generation counter. Services remember the generation
/// they last saw and recompute what depends on the configuration when it
/// differs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigWatch {
    generation: u32,
}

impl ConfigWatch {
    /// Announces a change
    pub fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// The current generation
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A service's view of a [`ConfigWatch`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigWatcher {
    seen: Option<u32>,
}

impl ConfigWatcher {
    /// Returns `true` once for every change, and on first use
    pub fn changed(&mut self, watch: &ConfigWatch) -> bool {
        if self.seen == Some(watch.generation()) {
            return false;
        }
        self.seen = Some(watch.generation());
        true
    }
}


/// The superframe epoch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Epoch {
    /// Local 40-bit time the epoch's packet was received or sent
    pub local: u64,
    /// The same instant in the master's 64-bit time base
    pub master: u64,
    /// The same instant in platform microseconds
    pub os_us: u64,
    /// Superframe period in UWB microseconds
    pub period: u32,
    /// Sequence number of the packet
    pub seq: u8,
    /// Set while the epoch can be relied on
    pub valid: bool,
}

impl Epoch {
    /// Superframe period in DTU
    pub fn period_dtu(&self) -> u64 {
        (self.period as u64) << 16
    }

    /// Superframe period in platform microseconds
    pub fn period_us(&self) -> u64 {
        dtu_to_micros(self.period_dtu())
    }
}


/// Epoch and clock sync state of a device
#[derive(Clone, Debug)]
pub struct ClockReference {
    /// The last superframe epoch
    pub epoch: Epoch,
    /// Clock sync estimate
    pub wcs: Wcs,
}


/// How long an open receive window lasts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxWindow {
    /// Until a frame arrives
    Open,
    /// Until this system time
    Until(u64),
}

impl RxWindow {
    fn new(start: u64, timeout: u32) -> Self {
        if timeout == 0 {
            RxWindow::Open
        }
        else {
            RxWindow::Until((start + Duration::from_uus(timeout).value()) & TIME_MAX)
        }
    }
}


/// One radio and everything the services need to know about it
pub struct Device<R> {
    /// The radio
    pub radio: R,
    /// 64-bit unique identifier
    pub euid: ExtendedAddress,
    /// Short address, `0xffff` while unassigned
    pub short_address: ShortAddress,
    /// PAN id
    pub pan_id: PanId,
    /// TDMA slot id, also used to rank replies in multi-node exchanges
    pub slot_id: u16,
    /// Role bits
    pub role: Role,
    /// Status of the last radio operation
    pub status: RadioStatus,
    /// Epoch and clock sync
    pub clock: ClockReference,
    /// Configuration change announcements
    pub config: ConfigWatch,

    phy: PhyConfig,
    seq_num: u8,
    superframe: bool,
    rx_window: Option<RxWindow>,
}

impl<R> Device<R>
    where R: Radio
{
    /// Creates a device
    pub fn new(radio: R, euid: u64, short_address: u16) -> Self {
        Device {
            radio,
            euid: ExtendedAddress(euid),
            short_address: ShortAddress(short_address),
            pan_id: PanId(0xDECA),
            slot_id: 0,
            role: Role::default(),
            status: RadioStatus::default(),
            clock: ClockReference {
                epoch: Epoch::default(),
                wcs: Wcs::new(WcsConfig::default()),
            },
            config: ConfigWatch::default(),
            phy: PhyConfig::default(),
            seq_num: 0,
            superframe: false,
            rx_window: None,
        }
    }

    /// The PHY configuration
    pub fn phy(&self) -> &PhyConfig {
        &self.phy
    }

    /// Changes the PHY configuration and announces the change
    pub fn set_phy(&mut self, phy: PhyConfig) {
        self.phy = phy;
        self.config.bump();
    }

    /// Returns the next frame sequence number
    pub fn next_seq(&mut self) -> u8 {
        self.seq_num = self.seq_num.wrapping_add(1);
        self.seq_num
    }

    /// The transmit timestamp a delayed transmission at `at` will get
    pub fn delayed_tx_timestamp(&self, at: u64) -> u64 {
        ((at & DELAYED_TX_MASK) + self.radio.tx_antenna_delay() as u64) & TIME_MAX
    }

    /// Transmits `frame`
    ///
    /// With `at`, the transmission is delayed until that system time. With
    /// `response_timeout`, the receiver turns on right after the
    /// transmission and times out after that many UWB microseconds.
    pub fn transmit(&mut self, frame: &[u8], at: Option<u64>, response_timeout: Option<u32>) -> RadioStatus {
        self.radio.write_tx(frame, 0);
        self.radio.write_tx_fctrl(frame.len(), true);
        if let Some(at) = at {
            self.radio.set_delay_start(at & TIME_MAX);
        }
        match response_timeout {
            Some(timeout) => {
                self.radio.set_wait4resp(true);
                self.radio.set_rx_timeout(timeout);
            }
            None => self.radio.set_wait4resp(false),
        }
        let start = match at {
            Some(at) => at & DELAYED_TX_MASK & TIME_MAX,
            None => self.radio.read_systime(),
        };
        self.status = self.radio.start_tx();

        // The response timeout runs from the end of the frame
        self.rx_window = match response_timeout {
            Some(timeout) if !self.status.start_tx_error => {
                let on_air = Duration::from_uus(self.phy.frame_duration_uus(frame.len())).value();
                Some(RxWindow::new(start + on_air, timeout))
            }
            _ => None,
        };
        self.status
    }

    /// Turns the receiver on, optionally at a later system time
    ///
    /// A `timeout` of zero keeps the receiver on until a frame arrives.
    pub fn listen(&mut self, at: Option<u64>, timeout: u32) -> RadioStatus {
        let start = match at {
            Some(at) => {
                self.radio.set_delay_start(at & TIME_MAX);
                at & TIME_MAX
            }
            None => self.radio.read_systime(),
        };
        self.radio.set_rx_timeout(timeout);
        self.status = self.radio.start_rx();
        self.rx_window = if self.status.start_rx_error {
            None
        }
        else {
            Some(RxWindow::new(start, timeout))
        };
        self.status
    }

    /// Turns the radio off
    pub fn stop(&mut self) {
        self.radio.stop();
        self.rx_window = None;
    }

    /// Takes the receive window the last frame arrived in
    ///
    /// The receiver turns off with every event, the window is gone with it.
    pub fn take_rx_window(&mut self) -> Option<RxWindow> {
        self.rx_window.take()
    }

    /// Turns the receiver back on for what is left of `window`
    ///
    /// Reports `rx_timeout_error` without touching the radio, if the window
    /// has already closed.
    pub fn resume_rx(&mut self, window: RxWindow) -> RadioStatus {
        let timeout = match window {
            RxWindow::Open => 0,
            RxWindow::Until(deadline) => {
                let remaining = wrapping_delta(deadline, self.radio.read_systime());
                if remaining == 0 || remaining > TIME_MAX / 2 {
                    return RadioStatus {
                        rx_timeout_error: true,
                        ..RadioStatus::default()
                    };
                }
                ((remaining + 0xffff) >> 16) as u32
            }
        };
        self.radio.set_rx_timeout(timeout);
        self.status = self.radio.start_rx();
        if !self.status.start_rx_error {
            self.rx_window = Some(window);
        }
        self.status
    }

    /// Projects a local 40-bit timestamp into platform microseconds
    pub fn project_os_us(&mut self, timestamp: u64) -> u64 {
        let now = self.radio.read_systime();
        let age = dtu_to_micros(wrapping_delta(now, timestamp));
        self.radio.uptime_us().saturating_sub(age)
    }

    /// Asks for the superframe event to be raised after the current event
    pub fn signal_superframe(&mut self) {
        self.superframe = true;
    }

    /// Takes a pending superframe signal
    pub fn take_superframe(&mut self) -> bool {
        core::mem::replace(&mut self.superframe, false)
    }
}


/// Events a service can receive from its device
///
/// Every callback returns `true` if the service claimed the event. Dispatch
/// stops at the first service that does. A service that doesn't own the
/// exchange an event belongs to must return `false` and leave its state
/// untouched.
pub trait MacInterface<R: Radio> {
    /// A frame was received
    fn rx_complete(&mut self, _dev: &mut Device<R>, _frame: &[u8]) -> bool {
        false
    }

    /// A frame was transmitted
    fn tx_complete(&mut self, _dev: &mut Device<R>) -> bool {
        false
    }

    /// A reception timed out
    fn rx_timeout(&mut self, _dev: &mut Device<R>) -> bool {
        false
    }

    /// A reception failed
    fn rx_error(&mut self, _dev: &mut Device<R>) -> bool {
        false
    }

    /// A transmission failed
    fn tx_error(&mut self, _dev: &mut Device<R>) -> bool {
        false
    }

    /// The radio was reset
    fn reset(&mut self, _dev: &mut Device<R>) -> bool {
        false
    }

    /// A new superframe epoch is available
    fn superframe(&mut self, _dev: &mut Device<R>) -> bool {
        false
    }
}


/// Identifies a service on the interface chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceId {
    /// Clock calibration packets
    Ccp,
    /// Two-party ranging
    Rng,
    /// Multi-node ranging
    Nrng,
    /// Reverse TDOA
    Rtdoa,
    /// PAN association
    Pan,
    /// Site survey
    Survey,
}

/// Maximum number of services on one chain
pub const MAX_INTERFACES: usize = 8;

/// Ordered list of the services events are offered to
#[derive(Clone, Debug, Default)]
pub struct InterfaceChain {
    interfaces: Vec<InterfaceId, MAX_INTERFACES>,
}

impl InterfaceChain {
    /// Creates an empty chain
    pub const fn new() -> Self {
        InterfaceChain {
            interfaces: Vec::new(),
        }
    }

    /// Appends `id`, unless it is already on the chain
    pub fn append(&mut self, id: InterfaceId) -> Result<(), Error> {
        if self.contains(id) {
            return Ok(());
        }
        self.interfaces.push(id).map_err(|_| Error::QueueFull)
    }

    /// Removes `id`, returns `false` if it wasn't on the chain
    pub fn remove(&mut self, id: InterfaceId) -> bool {
        match self.interfaces.iter().position(|&i| i == id) {
            Some(index) => {
                self.interfaces.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `id` is on the chain
    pub fn contains(&self, id: InterfaceId) -> bool {
        self.interfaces.iter().any(|&i| i == id)
    }

    /// The services in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = InterfaceId> + '_ {
        self.interfaces.iter().copied()
    }

    /// Number of services on the chain
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Returns `true` if no service is on the chain
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_keeps_order() {
        let mut chain = InterfaceChain::new();
        chain.append(InterfaceId::Ccp).unwrap();
        chain.append(InterfaceId::Rng).unwrap();
        chain.append(InterfaceId::Pan).unwrap();
        chain.append(InterfaceId::Rng).unwrap();

        assert!(chain.remove(InterfaceId::Rng));
        assert!(!chain.remove(InterfaceId::Rng));

        let order: Vec<InterfaceId, 8> = chain.iter().collect();
        assert_eq!(&order[..], &[InterfaceId::Ccp, InterfaceId::Pan]);
    }

    #[test]
    fn watcher_sees_every_change_once() {
        let mut watch = ConfigWatch::default();
        let mut watcher = ConfigWatcher::default();

        assert!(watcher.changed(&watch));
        assert!(!watcher.changed(&watch));
        watch.bump();
        assert!(watcher.changed(&watch));
        assert!(!watcher.changed(&watch));
    }

    #[test]
    fn roles_are_bits() {
        let mut role = Role::ANCHOR;
        role.insert(Role::RELAY);
        assert!(role.contains(Role::ANCHOR));
        assert!(role.contains(Role::RELAY));
        role.remove(Role::ANCHOR);
        assert!(!role.contains(Role::ANCHOR));
    }
}

//! A simulated radio
//!
//! Every [`SimRadio`] keeps a true (global) time and derives its own 40-bit
//! system time from it through a [`SimClock`]. Transmissions happen the
//! moment they are started and wait in the radio until [`transfer`] hands
//! them to another node, which gets the frame if its receiver is on.

use heapless::Vec;

use crate::configs::PhyConfig;
use crate::error::RadioStatus;
use crate::frame::MAX_FRAME_LEN;
use crate::math::carrier_integrator;
use crate::node::Node;
use crate::pan::PanAllocator;
use crate::radio::{Radio, RxDiagnostics};
use crate::time::{dtu_to_micros, micros_to_dtu, wrapping_delta, Duration, TIME_MAX};


/// Time between starting an immediate transmission and its timestamp
pub const TX_LATENCY: u64 = 0x4000;


/// Maps global time to a radio's system time
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SimClock {
    /// System time at global time zero
    pub offset: u64,
    /// Rate error, in parts per million
    pub ppm: f64,
}

impl SimClock {
    /// The system time at `global`
    pub fn to_local(&self, global: u64) -> u64 {
        let drift = global as f64 * self.ppm * 1e-6;
        (self.offset.wrapping_add(global).wrapping_add(drift as i64 as u64)) & TIME_MAX
    }

    /// Converts a system time interval to global time
    pub fn to_global_interval(&self, local: u64) -> u64 {
        (local as f64 / (1.0 + self.ppm * 1e-6)) as u64
    }
}


/// A frame that went on air
#[derive(Clone, Debug, PartialEq)]
pub struct SimFrame {
    /// The bytes sent
    pub data: Vec<u8, MAX_FRAME_LEN>,
    /// Global time of the transmission
    pub global: u64,
    /// Rate error of the sender's clock, in parts per million
    pub ppm: f64,
}


/// A radio that only exists in memory
#[derive(Clone, Debug)]
pub struct SimRadio {
    /// Clock model
    pub clock: SimClock,
    /// Reported with every reception
    pub diagnostics: RxDiagnostics,
    /// Makes the next transmission fail to start
    pub fail_next_tx: bool,
    /// Number of transmissions started
    pub sent: u32,
    /// Receiver state
    pub rx_enabled: bool,
    /// The receive timeout last set, in UWB microseconds
    pub rx_timeout: u32,

    global: u64,
    rx_time: u64,
    tx_time: u64,
    antenna_delay: u16,
    delay: Option<u64>,
    wait4resp: bool,
    tx_buf: [u8; MAX_FRAME_LEN],
    tx_len: usize,
    outbox: Option<SimFrame>,
}

impl SimRadio {
    /// Creates a radio
    pub fn new(clock: SimClock) -> Self {
        SimRadio {
            clock,
            diagnostics: RxDiagnostics::default(),
            fail_next_tx: false,
            sent: 0,
            rx_enabled: false,
            rx_timeout: 0,
            global: 0,
            rx_time: 0,
            tx_time: 0,
            antenna_delay: 0,
            delay: None,
            wait4resp: false,
            tx_buf: [0; MAX_FRAME_LEN],
            tx_len: 0,
            outbox: None,
        }
    }

    /// Sets the transmit antenna delay
    pub fn with_antenna_delay(mut self, delay: u16) -> Self {
        self.antenna_delay = delay;
        self
    }

    /// The current global time
    pub fn global(&self) -> u64 {
        self.global
    }

    /// Moves global time forward
    pub fn advance_micros(&mut self, micros: u64) {
        self.global += micros_to_dtu(micros);
    }

    /// Moves global time forward to `global`, never backwards
    pub fn advance_to(&mut self, global: u64) {
        if global > self.global {
            self.global = global;
        }
    }

    /// Takes the last transmitted frame
    pub fn take_frame(&mut self) -> Option<SimFrame> {
        self.outbox.take()
    }

    /// Lets `frame` arrive after `tof` DTU
    ///
    /// The carrier integrator in the diagnostics shows the sender's clock
    /// offset relative to this radio, as the PHY `phy` would measure it.
    /// Returns `false`, if the receiver is off.
    pub fn receive(&mut self, frame: &SimFrame, tof: u64, phy: &PhyConfig) -> bool {
        if !self.rx_enabled {
            return false;
        }
        let arrival = frame.global + tof;
        self.advance_to(arrival);
        self.rx_time = self.clock.to_local(arrival);
        self.rx_enabled = false;

        let offset = (1.0 + frame.ppm * 1e-6) / (1.0 + self.clock.ppm * 1e-6) - 1.0;
        self.diagnostics.carrier_integrator = carrier_integrator(offset, phy);
        true
    }

    fn local_now(&self) -> u64 {
        self.clock.to_local(self.global)
    }
}

impl Radio for SimRadio {
    fn read_systime(&mut self) -> u64 {
        self.local_now()
    }

    fn read_rxtime(&mut self) -> u64 {
        self.rx_time
    }

    fn read_txtime(&mut self) -> u64 {
        self.tx_time
    }

    fn write_tx(&mut self, buf: &[u8], offset: usize) {
        let end = (offset + buf.len()).min(MAX_FRAME_LEN);
        self.tx_buf[offset..end].copy_from_slice(&buf[..end - offset]);
    }

    fn write_tx_fctrl(&mut self, len: usize, _ranging: bool) {
        self.tx_len = len.min(MAX_FRAME_LEN);
    }

    fn set_delay_start(&mut self, time: u64) {
        self.delay = Some(time & TIME_MAX);
    }

    fn set_wait4resp(&mut self, enable: bool) {
        self.wait4resp = enable;
    }

    fn set_rx_timeout(&mut self, uus: u32) {
        self.rx_timeout = uus;
    }

    fn start_tx(&mut self) -> RadioStatus {
        let delay = self.delay.take();
        if core::mem::replace(&mut self.fail_next_tx, false) {
            return RadioStatus {
                start_tx_error: true,
                ..RadioStatus::default()
            };
        }

        let now = self.local_now();
        let start = match delay {
            Some(at) => {
                let start = at & !0x1ff;
                let ahead = wrapping_delta(start, now);
                if ahead == 0 || ahead >= (TIME_MAX + 1) / 2 {
                    return RadioStatus {
                        start_tx_error: true,
                        ..RadioStatus::default()
                    };
                }
                start
            }
            None => (now + TX_LATENCY) & TIME_MAX,
        };

        self.tx_time = (start + self.antenna_delay as u64) & TIME_MAX;
        self.global += self.clock.to_global_interval(wrapping_delta(self.tx_time, now));
        self.sent += 1;
        self.outbox = Some(SimFrame {
            data: Vec::from_slice(&self.tx_buf[..self.tx_len]).unwrap_or_default(),
            global: self.global,
            ppm: self.clock.ppm,
        });
        self.rx_enabled = self.wait4resp;
        RadioStatus::default()
    }

    fn start_rx(&mut self) -> RadioStatus {
        self.delay = None;
        self.rx_enabled = true;
        RadioStatus::default()
    }

    fn stop(&mut self) {
        self.delay = None;
        self.rx_enabled = false;
    }

    fn tx_antenna_delay(&self) -> u16 {
        self.antenna_delay
    }

    fn rx_diagnostics(&mut self) -> RxDiagnostics {
        self.diagnostics
    }

    fn uptime_us(&self) -> u64 {
        dtu_to_micros(self.global)
    }
}


/// Moves the frame `from` sent to `to` over a flight time of `tof` DTU
///
/// Dispatches `tx_complete` on the sender first. Returns whether the
/// receiver claimed the frame; `false` if nothing was sent or the receiver
/// was off.
pub fn transfer<A, B>(from: &mut Node<SimRadio, A>, to: &mut Node<SimRadio, B>, tof: u64) -> bool
    where A: PanAllocator, B: PanAllocator
{
    let frame = match from.dev.radio.take_frame() {
        Some(frame) => frame,
        None => return false,
    };
    from.tx_complete();
    let phy = *to.dev.phy();
    if !to.dev.radio.receive(&frame, tof, &phy) {
        return false;
    }
    to.rx_complete(&frame.data)
}

/// Moves the frame `from` sent to every node in `to`
///
/// `tofs[i]` is the flight time to `to[i]`. Returns how many receivers
/// claimed the frame.
pub fn broadcast<A, B>(
    from: &mut Node<SimRadio, A>,
    to: &mut [&mut Node<SimRadio, B>],
    tofs: &[u64],
) -> usize
    where A: PanAllocator, B: PanAllocator
{
    let frame = match from.dev.radio.take_frame() {
        Some(frame) => frame,
        None => return 0,
    };
    from.tx_complete();

    let mut claimed = 0;
    for (node, &tof) in to.iter_mut().zip(tofs) {
        let phy = *node.dev.phy();
        if node.dev.radio.receive(&frame, tof, &phy) && node.rx_complete(&frame.data) {
            claimed += 1;
        }
    }
    claimed
}

/// Lets the receive timeout of `node` expire, if its receiver is on
pub fn expire<A: PanAllocator>(node: &mut Node<SimRadio, A>) -> bool {
    if !node.dev.radio.rx_enabled {
        return false;
    }
    node.dev.radio.global += Duration::from_uus(node.dev.radio.rx_timeout).value();
    node.dev.radio.rx_enabled = false;
    node.rx_timeout()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_tx_uses_the_masked_start() {
        let mut radio = SimRadio::new(SimClock::default()).with_antenna_delay(0x4042);
        radio.advance_micros(10);
        let at = radio.read_systime() + 0x8000_0123;
        radio.write_tx(&[1, 2, 3], 0);
        radio.write_tx_fctrl(3, true);
        radio.set_delay_start(at);
        assert!(!radio.start_tx().is_err());
        assert_eq!(radio.read_txtime(), (at & !0x1ff) + 0x4042);
        assert_eq!(radio.take_frame().map(|f| f.data.len()), Some(3));
    }

    #[test]
    fn late_start_is_an_error() {
        let mut radio = SimRadio::new(SimClock::default());
        radio.advance_micros(1000);
        let past = radio.read_systime() - 0x1000;
        radio.set_delay_start(past);
        assert!(radio.start_tx().start_tx_error);
        assert!(radio.take_frame().is_none());
    }

    #[test]
    fn clock_offset_shows_in_reception() {
        let mut sender = SimRadio::new(SimClock::default());
        let mut receiver = SimRadio::new(SimClock { offset: 5_000_000, ppm: 0.0 });
        sender.write_tx_fctrl(0, false);
        assert!(!sender.start_tx().is_err());
        let frame = sender.take_frame().unwrap();

        let phy = PhyConfig::default();
        assert!(!receiver.receive(&frame, 100, &phy));
        receiver.start_rx();
        assert!(receiver.receive(&frame, 100, &phy));
        assert_eq!(receiver.read_rxtime(), 5_000_000 + TX_LATENCY + 100);
        assert_eq!(receiver.diagnostics.carrier_integrator, 0);
    }

    #[test]
    fn carrier_integrator_follows_the_clocks() {
        let mut sender = SimRadio::new(SimClock { offset: 0, ppm: 10.0 });
        let mut receiver = SimRadio::new(SimClock { offset: 0, ppm: -5.0 });
        sender.write_tx_fctrl(0, false);
        assert!(!sender.start_tx().is_err());
        let frame = sender.take_frame().unwrap();

        let phy = PhyConfig::default();
        receiver.start_rx();
        assert!(receiver.receive(&frame, 100, &phy));
        let offset = crate::math::clock_offset_ratio(receiver.diagnostics.carrier_integrator, &phy);
        assert!((offset - 15e-6).abs() < 1e-8, "offset {}", offset);
    }
}

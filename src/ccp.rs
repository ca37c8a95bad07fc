//! Clock calibration packets
//!
//! The clock master sends a blink every superframe period carrying its own
//! transmission time in a 64-bit time base. Every packet received sets the
//! superframe epoch of the receiver and feeds its clock sync. Relays repeat
//! the packet, at most `rpt_max` times in total, with the transmission time
//! projected into the master's time base.

use crate::configs::{CcpConfig, CcpRole};
use crate::frame::{peek_frame_code, CcpFrame, FrameCode, Message, FCTRL_BLINK, MAX_FRAME_LEN};
use crate::logging::{debug, trace, warn};
use crate::mac::{Device, Epoch, MacInterface, Role};
use crate::radio::Radio;
use crate::time::{dtu_to_micros, Duration, Extender, TIME_MAX};


stats! {
    /// Counters of the clock calibration
    pub struct CcpStats {
        master_tx,
        rx,
        relay,
        self_origin,
        duplicate,
        master_change,
        seq_gap,
        miss,
        invalidated,
        start_tx_error,
        start_rx_error,
        rx_error,
        reset,
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Receiver on, waiting for a packet
    Listening,
    /// Master packet going out
    Transmitting,
    /// Repeat going out
    Relaying,
}


/// A clock calibration instance
pub struct Ccp {
    config: CcpConfig,
    phase: Phase,
    seq_num: u8,
    last_seq: Option<u8>,
    master_euid: Option<u64>,
    rx_count: u16,
    missed: u16,
    extender: Extender,
    /// The packet on air, if any
    pending: CcpFrame,

    /// Statistics
    pub stats: CcpStats,
}

impl Ccp {
    /// Creates an instance
    pub fn new(config: CcpConfig) -> Self {
        Ccp {
            config,
            phase: Phase::Idle,
            seq_num: 0,
            last_seq: None,
            master_euid: None,
            rx_count: 0,
            missed: 0,
            extender: Extender::new(),
            pending: CcpFrame::default(),
            stats: CcpStats::default(),
        }
    }

    /// The configuration
    pub fn config(&self) -> &CcpConfig {
        &self.config
    }

    /// EUID of the master being tracked
    pub fn master_euid(&self) -> Option<u64> {
        self.master_euid
    }

    /// Number of consecutive packets received
    pub fn rx_count(&self) -> u16 {
        self.rx_count
    }

    /// Number of consecutive packets missed
    pub fn missed(&self) -> u16 {
        self.missed
    }

    /// Starts the service
    ///
    /// A master sends its first packet right away, the other roles start
    /// listening until a packet arrives.
    pub fn start<R: Radio>(&mut self, dev: &mut Device<R>) -> bool {
        dev.clock.epoch.period = self.config.period;
        match self.config.role {
            CcpRole::Master => {
                dev.role.insert(Role::CCP_MASTER);
                let now = dev.radio.read_systime();
                let at = (now + Duration::from_uus(self.config.listen_window).value()) & TIME_MAX;
                self.send(dev, at)
            }
            CcpRole::Slave | CcpRole::Relay => {
                dev.role.remove(Role::CCP_MASTER);
                self.listen(dev, 0)
            }
        }
    }

    /// Stops the service, the epoch becomes invalid
    pub fn stop<R: Radio>(&mut self, dev: &mut Device<R>) {
        if self.phase != Phase::Idle {
            dev.stop();
        }
        self.phase = Phase::Idle;
        dev.clock.epoch.valid = false;
    }

    /// Keeps the service going, `now_us` is the platform time
    ///
    /// A master sends the packet of the next superframe once it is close
    /// enough, slaves and relays open their receiver around the time the
    /// next packet is expected. Returns `true` if the radio was started.
    pub fn poll<R: Radio>(&mut self, dev: &mut Device<R>, now_us: u64) -> bool {
        if self.phase != Phase::Idle {
            return false;
        }
        let epoch = dev.clock.epoch;
        let window_us = dtu_to_micros(Duration::from_uus(self.config.listen_window).value());

        match self.config.role {
            CcpRole::Master => {
                if epoch.os_us == 0 || now_us + window_us < epoch.os_us + epoch.period_us() {
                    return false;
                }
                let at = (epoch.local + epoch.period_dtu()) & TIME_MAX;
                self.send(dev, at)
            }
            CcpRole::Slave | CcpRole::Relay => {
                if self.rx_count == 0 {
                    return self.listen(dev, 0);
                }
                let expected = epoch.os_us + (self.missed as u64 + 1) * epoch.period_us();
                if now_us + window_us < expected {
                    return false;
                }
                self.listen(dev, 2 * self.config.listen_window)
            }
        }
    }

    fn listen<R: Radio>(&mut self, dev: &mut Device<R>, timeout: u32) -> bool {
        let status = dev.listen(None, timeout);
        if status.start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            return false;
        }
        self.phase = Phase::Listening;
        true
    }

    /// Sends the master packet at `at`
    fn send<R: Radio>(&mut self, dev: &mut Device<R>, at: u64) -> bool {
        self.seq_num = self.seq_num.wrapping_add(1);
        let transmission = dev.delayed_tx_timestamp(at);
        self.pending = CcpFrame {
            fctrl: FCTRL_BLINK,
            seq_num: self.seq_num,
            euid: dev.euid.0,
            code: FrameCode::Ccp.into(),
            rpt_count: 0,
            rpt_max: self.config.rpt_max,
            transmission_timestamp: self.extender.extend(transmission),
            period: self.config.period,
        };
        self.transmit(dev, at, Phase::Transmitting)
    }

    fn transmit<R: Radio>(&mut self, dev: &mut Device<R>, at: u64, phase: Phase) -> bool {
        let mut buf = [0; MAX_FRAME_LEN];
        let len = match self.pending.encode(&mut buf) {
            Ok(len) => len,
            Err(_) => return false,
        };
        let status = dev.transmit(&buf[..len], Some(at), None);
        if status.start_tx_error {
            warn!("ccp: packet {} started too late", self.pending.seq_num);
            stat_inc!(self.stats, start_tx_error);
            if phase == Phase::Transmitting {
                // Skip this superframe, the next poll aims for the one after
                let epoch = &mut dev.clock.epoch;
                epoch.local = (epoch.local + epoch.period_dtu()) & TIME_MAX;
                epoch.os_us += epoch.period_us();
            }
            self.phase = Phase::Idle;
            return false;
        }
        self.phase = phase;
        true
    }

    fn miss<R: Radio>(&mut self, dev: &mut Device<R>) {
        stat_inc!(self.stats, miss);
        self.missed = self.missed.saturating_add(1);
        if self.missed > self.config.miss_tolerance && dev.clock.epoch.valid {
            warn!("ccp: lost the master after {} packets", self.missed);
            stat_inc!(self.stats, invalidated);
            dev.clock.epoch.valid = false;
            dev.clock.wcs.reset();
            self.rx_count = 0;
            self.last_seq = None;
        }
    }

    fn on_packet<R: Radio>(&mut self, dev: &mut Device<R>, frame: &CcpFrame) {
        if self.master_euid != Some(frame.euid) {
            if self.master_euid.is_some() {
                warn!("ccp: master changed to {:#018x}", frame.euid);
                stat_inc!(self.stats, master_change);
            }
            dev.clock.wcs.reset();
            self.master_euid = Some(frame.euid);
            self.rx_count = 0;
            self.last_seq = None;
        }

        if let Some(last) = self.last_seq {
            if frame.seq_num != last.wrapping_add(1) {
                stat_inc!(self.stats, seq_gap);
                self.rx_count = 0;
            }
        }

        let reception = dev.radio.read_rxtime();
        dev.clock.wcs.update(reception, frame.transmission_timestamp);

        stat_inc!(self.stats, rx);
        self.last_seq = Some(frame.seq_num);
        self.rx_count = self.rx_count.saturating_add(1);
        self.missed = 0;

        // A repeat left `rpt_count` holdoffs after the master's packet
        let shift = Duration::from_uus(self.config.relay_holdoff * frame.rpt_count as u32).value();
        let local = reception.wrapping_sub(shift) & TIME_MAX;

        let valid = self.rx_count >= self.config.valid_threshold;
        dev.clock.epoch = Epoch {
            local,
            master: frame.transmission_timestamp.saturating_sub(shift),
            os_us: dev.project_os_us(local),
            period: frame.period,
            seq: frame.seq_num,
            valid,
        };
        trace!("ccp: epoch {} valid {}", frame.seq_num, valid);
        if valid {
            dev.signal_superframe();
        }

        if self.config.role == CcpRole::Relay && frame.rpt_count < frame.rpt_max {
            let at = (reception + Duration::from_uus(self.config.relay_holdoff).value()) & TIME_MAX;
            let transmission = dev.delayed_tx_timestamp(at);
            self.pending = CcpFrame {
                rpt_count: frame.rpt_count + 1,
                transmission_timestamp: dev.clock.wcs.local_to_master64(transmission),
                ..*frame
            };
            if self.transmit(dev, at, Phase::Relaying) {
                stat_inc!(self.stats, relay);
            }
        }
    }
}


impl<R: Radio> MacInterface<R> for Ccp {
    fn rx_complete(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        if peek_frame_code(frame) != Some(FrameCode::Ccp) {
            return false;
        }
        let packet = match CcpFrame::decode(frame) {
            Ok(Some(packet)) if packet.fctrl == FCTRL_BLINK => packet,
            _ => return false,
        };
        if self.phase == Phase::Listening {
            self.phase = Phase::Idle;
        }
        if self.config.role == CcpRole::Master || packet.euid == dev.euid.0 {
            stat_inc!(self.stats, self_origin);
            return true;
        }
        if self.last_seq == Some(packet.seq_num) && self.master_euid == Some(packet.euid) {
            // A relay's repeat of a packet we already have
            stat_inc!(self.stats, duplicate);
            return true;
        }
        self.on_packet(dev, &packet);
        true
    }

    fn tx_complete(&mut self, dev: &mut Device<R>) -> bool {
        match self.phase {
            Phase::Transmitting => {
                let transmission = dev.radio.read_txtime();
                let master = self.pending.transmission_timestamp;
                dev.clock.wcs.update(transmission, master);
                dev.clock.epoch = Epoch {
                    local: transmission,
                    master,
                    os_us: dev.project_os_us(transmission),
                    period: self.pending.period,
                    seq: self.pending.seq_num,
                    valid: true,
                };
                stat_inc!(self.stats, master_tx);
                debug!("ccp: sent packet {}", self.pending.seq_num);
                self.phase = Phase::Idle;
                dev.signal_superframe();
                true
            }
            Phase::Relaying => {
                self.phase = Phase::Idle;
                true
            }
            Phase::Idle | Phase::Listening => false,
        }
    }

    fn rx_timeout(&mut self, dev: &mut Device<R>) -> bool {
        if self.phase != Phase::Listening {
            return false;
        }
        self.phase = Phase::Idle;
        self.miss(dev);
        true
    }

    fn rx_error(&mut self, dev: &mut Device<R>) -> bool {
        if self.phase != Phase::Listening {
            return false;
        }
        stat_inc!(self.stats, rx_error);
        self.phase = Phase::Idle;
        self.miss(dev);
        true
    }

    fn tx_error(&mut self, _dev: &mut Device<R>) -> bool {
        match self.phase {
            Phase::Transmitting | Phase::Relaying => {
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self, _dev: &mut Device<R>) -> bool {
        stat_inc!(self.stats, reset);
        self.phase = Phase::Idle;
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::sim::{expire, transfer, SimClock, SimRadio};

    fn node(euid: u64, clock: SimClock, role: CcpRole) -> Node<SimRadio> {
        let dev = Device::new(SimRadio::new(clock), euid, euid as u16);
        let config = CcpConfig { role, ..CcpConfig::default() };
        Node::new(dev).with_ccp(Ccp::new(config)).unwrap()
    }

    fn start(node: &mut Node<SimRadio>) {
        assert!(node.ccp.as_mut().unwrap().start(&mut node.dev));
    }

    /// Polls the master for its next packet, the slave opens its receiver
    fn next_superframe(master: &mut Node<SimRadio>, slave: &mut Node<SimRadio>) {
        let epoch = master.dev.clock.epoch;
        let now = epoch.os_us + epoch.period_us();
        master.poll(now);
        slave.poll(now);
    }

    #[test]
    fn slave_follows_the_master() {
        let mut master = node(0x10, SimClock::default(), CcpRole::Master);
        let mut slave = node(0x20, SimClock { offset: 0x1234_5678, ppm: 20.0 }, CcpRole::Slave);
        start(&mut master);
        start(&mut slave);

        assert!(transfer(&mut master, &mut slave, 300));
        assert!(master.dev.clock.epoch.valid);
        assert_eq!(slave.ccp.as_ref().unwrap().rx_count(), 1);
        assert!(!slave.dev.clock.epoch.valid);

        next_superframe(&mut master, &mut slave);
        assert!(transfer(&mut master, &mut slave, 300));

        let ccp = slave.ccp.as_ref().unwrap();
        assert_eq!(ccp.master_euid(), Some(0x10));
        assert_eq!(ccp.rx_count(), 2);
        assert_eq!(slave.dev.clock.epoch.seq, 2);
        assert!(slave.dev.clock.epoch.valid);

        // The slave runs 20 ppm fast
        let wcs = &slave.dev.clock.wcs;
        assert!(wcs.is_valid());
        assert!((wcs.fractional_skew() + 20e-6).abs() < 1e-7, "skew {}", wcs.fractional_skew());
    }

    #[test]
    fn master_ignores_packets() {
        let mut master = node(0x10, SimClock::default(), CcpRole::Master);
        let mut other = node(0x11, SimClock::default(), CcpRole::Master);
        start(&mut other);
        master.dev.radio.start_rx();
        assert!(transfer(&mut other, &mut master, 300));
        assert_eq!(master.ccp.as_ref().unwrap().stats.self_origin, 1);
        assert!(!master.dev.clock.epoch.valid);
    }

    #[test]
    fn relay_repeats_with_projected_time() {
        let mut master = node(0x10, SimClock::default(), CcpRole::Master);
        let mut relay = node(0x30, SimClock::default(), CcpRole::Relay);
        let mut slave = node(0x20, SimClock::default(), CcpRole::Slave);
        master.ccp = Some(Ccp::new(CcpConfig { role: CcpRole::Master, rpt_max: 1, ..CcpConfig::default() }));
        start(&mut master);
        start(&mut relay);
        start(&mut slave);

        assert!(transfer(&mut master, &mut relay, 300));
        assert_eq!(relay.ccp.as_ref().unwrap().stats.relay, 1);
        assert!(transfer(&mut relay, &mut slave, 300));

        let ccp = slave.ccp.as_ref().unwrap();
        assert_eq!(ccp.master_euid(), Some(0x10));
        assert_eq!(ccp.rx_count(), 1);
        assert_eq!(ccp.stats.rx, 1);

        // The slave shares the master's epoch, not the time of the repeat
        let master_epoch = master.dev.clock.epoch;
        let slave_epoch = slave.dev.clock.epoch;
        let diff = slave_epoch.master as i64 - master_epoch.master as i64;
        assert!(diff.abs() < 1000, "epoch off by {} DTU", diff);
        let diff = slave_epoch.local as i64 - master_epoch.local as i64;
        assert!(diff.abs() < 1000, "local epoch off by {} DTU", diff);
    }

    #[test]
    fn two_hops_share_the_epoch() {
        let mut master = node(0x10, SimClock::default(), CcpRole::Master);
        let mut first = node(0x30, SimClock::default(), CcpRole::Relay);
        let mut second = node(0x31, SimClock::default(), CcpRole::Relay);
        let mut slave = node(0x20, SimClock::default(), CcpRole::Slave);
        master.ccp = Some(Ccp::new(CcpConfig { role: CcpRole::Master, rpt_max: 2, ..CcpConfig::default() }));
        start(&mut master);
        start(&mut first);
        start(&mut second);
        start(&mut slave);

        assert!(transfer(&mut master, &mut first, 300));
        assert!(transfer(&mut first, &mut second, 300));
        assert_eq!(second.ccp.as_ref().unwrap().stats.relay, 1);
        assert!(transfer(&mut second, &mut slave, 300));

        let diff = slave.dev.clock.epoch.master as i64 - master.dev.clock.epoch.master as i64;
        assert!(diff.abs() < 2000, "epoch off by {} DTU", diff);
    }

    #[test]
    fn misses_invalidate_the_epoch() {
        let mut master = node(0x10, SimClock::default(), CcpRole::Master);
        let mut slave = node(0x20, SimClock { offset: 0, ppm: -5.0 }, CcpRole::Slave);
        start(&mut master);
        start(&mut slave);
        assert!(transfer(&mut master, &mut slave, 300));
        next_superframe(&mut master, &mut slave);
        assert!(transfer(&mut master, &mut slave, 300));
        assert!(slave.dev.clock.epoch.valid);
        assert!(slave.dev.clock.wcs.is_valid());

        let tolerance = slave.ccp.as_ref().unwrap().config().miss_tolerance;
        for _ in 0..=tolerance {
            slave.poll(u64::MAX / 2);
            assert!(expire(&mut slave));
        }

        assert!(!slave.dev.clock.epoch.valid);
        let wcs = &slave.dev.clock.wcs;
        assert!(!wcs.is_valid());
        assert_eq!(wcs.normalized_skew(), 1.0);
        let ccp = slave.ccp.as_ref().unwrap();
        assert_eq!(ccp.stats.invalidated, 1);
        assert_eq!(ccp.rx_count(), 0);
    }
}

//! PAN association
//!
//! A tag without an address blinks a request with its EUID. The master
//! allocates a short address and a slot id and answers with a lease; relays
//! repeat both frames, at most `rpt_max` times in total. The tag renews the
//! lease once it comes within the expiry margin and falls back to
//! [`UNASSIGNED`] when the lease runs out.

use heapless::Vec;

use crate::configs::{PanConfig, PanRole};
use crate::error::{Error, RadioStatus};
use crate::events::Deferred;
use crate::frame::{peek_frame_code, FrameCode, Message, PanFrame, FCTRL_BLINK, MAX_FRAME_LEN};
use crate::logging::{debug, info, warn};
use crate::mac::{ConfigWatcher, Device, MacInterface, Role};
use crate::radio::Radio;
use crate::time::{Duration, TIME_MAX};


/// Short address of a node without a lease
pub const UNASSIGNED: u16 = 0xffff;

/// Number of nodes the table allocator can hold
pub const PAN_MAX_NODES: usize = 32;

/// Number of events that can wait to be collected
pub const PAN_NEVENTS: usize = 4;


/// What the master hands out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Short address
    pub short_address: u16,
    /// TDMA slot id
    pub slot_id: u16,
}

/// Address and slot allocation on the master
///
/// Called for every request the master receives, with the receiver stopped.
pub trait PanAllocator {
    /// Allocates an address for the node `euid` asking for `role`
    ///
    /// Returns `None`, if nothing is left. A node that asks again should get
    /// the same allocation.
    fn allocate(&mut self, euid: u64, role: Role) -> Option<Allocation>;

    /// Gives back the allocation of `euid`
    fn release(&mut self, _euid: u64) -> bool {
        false
    }
}


/// Allocates addresses from a fixed table
///
/// Slot ids start at 1, slot 0 belongs to the clock calibration packet. The
/// short address is the base address plus the slot id.
#[derive(Clone, Debug)]
pub struct TableAllocator {
    base_address: u16,
    nslots: u16,
    entries: Vec<(u64, Allocation), PAN_MAX_NODES>,
}

impl TableAllocator {
    /// Creates an allocator for slot ids `1..nslots`
    pub fn new(base_address: u16, nslots: u16) -> Self {
        TableAllocator {
            base_address,
            nslots,
            entries: Vec::new(),
        }
    }

    /// Number of allocations handed out
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is handed out
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TableAllocator {
    fn default() -> Self {
        TableAllocator::new(0x0100, 16)
    }
}

impl PanAllocator for TableAllocator {
    fn allocate(&mut self, euid: u64, _role: Role) -> Option<Allocation> {
        if let Some((_, allocation)) = self.entries.iter().find(|(e, _)| *e == euid) {
            return Some(*allocation);
        }
        let slot_id = (1..self.nslots).find(|slot| self.entries.iter().all(|(_, a)| a.slot_id != *slot))?;
        let allocation = Allocation {
            short_address: self.base_address.wrapping_add(slot_id),
            slot_id,
        };
        self.entries.push((euid, allocation)).ok()?;
        Some(allocation)
    }

    fn release(&mut self, euid: u64) -> bool {
        match self.entries.iter().position(|(e, _)| *e == euid) {
            Some(index) => {
                self.entries.swap_remove(index);
                true
            }
            None => false,
        }
    }
}


/// Something that happened to a lease
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanEvent {
    /// The tag got its first lease
    Joined(Allocation),
    /// The tag renewed its lease
    Renewed(Allocation),
    /// The tag's lease ran out
    Expired,
    /// The master handed out an allocation
    Allocated {
        /// EUID of the tag
        euid: u64,
        /// What it got
        allocation: Allocation,
    },
}


/// A lease held by a tag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    /// What was allocated
    pub allocation: Allocation,
    /// PAN id
    pub pan_id: u16,
    /// Platform time the lease ends
    pub expires_us: u64,
}


stats! {
    /// Counters of the PAN association
    pub struct PanStats {
        request,
        response,
        relay,
        duplicate,
        renew,
        expired,
        allocated,
        exhausted,
        rx_timeout,
        start_tx_error,
        dropped,
        reset,
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Master or relay waiting for frames
    Listening,
    /// Tag waiting for its response
    Requesting,
    /// Master sending a response
    Responding,
    /// Relay repeating a frame
    Relaying,
}


/// A PAN association instance
pub struct Pan<A = TableAllocator> {
    config: PanConfig,
    allocator: A,
    phase: Phase,
    seq_num: u8,
    lease: Option<Lease>,
    /// Last frame relayed, by EUID, sequence number and code
    last_relayed: Option<(u64, u8, u16)>,
    listen_timeout: u32,
    response_duration: u32,
    watcher: ConfigWatcher,
    events: Deferred<PanEvent, PAN_NEVENTS>,

    /// Statistics
    pub stats: PanStats,
}

impl<A: PanAllocator> Pan<A> {
    /// Creates an instance, `allocator` is only used by a master
    pub fn new(config: PanConfig, allocator: A) -> Self {
        Pan {
            config,
            allocator,
            phase: Phase::Idle,
            seq_num: 0,
            lease: None,
            last_relayed: None,
            listen_timeout: 0,
            response_duration: 0,
            watcher: ConfigWatcher::default(),
            events: Deferred::new(),
            stats: PanStats::default(),
        }
    }

    /// The configuration
    pub fn config(&self) -> &PanConfig {
        &self.config
    }

    /// The allocator
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The lease of a tag
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Takes the oldest event
    pub fn pop_event(&mut self) -> Option<PanEvent> {
        self.events.pop()
    }

    fn refresh<R: Radio>(&mut self, dev: &Device<R>) {
        if self.watcher.changed(&dev.config) {
            self.response_duration = dev.phy().frame_duration_uus(PanFrame::LEN);
        }
    }

    /// Blinks a request for an address
    ///
    /// Returns `WouldBlock` while the instance is busy. A blink that could not
    /// be started shows in the returned status, the instance stays idle.
    pub fn request<R: Radio>(&mut self, dev: &mut Device<R>) -> nb::Result<RadioStatus, Error> {
        if self.config.role != PanRole::Tag {
            return Err(nb::Error::Other(Error::InvalidConfiguration));
        }
        if self.phase != Phase::Idle {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, request);

        self.seq_num = self.seq_num.wrapping_add(1);
        let frame = PanFrame {
            fctrl: FCTRL_BLINK,
            seq_num: self.seq_num,
            long_address: dev.euid.0,
            code: FrameCode::PanRequest.into(),
            rpt_count: 0,
            rpt_max: self.config.rpt_max,
            role: dev.role.0,
            short_address: dev.short_address.0,
            slot_id: dev.slot_id,
            pan_id: dev.pan_id.0,
            lease_time: 0,
        };

        // Every relay hop adds a holdoff
        let hops = self.config.rpt_max as u32 + 1;
        self.listen_timeout = hops * (self.config.tx_holdoff_delay + self.response_duration)
            + self.config.rx_timeout_delay;

        let mut buf = [0; MAX_FRAME_LEN];
        let len = frame.encode(&mut buf).map_err(nb::Error::Other)?;
        let status = dev.transmit(&buf[..len], None, Some(self.listen_timeout));
        if status.start_tx_error {
            warn!("pan: request {} started too late", self.seq_num);
            stat_inc!(self.stats, start_tx_error);
            return Ok(status);
        }
        self.phase = Phase::Requesting;
        Ok(status)
    }

    /// Opens the receiver of a master or relay
    pub fn listen<R: Radio>(&mut self, dev: &mut Device<R>, timeout: u32) -> nb::Result<RadioStatus, Error> {
        if self.config.role == PanRole::Tag {
            return Err(nb::Error::Other(Error::InvalidConfiguration));
        }
        if self.phase != Phase::Idle {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        self.listen_timeout = timeout;
        let status = dev.listen(None, timeout);
        if !status.start_rx_error {
            self.phase = Phase::Listening;
        }
        Ok(status)
    }

    /// Keeps the lease of a tag alive, `now_us` is the platform time
    ///
    /// Returns `true` if a request went out.
    pub fn poll<R: Radio>(&mut self, dev: &mut Device<R>, now_us: u64) -> bool {
        if self.config.role != PanRole::Tag {
            return false;
        }
        let lease = match self.lease {
            Some(lease) => lease,
            None => return false,
        };

        if now_us >= lease.expires_us {
            warn!("pan: lease of {:#06x} expired", lease.allocation.short_address);
            stat_inc!(self.stats, expired);
            self.lease = None;
            dev.short_address.0 = UNASSIGNED;
            dev.slot_id = 0;
            self.post(PanEvent::Expired);
            return false;
        }

        let margin_us = self.config.exp_margin as u64 * 1_000_000;
        if now_us + margin_us >= lease.expires_us && self.phase == Phase::Idle {
            stat_inc!(self.stats, renew);
            return matches!(self.request(dev), Ok(status) if !status.start_tx_error);
        }
        false
    }

    fn post(&mut self, event: PanEvent) {
        if self.events.post(event).is_err() {
            warn!("pan: event queue full");
            stat_inc!(self.stats, dropped);
        }
    }

    fn send<R: Radio>(&mut self, dev: &mut Device<R>, frame: &PanFrame, at: u64, phase: Phase) {
        let mut buf = [0; MAX_FRAME_LEN];
        let len = match frame.encode(&mut buf) {
            Ok(len) => len,
            Err(_) => return,
        };
        let status = dev.transmit(&buf[..len], Some(at), None);
        if status.start_tx_error {
            stat_inc!(self.stats, start_tx_error);
            self.phase = Phase::Idle;
            return;
        }
        self.phase = phase;
    }

    fn on_request<R: Radio>(&mut self, dev: &mut Device<R>, request: &PanFrame) {
        dev.stop();
        let allocation = match self.allocator.allocate(request.long_address, Role(request.role)) {
            Some(allocation) => allocation,
            None => {
                warn!("pan: no address left for {:#018x}", request.long_address);
                stat_inc!(self.stats, exhausted);
                self.phase = Phase::Idle;
                return;
            }
        };
        stat_inc!(self.stats, allocated);
        info!(
            "pan: {:#018x} gets {:#06x} in slot {}",
            request.long_address, allocation.short_address, allocation.slot_id
        );
        self.post(PanEvent::Allocated {
            euid: request.long_address,
            allocation,
        });

        let response = PanFrame {
            code: FrameCode::PanResponse.into(),
            rpt_count: 0,
            rpt_max: self.config.rpt_max,
            short_address: allocation.short_address,
            slot_id: allocation.slot_id,
            pan_id: dev.pan_id.0,
            lease_time: self.config.lease_time,
            ..*request
        };
        let reception = dev.radio.read_rxtime();
        let at = (reception + Duration::from_uus(self.config.tx_holdoff_delay).value()) & TIME_MAX;
        self.send(dev, &response, at, Phase::Responding);
    }

    fn on_response<R: Radio>(&mut self, dev: &mut Device<R>, response: &PanFrame) {
        if response.long_address != dev.euid.0 || response.seq_num != self.seq_num {
            // Someone else's, keep waiting
            if !dev.listen(None, self.listen_timeout).start_rx_error {
                return;
            }
            self.phase = Phase::Idle;
            return;
        }
        stat_inc!(self.stats, response);
        self.phase = Phase::Idle;

        let allocation = Allocation {
            short_address: response.short_address,
            slot_id: response.slot_id,
        };
        dev.short_address.0 = allocation.short_address;
        dev.slot_id = allocation.slot_id;
        dev.pan_id.0 = response.pan_id;

        let expires_us = dev.radio.uptime_us() + response.lease_time as u64 * 1_000_000;
        let event = match self.lease {
            Some(_) => PanEvent::Renewed(allocation),
            None => PanEvent::Joined(allocation),
        };
        self.lease = Some(Lease {
            allocation,
            pan_id: response.pan_id,
            expires_us,
        });
        debug!("pan: leased {:#06x} for {} s", allocation.short_address, response.lease_time);
        self.post(event);
    }

    fn relay<R: Radio>(&mut self, dev: &mut Device<R>, frame: &PanFrame) {
        let key = (frame.long_address, frame.seq_num, frame.code);
        if self.last_relayed == Some(key) {
            stat_inc!(self.stats, duplicate);
            self.phase = Phase::Idle;
            return;
        }
        if frame.rpt_count >= frame.rpt_max {
            self.phase = Phase::Idle;
            return;
        }
        self.last_relayed = Some(key);

        let hops = frame.rpt_count as u32 + 1;
        let reception = dev.radio.read_rxtime();
        let at = (reception + Duration::from_uus(self.config.tx_holdoff_delay * hops).value()) & TIME_MAX;
        let repeat = PanFrame {
            rpt_count: frame.rpt_count + 1,
            ..*frame
        };
        stat_inc!(self.stats, relay);
        self.send(dev, &repeat, at, Phase::Relaying);
    }
}


impl<R: Radio, A: PanAllocator> MacInterface<R> for Pan<A> {
    fn rx_complete(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let code = match peek_frame_code(frame) {
            Some(code @ FrameCode::PanRequest) | Some(code @ FrameCode::PanResponse) => code,
            _ => return false,
        };
        let frame = match PanFrame::decode(frame) {
            Ok(Some(frame)) if frame.fctrl == FCTRL_BLINK => frame,
            _ => return false,
        };

        match (self.config.role, code) {
            (PanRole::Tag, FrameCode::PanResponse) if self.phase == Phase::Requesting => {
                self.on_response(dev, &frame)
            }
            (PanRole::Master, FrameCode::PanRequest) if self.phase == Phase::Listening => {
                self.on_request(dev, &frame)
            }
            (PanRole::Relay, _) if self.phase == Phase::Listening => self.relay(dev, &frame),
            // Frames of the protocol nobody here waits for
            _ => {}
        }
        true
    }

    fn tx_complete(&mut self, _dev: &mut Device<R>) -> bool {
        match self.phase {
            Phase::Responding | Phase::Relaying => {
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    fn rx_timeout(&mut self, _dev: &mut Device<R>) -> bool {
        match self.phase {
            Phase::Requesting | Phase::Listening => {
                stat_inc!(self.stats, rx_timeout);
                self.phase = Phase::Idle;
                true
            }
            _ => false,
        }
    }

    fn rx_error(&mut self, dev: &mut Device<R>) -> bool {
        match self.phase {
            Phase::Requesting | Phase::Listening => {
                if dev.listen(None, self.listen_timeout).start_rx_error {
                    self.phase = Phase::Idle;
                }
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
    use crate::sim::{transfer, SimClock, SimRadio};

    #[test]
    fn table_reuses_allocations() {
        let mut table = TableAllocator::new(0x0100, 4);
        let first = table.allocate(0xaa, Role::TAG).unwrap();
        let second = table.allocate(0xbb, Role::TAG).unwrap();
        assert_eq!(first, Allocation { short_address: 0x0101, slot_id: 1 });
        assert_eq!(second.slot_id, 2);
        assert_eq!(table.allocate(0xaa, Role::TAG), Some(first));

        assert!(table.allocate(0xcc, Role::TAG).is_some());
        assert!(table.allocate(0xdd, Role::TAG).is_none());

        assert!(table.release(0xbb));
        assert!(!table.release(0xbb));
        assert_eq!(table.allocate(0xdd, Role::TAG).map(|a| a.slot_id), Some(2));
    }

    fn node(euid: u64, role: PanRole) -> Node<SimRadio> {
        let dev = Device::new(SimRadio::new(SimClock::default()), euid, UNASSIGNED);
        let pan = Pan::new(PanConfig { role, ..PanConfig::default() }, TableAllocator::default());
        Node::new(dev).with_pan(pan).unwrap()
    }

    fn associate(master: &mut Node<SimRadio>, tag: &mut Node<SimRadio>) {
        master.pan.as_mut().unwrap().listen(&mut master.dev, 0).unwrap();
        tag.pan.as_mut().unwrap().request(&mut tag.dev).unwrap();
        assert!(transfer(tag, master, 500));
        assert!(transfer(master, tag, 500));
    }

    #[test]
    fn tag_joins_and_renews() {
        let mut master = node(0x01, PanRole::Master);
        let mut tag = node(0xaa, PanRole::Tag);
        associate(&mut master, &mut tag);

        let joined = Allocation { short_address: 0x0101, slot_id: 1 };
        assert_eq!(tag.dev.short_address.0, 0x0101);
        assert_eq!(tag.dev.slot_id, 1);
        assert_eq!(tag.pan.as_mut().unwrap().pop_event(), Some(PanEvent::Joined(joined)));
        assert_eq!(
            master.pan.as_mut().unwrap().pop_event(),
            Some(PanEvent::Allocated { euid: 0xaa, allocation: joined })
        );

        let expires_us = tag.pan.as_ref().unwrap().lease().unwrap().expires_us;
        master.pan.as_mut().unwrap().listen(&mut master.dev, 0).unwrap();
        tag.poll(expires_us - 1_000_000);
        assert_eq!(tag.pan.as_ref().unwrap().stats.renew, 1);
        assert!(transfer(&mut tag, &mut master, 500));
        assert!(transfer(&mut master, &mut tag, 500));
        assert_eq!(tag.pan.as_mut().unwrap().pop_event(), Some(PanEvent::Renewed(joined)));
        assert_eq!(master.pan.as_ref().unwrap().allocator().len(), 1);
    }

    #[test]
    fn lease_runs_out() {
        let mut master = node(0x01, PanRole::Master);
        let mut tag = node(0xaa, PanRole::Tag);
        associate(&mut master, &mut tag);
        tag.pan.as_mut().unwrap().pop_event();

        let expires_us = tag.pan.as_ref().unwrap().lease().unwrap().expires_us;
        tag.poll(expires_us);
        assert_eq!(tag.dev.short_address.0, UNASSIGNED);
        assert_eq!(tag.dev.slot_id, 0);
        assert!(tag.pan.as_ref().unwrap().lease().is_none());
        assert_eq!(tag.pan.as_mut().unwrap().pop_event(), Some(PanEvent::Expired));
    }

    #[test]
    fn relay_carries_both_ways() {
        let mut master = node(0x01, PanRole::Master);
        let mut relay = node(0x02, PanRole::Relay);
        let mut tag = node(0xaa, PanRole::Tag);
        relay.pan.as_mut().unwrap().listen(&mut relay.dev, 0).unwrap();
        master.pan.as_mut().unwrap().listen(&mut master.dev, 0).unwrap();
        tag.pan.as_mut().unwrap().request(&mut tag.dev).unwrap();

        // The master is out of range of the tag
        assert!(transfer(&mut tag, &mut relay, 500));
        assert!(transfer(&mut relay, &mut master, 500));
        assert_eq!(relay.pan.as_ref().unwrap().stats.relay, 1);

        relay.pan.as_mut().unwrap().listen(&mut relay.dev, 0).unwrap();
        assert!(transfer(&mut master, &mut relay, 500));
        assert!(transfer(&mut relay, &mut tag, 500));
        assert_eq!(relay.pan.as_ref().unwrap().stats.relay, 2);
        assert_eq!(tag.dev.short_address.0, 0x0101);
    }

    #[test]
    fn blink_that_did_not_start_is_reported() {
        let mut tag = node(0xaa, PanRole::Tag);
        tag.dev.radio.fail_next_tx = true;
        let status = tag.pan.as_mut().unwrap().request(&mut tag.dev).unwrap();
        assert!(status.start_tx_error);
        assert_eq!(tag.pan.as_ref().unwrap().stats.start_tx_error, 1);
        assert!(tag.dev.radio.take_frame().is_none());

        // Nothing is in flight, the next blink goes out
        let status = tag.pan.as_mut().unwrap().request(&mut tag.dev).unwrap();
        assert!(!status.is_err());
        assert!(tag.dev.radio.take_frame().is_some());
    }

    #[test]
    fn full_event_queue_is_counted() {
        let mut master = node(0x01, PanRole::Master);
        for euid in 0..PAN_NEVENTS as u64 + 1 {
            let mut tag = node(0xa0 + euid, PanRole::Tag);
            tag.dev.radio.advance_to(master.dev.radio.global());
            associate(&mut master, &mut tag);
        }
        let pan = master.pan.as_mut().unwrap();
        assert_eq!(pan.stats.allocated, PAN_NEVENTS as u32 + 1);
        assert_eq!(pan.stats.dropped, 1);
        assert_eq!(pan.allocator().len(), PAN_NEVENTS + 1);
    }

    #[test]
    fn only_tags_request() {
        let mut master = node(0x01, PanRole::Master);
        let pan = master.pan.as_mut().unwrap();
        assert_eq!(pan.request(&mut master.dev), Err(nb::Error::Other(Error::InvalidConfiguration)));
    }
}

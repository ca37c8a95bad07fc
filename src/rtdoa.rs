//! Reverse time difference of arrival
//!
//! An initiator broadcasts a request stamped with its transmission time in
//! the clock master's time base. Every responder in the request's slot mask
//! answers once, in its ranked sub-slot, with the master-time reception of
//! the request and transmission of its response. A listening tag timestamps
//! the request and every response and computes, per responder `i`,
//!
//! ``` text
//! tdoa_i = (B_i - A) - (S_i - R_i)
//! ```
//!
//! with `A` the tag's reception of the request, `B_i` its reception of the
//! response, `R_i` the responder's reception of the request and `S_i` its
//! transmission of the response. All four are in the master's time base.
//! Responders may repeat the request, bounded by `rpt_max`, before they
//! answer.

use heapless::Vec;

use crate::configs::RtdoaConfig;
use crate::error::{Error, RngStatus};
use crate::events::Deferred;
use crate::frame::{
    peek_frame_code, FrameCode, FrameHeader, Message, RtdoaRequest, RtdoaResponse, BROADCAST,
    MAX_FRAME_LEN,
};
use crate::logging::{debug, trace, warn};
use crate::mac::{ConfigWatcher, Device, MacInterface};
use crate::math::tof_to_meters;
use crate::nrng::{bit_rank, NRNG_MAX_NODES};
use crate::radio::Radio;
use crate::sync::Semaphore;
use crate::time::{wrapping_delta, Duration, TIME_MAX};


/// Number of results that can wait to be collected
pub const RTDOA_NRESULTS: usize = 2;


stats! {
    /// Counters of the reverse TDOA
    pub struct RtdoaStats {
        request,
        listen,
        relay,
        response,
        rx_response,
        dropped,
        duplicate,
        complete,
        rx_timeout,
        rx_error,
        tx_error,
        start_tx_error,
        start_rx_error,
        reset,
    }
}


/// Time difference of arrival of one responder
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tdoa {
    /// Slot id of the responder
    pub slot_id: u16,
    /// Short address of the responder
    pub address: u16,
    /// Difference in DTU
    pub tdoa: f64,
    /// Difference in meters
    pub range_diff: f64,
}

/// What a tag computed from one request
#[derive(Clone, Debug, PartialEq)]
pub struct RtdoaResult {
    /// Sequence number of the request
    pub seq_num: u8,
    /// Short address of the initiator
    pub initiator: u16,
    /// Slot ids asked to respond
    pub slot_mask: u16,
    /// Responders heard, in order of arrival
    pub tdoas: Vec<Tdoa, NRNG_MAX_NODES>,
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Initiator sending the request
    Requesting,
    /// Responder or tag waiting for a request
    Listening,
    /// Responder repeating the request
    Relaying,
    /// Responder sending its response
    Responding,
    /// Tag collecting responses
    Collecting,
}


#[derive(Clone, Copy, Debug, Default)]
struct Durations {
    request: u32,
    response: u32,
}


/// A reverse TDOA instance
pub struct Rtdoa {
    config: RtdoaConfig,
    sem: Semaphore,
    phase: Phase,
    status: RngStatus,
    /// The request being handled, by source and sequence number
    request: Option<(u16, u8)>,
    slot_mask: u16,
    /// Tag's reception of the request, master time
    request_rx: u64,
    /// Responder's response, sent once the repeat is out
    response: RtdoaResponse,
    response_at: u64,
    window_end: u64,
    collected: Option<RtdoaResult>,
    results: Deferred<RtdoaResult, RTDOA_NRESULTS>,
    watcher: ConfigWatcher,
    durations: Durations,

    /// Statistics
    pub stats: RtdoaStats,
}

impl Rtdoa {
    /// Creates an idle instance
    pub fn new(config: RtdoaConfig) -> Self {
        Rtdoa {
            config,
            sem: Semaphore::new(),
            phase: Phase::Idle,
            status: RngStatus::default(),
            request: None,
            slot_mask: 0,
            request_rx: 0,
            response: RtdoaResponse::default(),
            response_at: 0,
            window_end: 0,
            collected: None,
            results: Deferred::new(),
            watcher: ConfigWatcher::default(),
            durations: Durations::default(),
            stats: RtdoaStats::default(),
        }
    }

    /// The semaphore count, 1 when idle
    pub fn sem_count(&self) -> u8 {
        self.sem.count()
    }

    /// Status of the last exchange
    pub fn status(&self) -> RngStatus {
        self.status
    }

    /// Takes the oldest result
    pub fn pop_result(&mut self) -> Option<RtdoaResult> {
        self.results.pop()
    }

    /// Returns the status of the last exchange once it is over
    pub fn wait(&self) -> nb::Result<RngStatus, Error> {
        if self.sem.is_held() {
            return Err(nb::Error::WouldBlock);
        }
        Ok(self.status)
    }

    fn refresh<R: Radio>(&mut self, dev: &Device<R>) {
        if self.watcher.changed(&dev.config) {
            let phy = dev.phy();
            self.durations = Durations {
                request: phy.frame_duration_uus(RtdoaRequest::LEN),
                response: phy.frame_duration_uus(RtdoaResponse::LEN),
            };
        }
    }

    fn finish(&mut self, status: RngStatus) {
        self.status = status;
        self.phase = Phase::Idle;
        self.sem.release();
    }

    fn complete(&mut self) {
        stat_inc!(self.stats, complete);
        self.finish(RngStatus {
            complete: true,
            ..RngStatus::default()
        });
    }

    fn holdoff(&self) -> u64 {
        Duration::from_uus(self.config.tx_holdoff_delay).value()
    }

    /// Broadcasts a request to the responders in `slot_mask`
    pub fn request<R: Radio>(&mut self, dev: &mut Device<R>, slot_mask: u16) -> nb::Result<RngStatus, Error> {
        if !self.sem.try_acquire() {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, request);
        self.status = RngStatus::default();

        let now = dev.radio.read_systime();
        let at = (now + self.holdoff()) & TIME_MAX;
        let transmission = dev.delayed_tx_timestamp(at);
        let request = RtdoaRequest {
            header: FrameHeader::new(
                FrameCode::RtdoaRequest,
                dev.next_seq(),
                dev.pan_id.0,
                dev.short_address.0,
                BROADCAST,
            ),
            slot_mask,
            rpt_count: 0,
            rpt_max: self.config.rpt_max,
            tx_timestamp: dev.clock.wcs.local_to_master64(transmission),
        };
        debug!("rtdoa: request to {:#06x}", slot_mask);

        self.phase = Phase::Requesting;
        if !self.send(dev, &request, at) {
            self.finish(RngStatus {
                start_tx_error: true,
                ..RngStatus::default()
            });
        }
        Ok(self.status)
    }

    /// Waits for a request for up to `timeout` UWB microseconds
    ///
    /// Nodes whose slot id is in the request's mask respond, all others
    /// collect the responses as a tag.
    pub fn listen<R: Radio>(&mut self, dev: &mut Device<R>, timeout: u32) -> nb::Result<RngStatus, Error> {
        if !self.sem.try_acquire() {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, listen);
        self.status = RngStatus::default();
        self.request = None;

        self.phase = Phase::Listening;
        if dev.listen(None, timeout).start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            self.finish(RngStatus {
                start_rx_error: true,
                ..RngStatus::default()
            });
        }
        Ok(self.status)
    }

    fn send<R: Radio, M: Message>(&mut self, dev: &mut Device<R>, message: &M, at: u64) -> bool {
        let mut buf = [0; MAX_FRAME_LEN];
        let len = match message.encode(&mut buf) {
            Ok(len) => len,
            Err(_) => return false,
        };
        if dev.transmit(&buf[..len], Some(at), None).start_tx_error {
            warn!("rtdoa: transmission started too late");
            stat_inc!(self.stats, start_tx_error);
            return false;
        }
        true
    }

    fn send_response<R: Radio>(&mut self, dev: &mut Device<R>) {
        let response = self.response;
        self.phase = Phase::Responding;
        if self.send(dev, &response, self.response_at) {
            stat_inc!(self.stats, response);
        }
        else {
            self.finish(RngStatus {
                start_tx_error: true,
                ..RngStatus::default()
            });
        }
    }

    fn on_request<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let request = match RtdoaRequest::decode(frame) {
            Ok(Some(request)) if request.header.dst_address == BROADCAST => request,
            _ => return false,
        };
        let key = (request.header.src_address, request.header.seq_num);
        let reception = dev.radio.read_rxtime();
        let slot = dev.slot_id;

        if slot < 16 && request.slot_mask & (1 << slot) != 0 {
            let rank = bit_rank(request.slot_mask, slot);
            let offset = self.config.tx_holdoff_delay
                + rank as u32 * (self.durations.response + self.config.tx_guard_delay);
            self.response_at = (reception + Duration::from_uus(offset).value()) & TIME_MAX;

            let transmission = dev.delayed_tx_timestamp(self.response_at);
            self.request = Some(key);
            self.response = RtdoaResponse {
                header: FrameHeader::new(
                    FrameCode::RtdoaResponse,
                    request.header.seq_num,
                    dev.pan_id.0,
                    dev.short_address.0,
                    BROADCAST,
                ),
                slot_id: slot,
                rx_timestamp: dev.clock.wcs.local_to_master64(reception),
                tx_timestamp: dev.clock.wcs.local_to_master64(transmission),
            };

            // The repeat must be out before the first sub-slot
            let fits = self.config.tx_guard_delay + self.durations.request < self.config.tx_holdoff_delay;
            if fits && request.rpt_count < request.rpt_max.min(self.config.rpt_max) {
                let at = (reception + Duration::from_uus(self.config.tx_guard_delay).value()) & TIME_MAX;
                let repeat = RtdoaRequest {
                    rpt_count: request.rpt_count + 1,
                    tx_timestamp: dev.clock.wcs.local_to_master64(dev.delayed_tx_timestamp(at)),
                    ..request
                };
                self.phase = Phase::Relaying;
                if self.send(dev, &repeat, at) {
                    stat_inc!(self.stats, relay);
                    return true;
                }
            }
            self.send_response(dev);
            return true;
        }

        // Not asked to respond, collect as a tag
        let nnodes = request.slot_mask.count_ones();
        let window = self.config.tx_holdoff_delay
            + nnodes * (self.durations.response + self.config.tx_guard_delay)
            + self.config.rx_timeout_delay;
        self.request = Some(key);
        self.slot_mask = request.slot_mask;
        self.request_rx = dev.clock.wcs.local_to_master64(reception);
        self.window_end = (reception + Duration::from_uus(window).value()) & TIME_MAX;
        self.collected = Some(RtdoaResult {
            seq_num: request.header.seq_num,
            initiator: request.header.src_address,
            slot_mask: request.slot_mask,
            tdoas: Vec::new(),
        });
        self.phase = Phase::Collecting;
        trace!("rtdoa: collecting {} responses", nnodes);
        if !self.relisten(dev) {
            self.publish();
        }
        true
    }

    fn on_response<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let response = match RtdoaResponse::decode(frame) {
            Ok(Some(response)) => response,
            _ => return false,
        };
        if Some(response.header.seq_num) != self.request.map(|(_, seq)| seq)
            || response.slot_id >= 16
            || self.slot_mask & (1 << response.slot_id) == 0
        {
            return false;
        }

        let reception = dev.radio.read_rxtime();
        let arrival = dev.clock.wcs.local_to_master64(reception);
        let request_rx = self.request_rx;

        if let Some(collected) = self.collected.as_mut() {
            if collected.tdoas.iter().all(|t| t.slot_id != response.slot_id) {
                let flight = arrival.wrapping_sub(request_rx) as i64;
                let turnaround = response.tx_timestamp.wrapping_sub(response.rx_timestamp) as i64;
                let tdoa = (flight - turnaround) as f64;
                let entry = Tdoa {
                    slot_id: response.slot_id,
                    address: response.header.src_address,
                    tdoa,
                    range_diff: tof_to_meters(tdoa),
                };
                if collected.tdoas.push(entry).is_ok() {
                    stat_inc!(self.stats, rx_response);
                }
                else {
                    stat_inc!(self.stats, dropped);
                }
            }
        }

        let heard = self.collected.as_ref().map_or(0, |c| c.tdoas.len() as u32);
        if heard >= self.slot_mask.count_ones() || !self.relisten(dev) {
            self.publish();
        }
        true
    }

    fn relisten<R: Radio>(&mut self, dev: &mut Device<R>) -> bool {
        let now = dev.radio.read_systime();
        let remaining = wrapping_delta(self.window_end, now);
        if remaining == 0 || remaining >= (TIME_MAX + 1) / 2 {
            return false;
        }
        let timeout = Duration::new(remaining).map_or(0, |d| d.to_uus()).max(1);
        if dev.listen(None, timeout).start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            return false;
        }
        true
    }

    fn publish(&mut self) {
        if let Some(result) = self.collected.take() {
            if self.results.post(result).is_err() {
                warn!("rtdoa: result queue full");
            }
        }
        self.complete();
    }
}


impl<R: Radio> MacInterface<R> for Rtdoa {
    fn rx_complete(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        match (self.phase, peek_frame_code(frame)) {
            (Phase::Listening, Some(FrameCode::RtdoaRequest)) => self.on_request(dev, frame),
            (Phase::Collecting, Some(FrameCode::RtdoaRequest)) => {
                // A repeat of the request being collected
                stat_inc!(self.stats, duplicate);
                if !self.relisten(dev) {
                    self.publish();
                }
                true
            }
            (Phase::Collecting, Some(FrameCode::RtdoaResponse)) => self.on_response(dev, frame),
            _ => false,
        }
    }

    fn tx_complete(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        match self.phase {
            Phase::Requesting | Phase::Responding => self.complete(),
            Phase::Relaying => self.send_response(dev),
            _ => return false,
        }
        true
    }

    fn rx_timeout(&mut self, _dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        stat_inc!(self.stats, rx_timeout);
        match self.phase {
            Phase::Collecting => self.publish(),
            _ => self.finish(RngStatus {
                rx_timeout_error: true,
                ..RngStatus::default()
            }),
        }
        true
    }

    fn rx_error(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        stat_inc!(self.stats, rx_error);
        let phase = self.phase;
        match phase {
            Phase::Collecting if self.relisten(dev) => {}
            Phase::Collecting => self.publish(),
            _ => self.finish(RngStatus {
                rx_error: true,
                ..RngStatus::default()
            }),
        }
        true
    }

    fn tx_error(&mut self, _dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        stat_inc!(self.stats, tx_error);
        self.finish(RngStatus {
            tx_error: true,
            ..RngStatus::default()
        });
        true
    }

    fn reset(&mut self, _dev: &mut Device<R>) -> bool {
        stat_inc!(self.stats, reset);
        if self.sem.is_held() {
            self.collected = None;
            self.finish(RngStatus {
                aborted: true,
                ..RngStatus::default()
            });
        }
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::sim::{broadcast, expire, transfer, SimClock, SimRadio};

    fn node(short_address: u16, slot_id: u16, rpt_max: u8) -> Node<SimRadio> {
        let mut dev = Device::new(SimRadio::new(SimClock::default()), short_address as u64, short_address);
        dev.slot_id = slot_id;
        let config = RtdoaConfig { rpt_max, ..RtdoaConfig::default() };
        Node::new(dev).with_rtdoa(Rtdoa::new(config)).unwrap()
    }

    fn listen(node: &mut Node<SimRadio>) {
        node.rtdoa.as_mut().unwrap().listen(&mut node.dev, 0).unwrap();
    }

    /// Initiator, two responders and a tag, all listening but the initiator
    fn network(rpt_max: u8) -> [Node<SimRadio>; 4] {
        let mut nodes = [
            node(0x0010, 0, rpt_max),
            node(0x0011, 1, rpt_max),
            node(0x0012, 2, 0),
            node(0x0020, 5, 0),
        ];
        for node in nodes.iter_mut().skip(1) {
            listen(node);
        }
        nodes
    }

    #[test]
    fn tag_computes_differences() {
        let [mut initiator, mut first, mut second, mut tag] = network(0);
        initiator.rtdoa.as_mut().unwrap().request(&mut initiator.dev, 0b110).unwrap();

        // Flight times from the initiator
        let claimed = broadcast(&mut initiator, &mut [&mut first, &mut second, &mut tag], &[1000, 2000, 1500]);
        assert_eq!(claimed, 3);
        assert!(initiator.rtdoa.as_ref().unwrap().status().complete);

        assert!(transfer(&mut first, &mut tag, 700));
        assert!(transfer(&mut second, &mut tag, 900));

        let rtdoa = tag.rtdoa.as_mut().unwrap();
        assert!(rtdoa.status().complete);
        let result = rtdoa.pop_result().unwrap();
        assert_eq!(result.initiator, 0x0010);
        assert_eq!(result.tdoas.len(), 2);
        assert_eq!(result.tdoas[0].tdoa, 200.0);
        assert_eq!(result.tdoas[1].tdoa, 1400.0);
        assert_eq!(result.tdoas[1].address, 0x0012);
        assert_eq!(first.rtdoa.as_ref().unwrap().stats.response, 1);
    }

    #[test]
    fn responder_repeats_before_responding() {
        let [mut initiator, mut first, mut second, mut tag] = network(1);
        initiator.rtdoa.as_mut().unwrap().request(&mut initiator.dev, 0b110).unwrap();
        broadcast(&mut initiator, &mut [&mut first, &mut second, &mut tag], &[1000, 2000, 1500]);

        assert!(transfer(&mut first, &mut tag, 700)); // repeat
        assert_eq!(first.rtdoa.as_ref().unwrap().stats.relay, 1);
        assert_eq!(tag.rtdoa.as_ref().unwrap().stats.duplicate, 1);

        assert!(transfer(&mut first, &mut tag, 700));
        assert!(transfer(&mut second, &mut tag, 900));
        let result = tag.rtdoa.as_mut().unwrap().pop_result().unwrap();
        assert_eq!(result.tdoas[0].tdoa, 200.0);
    }

    #[test]
    fn silent_responder_leaves_a_partial_result() {
        let [mut initiator, mut first, mut second, mut tag] = network(0);
        initiator.rtdoa.as_mut().unwrap().request(&mut initiator.dev, 0b110).unwrap();
        broadcast(&mut initiator, &mut [&mut first, &mut second, &mut tag], &[1000, 2000, 1500]);

        assert!(transfer(&mut first, &mut tag, 700));
        assert!(expire(&mut tag));
        let result = tag.rtdoa.as_mut().unwrap().pop_result().unwrap();
        assert_eq!(result.tdoas.len(), 1);
        assert_eq!(result.tdoas[0].slot_id, 1);
    }

    #[test]
    fn busy_while_listening() {
        let mut tag = node(0x0020, 5, 0);
        listen(&mut tag);
        let rtdoa = tag.rtdoa.as_mut().unwrap();
        assert_eq!(rtdoa.request(&mut tag.dev, 0b110), Err(nb::Error::WouldBlock));
        assert_eq!(rtdoa.wait(), Err(nb::Error::WouldBlock));
    }
}

//! Multi-node ranging
//!
//! One request, addressed to broadcast, carries a mask of the slot ids that
//! should answer. Every node in the mask replies in its own sub-slot,
//! ordered by the rank of its bit in the mask, so all replies fit into one
//! window without a schedule:
//!
//! ``` text
//! reply of rank r at  rx(request) + holdoff + r * (reply duration + guard)
//! ```
//!
//! The double-sided mode follows the replies with a second broadcast request
//! and collects one final per node, ranked the same way.

use heapless::Vec;

use crate::configs::NrngConfig;
use crate::error::{Error, RngStatus};
use crate::events::Deferred;
use crate::frame::{
    peek_frame_code, FrameCode, FrameHeader, Message, NrngFrame, NrngRequest, BROADCAST,
    MAX_FRAME_LEN,
};
use crate::logging::{debug, trace, warn};
use crate::mac::{ConfigWatcher, Device, MacInterface};
use crate::math::{calc_tof_ds, calc_tof_ss, clock_offset_ratio, tof_to_meters, Timestamps};
use crate::radio::Radio;
use crate::sync::Semaphore;
use crate::time::{wrapping_delta, Duration, TIME_MAX};


/// Maximum number of nodes one request can address
pub const NRNG_MAX_NODES: usize = 16;

/// Number of results that can wait to be collected
pub const NRNG_NRESULTS: usize = 2;


/// Number of bits set in `mask` below `slot`
///
/// That is the position of `slot` among the nodes `mask` addresses.
pub fn bit_rank(mask: u16, slot: u16) -> u16 {
    if slot >= 16 {
        return mask.count_ones() as u16;
    }
    (mask & ((1u16 << slot) - 1)).count_ones() as u16
}


stats! {
    /// Counters of the multi-node ranging
    pub struct NrngStats {
        request,
        listen,
        reply,
        final_,
        complete,
        partial,
        dropped,
        rx_timeout,
        rx_error,
        tx_error,
        start_tx_error,
        start_rx_error,
        reset,
    }
}


/// Single- or double-sided
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NrngMode {
    /// Request and replies
    SingleSided,
    /// Request, replies, second request and finals
    DoubleSided,
}

impl NrngMode {
    fn request_code(&self) -> FrameCode {
        match self {
            NrngMode::SingleSided => FrameCode::SsNrngRequest,
            NrngMode::DoubleSided => FrameCode::DsNrngRequest,
        }
    }

    fn reply_code(&self) -> FrameCode {
        match self {
            NrngMode::SingleSided => FrameCode::SsNrngT1,
            NrngMode::DoubleSided => FrameCode::DsNrngT1,
        }
    }
}


/// Range to one node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeRange {
    /// Slot id of the node
    pub slot_id: u16,
    /// Short address of the node
    pub address: u16,
    /// Time of flight in DTU
    pub tof: f64,
    /// Range in meters
    pub range: f64,
}

/// Outcome of a multi-node exchange
#[derive(Clone, Debug, PartialEq)]
pub struct NrngResult {
    /// Mode used
    pub mode: NrngMode,
    /// Sequence number of the exchange
    pub seq_num: u8,
    /// The slot ids asked to respond
    pub slot_mask: u16,
    /// Ranges of the nodes that answered, by slot id
    pub ranges: Vec<NodeRange, NRNG_MAX_NODES>,
}

impl NrngResult {
    /// Slot ids that answered
    pub fn answered(&self) -> u16 {
        self.ranges
            .iter()
            .filter(|r| r.slot_id < 16)
            .fold(0, |mask, r| mask | (1 << r.slot_id))
    }
}


#[derive(Clone, Copy, Debug, Default)]
struct Reply {
    slot_id: u16,
    address: u16,
    skew: f64,
    first: Timestamps,
    second: Option<Timestamps>,
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Responder waiting for a request
    Listening,
    /// Responder sending its reply
    Replying,
    /// Responder waiting for the second request
    AwaitT2,
    /// Responder sending its final
    SendingFinal,
    /// Initiator collecting replies
    AwaitReplies,
    /// Initiator collecting finals
    AwaitFinals,
}


/// Responder side of the exchange in flight
#[derive(Clone, Copy, Debug, Default)]
struct Responding {
    initiator: u16,
    nnodes: u16,
    reception: u64,
    transmission: u64,
}


#[derive(Clone, Copy, Debug, Default)]
struct Durations {
    request: u32,
    reply: u32,
    final_: u32,
}


/// A multi-node ranging instance
pub struct Nrng {
    config: NrngConfig,
    sem: Semaphore,
    phase: Phase,
    mode: NrngMode,
    seq_num: u8,
    slot_mask: u16,
    /// Transmission of the request
    request_tx: u64,
    /// Transmission of the second request
    second_tx: u64,
    /// End of the current receive window
    window_end: u64,
    replies: Vec<Reply, NRNG_MAX_NODES>,
    responding: Responding,
    status: RngStatus,
    results: Deferred<NrngResult, NRNG_NRESULTS>,
    watcher: ConfigWatcher,
    durations: Durations,

    /// Statistics
    pub stats: NrngStats,
}

impl Nrng {
    /// Creates an idle instance
    pub fn new(config: NrngConfig) -> Self {
        Nrng {
            config,
            sem: Semaphore::new(),
            phase: Phase::Idle,
            mode: NrngMode::SingleSided,
            seq_num: 0,
            slot_mask: 0,
            request_tx: 0,
            second_tx: 0,
            window_end: 0,
            replies: Vec::new(),
            responding: Responding::default(),
            status: RngStatus::default(),
            results: Deferred::new(),
            watcher: ConfigWatcher::default(),
            durations: Durations::default(),
            stats: NrngStats::default(),
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
    pub fn pop_result(&mut self) -> Option<NrngResult> {
        self.results.pop()
    }

    /// Returns the status of the last exchange once it is over
    pub fn wait(&self) -> nb::Result<RngStatus, Error> {
        if self.sem.is_held() {
            return Err(nb::Error::WouldBlock);
        }
        Ok(self.status)
    }

    /// Asks the nodes in `slot_mask` for their range
    pub fn request<R: Radio>(
        &mut self,
        dev: &mut Device<R>,
        slot_mask: u16,
        mode: NrngMode,
    ) -> nb::Result<RngStatus, Error> {
        if slot_mask.count_ones() as usize > NRNG_MAX_NODES {
            return Err(nb::Error::Other(Error::InvalidConfiguration));
        }
        if !self.sem.try_acquire() {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, request);

        self.mode = mode;
        self.status = RngStatus::default();
        self.seq_num = dev.next_seq();
        self.slot_mask = slot_mask;
        self.replies.clear();

        let request = NrngRequest {
            header: FrameHeader::new(
                mode.request_code(),
                self.seq_num,
                dev.pan_id.0,
                dev.short_address.0,
                BROADCAST,
            ),
            slot_mask,
        };
        let timeout = self.window(slot_mask.count_ones() as u16, self.durations.reply);
        debug!("nrng: request to {:#06x}", slot_mask);

        self.phase = Phase::AwaitReplies;
        let mut buf = [0; MAX_FRAME_LEN];
        let len = match request.encode(&mut buf) {
            Ok(len) => len,
            Err(error) => {
                self.finish(RngStatus::default());
                return Err(nb::Error::Other(error));
            }
        };
        let status = dev.transmit(&buf[..len], None, Some(timeout));
        if status.start_tx_error {
            stat_inc!(self.stats, start_tx_error);
            self.finish(status.into());
        }
        Ok(self.status)
    }

    /// Waits for a request for up to `timeout` UWB microseconds
    pub fn listen<R: Radio>(&mut self, dev: &mut Device<R>, timeout: u32) -> nb::Result<RngStatus, Error> {
        if !self.sem.try_acquire() {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, listen);

        self.status = RngStatus::default();
        self.phase = Phase::Listening;
        let status = dev.listen(None, timeout);
        if status.start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            self.finish(status.into());
        }
        Ok(self.status)
    }

    /// Ends the exchange in flight
    pub fn abort<R: Radio>(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        dev.stop();
        self.finish(RngStatus {
            aborted: true,
            ..RngStatus::default()
        });
        true
    }

    fn refresh<R: Radio>(&mut self, dev: &Device<R>) {
        if self.watcher.changed(&dev.config) {
            let phy = dev.phy();
            self.durations = Durations {
                request: phy.frame_duration_uus(NrngRequest::LEN),
                reply: phy.frame_duration_uus(NrngFrame::REPLY_LEN),
                final_: phy.frame_duration_uus(NrngFrame::FINAL_LEN),
            };
        }
    }

    /// Receive window for `nnodes` frames of `duration`
    fn window(&self, nnodes: u16, duration: u32) -> u32 {
        self.config.tx_holdoff_delay
            + nnodes as u32 * (duration + self.config.tx_guard_delay)
            + self.config.rx_timeout_delay
    }

    /// Start of the sub-slot of `rank` after a request received at `rx`
    fn sub_slot(&self, rx: u64, rank: u16, duration: u32) -> u64 {
        let offset = self.config.tx_holdoff_delay + rank as u32 * (duration + self.config.tx_guard_delay);
        (rx + Duration::from_uus(offset).value()) & TIME_MAX
    }

    fn finish(&mut self, status: RngStatus) {
        self.status = status;
        self.phase = Phase::Idle;
        self.sem.release();
    }

    /// Posts the ranges collected so far and ends the exchange
    fn finalize(&mut self, partial: bool) {
        let mut result = NrngResult {
            mode: self.mode,
            seq_num: self.seq_num,
            slot_mask: self.slot_mask,
            ranges: Vec::new(),
        };
        for reply in &self.replies {
            let tof = match (self.mode, reply.second) {
                (NrngMode::SingleSided, _) => calc_tof_ss(&reply.first, reply.skew),
                (NrngMode::DoubleSided, Some(second)) => calc_tof_ds(&reply.first, &second),
                (NrngMode::DoubleSided, None) => continue,
            };
            let range = NodeRange {
                slot_id: reply.slot_id,
                address: reply.address,
                tof,
                range: tof_to_meters(tof),
            };
            if result.ranges.push(range).is_err() {
                stat_inc!(self.stats, dropped);
            }
        }

        if partial {
            stat_inc!(self.stats, partial);
        }
        stat_inc!(self.stats, complete);
        trace!("nrng: {} of {} nodes answered", result.ranges.len(), self.slot_mask.count_ones());
        if self.results.post(result).is_err() {
            warn!("nrng: result queue full");
        }
        self.finish(RngStatus {
            complete: true,
            rx_timeout_error: partial,
            ..RngStatus::default()
        });
    }

    /// Turns the receiver back on for the rest of the window
    ///
    /// Returns `false` if the window is over.
    fn relisten<R: Radio>(&mut self, dev: &mut Device<R>) -> bool {
        let now = dev.radio.read_systime();
        let remaining = wrapping_delta(self.window_end, now);
        if remaining == 0 || remaining >= (TIME_MAX + 1) / 2 {
            return false;
        }
        let status = dev.listen(None, Duration::new(remaining).map_or(0, |d| d.to_uus()).max(1));
        if status.start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            return false;
        }
        true
    }

    fn send_second_request<R: Radio>(&mut self, dev: &mut Device<R>, at: Option<u64>) {
        let answered = self
            .replies
            .iter()
            .fold(0u16, |mask, reply| mask | (1 << reply.slot_id));
        let request = NrngRequest {
            header: FrameHeader::new(
                FrameCode::DsNrngT2,
                self.seq_num,
                dev.pan_id.0,
                dev.short_address.0,
                BROADCAST,
            ),
            slot_mask: answered,
        };
        let timeout = self.window(answered.count_ones() as u16, self.durations.final_);

        let mut buf = [0; MAX_FRAME_LEN];
        let len = match request.encode(&mut buf) {
            Ok(len) => len,
            Err(_) => return self.finish(RngStatus::default()),
        };
        self.phase = Phase::AwaitFinals;
        let status = dev.transmit(&buf[..len], at, Some(timeout));
        if status.start_tx_error {
            stat_inc!(self.stats, start_tx_error);
            self.finish(status.into());
        }
    }

    /// All replies are in, or the window is over
    fn replies_done<R: Radio>(&mut self, dev: &mut Device<R>, at: Option<u64>) {
        match self.mode {
            NrngMode::DoubleSided if !self.replies.is_empty() => self.send_second_request(dev, at),
            _ => {
                let partial = self.replies.len() < self.slot_mask.count_ones() as usize;
                self.finalize(partial)
            }
        }
    }

    fn on_request<R: Radio>(&mut self, dev: &mut Device<R>, mode: NrngMode, frame: &[u8]) -> bool {
        let request = match NrngRequest::decode(frame) {
            Ok(Some(request)) if request.header.dst_address == BROADCAST => request,
            _ => return false,
        };
        let slot = dev.slot_id;
        if slot >= 16 || request.slot_mask & (1 << slot) == 0 {
            return false;
        }

        let reception = dev.radio.read_rxtime();
        let rank = bit_rank(request.slot_mask, slot);
        let at = self.sub_slot(reception, rank, self.durations.reply);
        let transmission = dev.delayed_tx_timestamp(at);

        self.mode = mode;
        self.seq_num = request.header.seq_num;
        self.responding = Responding {
            initiator: request.header.src_address,
            nnodes: request.slot_mask.count_ones() as u16,
            reception,
            transmission,
        };

        let reply = NrngFrame {
            header: FrameHeader::new(
                mode.reply_code(),
                self.seq_num,
                dev.pan_id.0,
                dev.short_address.0,
                self.responding.initiator,
            ),
            slot_id: slot,
            reception_timestamp: reception as u32,
            transmission_timestamp: transmission as u32,
            ..NrngFrame::default()
        };

        let mut buf = [0; MAX_FRAME_LEN];
        let len = match reply.encode(NrngFrame::REPLY_LEN, &mut buf) {
            Ok(len) => len,
            Err(_) => {
                self.finish(RngStatus::default());
                return true;
            }
        };

        let timeout = match mode {
            NrngMode::SingleSided => None,
            NrngMode::DoubleSided => {
                // Until the end of the initiator's window and its second request
                let after = self.responding.nnodes - rank;
                Some(
                    after as u32 * (self.durations.reply + self.config.tx_guard_delay)
                        + self.config.rx_timeout_delay
                        + self.config.tx_holdoff_delay
                        + self.durations.request,
                )
            }
        };
        self.phase = Phase::Replying;
        let status = dev.transmit(&buf[..len], Some(at), timeout);
        if status.start_tx_error {
            warn!("nrng: reply of rank {} started too late", rank);
            stat_inc!(self.stats, start_tx_error);
            self.finish(status.into());
        }
        stat_inc!(self.stats, reply);
        true
    }

    fn on_reply<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let reply = match NrngFrame::decode(NrngFrame::REPLY_LEN, frame) {
            Ok(Some(reply)) => reply,
            _ => return false,
        };
        let header = &reply.header;
        if header.dst_address != dev.short_address.0
            || header.seq_num != self.seq_num
            || reply.slot_id >= 16
            || self.slot_mask & (1 << reply.slot_id) == 0
            || self.replies.iter().any(|r| r.slot_id == reply.slot_id)
        {
            return false;
        }

        let response = dev.radio.read_rxtime();
        let skew = clock_offset_ratio(dev.radio.rx_diagnostics().carrier_integrator, dev.phy());
        let entry = Reply {
            slot_id: reply.slot_id,
            address: header.src_address,
            skew,
            first: Timestamps {
                request: self.request_tx as u32,
                response: response as u32,
                reception: reply.reception_timestamp,
                transmission: reply.transmission_timestamp,
            },
            second: None,
        };
        if self.replies.push(entry).is_err() {
            stat_inc!(self.stats, dropped);
            return true;
        }

        if self.replies.len() == self.slot_mask.count_ones() as usize {
            let at = (response + Duration::from_uus(self.config.tx_holdoff_delay).value()) & TIME_MAX;
            self.replies_done(dev, Some(at));
        }
        else if !self.relisten(dev) {
            self.replies_done(dev, None);
        }
        true
    }

    fn on_second_request<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let request = match NrngRequest::decode(frame) {
            Ok(Some(request)) => request,
            _ => return false,
        };
        let slot = dev.slot_id;
        if request.header.src_address != self.responding.initiator
            || request.header.seq_num != self.seq_num
            || slot >= 16
            || request.slot_mask & (1 << slot) == 0
        {
            return false;
        }

        let response = dev.radio.read_rxtime();
        let rank = bit_rank(request.slot_mask, slot);
        let at = self.sub_slot(response, rank, self.durations.final_);

        let last = NrngFrame {
            header: FrameHeader::new(
                FrameCode::DsNrngFinal,
                self.seq_num,
                dev.pan_id.0,
                dev.short_address.0,
                self.responding.initiator,
            ),
            slot_id: slot,
            reception_timestamp: self.responding.reception as u32,
            transmission_timestamp: self.responding.transmission as u32,
            request_timestamp: self.responding.transmission as u32,
            response_timestamp: response as u32,
        };
        let mut buf = [0; MAX_FRAME_LEN];
        let len = match last.encode(NrngFrame::FINAL_LEN, &mut buf) {
            Ok(len) => len,
            Err(_) => {
                self.finish(RngStatus::default());
                return true;
            }
        };
        self.phase = Phase::SendingFinal;
        let status = dev.transmit(&buf[..len], Some(at), None);
        if status.start_tx_error {
            stat_inc!(self.stats, start_tx_error);
            self.finish(status.into());
        }
        true
    }

    fn on_final<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let last = match NrngFrame::decode(NrngFrame::FINAL_LEN, frame) {
            Ok(Some(last)) => last,
            _ => return false,
        };
        if last.header.dst_address != dev.short_address.0 || last.header.seq_num != self.seq_num {
            return false;
        }
        let second_tx = self.second_tx as u32;
        let reply = match self.replies.iter_mut().find(|r| r.slot_id == last.slot_id) {
            Some(reply) if reply.second.is_none() => reply,
            _ => return false,
        };
        reply.second = Some(Timestamps {
            request: last.request_timestamp,
            response: last.response_timestamp,
            reception: reply.first.response,
            transmission: second_tx,
        });
        stat_inc!(self.stats, final_);

        if self.replies.iter().all(|r| r.second.is_some()) {
            let partial = self.replies.len() < self.slot_mask.count_ones() as usize;
            self.finalize(partial);
        }
        else if !self.relisten(dev) {
            self.finalize(true);
        }
        true
    }
}


impl<R: Radio> MacInterface<R> for Nrng {
    fn rx_complete(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        let code = match peek_frame_code(frame) {
            Some(code) => code,
            None => return false,
        };
        match (self.phase, code) {
            (Phase::Listening, FrameCode::SsNrngRequest) => {
                self.on_request(dev, NrngMode::SingleSided, frame)
            }
            (Phase::Listening, FrameCode::DsNrngRequest) => {
                self.on_request(dev, NrngMode::DoubleSided, frame)
            }
            (Phase::AwaitReplies, code) if code == self.mode.reply_code() => self.on_reply(dev, frame),
            (Phase::AwaitT2, FrameCode::DsNrngT2) => self.on_second_request(dev, frame),
            (Phase::AwaitFinals, FrameCode::DsNrngFinal) => self.on_final(dev, frame),
            _ => false,
        }
    }

    fn tx_complete(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        match self.phase {
            Phase::AwaitReplies => {
                self.request_tx = dev.radio.read_txtime();
                let timeout = self.window(self.slot_mask.count_ones() as u16, self.durations.reply);
                self.window_end = (self.request_tx + Duration::from_uus(timeout).value()) & TIME_MAX;
            }
            Phase::AwaitFinals => {
                self.second_tx = dev.radio.read_txtime();
                let nnodes = self.replies.len() as u16;
                let timeout = self.window(nnodes, self.durations.final_);
                self.window_end = (self.second_tx + Duration::from_uus(timeout).value()) & TIME_MAX;
            }
            Phase::Replying => match self.mode {
                NrngMode::SingleSided => self.finish(RngStatus {
                    complete: true,
                    ..RngStatus::default()
                }),
                NrngMode::DoubleSided => self.phase = Phase::AwaitT2,
            },
            Phase::SendingFinal => self.finish(RngStatus {
                complete: true,
                ..RngStatus::default()
            }),
            Phase::Idle | Phase::Listening | Phase::AwaitT2 => return false,
        }
        true
    }

    fn rx_timeout(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        stat_inc!(self.stats, rx_timeout);
        match self.phase {
            // The second request goes out right away
            Phase::AwaitReplies => self.replies_done(dev, None),
            Phase::AwaitFinals => self.finalize(true),
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
            // A collision in the window doesn't end it
            Phase::AwaitReplies | Phase::AwaitFinals if self.relisten(dev) => {}
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

    #[test]
    fn rank_counts_lower_bits() {
        assert_eq!(bit_rank(0b1011_0110, 1), 0);
        assert_eq!(bit_rank(0b1011_0110, 2), 1);
        assert_eq!(bit_rank(0b1011_0110, 7), 4);
        assert_eq!(bit_rank(0xffff, 15), 15);
        assert_eq!(bit_rank(0, 3), 0);
    }

    #[test]
    fn answered_mask() {
        let mut result = NrngResult {
            mode: NrngMode::SingleSided,
            seq_num: 1,
            slot_mask: 0b1110,
            ranges: Vec::new(),
        };
        for &slot_id in &[1, 3] {
            result
                .ranges
                .push(NodeRange { slot_id, address: slot_id, tof: 0.0, range: 0.0 })
                .unwrap();
        }
        assert_eq!(result.answered(), 0b1010);
    }

    const TOFS: [u64; 2] = [800, 1500];

    fn node(short_address: u16, slot_id: u16) -> Node<SimRadio> {
        let mut dev = Device::new(SimRadio::new(SimClock::default()), short_address as u64, short_address);
        dev.slot_id = slot_id;
        Node::new(dev).with_nrng(Nrng::new(NrngConfig::default())).unwrap()
    }

    fn setup(mode: NrngMode) -> (Node<SimRadio>, Node<SimRadio>, Node<SimRadio>) {
        let mut initiator = node(0x0010, 0);
        let mut first = node(0x0011, 1);
        let mut second = node(0x0012, 2);
        for responder in [&mut first, &mut second] {
            responder.nrng.as_mut().unwrap().listen(&mut responder.dev, 0).unwrap();
        }
        initiator.nrng.as_mut().unwrap().request(&mut initiator.dev, 0b110, mode).unwrap();
        assert_eq!(broadcast(&mut initiator, &mut [&mut first, &mut second], &TOFS), 2);
        (initiator, first, second)
    }

    fn assert_ranges(result: &NrngResult) {
        assert_eq!(result.answered(), 0b110);
        for (range, &tof) in result.ranges.iter().zip(&TOFS) {
            assert!((range.tof - tof as f64).abs() < 1.0, "tof {}", range.tof);
        }
        assert_eq!(result.ranges[1].address, 0x0012);
    }

    #[test]
    fn single_sided() {
        let (mut initiator, mut first, mut second) = setup(NrngMode::SingleSided);
        assert!(transfer(&mut first, &mut initiator, TOFS[0]));
        assert_eq!(initiator.nrng.as_ref().unwrap().sem_count(), 0);
        assert!(transfer(&mut second, &mut initiator, TOFS[1]));

        let nrng = initiator.nrng.as_mut().unwrap();
        assert!(nrng.status().complete);
        assert_ranges(&nrng.pop_result().unwrap());
        assert_eq!(first.nrng.as_ref().unwrap().sem_count(), 1);
    }

    #[test]
    fn double_sided() {
        let (mut initiator, mut first, mut second) = setup(NrngMode::DoubleSided);
        assert!(transfer(&mut first, &mut initiator, TOFS[0]));
        assert!(transfer(&mut second, &mut initiator, TOFS[1]));
        assert_eq!(broadcast(&mut initiator, &mut [&mut first, &mut second], &TOFS), 2);
        assert!(transfer(&mut first, &mut initiator, TOFS[0]));
        assert!(transfer(&mut second, &mut initiator, TOFS[1]));

        let nrng = initiator.nrng.as_mut().unwrap();
        assert_eq!(nrng.wait(), Ok(RngStatus { complete: true, ..RngStatus::default() }));
        assert_eq!(nrng.stats.final_, 2);
        let result = nrng.pop_result().unwrap();
        assert_eq!(result.mode, NrngMode::DoubleSided);
        assert_ranges(&result);
        assert!(second.nrng.as_ref().unwrap().status().complete);
    }

    #[test]
    fn missing_reply_gives_a_partial_result() {
        let (mut initiator, mut first, _) = setup(NrngMode::SingleSided);
        assert!(transfer(&mut first, &mut initiator, TOFS[0]));
        assert!(expire(&mut initiator));

        let nrng = initiator.nrng.as_mut().unwrap();
        assert!(nrng.status().complete);
        assert!(nrng.status().rx_timeout_error);
        assert_eq!(nrng.stats.partial, 1);
        assert_eq!(nrng.pop_result().map(|result| result.answered()), Some(0b010));
    }

    #[test]
    fn nodes_outside_the_mask_stay_quiet() {
        let mut initiator = node(0x0010, 0);
        let mut outsider = node(0x0013, 3);
        outsider.nrng.as_mut().unwrap().listen(&mut outsider.dev, 0).unwrap();
        initiator.nrng.as_mut().unwrap().request(&mut initiator.dev, 0b110, NrngMode::SingleSided).unwrap();
        assert!(!transfer(&mut initiator, &mut outsider, 100));
        assert!(outsider.dev.radio.take_frame().is_none());
    }
}

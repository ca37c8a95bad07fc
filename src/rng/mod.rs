//! Two-party two-way ranging
//!
//! An [`Rng`] instance runs one exchange at a time, in either role. The
//! initiator calls [`Rng::request`], the responder must be listening
//! ([`Rng::listen`]) for the request to be picked up. The exchange is driven
//! by the device's events from then on:
//!
//! ``` text
//! initiator                       responder
//!   REQUEST  ------------------>
//!            <------------------  T1      (delayed by the holdoff)
//!   T2       ------------------>          (double-sided only)
//!   FINAL    <----------------->  FINAL   (sent by the side that has all
//!                                          timestamps last)
//! ```
//!
//! Both sides compute the time of flight and post a [`RangeResult`]. The
//! instance's semaphore is held from the request (or listen) until the
//! exchange completes, fails, or is aborted.

mod twr;

pub use self::twr::{RangeResult, Step, Variant};

use crate::configs::RngConfig;
use crate::error::{Error, RadioStatus, RngStatus};
use crate::events::Deferred;
use crate::frame::{
    decode_ack, encode_ack, peek_frame_code, ExtPayload, FrameHeader, TwrFrame, TwrKind,
    ACK_LEN, FCTRL_DATA_ACK_REQ, MAX_FRAME_LEN,
};
use crate::logging::{debug, trace, warn};
use crate::mac::{ConfigWatcher, Device, MacInterface};
use crate::math::{
    calc_tof_ds, calc_tof_ss, clock_offset_ratio, range_bias_cm, rssi_dbm, tof_to_meters,
    Timestamps, Triad,
};
use crate::radio::Radio;
use crate::ring::FrameRing;
use crate::sync::Semaphore;
use crate::time::{Duration, TIME_MAX};


/// Number of frames each instance keeps
pub const RNG_NFRAMES: usize = 4;

/// Number of results that can wait to be collected
pub const RNG_NRESULTS: usize = 8;


stats! {
    /// Counters of the two-party ranging
    pub struct RngStats {
        request,
        listen,
        rx_complete,
        tx_complete,
        complete,
        rx_timeout,
        rx_error,
        tx_error,
        start_tx_error,
        start_rx_error,
        duplicate,
        abort,
        reset,
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Responder waiting for a request
    Listening,
    /// Initiator waiting for the acknowledgement of its request
    AwaitAck,
    /// Initiator waiting for the reply
    AwaitT1,
    /// Responder waiting for the second request
    AwaitT2,
    /// Waiting for the final
    AwaitFinal,
    /// Responder sending the acknowledgement
    SendingAck,
    /// Sending the final, the exchange ends when it is out
    SendingFinal,
}


#[derive(Clone, Copy, Debug, Default)]
struct Exchange {
    initiator: bool,
    peer: u16,
    seq_num: u8,
    /// Opened by the initiator
    first: Timestamps,
    /// Opened by the responder
    second: Timestamps,
}


/// On-air durations of each frame kind, in UWB microseconds
#[derive(Clone, Copy, Debug, Default)]
struct Durations {
    ack: u32,
    response: u32,
    final_: u32,
    final_ext: u32,
}


/// A two-party ranging instance
pub struct Rng {
    config: RngConfig,
    sem: Semaphore,
    phase: Phase,
    variant: Variant,
    exchange: Exchange,
    frames: FrameRing<TwrFrame, RNG_NFRAMES>,
    status: RngStatus,
    results: Deferred<RangeResult, RNG_NRESULTS>,
    last_ack_request: Option<(u16, u8)>,
    listen_timeout: u32,
    position: Triad,
    variance: Triad,
    watcher: ConfigWatcher,
    durations: Durations,

    /// Statistics
    pub stats: RngStats,
}

impl Rng {
    /// Creates an idle instance
    pub fn new(config: RngConfig) -> Self {
        Rng {
            config,
            sem: Semaphore::new(),
            phase: Phase::Idle,
            variant: Variant::SingleSided,
            exchange: Exchange::default(),
            frames: FrameRing::new(),
            status: RngStatus::default(),
            results: Deferred::new(),
            last_ack_request: None,
            listen_timeout: 0,
            position: Triad::default(),
            variance: Triad::default(),
            watcher: ConfigWatcher::default(),
            durations: Durations::default(),
            stats: RngStats::default(),
        }
    }

    /// The configuration
    pub fn config(&self) -> &RngConfig {
        &self.config
    }

    /// Sets the position sent in the extended variants
    pub fn set_position(&mut self, position: Triad, variance: Triad) {
        self.position = position;
        self.variance = variance;
    }

    /// The semaphore count, 1 when idle
    pub fn sem_count(&self) -> u8 {
        self.sem.count()
    }

    /// Status of the last exchange
    pub fn status(&self) -> RngStatus {
        self.status
    }

    /// The last frame sent or received
    pub fn last_frame(&self) -> &TwrFrame {
        self.frames.current()
    }

    /// Takes the oldest result
    pub fn pop_result(&mut self) -> Option<RangeResult> {
        self.results.pop()
    }

    /// Opens an exchange of `variant` with the node at `dst`
    ///
    /// Returns `WouldBlock` while another exchange is in flight. Radio start
    /// errors end the exchange right away and are reported in the status.
    pub fn request<R: Radio>(
        &mut self,
        dev: &mut Device<R>,
        dst: u16,
        variant: Variant,
    ) -> nb::Result<RngStatus, Error> {
        if !self.sem.try_acquire() {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, request);

        self.variant = variant;
        self.status = RngStatus::default();
        self.exchange = Exchange {
            initiator: true,
            peer: dst,
            seq_num: dev.next_seq(),
            ..Exchange::default()
        };

        let mut header = match self.header(dev, Step::Request) {
            Ok(header) => header,
            Err(error) => {
                self.finish(RngStatus::default());
                return Err(nb::Error::Other(error));
            }
        };
        if variant == Variant::SingleSidedAck {
            header.fctrl = FCTRL_DATA_ACK_REQ;
        }
        *self.frames.advance() = TwrFrame::new(header);

        let timeout = match variant {
            Variant::SingleSidedAck => {
                self.config.tx_holdoff_delay
                    + self.durations.ack
                    + self.durations.response
                    + self.config.rx_timeout_delay
            }
            _ => self.reply_timeout(self.durations.response),
        };

        self.phase = if variant == Variant::SingleSidedAck {
            Phase::AwaitAck
        }
        else {
            Phase::AwaitT1
        };
        debug!("rng: request {:?} to {:#06x}", variant, dst);

        match self.send_current(dev, TwrKind::Request, None, Some(timeout)) {
            Ok(status) => Ok(status),
            Err(error) => {
                self.finish(RngStatus::default());
                Err(nb::Error::Other(error))
            }
        }
    }

    /// Waits for a request for up to `timeout` UWB microseconds
    ///
    /// A timeout of zero listens until a request arrives or the exchange is
    /// aborted.
    pub fn listen<R: Radio>(&mut self, dev: &mut Device<R>, timeout: u32) -> nb::Result<RngStatus, Error> {
        if !self.sem.try_acquire() {
            return Err(nb::Error::WouldBlock);
        }
        self.refresh(dev);
        stat_inc!(self.stats, listen);

        self.status = RngStatus::default();
        self.phase = Phase::Listening;
        self.listen_timeout = timeout;

        let status = dev.listen(None, timeout);
        if status.start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            self.finish(status.into());
        }
        Ok(self.status)
    }

    /// Returns the status of the last exchange once it is over
    pub fn wait(&self) -> nb::Result<RngStatus, Error> {
        if self.sem.is_held() {
            return Err(nb::Error::WouldBlock);
        }
        Ok(self.status)
    }

    /// Ends the exchange in flight
    ///
    /// Returns `false` if there was none.
    pub fn abort<R: Radio>(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        dev.stop();
        stat_inc!(self.stats, abort);
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
                ack: phy.frame_duration_uus(ACK_LEN),
                response: phy.frame_duration_uus(TwrKind::Response.len()),
                final_: phy.frame_duration_uus(TwrKind::Final.len()),
                final_ext: phy.frame_duration_uus(TwrKind::FinalExt.len()),
            };
        }
    }

    fn reply_timeout(&self, duration: u32) -> u32 {
        self.config.tx_holdoff_delay + duration + self.config.rx_timeout_delay
    }

    fn final_timeout(&self) -> u32 {
        if self.variant.is_extended() {
            self.reply_timeout(self.durations.final_ext)
        }
        else {
            self.reply_timeout(self.durations.final_)
        }
    }

    fn holdoff(&self) -> u64 {
        Duration::from_uus(self.config.tx_holdoff_delay).value()
    }

    fn header<R: Radio>(&self, dev: &Device<R>, step: Step) -> Result<FrameHeader, Error> {
        let code = self.variant.code(step).ok_or(Error::InvalidConfiguration)?;
        Ok(FrameHeader::new(
            code,
            self.exchange.seq_num,
            dev.pan_id.0,
            dev.short_address.0,
            self.exchange.peer,
        ))
    }

    fn ext_payload<R: Radio>(&self, dev: &Device<R>, tx_timestamp: u64) -> ExtPayload {
        ExtPayload {
            utime: dev.clock.wcs.local_to_master64(tx_timestamp),
            cartesian: self.position,
            spherical_variance: self.variance,
        }
    }

    /// Sends the current frame, ends the exchange on a start error
    fn send_current<R: Radio>(
        &mut self,
        dev: &mut Device<R>,
        kind: TwrKind,
        at: Option<u64>,
        timeout: Option<u32>,
    ) -> Result<RngStatus, Error> {
        let mut buf = [0; MAX_FRAME_LEN];
        let len = self.frames.current().encode(kind, &mut buf)?;
        let status = dev.transmit(&buf[..len], at, timeout);
        self.check_start(status);
        Ok(self.status)
    }

    /// Returns `false` and ends the exchange if the radio didn't start
    fn check_start(&mut self, status: RadioStatus) -> bool {
        if status.start_tx_error {
            warn!("rng: transmission started too late");
            stat_inc!(self.stats, start_tx_error);
            self.finish(status.into());
            return false;
        }
        true
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

    fn post<R: Radio>(&mut self, dev: &mut Device<R>, tof: f64, ext: Option<ExtPayload>) {
        let diagnostics = dev.radio.rx_diagnostics();
        let phy = *dev.phy();
        let rssi = rssi_dbm(
            diagnostics.cir_power,
            diagnostics.preamble_count,
            phy.pulse_repetition_frequency,
        );

        let mut range = tof_to_meters(tof);
        if let (true, Some(rssi)) = (self.config.bias_correction, rssi) {
            range -= range_bias_cm(rssi, &phy) as f64 / 100.0;
        }

        let result = RangeResult {
            variant: self.variant,
            initiator: self.exchange.initiator,
            peer: self.exchange.peer,
            seq_num: self.exchange.seq_num,
            tof,
            range,
            rssi,
            ext,
        };
        if self.results.post(result).is_err() {
            warn!("rng: result queue full");
        }
    }

    /// Skew of the peer's clock relative to ours, from the last reception
    fn peer_skew<R: Radio>(&self, dev: &mut Device<R>) -> f64 {
        let carrier_integrator = dev.radio.rx_diagnostics().carrier_integrator;
        clock_offset_ratio(carrier_integrator, dev.phy())
    }

    /// Checks the header of a received frame against the exchange
    fn accepts(&self, header: &FrameHeader, own_address: u16) -> bool {
        header.dst_address == own_address
            && header.src_address == self.exchange.peer
            && header.seq_num == self.exchange.seq_num
    }

    fn on_request<R: Radio>(&mut self, dev: &mut Device<R>, variant: Variant, frame: &[u8]) -> bool {
        let header = match TwrFrame::decode(TwrKind::Request, frame) {
            Ok(Some(request)) => request.header,
            _ => return false,
        };
        if header.dst_address != dev.short_address.0 {
            return false;
        }

        if variant == Variant::SingleSidedAck {
            let key = (header.src_address, header.seq_num);
            if self.last_ack_request == Some(key) {
                // Repeated by a relay
                stat_inc!(self.stats, duplicate);
                let status = dev.listen(None, self.listen_timeout);
                if status.start_rx_error {
                    stat_inc!(self.stats, start_rx_error);
                    self.finish(status.into());
                }
                return true;
            }
            self.last_ack_request = Some(key);
        }

        let reception = dev.radio.read_rxtime();
        self.variant = variant;
        self.exchange = Exchange {
            initiator: false,
            peer: header.src_address,
            seq_num: header.seq_num,
            ..Exchange::default()
        };
        self.exchange.first.reception = reception as u32;
        trace!("rng: request from {:#06x}", header.src_address);

        if variant == Variant::SingleSidedAck {
            let mut buf = [0; ACK_LEN];
            if encode_ack(&mut buf, header.seq_num).is_err() {
                self.finish(RngStatus::default());
                return true;
            }
            self.phase = Phase::SendingAck;
            let status = dev.transmit(&buf, None, None);
            self.check_start(status);
            return true;
        }

        let at = (reception + self.holdoff()) & TIME_MAX;
        self.send_t1(dev, at);
        true
    }

    fn send_t1<R: Radio>(&mut self, dev: &mut Device<R>, at: u64) {
        let transmission = dev.delayed_tx_timestamp(at);
        self.exchange.first.transmission = transmission as u32;

        let header = match self.header(dev, Step::T1) {
            Ok(header) => header,
            Err(_) => return self.finish(RngStatus::default()),
        };
        let frame = self.frames.advance();
        *frame = TwrFrame::new(header);
        frame.reception_timestamp = self.exchange.first.reception;
        frame.transmission_timestamp = self.exchange.first.transmission;

        // The second request is as long as the final
        let timeout = self.final_timeout();
        self.phase = if self.variant.is_double_sided() {
            Phase::AwaitT2
        }
        else {
            Phase::AwaitFinal
        };
        if self.send_current(dev, TwrKind::Response, Some(at), Some(timeout)).is_err() {
            self.finish(RngStatus::default());
        }
    }

    fn on_t1<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let t1 = match TwrFrame::decode(TwrKind::Response, frame) {
            Ok(Some(t1)) if self.accepts(&t1.header, dev.short_address.0) => t1,
            _ => return false,
        };
        let rx_timestamp = dev.radio.read_rxtime();
        *self.frames.advance() = t1;

        let first = &mut self.exchange.first;
        if self.variant != Variant::SingleSidedAck {
            first.response = rx_timestamp as u32;
        }
        first.reception = t1.reception_timestamp;
        first.transmission = t1.transmission_timestamp;

        let at = (rx_timestamp + self.holdoff()) & TIME_MAX;
        let tx_timestamp = dev.delayed_tx_timestamp(at);

        let step = if self.variant.is_double_sided() { Step::T2 } else { Step::Final };
        let header = match self.header(dev, step) {
            Ok(header) => header,
            Err(_) => {
                self.finish(RngStatus::default());
                return true;
            }
        };
        let mut next = TwrFrame::new(header);

        if self.variant.is_double_sided() {
            // The initiator's half of both legs
            self.exchange.second.reception = rx_timestamp as u32;
            self.exchange.second.transmission = tx_timestamp as u32;
            next.set_timestamps(&Timestamps {
                request: self.exchange.first.request,
                response: self.exchange.first.response,
                reception: self.exchange.second.reception,
                transmission: self.exchange.second.transmission,
            });
        }
        else {
            let skew = self.peer_skew(dev);
            let tof = calc_tof_ss(&self.exchange.first, skew);
            self.post(dev, tof, None);
            next.set_timestamps(&self.exchange.first);
        }
        if self.variant.is_extended() {
            next.ext = self.ext_payload(dev, tx_timestamp);
        }
        *self.frames.advance() = next;

        let kind = self.variant.kind(step);
        let result = if self.variant.is_double_sided() {
            self.phase = Phase::AwaitFinal;
            let timeout = self.final_timeout();
            self.send_current(dev, kind, Some(at), Some(timeout))
        }
        else {
            self.phase = Phase::SendingFinal;
            self.send_current(dev, kind, Some(at), None)
        };
        if result.is_err() {
            self.finish(RngStatus::default());
        }
        true
    }

    fn on_t2<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let kind = self.variant.kind(Step::T2);
        let t2 = match TwrFrame::decode(kind, frame) {
            Ok(Some(t2)) if self.accepts(&t2.header, dev.short_address.0) => t2,
            _ => return false,
        };
        let rx_timestamp = dev.radio.read_rxtime();
        *self.frames.advance() = t2;

        self.exchange.first.request = t2.request_timestamp;
        self.exchange.first.response = t2.response_timestamp;
        self.exchange.second = Timestamps {
            request: self.exchange.first.transmission,
            response: rx_timestamp as u32,
            reception: t2.reception_timestamp,
            transmission: t2.transmission_timestamp,
        };

        let tof = calc_tof_ds(&self.exchange.first, &self.exchange.second);
        let ext = if self.variant.is_extended() { Some(t2.ext) } else { None };
        self.post(dev, tof, ext);

        let header = match self.header(dev, Step::Final) {
            Ok(header) => header,
            Err(_) => {
                self.finish(RngStatus::default());
                return true;
            }
        };
        let at = (rx_timestamp + self.holdoff()) & TIME_MAX;
        let mut last = TwrFrame::new(header);
        last.set_timestamps(&self.exchange.second);
        if self.variant.is_extended() {
            last.ext = self.ext_payload(dev, dev.delayed_tx_timestamp(at));
        }
        *self.frames.advance() = last;

        self.phase = Phase::SendingFinal;
        if self.send_current(dev, kind, Some(at), None).is_err() {
            self.finish(RngStatus::default());
        }
        true
    }

    fn on_final<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        let kind = self.variant.kind(Step::Final);
        let last = match TwrFrame::decode(kind, frame) {
            Ok(Some(last)) if self.accepts(&last.header, dev.short_address.0) => last,
            _ => return false,
        };
        *self.frames.advance() = last;
        let ext = if self.variant.is_extended() { Some(last.ext) } else { None };

        let tof = if self.exchange.initiator {
            self.exchange.second = last.timestamps();
            calc_tof_ds(&self.exchange.first, &self.exchange.second)
        }
        else {
            self.exchange.first = last.timestamps();
            // The carrier integrator measured the initiator, the formula
            // wants the responder relative to the initiator
            let skew = -self.peer_skew(dev);
            calc_tof_ss(&self.exchange.first, skew)
        };
        self.post(dev, tof, ext);
        self.complete();
        true
    }

    fn on_ack<R: Radio>(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        if decode_ack(frame) != Some(self.exchange.seq_num) {
            return false;
        }
        self.exchange.first.response = dev.radio.read_rxtime() as u32;
        self.phase = Phase::AwaitT1;

        let timeout = self.reply_timeout(self.durations.response);
        let status = dev.listen(None, timeout);
        if status.start_rx_error {
            stat_inc!(self.stats, start_rx_error);
            self.finish(status.into());
        }
        true
    }
}


impl<R: Radio> MacInterface<R> for Rng {
    fn rx_complete(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        if self.phase == Phase::AwaitAck {
            return self.on_ack(dev, frame);
        }

        let (variant, step) = match peek_frame_code(frame).and_then(Variant::from_code) {
            Some(found) => found,
            None => return false,
        };
        if self.phase != Phase::Listening && variant != self.variant {
            return false;
        }

        let handled = match (self.phase, step) {
            (Phase::Listening, Step::Request) => self.on_request(dev, variant, frame),
            (Phase::AwaitT1, Step::T1) => self.on_t1(dev, frame),
            (Phase::AwaitT2, Step::T2) => self.on_t2(dev, frame),
            (Phase::AwaitFinal, Step::Final) => self.on_final(dev, frame),
            _ => false,
        };
        if handled {
            stat_inc!(self.stats, rx_complete);
        }
        handled
    }

    fn tx_complete(&mut self, dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        match self.phase {
            Phase::Idle | Phase::Listening => return false,
            Phase::AwaitAck | Phase::AwaitT1 => {
                self.exchange.first.request = dev.radio.read_txtime() as u32;
            }
            Phase::SendingAck => {
                let transmission = dev.radio.read_txtime();
                let at = (transmission + self.holdoff()) & TIME_MAX;
                stat_inc!(self.stats, tx_complete);
                self.send_t1_after_ack(dev, transmission, at);
                return true;
            }
            Phase::SendingFinal => {
                self.complete();
            }
            Phase::AwaitT2 | Phase::AwaitFinal => {}
        }
        stat_inc!(self.stats, tx_complete);
        true
    }

    fn rx_timeout(&mut self, _dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        trace!("rng: rx timeout");
        stat_inc!(self.stats, rx_timeout);
        self.finish(RngStatus {
            rx_timeout_error: true,
            ..RngStatus::default()
        });
        true
    }

    fn rx_error(&mut self, _dev: &mut Device<R>) -> bool {
        if !self.sem.is_held() {
            return false;
        }
        stat_inc!(self.stats, rx_error);
        self.finish(RngStatus {
            rx_error: true,
            ..RngStatus::default()
        });
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

impl Rng {
    /// The acknowledgement is out; its transmission time is the timed reply
    fn send_t1_after_ack<R: Radio>(&mut self, dev: &mut Device<R>, transmission: u64, at: u64) {
        let header = match self.header(dev, Step::T1) {
            Ok(header) => header,
            Err(_) => return self.finish(RngStatus::default()),
        };
        self.exchange.first.transmission = transmission as u32;

        let frame = self.frames.advance();
        *frame = TwrFrame::new(header);
        frame.reception_timestamp = self.exchange.first.reception;
        frame.transmission_timestamp = self.exchange.first.transmission;

        self.phase = Phase::AwaitFinal;
        let timeout = self.final_timeout();
        if self.send_current(dev, TwrKind::Response, Some(at), Some(timeout)).is_err() {
            self.finish(RngStatus::default());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::sim::{expire, transfer, SimClock, SimRadio};

    const TOF: u64 = 1000;

    fn node(short_address: u16) -> Node<SimRadio> {
        clocked_node(short_address, SimClock::default())
    }

    fn clocked_node(short_address: u16, clock: SimClock) -> Node<SimRadio> {
        let dev = Device::new(SimRadio::new(clock), 0x1000 + short_address as u64, short_address);
        Node::new(dev).with_rng(Rng::new(RngConfig::default())).unwrap()
    }

    fn responder_and_initiator() -> (Node<SimRadio>, Node<SimRadio>) {
        let mut responder = node(0x0001);
        let initiator = node(0x0002);
        responder.rng.as_mut().unwrap().listen(&mut responder.dev, 0).unwrap();
        (responder, initiator)
    }

    fn assert_range(result: Option<RangeResult>, initiator: bool) {
        let result = result.unwrap();
        assert_eq!(result.initiator, initiator);
        assert!((result.tof - TOF as f64).abs() < 1.0, "tof {}", result.tof);
        assert!((result.range - tof_to_meters(TOF as f64)).abs() < 0.01);
    }

    #[test]
    fn double_sided_exchange() {
        let (mut a, mut b) = responder_and_initiator();
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::DoubleSided).unwrap();
        assert_eq!(b.rng.as_ref().unwrap().sem_count(), 0);

        assert!(transfer(&mut b, &mut a, TOF)); // request
        assert!(transfer(&mut a, &mut b, TOF)); // T1
        assert!(transfer(&mut b, &mut a, TOF)); // T2
        assert!(transfer(&mut a, &mut b, TOF)); // final

        for (node, initiator) in [(&mut a, false), (&mut b, true)] {
            let rng = node.rng.as_mut().unwrap();
            assert_eq!(rng.sem_count(), 1);
            assert!(rng.status().complete);
            assert_range(rng.pop_result(), initiator);
            assert!(rng.pop_result().is_none());
        }
    }

    #[test]
    fn single_sided_exchange() {
        let (mut a, mut b) = responder_and_initiator();
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::SingleSided).unwrap();

        assert!(transfer(&mut b, &mut a, TOF)); // request
        assert!(transfer(&mut a, &mut b, TOF)); // T1
        assert!(transfer(&mut b, &mut a, TOF)); // final

        assert_range(b.rng.as_mut().unwrap().pop_result(), true);
        assert_range(a.rng.as_mut().unwrap().pop_result(), false);
        assert_eq!(a.rng.as_ref().unwrap().wait(), Ok(RngStatus { complete: true, ..RngStatus::default() }));
        assert_eq!(b.rng.as_ref().unwrap().sem_count(), 1);
    }

    /// The responder runs 20 ppm fast, the initiator 10 ppm slow. Uncorrected,
    /// the 30 ppm over the reply time would put the flight time off by
    /// about 2000 DTU.
    fn skewed_pair() -> (Node<SimRadio>, Node<SimRadio>) {
        let mut responder = clocked_node(0x0001, SimClock { offset: 0x10_0000, ppm: 20.0 });
        let initiator = clocked_node(0x0002, SimClock { offset: 0, ppm: -10.0 });
        responder.rng.as_mut().unwrap().listen(&mut responder.dev, 0).unwrap();
        (responder, initiator)
    }

    #[test]
    fn single_sided_corrects_the_clock_offset() {
        let (mut a, mut b) = skewed_pair();
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::SingleSided).unwrap();

        assert!(transfer(&mut b, &mut a, TOF)); // request
        assert!(transfer(&mut a, &mut b, TOF)); // T1
        assert!(b.dev.radio.diagnostics.carrier_integrator != 0);
        assert!(transfer(&mut b, &mut a, TOF)); // final

        for node in [&mut a, &mut b] {
            let result = node.rng.as_mut().unwrap().pop_result().unwrap();
            assert!((result.tof - TOF as f64).abs() < 5.0, "tof {}", result.tof);
        }
    }

    #[test]
    fn acknowledged_corrects_the_clock_offset() {
        let (mut a, mut b) = skewed_pair();
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::SingleSidedAck).unwrap();

        assert!(transfer(&mut b, &mut a, TOF)); // request
        assert!(transfer(&mut a, &mut b, TOF)); // acknowledgement
        assert!(transfer(&mut a, &mut b, TOF)); // T1
        assert!(transfer(&mut b, &mut a, TOF)); // final

        for node in [&mut a, &mut b] {
            let result = node.rng.as_mut().unwrap().pop_result().unwrap();
            assert!((result.tof - TOF as f64).abs() < 5.0, "tof {}", result.tof);
        }
    }

    #[test]
    fn acknowledged_exchange() {
        let (mut a, mut b) = responder_and_initiator();
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::SingleSidedAck).unwrap();

        assert!(transfer(&mut b, &mut a, TOF)); // request
        assert!(transfer(&mut a, &mut b, TOF)); // acknowledgement
        assert!(transfer(&mut a, &mut b, TOF)); // T1
        assert!(transfer(&mut b, &mut a, TOF)); // final

        let result = b.rng.as_mut().unwrap().pop_result().unwrap();
        assert_eq!(result.variant, Variant::SingleSidedAck);
        assert!((result.tof - TOF as f64).abs() < 1.0);
        assert!(a.rng.as_ref().unwrap().status().complete);
    }

    #[test]
    fn extended_final_carries_the_position() {
        let (mut a, mut b) = responder_and_initiator();
        let position = Triad { x: 1.0, y: 2.0, z: 3.0 };
        let rng = b.rng.as_mut().unwrap();
        rng.set_position(position, Triad::default());
        rng.request(&mut b.dev, 0x0001, Variant::SingleSidedExt).unwrap();

        assert!(transfer(&mut b, &mut a, TOF));
        assert!(transfer(&mut a, &mut b, TOF));
        assert!(transfer(&mut b, &mut a, TOF));

        let result = a.rng.as_mut().unwrap().pop_result().unwrap();
        assert_eq!(result.ext.map(|ext| ext.cartesian), Some(position));
    }

    #[test]
    fn busy_while_in_flight() {
        let mut b = node(0x0002);
        let rng = b.rng.as_mut().unwrap();
        rng.request(&mut b.dev, 0x0001, Variant::DoubleSided).unwrap();
        assert_eq!(rng.request(&mut b.dev, 0x0001, Variant::DoubleSided), Err(nb::Error::WouldBlock));
        assert_eq!(rng.wait(), Err(nb::Error::WouldBlock));
    }

    #[test]
    fn no_reply_times_out() {
        let mut b = node(0x0002);
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::SingleSided).unwrap();
        b.dev.radio.take_frame();
        b.tx_complete();

        assert!(expire(&mut b));
        let rng = b.rng.as_ref().unwrap();
        assert!(rng.status().rx_timeout_error);
        assert_eq!(rng.sem_count(), 1);
        assert_eq!(rng.stats.rx_timeout, 1);
    }

    #[test]
    fn late_start_ends_the_exchange() {
        let mut b = node(0x0002);
        b.dev.radio.fail_next_tx = true;
        let status = b.rng.as_mut().unwrap().request(&mut b.dev, 0x0001, Variant::DoubleSided).unwrap();
        assert!(status.start_tx_error);
        assert_eq!(b.rng.as_ref().unwrap().sem_count(), 1);
    }

    #[test]
    fn events_without_an_exchange_are_not_claimed() {
        let mut b = node(0x0002);
        assert!(!b.rx_timeout());
        assert!(!b.tx_complete());
        assert!(!b.rx_error());
    }

    #[test]
    fn abort_releases_the_listener() {
        let (mut a, _) = responder_and_initiator();
        let rng = a.rng.as_mut().unwrap();
        assert!(rng.abort(&mut a.dev));
        assert!(rng.status().aborted);
        assert!(!rng.abort(&mut a.dev));
        assert!(!a.dev.radio.rx_enabled);
    }

    #[test]
    fn request_for_someone_else_is_ignored() {
        let mut a = node(0x0001);
        let mut b = node(0x0002);
        a.rng.as_mut().unwrap().listen(&mut a.dev, 1000).unwrap();
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0003, Variant::DoubleSided).unwrap();
        assert!(!transfer(&mut b, &mut a, TOF));
        assert_eq!(a.rng.as_ref().unwrap().sem_count(), 0);

        // The listener is still there, for the rest of its window
        assert!(a.dev.radio.rx_enabled);
        assert!(a.dev.radio.rx_timeout > 0 && a.dev.radio.rx_timeout <= 1000);
        assert!(expire(&mut a));
        let rng = a.rng.as_ref().unwrap();
        assert_eq!(rng.sem_count(), 1);
        assert!(rng.status().rx_timeout_error);
    }

    #[test]
    fn foreign_frame_after_the_window_times_out() {
        let mut a = node(0x0001);
        let mut b = node(0x0002);
        a.rng.as_mut().unwrap().listen(&mut a.dev, 10).unwrap();
        b.dev.radio.advance_micros(1000);
        b.rng.as_mut().unwrap().request(&mut b.dev, 0x0003, Variant::SingleSided).unwrap();
        assert!(!transfer(&mut b, &mut a, TOF));

        let rng = a.rng.as_ref().unwrap();
        assert_eq!(rng.sem_count(), 1);
        assert!(rng.status().rx_timeout_error);
        assert_eq!(rng.stats.rx_timeout, 1);
    }
}

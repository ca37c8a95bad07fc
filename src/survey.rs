//! Site survey
//!
//! Every survey node ranges to all others with a double-sided multi-node
//! exchange, averages its row of the distance matrix over the configured
//! number of rounds and broadcasts it. Rows broadcast by the other nodes
//! fill the rest of the matrix.

use crate::configs::SurveyConfig;
use crate::error::{Error, RadioStatus, RngStatus};
use crate::frame::{
    peek_frame_code, FrameCode, FrameHeader, Message, SurveyBroadcast, BROADCAST, MAX_FRAME_LEN,
    SURVEY_ROW_LEN,
};
use crate::logging::{debug, trace};
use crate::mac::{Device, MacInterface};
use crate::nrng::{Nrng, NrngMode, NrngResult};
use crate::radio::Radio;


/// Maximum number of survey nodes
pub const SURVEY_MAX_NODES: usize = SURVEY_ROW_LEN;


stats! {
    /// Counters of the site survey
    pub struct SurveyStats {
        request,
        collect,
        invalid,
        broadcast,
        rx_row,
        rx_timeout,
        start_tx_error,
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
    Broadcasting,
}


/// A site survey instance
pub struct Survey {
    config: SurveyConfig,
    phase: Phase,
    seq: u16,
    round: u16,
    listen_timeout: u32,
    ranges: [[f32; SURVEY_MAX_NODES]; SURVEY_MAX_NODES],
    masks: [u16; SURVEY_MAX_NODES],
    counts: [u16; SURVEY_MAX_NODES],

    /// Statistics
    pub stats: SurveyStats,
}

impl Survey {
    /// Creates an instance
    ///
    /// Fails if `config.nnodes` exceeds [`SURVEY_MAX_NODES`].
    pub fn new(config: SurveyConfig) -> Result<Self, Error> {
        if config.nnodes as usize > SURVEY_MAX_NODES || config.rounds == 0 {
            return Err(Error::InvalidConfiguration);
        }
        Ok(Survey {
            config,
            phase: Phase::Idle,
            seq: 0,
            round: 0,
            listen_timeout: 0,
            ranges: [[0.0; SURVEY_MAX_NODES]; SURVEY_MAX_NODES],
            masks: [0; SURVEY_MAX_NODES],
            counts: [0; SURVEY_MAX_NODES],
            stats: SurveyStats::default(),
        })
    }

    /// Sequence number of the current survey
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Mask of all survey nodes
    pub fn all_nodes(&self) -> u16 {
        if self.config.nnodes >= 16 {
            0xffff
        }
        else {
            (1u16 << self.config.nnodes) - 1
        }
    }

    /// Forgets the matrix and starts a new survey
    pub fn restart(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.round = 0;
        self.ranges = [[0.0; SURVEY_MAX_NODES]; SURVEY_MAX_NODES];
        self.masks = [0; SURVEY_MAX_NODES];
        self.counts = [0; SURVEY_MAX_NODES];
    }

    /// Ranges to every other survey node through `nrng`
    ///
    /// A new survey starts once all rounds of the last one are done.
    pub fn request<R: Radio>(
        &mut self,
        dev: &mut Device<R>,
        nrng: &mut Nrng,
    ) -> nb::Result<RngStatus, Error> {
        let own = dev.slot_id;
        if own as usize >= self.config.nnodes as usize {
            return Err(nb::Error::Other(Error::SlotOutOfRange { index: own }));
        }
        let mask = self.all_nodes() & !(1 << own);
        let status = nrng.request(dev, mask, NrngMode::DoubleSided)?;

        if self.round >= self.config.rounds {
            self.restart();
        }
        self.round += 1;
        stat_inc!(self.stats, request);
        Ok(status)
    }

    /// Adds the ranges of an exchange to this node's row
    ///
    /// Every entry is the mean over the rounds it answered in. Ranges that
    /// aren't finite are left out.
    pub fn collect<R: Radio>(&mut self, dev: &Device<R>, result: &NrngResult) {
        let own = dev.slot_id as usize;
        if own >= SURVEY_MAX_NODES {
            return;
        }
        for range in result.ranges.iter().filter(|r| (r.slot_id as usize) < SURVEY_MAX_NODES) {
            if !range.range.is_finite() {
                stat_inc!(self.stats, invalid);
                continue;
            }
            let slot = range.slot_id as usize;
            let count = self.counts[slot] as f32;
            let mean = &mut self.ranges[own][slot];
            *mean = (*mean * count + range.range as f32) / (count + 1.0);
            self.counts[slot] += 1;
            self.masks[own] |= 1 << slot;
        }
        stat_inc!(self.stats, collect);
        trace!("survey: row {} mask {:#06x}", own, self.masks[own]);
    }

    /// Broadcasts this node's row, at `at` or right away
    ///
    /// A broadcast that could not be started shows in the returned status.
    pub fn broadcast<R: Radio>(
        &mut self,
        dev: &mut Device<R>,
        at: Option<u64>,
    ) -> nb::Result<RadioStatus, Error> {
        if self.phase == Phase::Broadcasting {
            return Err(nb::Error::WouldBlock);
        }
        let own = dev.slot_id as usize;
        let row = self.row(own).ok_or(nb::Error::Other(Error::SlotOutOfRange { index: dev.slot_id }))?;
        let frame = SurveyBroadcast {
            header: FrameHeader::new(
                FrameCode::SurveyBroadcast,
                dev.next_seq(),
                dev.pan_id.0,
                dev.short_address.0,
                BROADCAST,
            ),
            seq: self.seq,
            slot_id: dev.slot_id,
            mask: self.masks[own],
            ranges: *row,
        };

        let mut buf = [0; MAX_FRAME_LEN];
        let len = frame.encode(&mut buf).map_err(nb::Error::Other)?;
        let status = dev.transmit(&buf[..len], at, None);
        if status.start_tx_error {
            stat_inc!(self.stats, start_tx_error);
            return Ok(status);
        }
        stat_inc!(self.stats, broadcast);
        self.phase = Phase::Broadcasting;
        Ok(status)
    }

    /// Listens for the rows of the other nodes
    pub fn listen<R: Radio>(&mut self, dev: &mut Device<R>, timeout: u32) -> bool {
        self.listen_timeout = timeout;
        if dev.listen(None, timeout).start_rx_error {
            return false;
        }
        self.phase = Phase::Listening;
        true
    }

    /// The row of the node in slot `slot`
    pub fn row(&self, slot: usize) -> Option<&[f32; SURVEY_MAX_NODES]> {
        self.ranges.get(slot)
    }

    /// The nodes the row of `slot` has ranges to
    pub fn mask(&self, slot: usize) -> u16 {
        self.masks.get(slot).copied().unwrap_or(0)
    }

    /// Range from `from` to `to` in meters, as measured by `from`
    pub fn range(&self, from: usize, to: usize) -> Option<f32> {
        if to >= SURVEY_MAX_NODES || self.mask(from) & (1 << to) == 0 {
            return None;
        }
        Some(self.ranges[from][to])
    }

    /// Returns `true` once every survey node's row has arrived
    pub fn is_complete(&self) -> bool {
        (0..self.config.nnodes as usize).all(|slot| {
            let others = self.all_nodes() & !(1 << slot);
            others == 0 || self.masks[slot] != 0
        })
    }
}


impl<R: Radio> MacInterface<R> for Survey {
    fn rx_complete(&mut self, dev: &mut Device<R>, frame: &[u8]) -> bool {
        if peek_frame_code(frame) != Some(FrameCode::SurveyBroadcast) {
            return false;
        }
        let row = match SurveyBroadcast::decode(frame) {
            Ok(Some(row)) => row,
            _ => return false,
        };
        let slot = row.slot_id as usize;
        if slot < self.config.nnodes as usize && slot != dev.slot_id as usize {
            self.ranges[slot] = row.ranges;
            self.masks[slot] = row.mask;
            stat_inc!(self.stats, rx_row);
            debug!("survey: row of slot {} from survey {}", slot, row.seq);
        }
        if self.phase == Phase::Listening && dev.listen(None, self.listen_timeout).start_rx_error {
            self.phase = Phase::Idle;
        }
        true
    }

    fn tx_complete(&mut self, _dev: &mut Device<R>) -> bool {
        if self.phase != Phase::Broadcasting {
            return false;
        }
        self.phase = Phase::Idle;
        true
    }

    fn rx_timeout(&mut self, _dev: &mut Device<R>) -> bool {
        if self.phase != Phase::Listening {
            return false;
        }
        stat_inc!(self.stats, rx_timeout);
        self.phase = Phase::Idle;
        true
    }

    fn reset(&mut self, _dev: &mut Device<R>) -> bool {
        self.phase = Phase::Idle;
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::nrng::NodeRange;
    use crate::sim::{transfer, SimClock, SimRadio};

    fn result(ranges: &[(u16, f64)]) -> NrngResult {
        let mut result = NrngResult {
            mode: NrngMode::DoubleSided,
            seq_num: 1,
            slot_mask: 0b1110,
            ranges: heapless::Vec::new(),
        };
        for &(slot_id, range) in ranges {
            result
                .ranges
                .push(NodeRange { slot_id, address: slot_id, tof: 0.0, range })
                .unwrap();
        }
        result
    }

    #[test]
    fn rows_average_over_rounds() {
        let dev = Device::new(SimRadio::new(SimClock::default()), 1, 1);
        let mut survey = Survey::new(SurveyConfig { nnodes: 4, rounds: 2 }).unwrap();

        survey.collect(&dev, &result(&[(1, 2.0), (2, 4.0)]));
        survey.collect(&dev, &result(&[(1, 3.0)]));

        assert_eq!(survey.range(0, 1), Some(2.5));
        assert_eq!(survey.range(0, 2), Some(4.0));
        assert_eq!(survey.range(0, 3), None);
        assert_eq!(survey.mask(0), 0b0110);
        assert!(!survey.is_complete());
    }

    #[test]
    fn broken_ranges_are_left_out() {
        let dev = Device::new(SimRadio::new(SimClock::default()), 1, 1);
        let mut survey = Survey::new(SurveyConfig { nnodes: 4, rounds: 2 }).unwrap();

        survey.collect(&dev, &result(&[(1, f64::NAN), (2, 4.0)]));
        survey.collect(&dev, &result(&[(1, 3.0)]));

        assert_eq!(survey.range(0, 1), Some(3.0));
        assert_eq!(survey.range(0, 2), Some(4.0));
        assert_eq!(survey.stats.invalid, 1);
    }

    fn node(slot_id: u16) -> Node<SimRadio> {
        let mut dev = Device::new(SimRadio::new(SimClock::default()), 0x40 + slot_id as u64, 0x40 + slot_id);
        dev.slot_id = slot_id;
        let survey = Survey::new(SurveyConfig { nnodes: 2, rounds: 1 }).unwrap();
        Node::new(dev).with_survey(survey).unwrap()
    }

    #[test]
    fn rows_reach_the_other_nodes() {
        let mut a = node(0);
        let mut b = node(1);
        a.survey.as_mut().unwrap().collect(&a.dev, &result(&[(1, 2.0)]));
        b.survey.as_mut().unwrap().collect(&b.dev, &result(&[(0, 2.1)]));
        assert!(!b.survey.as_ref().unwrap().is_complete());

        assert!(b.survey.as_mut().unwrap().listen(&mut b.dev, 0));
        let status = a.survey.as_mut().unwrap().broadcast(&mut a.dev, None).unwrap();
        assert!(!status.is_err());
        assert!(transfer(&mut a, &mut b, 300));

        let survey = b.survey.as_ref().unwrap();
        assert_eq!(survey.stats.rx_row, 1);
        assert_eq!(survey.mask(0), 0b10);
        assert_eq!(survey.range(0, 1), Some(2.0));
        assert_eq!(survey.range(1, 0), Some(2.1));
        assert!(survey.is_complete());
        // Still listening for more rows
        assert!(b.dev.radio.rx_enabled);

        // The broadcast is out, the next one can go
        assert_eq!(a.survey.as_ref().unwrap().stats.broadcast, 1);
        let status = a.survey.as_mut().unwrap().broadcast(&mut a.dev, None).unwrap();
        assert!(!status.is_err());
    }

    #[test]
    fn broadcast_that_did_not_start_is_reported() {
        let mut a = node(0);
        a.dev.radio.fail_next_tx = true;
        let status = a.survey.as_mut().unwrap().broadcast(&mut a.dev, None).unwrap();
        assert!(status.start_tx_error);
        assert_eq!(a.survey.as_ref().unwrap().stats.start_tx_error, 1);
        assert_eq!(a.survey.as_ref().unwrap().stats.broadcast, 0);
        assert!(a.dev.radio.take_frame().is_none());
    }

    #[test]
    fn too_many_nodes() {
        assert!(Survey::new(SurveyConfig { nnodes: 17, rounds: 1 }).is_err());
        assert_eq!(Survey::new(SurveyConfig { nnodes: 16, rounds: 1 }).map(|s| s.all_nodes()).ok(), Some(0xffff));
    }
}

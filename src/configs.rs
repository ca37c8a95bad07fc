//! Configuration structs for the radio PHY and the protocol services
//!
//! This module houses the datastructures that control how frames are
//! transmitted and received, and how each service times its exchanges. All
//! protocol delays are given in UWB microseconds (UUS, 65536 DTU) unless a
//! field says otherwise.

#[allow(unused_imports)]
// Not used on x86, but used on mcu target due to f32 core lib sillyness.
use micromath::F32Ext;

use crate::time::Duration;


/// Length of the frame check sequence appended by the radio
pub const FCS_LEN: usize = 2;

/// Number of data bits protected by one Reed-Solomon block
const RS_BLOCK_BITS: u32 = 330;

/// Number of parity bits added per Reed-Solomon block
const RS_PARITY_BITS: u32 = 48;

/// Number of bits in the PHY header
const PHR_BITS: u32 = 21;


/// PHY configuration of a radio
///
/// Holds everything needed to compute on-air durations of frames, which the
/// services use to place delayed transmissions and receive timeouts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhyConfig {
    /// The channel that the radio transmits and listens at
    pub channel: UwbChannel,
    /// Sets the bitrate of the transmission
    pub bitrate: BitRate,
    /// Sets the PRF value of the transmission
    pub pulse_repetition_frequency: PulseRepetitionFrequency,
    /// The length of the preamble
    pub preamble_length: PreambleLength,
    /// The SFD sequence that is used to transmit a frame
    pub sfd_sequence: SfdSequence,
    /// Transmit antenna delay in DTU
    pub tx_antenna_delay: u16,
    /// Receive antenna delay in DTU
    pub rx_antenna_delay: u16,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            channel: Default::default(),
            bitrate: Default::default(),
            pulse_repetition_frequency: Default::default(),
            preamble_length: Default::default(),
            sfd_sequence: Default::default(),
            tx_antenna_delay: 0x4042,
            rx_antenna_delay: 0x4042,
        }
    }
}

impl PhyConfig {
    /// Duration of one preamble symbol in nanoseconds
    pub fn symbol_duration_ns(&self) -> f32 {
        match self.pulse_repetition_frequency {
            PulseRepetitionFrequency::Mhz16 => 993.59,
            PulseRepetitionFrequency::Mhz64 => 1017.63,
        }
    }

    /// Number of symbols in the start-of-frame delimiter
    pub fn sfd_symbols(&self) -> u32 {
        match (self.bitrate, self.sfd_sequence) {
            (BitRate::Kbps110, _) => 64,
            (BitRate::Kbps850, SfdSequence::Decawave) => 16,
            _ => 8,
        }
    }

    /// Duration of one data bit in microseconds
    pub fn bit_duration_us(&self) -> f32 {
        match self.bitrate {
            BitRate::Kbps110 => 8.20513,
            BitRate::Kbps850 => 1.02564,
            BitRate::Kbps6800 => 0.12821,
        }
    }

    /// Duration of the synchronisation header (preamble and SFD) in
    /// microseconds
    pub fn shr_duration_us(&self) -> f32 {
        let symbols = self.preamble_length.symbols() + self.sfd_symbols();
        symbols as f32 * self.symbol_duration_ns() / 1000.0
    }

    /// Duration of the synchronisation header, rounded up to the next DTU
    pub fn shr_duration(&self) -> Duration {
        let nanos = (self.shr_duration_us() * 1000.0).ceil();
        Duration::from_nanos(nanos as u32)
    }

    /// Duration of the PHY header in microseconds
    pub fn phr_duration_us(&self) -> f32 {
        // The PHY header is sent at 850 kbps, unless the data rate is 110 kbps
        let bit_us = match self.bitrate {
            BitRate::Kbps110 => 8.20513,
            _ => 1.02564,
        };
        PHR_BITS as f32 * bit_us
    }

    /// Duration of a PSDU of `psdu_len` bytes (FCS included) in microseconds
    pub fn data_duration_us(&self, psdu_len: usize) -> f32 {
        let bits = psdu_len as u32 * 8;
        let blocks = (bits + RS_BLOCK_BITS - 1) / RS_BLOCK_BITS;
        (bits + blocks * RS_PARITY_BITS) as f32 * self.bit_duration_us()
    }

    /// On-air duration of a frame carrying `len` bytes before the FCS
    pub fn frame_duration_us(&self, len: usize) -> f32 {
        self.shr_duration_us() + self.phr_duration_us() + self.data_duration_us(len + FCS_LEN)
    }

    /// On-air duration of a frame, rounded up to whole UWB microseconds
    pub fn frame_duration_uus(&self, len: usize) -> u32 {
        // 1 UUS is 65536 / 63897.6 µs
        (self.frame_duration_us(len) * (63_897.6 / 65_536.0)).ceil() as u32
    }
}


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// The bitrate at which a message is transmitted
pub enum BitRate {
    /// 110 kilobits per second.
    /// This is an unofficial extension from decawave.
    Kbps110 = 0b00,
    /// 850 kilobits per second.
    Kbps850 = 0b01,
    /// 6.8 megabits per second.
    Kbps6800 = 0b10,
}

impl Default for BitRate {
    fn default() -> Self {
        BitRate::Kbps6800
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// The PRF value
pub enum PulseRepetitionFrequency {
    /// 16 megahertz
    Mhz16 = 0b01,
    /// 64 megahertz
    Mhz64 = 0b10
}

impl Default for PulseRepetitionFrequency {
    fn default() -> Self {
        PulseRepetitionFrequency::Mhz64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// An enum that specifies the length of the preamble.
///
/// Longer preambles improve the reception quality and thus range.
/// This comes at the cost of longer transmission times and thus power
/// consumption and bandwidth use.
pub enum PreambleLength {
    /// 64 symbols of preamble.
    /// Only supported at Bitrate::Kbps6800.
    Symbols64,
    /// 128 symbols of preamble.
    /// Only supported at Bitrate::Kbps850 & Bitrate::Kbps6800.
    Symbols128,
    /// 256 symbols of preamble.
    /// Only supported at Bitrate::Kbps850 & Bitrate::Kbps6800.
    Symbols256,
    /// 512 symbols of preamble.
    /// Only supported at Bitrate::Kbps850 & Bitrate::Kbps6800.
    Symbols512,
    /// 1024 symbols of preamble.
    /// Only supported at Bitrate::Kbps850 & Bitrate::Kbps6800.
    Symbols1024,
    /// 1536 symbols of preamble.
    /// Only supported at Bitrate::Kbps110.
    Symbols1536,
    /// 2048 symbols of preamble.
    /// Only supported at Bitrate::Kbps110.
    Symbols2048,
    /// 4096 symbols of preamble.
    /// Only supported at Bitrate::Kbps110.
    Symbols4096,
}

impl Default for PreambleLength {
    fn default() -> Self {
        PreambleLength::Symbols128
    }
}

impl PreambleLength {
    /// Returns the number of preamble symbols
    pub fn symbols(&self) -> u32 {
        match self {
            PreambleLength::Symbols64 => 64,
            PreambleLength::Symbols128 => 128,
            PreambleLength::Symbols256 => 256,
            PreambleLength::Symbols512 => 512,
            PreambleLength::Symbols1024 => 1024,
            PreambleLength::Symbols1536 => 1536,
            PreambleLength::Symbols2048 => 2048,
            PreambleLength::Symbols4096 => 4096,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// An enum that allows the selection between different SFD sequences
pub enum SfdSequence {
    /// The standard sequence defined by the IEEE standard.
    IEEE,
    /// A sequence defined by Decawave that is supposed to be more robust.
    /// This is an unofficial addition.
    Decawave,
}

impl Default for SfdSequence {
    fn default() -> Self {
        SfdSequence::IEEE
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
/// All the available UWB channels.
pub enum UwbChannel {
    /// Channel 1
    /// - Center frequency: 3494.4 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel1 = 1,
    /// Channel 2
    /// - Center frequency: 3993.6 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel2 = 2,
    /// Channel 3
    /// - Center frequency: 4492.8 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel3 = 3,
    /// Channel 4
    /// - Center frequency: 3993.6 Mhz
    /// - Bandwidth: 1331.2 Mhz
    Channel4 = 4,
    /// Channel 5
    /// - Center frequency: 6489.6 Mhz
    /// - Bandwidth: 499.2 Mhz
    Channel5 = 5,
    /// Channel 7
    /// - Center frequency: 6489.6 Mhz
    /// - Bandwidth: 1081.6 Mhz
    Channel7 = 7,
}

impl Default for UwbChannel {
    fn default() -> Self {
        UwbChannel::Channel5
    }
}

impl UwbChannel {
    /// Center frequency of the channel in Hz
    pub fn center_frequency_hz(&self) -> f64 {
        match self {
            UwbChannel::Channel1 => 3494.4e6,
            UwbChannel::Channel2 | UwbChannel::Channel4 => 3993.6e6,
            UwbChannel::Channel3 => 4492.8e6,
            UwbChannel::Channel5 | UwbChannel::Channel7 => 6489.6e6,
        }
    }

    /// Returns `true` for the 900 MHz wide channels
    pub fn is_wide(&self) -> bool {
        matches!(self, UwbChannel::Channel4 | UwbChannel::Channel7)
    }
}


/// Timing of the two-party ranging exchanges
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RngConfig {
    /// Delay between a reception and the delayed reply
    pub tx_holdoff_delay: u32,
    /// Guard time added to every receive timeout
    pub tx_guard_delay: u32,
    /// Receive timeout on top of the expected frame duration
    pub rx_timeout_delay: u32,
    /// Apply the RSSI dependent range bias to computed ranges
    pub bias_correction: bool,
}

impl Default for RngConfig {
    fn default() -> Self {
        RngConfig {
            tx_holdoff_delay: 0x0800,
            tx_guard_delay: 0x0100,
            rx_timeout_delay: 0x0200,
            bias_correction: false,
        }
    }
}

/// Timing of the multi-node ranging exchanges
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NrngConfig {
    /// Delay between the request reception and the first sub-slot
    pub tx_holdoff_delay: u32,
    /// Gap between two neighbouring sub-slots
    pub tx_guard_delay: u32,
    /// Receive timeout on top of the expected reply window
    pub rx_timeout_delay: u32,
}

impl Default for NrngConfig {
    fn default() -> Self {
        NrngConfig {
            tx_holdoff_delay: 0x0800,
            tx_guard_delay: 0x0040,
            rx_timeout_delay: 0x0200,
        }
    }
}

/// Timing of the reverse-TDOA exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtdoaConfig {
    /// Delay between the request reception and the first sub-slot
    pub tx_holdoff_delay: u32,
    /// Gap between two neighbouring sub-slots
    pub tx_guard_delay: u32,
    /// Receive timeout on top of the expected reply window
    pub rx_timeout_delay: u32,
    /// Maximum number of times a request is relayed
    pub rpt_max: u8,
}

impl Default for RtdoaConfig {
    fn default() -> Self {
        RtdoaConfig {
            tx_holdoff_delay: 0x0800,
            tx_guard_delay: 0x0040,
            rx_timeout_delay: 0x0200,
            rpt_max: 1,
        }
    }
}

/// What a node does with clock calibration packets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcpRole {
    /// Transmits a packet every period
    Master,
    /// Listens and tracks the master
    Slave,
    /// Listens and repeats the packet
    Relay,
}

/// Clock calibration packet configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CcpConfig {
    /// Role of this node
    pub role: CcpRole,
    /// Superframe period
    pub period: u32,
    /// Maximum number of relay hops
    pub rpt_max: u8,
    /// Delay between a relay's reception and its repeat, the same on every
    /// hop
    pub relay_holdoff: u32,
    /// Consecutive receptions needed before the epoch becomes valid
    pub valid_threshold: u16,
    /// Consecutive misses tolerated before the epoch is invalidated
    pub miss_tolerance: u16,
    /// Time a slave opens its receiver before the expected packet
    pub listen_window: u32,
}

impl Default for CcpConfig {
    fn default() -> Self {
        CcpConfig {
            role: CcpRole::Slave,
            period: 0x1_0000,
            rpt_max: 0,
            relay_holdoff: 0x0800,
            valid_threshold: 2,
            miss_tolerance: 4,
            listen_window: 0x0400,
        }
    }
}

/// Which estimator the clock sync uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Estimator {
    /// Ratio of the last master and local intervals
    Ratio,
    /// Three-state (time, skew, drift) Kalman filter
    Timescale,
}

/// Wireless clock sync configuration
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WcsConfig {
    /// The estimator policy
    pub estimator: Estimator,
    /// Process noise of the time, skew and drift states
    pub q: [f64; 3],
    /// Measurement noise of the master timestamp, in seconds squared
    pub r: f64,
}

impl Default for WcsConfig {
    fn default() -> Self {
        WcsConfig {
            estimator: Estimator::Ratio,
            q: [1.0e-20, 1.0e-18, 1.0e-20],
            r: 1.0e-18,
        }
    }
}

/// TDMA scheduler configuration
///
/// Unlike the protocol delays, the scheduler works with the platform's
/// monotonic microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TdmaConfig {
    /// Number of slots per superframe
    pub nslots: u16,
    /// Expected delay between a timer firing and its callback running
    pub os_latency_us: u32,
    /// Slots dispatched later than this are dropped
    pub max_dispatch_latency_us: u32,
    /// Time past the expected superframe before the fallback timer fires
    pub fallback_margin_us: u32,
    /// Consecutive fallback superframes before the cycle is aborted
    pub miss_tolerance: u16,
}

impl Default for TdmaConfig {
    fn default() -> Self {
        TdmaConfig {
            nslots: 16,
            os_latency_us: 100,
            max_dispatch_latency_us: 500,
            fallback_margin_us: 1000,
            miss_tolerance: 3,
        }
    }
}

/// What a node does in the PAN association protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanRole {
    /// Allocates addresses and slots
    Master,
    /// Repeats requests and responses
    Relay,
    /// Requests an address and keeps its lease alive
    Tag,
}

/// PAN association configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PanConfig {
    /// Role of this node
    pub role: PanRole,
    /// Lease handed out by the master, in seconds
    pub lease_time: u16,
    /// A tag renews its lease once it is this close to expiry, in seconds
    pub exp_margin: u16,
    /// Maximum number of relay hops
    pub rpt_max: u8,
    /// Delay between a reception and the delayed reply
    pub tx_holdoff_delay: u32,
    /// Receive timeout of a tag waiting for its response
    pub rx_timeout_delay: u32,
}

impl Default for PanConfig {
    fn default() -> Self {
        PanConfig {
            role: PanRole::Tag,
            lease_time: 3600,
            exp_margin: 60,
            rpt_max: 1,
            tx_holdoff_delay: 0x0800,
            rx_timeout_delay: 0x1000,
        }
    }
}

/// Site survey configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurveyConfig {
    /// Number of nodes taking part, each with the slot id of its index
    pub nnodes: u16,
    /// Number of ranging rounds averaged per row
    pub rounds: u16,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        SurveyConfig {
            nnodes: 4,
            rounds: 1,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shr_duration_default() {
        // 128 symbols preamble + 8 symbols SFD at PRF 64
        let phy = PhyConfig::default();
        let shr = phy.shr_duration_us();
        assert!((shr - 136.0 * 1.01763).abs() < 0.01);
        assert!(phy.shr_duration().value() > 0);
    }

    #[test]
    fn sfd_length_depends_on_bitrate() {
        let mut phy = PhyConfig::default();
        phy.bitrate = BitRate::Kbps110;
        assert_eq!(phy.sfd_symbols(), 64);

        phy.bitrate = BitRate::Kbps850;
        phy.sfd_sequence = SfdSequence::Decawave;
        assert_eq!(phy.sfd_symbols(), 16);
    }

    #[test]
    fn data_duration_includes_reed_solomon() {
        let phy = PhyConfig::default();
        // 20 bytes are 160 bits, one Reed-Solomon block adds 48
        let expected = 208.0 * 0.12821;
        assert!((phy.data_duration_us(20) - expected).abs() < 0.001);
    }

    #[test]
    fn frame_duration_grows_with_length() {
        let phy = PhyConfig::default();
        assert!(phy.frame_duration_uus(64) > phy.frame_duration_uus(16));
        assert!(phy.frame_duration_us(16) > phy.shr_duration_us());
    }
}

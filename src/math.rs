//! Timestamp and signal math
//!
//! Time-of-flight from raw timestamp quadruples, conversion to meters, clock
//! offset from the carrier integrator, and the received signal estimates
//! used to judge and correct a range.

#[allow(unused_imports)]
// Not used on x86, but used on mcu target due to f32 core lib sillyness.
use micromath::F32Ext;
use serde::{Deserialize, Serialize};

use crate::configs::{BitRate, PhyConfig, PulseRepetitionFrequency};
use crate::time::DTU_FREQ_HZ;


/// Speed of light in vacuum in m/s
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Refractive index of air
pub const AIR_REFRACTIVE_INDEX: f64 = 1.000293;


/// The four timestamps one leg of an exchange contributes
///
/// `request` and `response` are taken by the side that opened the leg,
/// `reception` and `transmission` by the side that replied. Only the low 32
/// bits of each 40-bit timestamp are carried, differences are taken modulo
/// 2^32.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Timestamps {
    /// Transmission of the leg's opening frame
    pub request: u32,
    /// Reception of the reply
    pub response: u32,
    /// Reception of the opening frame by the replier
    pub reception: u32,
    /// Transmission of the reply
    pub transmission: u32,
}

impl Timestamps {
    /// Round-trip time measured by the opener
    pub fn round_trip(&self) -> u32 {
        self.response.wrapping_sub(self.request)
    }

    /// Reply time measured by the replier
    pub fn reply(&self) -> u32 {
        self.transmission.wrapping_sub(self.reception)
    }
}


/// Single-sided time of flight in DTU
///
/// `skew` is the fractional clock offset of the replier relative to the
/// opener, as returned by [`clock_offset_ratio`].
pub fn calc_tof_ss(leg: &Timestamps, skew: f64) -> f64 {
    let round_trip = leg.round_trip() as f64;
    let reply = leg.reply() as f64;
    (round_trip - reply * (1.0 - skew)) / 2.0
}

/// Double-sided (asymmetric) time of flight in DTU
///
/// Returns NaN, if all four intervals sum to zero.
pub fn calc_tof_ds(first: &Timestamps, second: &Timestamps) -> f64 {
    let t1_round = first.round_trip() as i128;
    let t1_reply = first.reply() as i128;
    let t2_round = second.round_trip() as i128;
    let t2_reply = second.reply() as i128;

    let denominator = t1_round + t2_round + t1_reply + t2_reply;
    if denominator == 0 {
        return f64::NAN;
    }

    let numerator = t1_round * t2_round - t1_reply * t2_reply;
    numerator as f64 / denominator as f64
}

/// Symmetric double-sided time of flight in DTU
///
/// Assumes both reply times are equal, which the delayed transmissions
/// approximate.
pub fn calc_tof_sym(first: &Timestamps, second: &Timestamps) -> f64 {
    let round = first.round_trip() as f64 + second.round_trip() as f64;
    let reply = first.reply() as f64 + second.reply() as f64;
    (round - reply) / 4.0
}

/// Converts a time of flight in DTU to meters
pub fn tof_to_meters(tof: f64) -> f64 {
    tof * (SPEED_OF_LIGHT / AIR_REFRACTIVE_INDEX) * (1.0 / DTU_FREQ_HZ)
}

/// Converts a distance in meters to a time of flight in DTU
pub fn meters_to_tof(meters: f64) -> f64 {
    meters / (SPEED_OF_LIGHT / AIR_REFRACTIVE_INDEX) * DTU_FREQ_HZ
}

/// Clock offset of the remote transmitter relative to the local receiver
///
/// Derived from the carrier recovery integrator of the last reception. The
/// result is a fraction (e.g. `1e-6` for 1 ppm), with the sign convention
/// of the single-sided formula in [`calc_tof_ss`].
pub fn clock_offset_ratio(carrier_integrator: i32, phy: &PhyConfig) -> f64 {
    -(carrier_integrator as f64) * carrier_hz_per_count(phy) / phy.channel.center_frequency_hz()
}

/// The carrier integrator a clock offset of `ratio` shows up as
///
/// The inverse of [`clock_offset_ratio`], rounded to the nearest count.
pub fn carrier_integrator(ratio: f64, phy: &PhyConfig) -> i32 {
    let counts = -ratio * phy.channel.center_frequency_hz() / carrier_hz_per_count(phy);
    if counts < 0.0 {
        (counts - 0.5) as i32
    }
    else {
        (counts + 0.5) as i32
    }
}

// F_S / 2 / N_samples / 2^17
fn carrier_hz_per_count(phy: &PhyConfig) -> f64 {
    match phy.bitrate {
        BitRate::Kbps110 => 998.4e6 / 2.0 / 8192.0 / 131072.0,
        _ => 998.4e6 / 2.0 / 1024.0 / 131072.0,
    }
}


fn prf_constant(prf: PulseRepetitionFrequency) -> f32 {
    match prf {
        PulseRepetitionFrequency::Mhz16 => 113.77,
        PulseRepetitionFrequency::Mhz64 => 121.74,
    }
}

/// Estimated receive power in dBm
///
/// Returns `None`, if no preamble symbols were accumulated.
pub fn rssi_dbm(cir_power: u32, preamble_count: u16, prf: PulseRepetitionFrequency) -> Option<f32> {
    if preamble_count == 0 || cir_power == 0 {
        return None;
    }
    let n = preamble_count as f32;
    let ratio = cir_power as f32 * 131072.0 / (n * n);
    Some(10.0 * ratio.log10() - prf_constant(prf))
}

/// Estimated first path power in dBm
///
/// Returns `None`, if no preamble symbols were accumulated or the first path
/// amplitudes are all zero.
pub fn first_path_power_dbm(
    fp_ampl: [u16; 3],
    preamble_count: u16,
    prf: PulseRepetitionFrequency,
) -> Option<f32> {
    let energy: f32 = fp_ampl.iter().map(|&a| (a as f32) * (a as f32)).sum();
    if preamble_count == 0 || energy == 0.0 {
        return None;
    }
    let n = preamble_count as f32;
    Some(10.0 * (energy / (n * n)).log10() - prf_constant(prf))
}

/// Line-of-sight confidence between 0.0 and 1.0
///
/// A difference of less than 6 dB between total and first path power is
/// considered line of sight, more than 10 dB non line of sight.
pub fn los_confidence(rssi: f32, fppl: f32) -> f32 {
    let difference = rssi - fppl;
    if difference < 6.0 {
        1.0
    }
    else if difference > 10.0 {
        0.0
    }
    else {
        1.0 - (difference - 6.0) / 4.0
    }
}

/// Free space path loss in dB at `distance` meters
pub fn free_space_path_loss_db(distance: f32, phy: &PhyConfig) -> f32 {
    let wavelength = (SPEED_OF_LIGHT / phy.channel.center_frequency_hz()) as f32;
    20.0 * (4.0 * core::f32::consts::PI * distance / wavelength).log10()
}


/// The range bias table for PRF 16Mhz and a bandwidth of 500Mhz.
///
/// The values are taken from APS011 1.1
///
/// The first index is at -93 RSL(dBm) and every next index is 2 dBm higher.
/// The output is the bias in centimeters.
const RANGE_BIAS_PRF16_MHZ500: [f32; 17] = [
    11.0, 10.6, 9.7, 8.4, 6.5, 3.6, 0.0, -3.1, -5.9, -8.4, -10.9, -12.7, -14.3, -16.3, -17.9,
    -18.7, -19.8,
];

/// The range bias table for PRF 64Mhz and a bandwidth of 500Mhz.
const RANGE_BIAS_PRF64_MHZ500: [f32; 17] = [
    8.1, 7.6, 7.1, 6.2, 4.9, 4.2, 3.5, 2.1, 0.0, -2.7, -5.1, -6.9, -8.2, -9.3, -10.0, -10.5, -11.0,
];

/// The range bias table for PRF 16Mhz and a bandwidth of 900Mhz.
///
/// The first index is at -95 RSL(dBm).
const RANGE_BIAS_PRF16_MHZ900: [f32; 18] = [
    39.4, 35.6, 33.9, 32.1, 29.4, 25.4, 21.0, 15.8, 9.7, 4.2, 0.0, -5.1, -9.5, -13.8, -17.6, -21.0,
    -24.4, -27.5,
];

/// The range bias table for PRF 64Mhz and a bandwidth of 900Mhz.
const RANGE_BIAS_PRF64_MHZ900: [f32; 18] = [
    28.4, 26.4, 24.5, 23.3, 19.7, 17.5, 15.3, 12.7, 9.1, 4.9, 0.0, -5.8, -10.0, -15.0, -19.9,
    -23.5, -26.6, -29.5,
];

/// Range bias in centimeters at the received signal level `rsl`
///
/// The bias is subtracted from the measured range. Levels outside the table
/// clamp to its first or last entry.
pub fn range_bias_cm(rsl: f32, phy: &PhyConfig) -> f32 {
    let (table, zero_index_value): (&[f32], f32) =
        match (phy.pulse_repetition_frequency, phy.channel.is_wide()) {
            (PulseRepetitionFrequency::Mhz64, true) => (&RANGE_BIAS_PRF64_MHZ900, -95.0),
            (PulseRepetitionFrequency::Mhz16, true) => (&RANGE_BIAS_PRF16_MHZ900, -95.0),
            (PulseRepetitionFrequency::Mhz64, false) => (&RANGE_BIAS_PRF64_MHZ500, -93.0),
            (PulseRepetitionFrequency::Mhz16, false) => (&RANGE_BIAS_PRF16_MHZ500, -93.0),
        };

    let index = (rsl - zero_index_value) / 2.0;
    let last = table.len() - 1;

    if index <= 0.0 {
        table[0]
    }
    else if index >= last as f32 {
        table[last]
    }
    else {
        let lower = index as usize;
        let fraction = index.fract();
        table[lower + 1] * fraction + table[lower] * (1.0 - fraction)
    }
}


/// A point or per-axis quantity in three dimensions
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Triad {
    /// x component
    pub x: f32,
    /// y component
    pub y: f32,
    /// z component
    pub z: f32,
}

impl Triad {
    /// Creates a new triad
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Triad { x, y, z }
    }

    /// Euclidean distance between two points
    pub fn distance(&self, other: &Triad) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::UwbChannel;

    fn leg(request: u32, response: u32, reception: u32, transmission: u32) -> Timestamps {
        Timestamps { request, response, reception, transmission }
    }

    #[test]
    fn tof_ss_recovers_flight_time() {
        // 1000 DTU of flight, 100_000 DTU reply time
        let t = leg(10_000, 10_000 + 102_000, 50_000, 150_000);
        assert_eq!(calc_tof_ss(&t, 0.0), 1000.0);
    }

    #[test]
    fn tof_ss_wraps_32_bits() {
        let t = leg(u32::MAX - 999, 101_000 - 1000, 7, 100_007);
        assert_eq!(calc_tof_ss(&t, 0.0), 500.0);
    }

    #[test]
    fn tof_ds_recovers_flight_time() {
        let tof = 1234;
        let first = leg(0, 2 * tof + 200_000, 5_000, 205_000);
        let second = leg(205_000, 205_000 + 2 * tof + 300_000, 200_000 + tof, 500_000 + tof);
        let result = calc_tof_ds(&first, &second);
        assert!((result - tof as f64).abs() < 1e-6);
        assert!((calc_tof_sym(&first, &second) - tof as f64).abs() < 1e-6);
    }

    #[test]
    fn tof_ds_zero_denominator_is_nan() {
        assert!(calc_tof_ds(&Timestamps::default(), &Timestamps::default()).is_nan());
    }

    #[test]
    fn meters_round_trip() {
        let tof = meters_to_tof(10.0);
        assert!((tof_to_meters(tof) - 10.0).abs() < 1e-9);
        // One DTU is about 4.69 mm
        assert!((tof_to_meters(1.0) - 0.004690).abs() < 1e-5);
    }

    #[test]
    fn clock_offset_sign() {
        let phy = PhyConfig::default();
        assert!(clock_offset_ratio(1000, &phy) < 0.0);
        assert_eq!(clock_offset_ratio(0, &phy), 0.0);
    }

    #[test]
    fn carrier_integrator_inverts_the_offset() {
        let phy = PhyConfig::default();
        let counts = carrier_integrator(20e-6, &phy);
        assert!(counts < 0);
        assert!((clock_offset_ratio(counts, &phy) - 20e-6).abs() < 1e-9);
        assert_eq!(carrier_integrator(0.0, &phy), 0);
    }

    #[test]
    fn tof_ss_corrects_the_replier_clock() {
        // The replier runs 20 ppm fast, its 10_000_000 DTU reply lasts 200 DTU less
        let skew = 20e-6;
        let reply = 10_000_000.0 / (1.0 + skew);
        let t = leg(0, (2_000.0 + reply) as u32, 500, 10_000_500);
        assert!((calc_tof_ss(&t, skew) - 1000.0).abs() < 1.0);
        assert!((calc_tof_ss(&t, 0.0) - 1000.0).abs() > 90.0);
    }

    #[test]
    fn rssi_is_plausible() {
        let rssi = rssi_dbm(10_000, 128, PulseRepetitionFrequency::Mhz64).unwrap();
        assert!(rssi < 0.0 && rssi > -130.0);
        assert_eq!(rssi_dbm(10_000, 0, PulseRepetitionFrequency::Mhz64), None);
    }

    #[test]
    fn los_confidence_is_clamped() {
        assert_eq!(los_confidence(-80.0, -82.0), 1.0);
        assert_eq!(los_confidence(-80.0, -95.0), 0.0);
        assert_eq!(los_confidence(-80.0, -88.0), 0.5);
    }

    #[test]
    fn path_loss_increases_with_distance() {
        let phy = PhyConfig::default();
        assert!(free_space_path_loss_db(10.0, &phy) > free_space_path_loss_db(1.0, &phy));
    }

    #[test]
    fn range_bias_cm_exact() {
        let mut phy = PhyConfig::default();
        phy.pulse_repetition_frequency = PulseRepetitionFrequency::Mhz16;

        for (index, rsl) in (-93..-61).step_by(2).map(|i| i as f32).enumerate() {
            assert_eq!(range_bias_cm(rsl, &phy), RANGE_BIAS_PRF16_MHZ500[index]);
        }
    }

    #[test]
    fn range_bias_cm_clamps() {
        let mut phy = PhyConfig::default();
        phy.channel = UwbChannel::Channel7;
        assert_eq!(range_bias_cm(-1000.0, &phy), RANGE_BIAS_PRF64_MHZ900[0]);
        assert_eq!(range_bias_cm(1000.0, &phy), RANGE_BIAS_PRF64_MHZ900[17]);
    }

    #[test]
    fn triad_distance() {
        let a = Triad::new(17.0, 18.0, 19.0);
        let b = Triad::new(13.0, 86.0, 44.0);
        assert!((a.distance(&b) - 72.5603197).abs() < 1e-4);
    }
}

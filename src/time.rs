//! Time-related types based on the radio's 40-bit system time
//!
//! All radio timestamps are counted in DTU (Decawave time units), ticks of a
//! 63.8976 GHz clock (499.2 MHz * 128), and wrap after 2^40 ticks (~17.2 s).
//! Protocol delays are usually expressed in "UWB microseconds" (UUS), which
//! are exactly 65536 DTU (~1.0256 µs) and therefore convert with a shift.


use core::ops::{Add, Sub};

use fixed::types::U64F64;
use serde::{Deserialize, Serialize};


/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: u64 = 0xff_ffff_ffff;

/// Frequency of the DTU clock in Hz
pub const DTU_FREQ_HZ: f64 = 499.2e6 * 128.0;

/// Delayed transmissions ignore the low 9 bits of the start time
pub const DELAYED_TX_MASK: u64 = !0x1ff;

/// DTU per microsecond (63897.6), as a 64.64 fixed-point number
const DTU_PER_MICRO: U64F64 =
    U64F64::from_bits((63_897u128 << 64) | 11_068_046_444_225_730_970);


/// Represents an instant in time
///
/// Internally uses the same 40-bit timestamps that the radio uses.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[repr(C)]
pub struct Instant(u64);

impl Instant {
    /// Creates a new instance of `Instant`
    ///
    /// Returns `None`, if `value` does not fit into 40 bits.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_core::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// assert!(Instant::new(TIME_MAX).is_some());
    /// assert!(Instant::new(TIME_MAX + 1).is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Instant(value))
        }
        else {
            None
        }
    }

    /// Creates an `Instant` from any value, discarding bits above bit 39
    pub fn wrapping(value: u64) -> Self {
        Instant(value & TIME_MAX)
    }

    /// Returns the raw 40-bit timestamp
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the amount of time passed between the two `Instant`s
    ///
    /// Assumes that `&self` represents a later time than the argument
    /// `earlier`. Timestamps overflow, so comparing the numerical value of
    /// the timestamps doesn't tell anything about their order.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use uwb_core::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// let instant_1 = Instant::new(TIME_MAX - 50).unwrap();
    /// let instant_2 = Instant::new(TIME_MAX).unwrap();
    /// let instant_3 = Instant::new(49).unwrap();
    ///
    /// assert_eq!(instant_2.duration_since(instant_1).value(), 50);
    /// assert_eq!(instant_3.duration_since(instant_2).value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(wrapping_delta(self.0, earlier.0))
    }

    /// Returns the start time a delayed transmission will actually use
    pub fn delayed_tx_start(&self) -> Instant {
        Instant(self.0 & DELAYED_TX_MASK & TIME_MAX)
    }

    /// Returns `true` if `self` lies after `other` within half the wrap range
    pub fn is_after(&self, other: Instant) -> bool {
        let delta = wrapping_delta(self.0, other.0);
        delta != 0 && delta < (TIME_MAX + 1) / 2
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        // Both values are 40-bit numbers, so the sum can't overflow `u64`.
        Instant((self.0 + rhs.0) & TIME_MAX)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Instant(self.0.wrapping_sub(rhs.0) & TIME_MAX)
    }
}


/// A duration between two instants in radio system time
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Duration(u64);

impl Duration {
    /// Creates a new instance of `Duration`
    ///
    /// Returns `None`, if `value` does not fit into 40 bits.
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Duration(value))
        }
        else {
            None
        }
    }

    /// Creates a `Duration` from UWB microseconds (65536 DTU each)
    pub fn from_uus(uus: u32) -> Self {
        // 32 + 16 bits would overflow 40 bits for delays above ~16 s, which
        // is larger than the wrap period anyway.
        Duration(((uus as u64) << 16) & TIME_MAX)
    }

    /// Creates a `Duration` from real microseconds
    pub fn from_micros(micros: u32) -> Self {
        Duration(micros_to_dtu(micros as u64) & TIME_MAX)
    }

    /// Creates an instance of `Duration` from a number of nanoseconds
    pub fn from_nanos(nanos: u32) -> Self {
        let dtu = U64F64::from_num(nanos) * DTU_PER_MICRO / U64F64::from_num(1000);
        Duration(dtu.round().to_num::<u64>() & TIME_MAX)
    }

    /// Returns the raw 40-bit value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Converts the duration into real microseconds, rounded to nearest
    pub fn to_micros(&self) -> u64 {
        dtu_to_micros(self.0)
    }

    /// Converts the duration into (truncated) UWB microseconds
    pub fn to_uus(&self) -> u32 {
        (self.0 >> 16) as u32
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration((self.0 + rhs.0) & TIME_MAX)
    }
}


/// Returns `later - earlier` on the 40-bit wrapping time line
pub fn wrapping_delta(later: u64, earlier: u64) -> u64 {
    later.wrapping_sub(earlier) & TIME_MAX
}

/// Converts real microseconds to DTU, rounded to nearest, without the 40-bit
/// clamp
pub fn micros_to_dtu(micros: u64) -> u64 {
    (U64F64::from_num(micros) * DTU_PER_MICRO).round().to_num::<u64>()
}

/// Converts DTU to real microseconds, rounded to nearest
pub fn dtu_to_micros(dtu: u64) -> u64 {
    (U64F64::from_num(dtu) / DTU_PER_MICRO).round().to_num::<u64>()
}


/// Unwraps 40-bit timestamps into a monotonically increasing 64-bit count
///
/// Timestamps must be fed in order and less than one wrap period apart.
#[derive(Clone, Copy, Debug, Default)]
pub struct Extender {
    last:  u64,
    upper: u64,
    primed: bool,
}

impl Extender {
    /// Creates an extender that has not seen any timestamp yet
    pub const fn new() -> Self {
        Extender { last: 0, upper: 0, primed: false }
    }

    /// Extends `timestamp` to 64 bits
    pub fn extend(&mut self, timestamp: u64) -> u64 {
        let timestamp = timestamp & TIME_MAX;
        if self.primed && timestamp < self.last {
            self.upper += TIME_MAX + 1;
        }
        self.last = timestamp;
        self.primed = true;
        self.upper + timestamp
    }

    /// Forgets the wrap history
    pub fn reset(&mut self) {
        *self = Extender::new();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uus_is_a_shift() {
        assert_eq!(Duration::from_uus(1).value(), 65536);
        assert_eq!(Duration::from_uus(0x800).to_uus(), 0x800);
    }

    #[test]
    fn micros_round_trip() {
        let d = Duration::from_micros(1000);
        assert_eq!(d.value(), 63_897_600);
        assert_eq!(d.to_micros(), 1000);
        assert_eq!(Duration::from_nanos(1000).value(), 63_898);
    }

    #[test]
    fn instant_add_wraps() {
        let instant = Instant::new(TIME_MAX - 9).unwrap() + Duration::new(20).unwrap();
        assert_eq!(instant.value(), 10);
        assert!(instant.is_after(Instant::new(TIME_MAX - 9).unwrap()));
        assert!(!Instant::new(TIME_MAX - 9).unwrap().is_after(instant));
    }

    #[test]
    fn delayed_start_drops_low_bits() {
        assert_eq!(Instant::wrapping(0x1234_5fff).delayed_tx_start().value(), 0x1234_5e00);
    }

    #[test]
    fn extender_counts_wraps() {
        let mut extender = Extender::new();
        assert_eq!(extender.extend(TIME_MAX - 5), TIME_MAX - 5);
        assert_eq!(extender.extend(4), TIME_MAX + 5);
        assert_eq!(extender.extend(100), TIME_MAX + 101);
    }
}

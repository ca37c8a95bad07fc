//! Wireless clock synchronization
//!
//! Estimates how fast the local radio clock runs compared to the clock
//! master's, from the (local reception, master transmission) timestamp pairs
//! of successive clock calibration packets, and projects local timestamps
//! into the master's time base.
//!
//! Two estimators are available, see [`Estimator`]. Losing synchronization
//! resets the estimate to an ideal clock, so a stale correction is never
//! applied.

use crate::configs::{Estimator, WcsConfig};
use crate::logging::debug;
use crate::time::{wrapping_delta, DTU_FREQ_HZ, TIME_MAX};


stats! {
    /// Counters of the clock sync
    pub struct WcsStats {
        update,
        reset,
        rejected,
    }
}


/// Rounds to the nearest integer, half away from zero
fn round(value: f64) -> i64 {
    if value >= 0.0 {
        (value + 0.5) as i64
    }
    else {
        (value - 0.5) as i64
    }
}

/// 40-bit difference `later - earlier`, negative if `later` lies in the
/// past half of the wrap range
fn signed_delta(later: u64, earlier: u64) -> i64 {
    let delta = wrapping_delta(later, earlier);
    if delta > TIME_MAX / 2 {
        delta as i64 - (TIME_MAX as i64 + 1)
    }
    else {
        delta as i64
    }
}


/// Three-state Kalman filter over offset, skew and drift
///
/// The offset state is kept in seconds relative to the last epoch and goes
/// back to zero after every update, as every update supplies an exact new
/// epoch pair.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Timescale {
    x: [f64; 3],
    p: [[f64; 3]; 3],
}

impl Timescale {
    fn new(skew: f64, r: f64) -> Self {
        Timescale {
            x: [0.0, skew, 0.0],
            p: [
                [r, 0.0, 0.0],
                [0.0, 1.0e-10, 0.0],
                [0.0, 0.0, 1.0e-14],
            ],
        }
    }

    /// Feeds the offset `z` (seconds) accumulated over `dt` seconds
    fn step(&mut self, dt: f64, z: f64, q: &[f64; 3], r: f64) {
        let f = [
            [1.0, dt, dt * dt / 2.0],
            [0.0, 1.0, dt],
            [0.0, 0.0, 1.0],
        ];

        // x = F x
        let mut x = [0.0; 3];
        for i in 0..3 {
            x[i] = (0..3).map(|j| f[i][j] * self.x[j]).sum();
        }

        // P = F P F' + Q dt
        let mut fp = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                fp[i][j] = (0..3).map(|k| f[i][k] * self.p[k][j]).sum();
            }
        }
        let mut p = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                p[i][j] = (0..3).map(|k| fp[i][k] * f[j][k]).sum();
            }
            p[i][i] += q[i] * dt;
        }

        // Measurement of the offset state only
        let s = p[0][0] + r;
        let k = [p[0][0] / s, p[1][0] / s, p[2][0] / s];
        let innovation = z - x[0];
        for i in 0..3 {
            x[i] += k[i] * innovation;
        }
        let row = p[0];
        for i in 0..3 {
            for j in 0..3 {
                p[i][j] -= k[i] * row[j];
            }
        }

        x[0] = 0.0;
        self.x = x;
        self.p = p;
    }
}


/// Clock sync state of one radio
#[derive(Clone, Debug)]
pub struct Wcs {
    config: WcsConfig,
    local_epoch: u64,
    master_epoch: u64,
    normalized_skew: f64,
    fractional_skew: f64,
    drift: f64,
    filter: Option<Timescale>,
    primed: bool,
    valid: bool,

    /// Statistics
    pub stats: WcsStats,
}

impl Wcs {
    /// Creates an unsynchronized instance
    pub fn new(config: WcsConfig) -> Self {
        Wcs {
            config,
            local_epoch: 0,
            master_epoch: 0,
            normalized_skew: 1.0,
            fractional_skew: 0.0,
            drift: 0.0,
            filter: None,
            primed: false,
            valid: false,
            stats: WcsStats::default(),
        }
    }

    /// Changes the estimator policy and restarts the estimate
    pub fn set_config(&mut self, config: WcsConfig) {
        self.config = config;
        self.reset();
    }

    /// Feeds a new epoch pair
    ///
    /// `local` is the 40-bit local reception timestamp, `master` the 64-bit
    /// transmission timestamp in the master's time base. Returns `true` once
    /// a skew estimate is available.
    pub fn update(&mut self, local: u64, master: u64) -> bool {
        let local = local & TIME_MAX;

        if self.primed {
            let local_interval = wrapping_delta(local, self.local_epoch);
            let master_interval = master.wrapping_sub(self.master_epoch);

            if local_interval == 0 || master_interval == 0 || master_interval > TIME_MAX {
                stat_inc!(self.stats, rejected);
                self.local_epoch = local;
                self.master_epoch = master;
                return self.valid;
            }

            let local_interval = local_interval as f64;
            let master_interval = master_interval as f64;

            match self.config.estimator {
                Estimator::Ratio => {
                    self.normalized_skew = master_interval / local_interval;
                    self.fractional_skew = self.normalized_skew - 1.0;
                    self.drift = 0.0;
                }
                Estimator::Timescale => {
                    let dt = local_interval / DTU_FREQ_HZ;
                    let z = (master_interval - local_interval) / DTU_FREQ_HZ;
                    match self.filter.as_mut() {
                        Some(filter) => filter.step(dt, z, &self.config.q, self.config.r),
                        None => self.filter = Some(Timescale::new(z / dt, self.config.r)),
                    }
                    if let Some(filter) = &self.filter {
                        self.fractional_skew = filter.x[1];
                        self.drift = filter.x[2];
                    }
                    self.normalized_skew = 1.0 + self.fractional_skew;
                }
            }

            self.valid = true;
            stat_inc!(self.stats, update);
        }

        self.local_epoch = local;
        self.master_epoch = master;
        self.primed = true;
        self.valid
    }

    /// Forgets the estimate
    ///
    /// The last epoch pair is kept, so projections degenerate to a constant
    /// offset.
    pub fn reset(&mut self) {
        debug!("wcs: reset");
        self.normalized_skew = 1.0;
        self.fractional_skew = 0.0;
        self.drift = 0.0;
        self.filter = None;
        self.primed = false;
        self.valid = false;
        stat_inc!(self.stats, reset);
    }

    /// Returns `true` once a skew estimate is available
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Ratio of master to local clock rate
    pub fn normalized_skew(&self) -> f64 {
        self.normalized_skew
    }

    /// `normalized_skew - 1`
    pub fn fractional_skew(&self) -> f64 {
        self.fractional_skew
    }

    /// Estimated change of the fractional skew per second
    pub fn drift(&self) -> f64 {
        self.drift
    }

    /// The local half of the last epoch pair
    pub fn local_epoch(&self) -> u64 {
        self.local_epoch
    }

    /// The master half of the last epoch pair
    pub fn master_epoch(&self) -> u64 {
        self.master_epoch
    }

    /// Projects a local 40-bit timestamp into the master's 64-bit time base
    pub fn local_to_master64(&self, timestamp: u64) -> u64 {
        let delta = signed_delta(timestamp & TIME_MAX, self.local_epoch) as f64;
        let seconds = delta / DTU_FREQ_HZ;
        let projected = delta * self.normalized_skew
            + self.drift * seconds * seconds / 2.0 * DTU_FREQ_HZ;
        (self.master_epoch as i64).wrapping_add(round(projected)) as u64
    }

    /// Projects a local 40-bit timestamp into the master's 40-bit time base
    pub fn local_to_master(&self, timestamp: u64) -> u64 {
        self.local_to_master64(timestamp) & TIME_MAX
    }

    /// Converts a duration in master DTU to the local DTU that take as long
    pub fn dtu_time_adjust(&self, duration: f64) -> u64 {
        let adjusted = duration * (1.0 - self.fractional_skew);
        if adjusted <= 0.0 {
            0
        }
        else {
            round(adjusted) as u64
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: u64 = 0x1_0000 << 16;

    fn feed(wcs: &mut Wcs, ppm: f64, n: u64) {
        for i in 0..n {
            let master = 1_000_000 + i * PERIOD;
            let local = (500 + (i as f64 * PERIOD as f64 * (1.0 - ppm * 1e-6)) as u64) & TIME_MAX;
            wcs.update(local, master);
        }
    }

    #[test]
    fn ratio_estimates_skew() {
        let mut wcs = Wcs::new(WcsConfig::default());
        feed(&mut wcs, 10.0, 3);

        assert!(wcs.is_valid());
        assert!((wcs.fractional_skew() - 10e-6).abs() < 1e-8);
    }

    #[test]
    fn timescale_tracks_constant_skew() {
        let config = WcsConfig {
            estimator: Estimator::Timescale,
            ..WcsConfig::default()
        };
        let mut wcs = Wcs::new(config);
        feed(&mut wcs, -5.0, 20);

        assert!((wcs.fractional_skew() + 5e-6).abs() < 1e-7);
    }

    #[test]
    fn projection_applies_skew() {
        let mut wcs = Wcs::new(WcsConfig::default());
        wcs.update(1000, 5000);
        wcs.update(1000 + 1_000_000, 5000 + 1_000_010);

        let local = 1000 + 2_000_000;
        assert_eq!(wcs.local_to_master64(local), 5000 + 2_000_020);
        assert_eq!(wcs.dtu_time_adjust(1_000_010.0), 1_000_000);
    }

    #[test]
    fn reset_falls_back_to_constant_offset() {
        let mut wcs = Wcs::new(WcsConfig::default());
        feed(&mut wcs, 20.0, 4);
        wcs.reset();

        assert_eq!(wcs.normalized_skew(), 1.0);
        assert_eq!(wcs.fractional_skew(), 0.0);

        let offset = wcs.master_epoch() as i64 - wcs.local_epoch() as i64;
        for ts in [wcs.local_epoch(), wcs.local_epoch() + 12_345, wcs.local_epoch() + 999_999].iter() {
            assert_eq!(wcs.local_to_master64(*ts) as i64, *ts as i64 + offset);
        }
    }

    #[test]
    fn projection_handles_wrap() {
        let mut wcs = Wcs::new(WcsConfig::default());
        wcs.update(TIME_MAX - 10, 100);
        assert_eq!(wcs.local_to_master64(9), 120);
        assert_eq!(wcs.local_to_master64(TIME_MAX - 20), 90);
    }
}

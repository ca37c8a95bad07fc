//! The radio capability consumed by the protocol services
//!
//! The register-level driver lives outside of this crate. Anything that can
//! transmit and receive frames, report 40-bit DTU timestamps and start a
//! transmission at a given system time can drive the services.

use crate::error::RadioStatus;


/// Diagnostics of the last reception
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxDiagnostics {
    /// Channel impulse response power
    pub cir_power: u32,
    /// Number of accumulated preamble symbols
    pub preamble_count: u16,
    /// First path amplitude points 1 to 3
    pub fp_ampl: [u16; 3],
    /// Carrier recovery integrator
    pub carrier_integrator: i32,
}


/// A UWB radio
///
/// Timestamps are 40-bit system time values in DTU. Receive timeouts are in
/// UWB microseconds, a timeout of zero disables it.
pub trait Radio {
    /// Reads the current system time
    fn read_systime(&mut self) -> u64;

    /// Reads the timestamp of the last received frame
    fn read_rxtime(&mut self) -> u64;

    /// Reads the timestamp of the last transmitted frame
    fn read_txtime(&mut self) -> u64;

    /// Writes `buf` into the transmit buffer at `offset`
    fn write_tx(&mut self, buf: &[u8], offset: usize);

    /// Sets the length of the next frame and whether it is a ranging frame
    fn write_tx_fctrl(&mut self, len: usize, ranging: bool);

    /// Makes the next `start_tx` or `start_rx` wait until `time`
    fn set_delay_start(&mut self, time: u64);

    /// Turns the receiver on right after the next transmission
    fn set_wait4resp(&mut self, enable: bool);

    /// Sets the receive timeout of the next reception
    fn set_rx_timeout(&mut self, uus: u32);

    /// Starts a transmission
    fn start_tx(&mut self) -> RadioStatus;

    /// Turns the receiver on
    fn start_rx(&mut self) -> RadioStatus;

    /// Stops any transmission or reception in progress
    fn stop(&mut self);

    /// The transmit antenna delay added to transmit timestamps
    fn tx_antenna_delay(&self) -> u16;

    /// Diagnostics of the last reception
    fn rx_diagnostics(&mut self) -> RxDiagnostics;

    /// Platform monotonic time in microseconds
    fn uptime_us(&self) -> u64;
}

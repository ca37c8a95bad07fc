//! Errors and status bit-fields

use core::fmt;


/// An error that can occur while running one of the protocol services
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Buffer too small
    BufferTooSmall {
        /// Indicates how large a buffer would have been required
        required_len: usize,
    },

    /// An exchange is already in flight on this instance
    Busy,

    /// A TDMA slot index was not below the configured number of slots
    SlotOutOfRange {
        /// The rejected slot index
        index: u16,
    },

    /// The service was used before it was initialized
    NotInitialized,

    /// The configuration was not valid. Some combinations of settings are not
    /// allowed.
    InvalidConfiguration,

    /// A fixed-capacity queue or table is full
    QueueFull,

    /// The frame carries a code that is not known to this crate
    UnknownCode(u16),

    /// An error occured while serializing or deserializing a frame body
    Ssmarshal,

    /// A frame field could not be read or written at its offset
    Byte,
}

impl From<ssmarshal::Error> for Error {
    fn from(_: ssmarshal::Error) -> Self {
        Error::Ssmarshal
    }
}

impl From<byte::Error> for Error {
    fn from(_: byte::Error) -> Self {
        Error::Byte
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BufferTooSmall { required_len } => {
                write!(f, "BufferTooSmall {{ required_len: {:?} }}", required_len)
            }
            Error::Busy => write!(f, "Busy"),
            Error::SlotOutOfRange { index } => {
                write!(f, "SlotOutOfRange {{ index: {:?} }}", index)
            }
            Error::NotInitialized => write!(f, "NotInitialized"),
            Error::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            Error::QueueFull => write!(f, "QueueFull"),
            Error::UnknownCode(code) => write!(f, "UnknownCode({:#06x})", code),
            Error::Ssmarshal => write!(f, "Ssmarshal"),
            Error::Byte => write!(f, "Byte"),
        }
    }
}


/// Status bits reported by the radio when starting a transmission or
/// reception
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RadioStatus {
    /// A delayed transmission could not be started in time
    pub start_tx_error: bool,
    /// The receiver could not be enabled in time
    pub start_rx_error: bool,
    /// The last reception failed (PHY, FCS or sync loss)
    pub rx_error: bool,
    /// The last reception timed out
    pub rx_timeout_error: bool,
    /// The last transmission failed
    pub tx_error: bool,
}

impl RadioStatus {
    /// Returns `true`, if any error bit is set
    pub fn is_err(&self) -> bool {
        self.start_tx_error
            || self.start_rx_error
            || self.rx_error
            || self.rx_timeout_error
            || self.tx_error
    }
}


/// Status bits of a ranging instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RngStatus {
    /// A delayed transmission could not be started in time
    pub start_tx_error: bool,
    /// The receiver could not be enabled in time
    pub start_rx_error: bool,
    /// The exchange was ended by a receive error
    pub rx_error: bool,
    /// The exchange was ended by a receive timeout
    pub rx_timeout_error: bool,
    /// A transmission of the exchange failed
    pub tx_error: bool,
    /// The exchange was forcibly aborted
    pub aborted: bool,
    /// The exchange finished and produced a result
    pub complete: bool,
}

impl RngStatus {
    /// Returns `true`, if the exchange ended in any kind of failure
    pub fn is_err(&self) -> bool {
        self.start_tx_error
            || self.start_rx_error
            || self.rx_error
            || self.rx_timeout_error
            || self.tx_error
            || self.aborted
    }
}

impl From<RadioStatus> for RngStatus {
    fn from(status: RadioStatus) -> Self {
        RngStatus {
            start_tx_error:   status.start_tx_error,
            start_rx_error:   status.start_rx_error,
            rx_error:         status.rx_error,
            rx_timeout_error: status.rx_timeout_error,
            tx_error:         status.tx_error,
            ..RngStatus::default()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_error_is_a_failure() {
        let status = RngStatus { tx_error: true, ..RngStatus::default() };
        assert!(status.is_err());
        assert!(!RngStatus { complete: true, ..RngStatus::default() }.is_err());
    }

    #[test]
    fn radio_status_carries_over() {
        let radio = RadioStatus { tx_error: true, start_rx_error: true, ..RadioStatus::default() };
        let status = RngStatus::from(radio);
        assert!(status.tx_error);
        assert!(status.start_rx_error);
        assert!(!status.complete);
    }
}

//! Logger back-end agnostic logging
//!
//! Re-exports the logging macros of `log` or `defmt`, depending on which
//! feature is enabled. Without either feature the macros expand to code that
//! only type-checks its arguments.

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("Cannot select log and defmt features together.");

#[cfg(feature = "defmt")]
pub(crate) use defmt::{debug, error, info, trace, warn};

#[cfg(feature = "log")]
pub(crate) use log::{debug, error, info, trace, warn};

#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! error_ {
    ($($arg:tt)*) => {{ // no-op
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! warn_ {
    ($($arg:tt)*) => {{ // no-op
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! info_ {
    ($($arg:tt)*) => {{ // no-op
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! debug_ {
    ($($arg:tt)*) => {{ // no-op
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(any(feature = "defmt", feature = "log")))]
macro_rules! trace_ {
    ($($arg:tt)*) => {{ // no-op
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}

#[cfg(not(any(feature = "defmt", feature = "log")))]
#[allow(unused_imports)]
pub(crate) use {
    debug_ as debug,
    error_ as error,
    info_ as info,
    trace_ as trace,
    warn_ as warn,
};

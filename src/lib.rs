//! MAC services for DW1000/DW3000 UWB networks
//!
//! This crate sits on top of a radio driver. The driver is reached through
//! the [`radio::Radio`] trait, everything above it is implemented here:
//!
//! - [`ccp`]: clock calibration, a master beacon that defines the superframe
//!   epoch and feeds the wireless clock synchronization in [`wcs`]
//! - [`tdma`]: a superframe of slots, dispatched relative to the epoch
//! - [`rng`]: two-way ranging between two nodes
//! - [`nrng`]: ranging from one node to many at once
//! - [`rtdoa`]: reverse time difference of arrival
//! - [`pan`]: PAN association and lease handling
//! - [`survey`]: site survey of the anchor distances
//!
//! A [`node::Node`] owns a [`mac::Device`] and the services registered on it,
//! and hands radio events to them.


#![cfg_attr(not(any(test, feature = "std")), no_std)]

#![deny(missing_docs)]


#[macro_use]
mod macros;
mod logging;

pub mod time;
pub mod error;
pub mod configs;
pub mod math;
pub mod radio;
pub mod sync;
pub mod ring;
pub mod events;
pub mod frame;
pub mod wcs;
pub mod mac;
pub mod rng;
pub mod nrng;
pub mod rtdoa;
pub mod ccp;
pub mod tdma;
pub mod pan;
pub mod survey;
pub mod node;

#[cfg(any(test, feature = "sim"))]
pub mod sim;


pub use ieee802154::mac as ieee;

pub use crate::{
    error::{Error, RadioStatus, RngStatus},
    mac::{Device, InterfaceId, MacInterface},
    node::{DeviceHandle, Node, Registry},
    radio::Radio,
    time::{Duration, Instant, TIME_MAX},
};

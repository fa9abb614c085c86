//! iec1541
//!
//! The protocol engine of an xum1541-style adapter, which connects Commodore
//! disk drives, and other peripherals, to a PC.  It speaks the host's
//! control and bulk command set (as used by
//! [`OpenCBM`](https://github.com/OpenCBM/OpenCBM)) and drives one of three
//! buses:
//!
//! * the serial IEC bus, including the parallel port, the parallel and SRQ
//!   burst nibblers and the XP1541/XE1541 cables
//! * the parallel IEEE-488 bus
//! * a 153x datasette, capturing and writing tape edges
//!
//! The engine owns no hardware.  Bus lines, timing and the tape deck are
//! injected through the traits in [`infra`], and the host's USB endpoints
//! through [`transfer::HostChannel`], so the same code runs on any
//! embassy-based microcontroller, or under test against simulated drives.
//!
//! [`ProtocolHandler`] is the entry point: feed it control requests and
//! bulk commands from the host.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![no_std]

#[cfg(test)]
extern crate std;

// Declare all of this library's modules.
pub mod constants;
pub mod driver;
pub mod ieee;
pub mod infra;
pub mod protocol;
pub mod queue;
pub mod tape;
pub mod transfer;
pub mod types;
pub mod util;

#[cfg(test)]
mod test;

pub use driver::{BusError, ProtocolDriver};
pub use infra::NotFitted;
pub use infra::lines::{IecHardware, IecLines, IeeeHardware, IeeeLines};
pub use infra::tape::TapeDeck;
pub use infra::watchdog::{AbortFlag, Supervisor};
pub use protocol::{BulkResponse, BusConfig, BusKind, CommandError, ProtocolHandler};
pub use queue::WorkQueue;
pub use transfer::HostChannel;
pub use types::{CableType, DeviceAddress, Direction};
pub use util::time::Clock;

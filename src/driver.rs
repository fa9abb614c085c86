//! This file defines the ProtocolDriver trait, which is implemented by the
//! various Commodore bus kinds (IEC, IEEE-488 and tape), and the error type
//! they share.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::fmt;

use crate::protocol::ProtocolFlags;
use crate::protocol::session::BusSession;
use crate::transfer::HostChannel;

/// Defines errors for ProtocolDriver implementations and the primitives
/// beneath them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// No device answered - the listener never pulled DATA.
    NoDevice,
    /// No devices at all on the bus, or all of them are powered off.
    NoDevices,
    /// The listener did not acknowledge a byte.
    NoAck,
    /// A bounded wait expired.
    Timeout,
    /// The host requested this operation be aborted.
    Cancelled,
    /// The cable no longer matches the polarity it was tested with, and the
    /// re-test failed.
    CableMismatch,
    /// An XE1541 cable was detected.  Data transfer is not supported.
    UnsupportedCable,
    /// A reset cancelled this operation
    Resetting,
    /// Bus was occupied
    BusOccupied,
    /// The host channel failed
    Io,
    /// Unsupported protocol or operation
    Unsupported,
    /// Internal error
    Internal,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusError::NoDevice => "no device responded",
            BusError::NoDevices => "no devices present on the bus",
            BusError::NoAck => "byte not acknowledged",
            BusError::Timeout => "timed out",
            BusError::Cancelled => "cancelled",
            BusError::CableMismatch => "cable polarity changed",
            BusError::UnsupportedCable => "unsupported cable (XE1541)",
            BusError::Resetting => "bus reset in progress",
            BusError::BusOccupied => "bus occupied",
            BusError::Io => "host channel I/O error",
            BusError::Unsupported => "unsupported operation",
            BusError::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Defines the interface for Commodore bus implementations.  Exactly one
/// implementation is bound when the host initializes the adapter, and every
/// bus-level command is routed through it.
#[allow(async_fn_in_trait)]
pub trait ProtocolDriver {
    /// Reset the bus, then wait for it to become free.
    ///
    /// # Arguments
    /// * `session` - The bus session state
    /// * `forever` - Whether to wait forever for the bus to free after
    ///   resetting
    async fn reset(&mut self, session: &mut BusSession, forever: bool) -> Result<(), BusError>;

    /// Write `len` raw bytes, received from the host channel, to the bus.
    ///
    /// # Arguments
    /// * `session` - The bus session state
    /// * `len` - Number of bytes the host will supply
    /// * `flags` - ATN and TALK control flags
    /// * `host` - Where the bytes come from
    ///
    /// # Returns
    /// The number of bytes actually written, or an error along with the
    /// number written before it occurred.
    async fn raw_write<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        flags: ProtocolFlags,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)>;

    /// Read up to `len` raw bytes from the bus, forwarding them to the host
    /// channel.  Fewer bytes are returned if the talker signals EOI.
    async fn raw_read<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)>;

    /// Wait for the lines in `line` to reach `state`.
    ///
    /// # Arguments
    /// * `line` - The bus line(s) to monitor, as a host line mask
    /// * `state` - Non-zero to wait for the lines to be active
    async fn wait(&mut self, session: &mut BusSession, line: u8, state: u8)
    -> Result<(), BusError>;

    /// Poll the current state of the bus lines.
    ///
    /// # Returns
    /// A bitfield of the lines currently active
    fn poll(&mut self) -> u8;

    /// Drive (`set`) and release lines, given as host line masks.
    fn set_release(&mut self, set: u8, release: u8);
}

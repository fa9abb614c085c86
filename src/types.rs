//! This module contains general types used across the crate.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::fmt;

use crate::constants::IEC_ADDRESS_MASK;

/// Direction of a transfer, from the point of view of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// In is from the drive to the host - a READ.  The drive talks.
    In,

    /// Out is from the host to the drive - a WRITE.  The drive listens.
    Out,
}

/// The way the adapter is wired to the bus.  An XA1541 inverts the lines
/// through active drivers, an XM1541 passes them straight through.  An
/// XE1541 is recognised (RESET reads back ATN), but cannot transfer data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableType {
    #[default]
    Unknown,
    Xa1541,
    Xm1541,
    Xe1541,
}

impl fmt::Display for CableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CableType::Unknown => "unknown",
            CableType::Xa1541 => "XA1541 (active)",
            CableType::Xm1541 => "XM1541 (passive)",
            CableType::Xe1541 => "XE1541",
        };
        f.write_str(s)
    }
}

/// A device on the bus, plus the channel (secondary address) being used.
///
/// Both parts are 5 bits wide on the wire, so construction masks them.  Disk
/// drives conventionally use devices 8-11, and channel 15 is the command and
/// status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceAddress {
    device: u8,
    secondary: u8,
}

impl DeviceAddress {
    /// The command/status channel of a disk drive.
    pub const COMMAND_CHANNEL: u8 = 15;

    pub const fn new(device: u8, secondary: u8) -> Self {
        Self {
            device: device & IEC_ADDRESS_MASK,
            secondary: secondary & IEC_ADDRESS_MASK,
        }
    }

    pub const fn device(&self) -> u8 {
        self.device
    }

    pub const fn secondary(&self) -> u8 {
        self.secondary
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.secondary)
    }
}

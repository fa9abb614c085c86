//! Contains the IEC line abstraction the drivers are written against.  The
//! board layer maps each logical line to its GPIOs (and handles any
//! inversion by level shifters), the drivers only ever deal with "active"
//! (wire-low) and "released".

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use bitflags::bitflags;
use embassy_time::Duration;

use crate::driver::BusError;
use crate::infra::watchdog::Supervisor;
use crate::types::CableType;
use crate::util::time::Clock;

bitflags! {
    /// IEC bus lines.  The bit values are those used by the host for the
    /// IEC_POLL, IEC_WAIT and IEC_SETRELEASE commands.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Lines: u8 {
        const DATA = 0x01;
        const CLOCK = 0x02;
        const ATN = 0x04;
        const RESET = 0x08;
        const SRQ = 0x10;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Lines {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Lines({=u8:#04x})", self.bits());
    }
}

impl Lines {
    /// The four lines which make up the bus proper.
    pub const PRIMARY: Lines = Lines::DATA
        .union(Lines::CLOCK)
        .union(Lines::ATN)
        .union(Lines::RESET);

    /// Creates from a host supplied mask, ignoring unknown bits.
    pub const fn from_host(mask: u8) -> Self {
        Self::from_bits_truncate(mask)
    }
}

/// The IEC lines, as driven and observed by the adapter.
pub trait IecLines {
    /// Drive the given lines active.
    fn set(&mut self, lines: Lines);

    /// Release the given lines.
    fn release(&mut self, lines: Lines);

    /// Drive `set` and release `release` in a single port update.
    fn set_release(&mut self, set: Lines, release: Lines);

    /// The lines currently observed active on the bus, whoever is driving
    /// them.
    fn active(&self) -> Lines;

    /// Whether any of `line` is active.
    fn get(&self, line: Lines) -> bool {
        self.active().intersects(line)
    }

    /// The lines this adapter is currently driving.
    fn driven(&self) -> Lines;

    /// The raw ATN output and input pin levels, before any cable mapping.
    /// Used to work out whether the cable inverts.
    fn raw_atn(&self) -> (bool, bool);

    /// Set up the pin mapping for the given cable.
    fn configure_cable(&mut self, cable: CableType);

    /// Make the parallel port an input and read it.
    fn pp_read(&mut self) -> u8;

    /// Make the parallel port an output and write to it.
    fn pp_write(&mut self, data: u8);
}

/// Everything the IEC driver needs from the platform.
#[allow(async_fn_in_trait)]
pub trait IecHardware: IecLines + Clock + Supervisor {
    /// Suspend until `(active() & mask) == want`, checking every `poll`,
    /// failing after `timeout` or when cancelled.
    ///
    /// A platform with edge interrupts may override this with an event
    /// based wait.
    async fn wait_until(
        &mut self,
        mask: Lines,
        want: Lines,
        poll: Duration,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let deadline = self.now() + timeout;
        loop {
            if self.active() & mask == want {
                break Ok(());
            }
            if self.is_cancelled() {
                break Err(BusError::Cancelled);
            }
            if self.now() >= deadline {
                break Err(BusError::Timeout);
            }
            self.feed();
            self.yield_for(poll).await;
        }
    }
}

bitflags! {
    /// IEEE-488 control lines.  The bit values are those reported to the
    /// host by IEC_POLL when an IEEE-488 bus is bound.
    #[repr(transparent)]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct IeeeLine: u8 {
        const NDAC = 0x01;
        const NRFD = 0x02;
        const ATN = 0x04;
        const IFC = 0x08;
        const DAV = 0x10;
        const EOI = 0x20;
        const REN = 0x40;
        const SRQ = 0x80;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for IeeeLine {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "IeeeLine({=u8:#04x})", self.bits());
    }
}

/// The IEEE-488 lines and data port.  As with [`IecLines`], everything is
/// in terms of active and released, and data bytes are logical (a bit set
/// is a line pulled low).
pub trait IeeeLines {
    fn set(&mut self, lines: IeeeLine);

    fn release(&mut self, lines: IeeeLine);

    fn active(&self) -> IeeeLine;

    fn get(&self, line: IeeeLine) -> bool {
        self.active().intersects(line)
    }

    /// Release `lines` with the adapter's pull-ups off, so they only read
    /// released if something else on the bus pulls them up.
    fn float(&mut self, lines: IeeeLine);

    /// Release every line, pull-ups on, and make the data port an input.
    fn init(&mut self);

    /// Drive a byte onto the data port.
    fn data_out(&mut self, byte: u8);

    /// Make the data port an input and read it.
    fn data_in(&mut self) -> u8;
}

/// Everything the IEEE-488 driver needs from the platform.
pub trait IeeeHardware: IeeeLines + Clock + Supervisor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mask_drops_unknown_bits() {
        assert_eq!(Lines::from_host(0xFF), Lines::all());
        assert_eq!(Lines::from_host(0x05), Lines::DATA | Lines::ATN);
        assert_eq!(Lines::PRIMARY.bits(), 0x0F);
    }
}

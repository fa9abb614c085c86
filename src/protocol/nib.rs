//! This file implements the nibbler primitives used by nibtools: the
//! parallel burst handshake, the polled parallel track transfer, and their
//! fast serial (SRQ) equivalents for the 1571.
//!
//! These are timing critical, with the drive code streaming a byte every
//! few tens of us, so all waits spin rather than yield.  They are bounded
//! by a generous per-byte timeout and are cancellable.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::iec::IecDriver;
use super::session::BusSession;
use super::transport::Transport;
use crate::constants::NIB_SUPPRESSED_READ;
use crate::driver::BusError;
use crate::infra::lines::{IecHardware, Lines};
use crate::util::time::nib::{
    BYTE_TIMEOUT, PARBURST_ATN_HOLD_US, PARBURST_SAMPLE_US, PARBURST_WRITE_HOLD_US,
};
use crate::util::time::srq::{
    BIT_ASSERT_NS, BIT_SETTLE_NS, READ_SAMPLE_NS, SRQBURST_READ_HOLD_US, SRQBURST_WRITE_HOLD_US,
    WRITE_HANDSHAKE_POLLS,
};

/// A parallel burst read, unless the command filter is holding burst
/// transfers back, in which case a dummy value is returned.
pub fn parburst_read_checked<T: Transport>(
    t: &mut T,
    session: &mut BusSession,
) -> Result<u8, BusError> {
    if session.nib.suppressed() {
        return Ok(NIB_SUPPRESSED_READ);
    }
    t.parburst_read()
}

/// A parallel burst write, unless the command filter saves the byte for
/// the coming track transfer.
pub fn parburst_write_checked<T: Transport>(
    t: &mut T,
    session: &mut BusSession,
    byte: u8,
) -> Result<(), BusError> {
    if session.nib.check_write(byte) {
        t.parburst_write(byte)
    } else {
        Ok(())
    }
}

/// As [`parburst_read_checked`], over SRQ.
pub fn srqburst_read_checked<T: Transport>(
    t: &mut T,
    session: &mut BusSession,
) -> Result<u8, BusError> {
    if session.nib.suppressed() {
        return Ok(NIB_SUPPRESSED_READ);
    }
    t.srqburst_read()
}

/// As [`parburst_write_checked`], over SRQ.
pub fn srqburst_write_checked<T: Transport>(
    t: &mut T,
    session: &mut BusSession,
    byte: u8,
) -> Result<(), BusError> {
    if session.nib.check_write(byte) {
        t.srqburst_write(byte)
    } else {
        Ok(())
    }
}

impl<H: IecHardware> IecDriver<H> {
    // Spin while `cond` holds.
    fn spin_while<F: Fn(&H) -> bool>(&mut self, cond: F) -> Result<(), BusError> {
        let deadline = self.hw.now() + BYTE_TIMEOUT;
        while cond(&self.hw) {
            if self.hw.is_cancelled() {
                return Err(BusError::Cancelled);
            }
            if self.hw.now() >= deadline {
                debug!("Nib: handshake timed out");
                return Err(BusError::Timeout);
            }
            self.hw.spin();
        }
        Ok(())
    }

    /// Read a byte with the parallel burst handshake.
    pub(crate) fn parburst_read(&mut self) -> Result<u8, BusError> {
        // Set ATN and wait for drive to release DATA
        self.hw.set_release(Lines::ATN, Lines::DATA | Lines::CLOCK);
        self.hw.block_us(PARBURST_ATN_HOLD_US);
        self.spin_while(|hw| hw.get(Lines::DATA))?;

        // Byte ready - read it and release ATN
        self.hw.block_us(PARBURST_SAMPLE_US);
        let byte = self.hw.pp_read();
        self.hw.release(Lines::ATN);

        // Wait for the drive to pull DATA again.  Delay for a bit afterwards
        // to keep the next read from being too close together.
        self.spin_while(|hw| !hw.get(Lines::DATA))?;
        self.hw.block_us(PARBURST_ATN_HOLD_US);

        Ok(byte)
    }

    /// Write a byte with the parallel burst handshake.
    pub(crate) fn parburst_write(&mut self, byte: u8) -> Result<(), BusError> {
        self.hw.set_release(Lines::ATN, Lines::DATA | Lines::CLOCK);
        self.hw.block_us(PARBURST_ATN_HOLD_US);
        self.spin_while(|hw| hw.get(Lines::DATA))?;

        self.hw.pp_write(byte);
        self.hw.block_us(PARBURST_SAMPLE_US);
        self.hw.release(Lines::ATN);

        // The drive pulls DATA before it has really taken the byte, so
        // hold the data valid a while first
        self.hw.block_us(PARBURST_WRITE_HOLD_US);
        self.spin_while(|hw| !hw.get(Lines::DATA))?;

        // Back to an input
        self.hw.pp_read();
        Ok(())
    }

    /// Read the next byte of a polled track transfer.  The drive toggles
    /// DATA for each byte.  Caller must have released DATA.
    #[inline(always)]
    pub(crate) fn nib_read_handshaked(&mut self, toggle: bool) -> Result<u8, BusError> {
        self.spin_while(|hw| hw.get(Lines::DATA) != toggle)?;

        // Read it directly from the port without debouncing
        Ok(self.hw.pp_read())
    }

    /// Write the next byte of a polled track transfer.  Caller must have
    /// released DATA.
    #[inline(always)]
    pub(crate) fn nib_write_handshaked(&mut self, byte: u8, toggle: bool) -> Result<(), BusError> {
        self.spin_while(|hw| hw.get(Lines::DATA) != toggle)?;
        self.hw.pp_write(byte);
        Ok(())
    }

    /// Read a byte over SRQ, after taking ATN to ask the drive to send.
    pub(crate) fn srqburst_read(&mut self) -> Result<u8, BusError> {
        self.hw
            .set_release(Lines::ATN, Lines::SRQ | Lines::CLOCK | Lines::DATA);
        self.hw.block_us(SRQBURST_READ_HOLD_US);

        let byte = self.srq_read_byte()?;
        self.hw.release(Lines::ATN);

        // Wait for the drive to release CLK
        self.spin_while(|hw| hw.get(Lines::CLOCK))?;
        Ok(byte)
    }

    /// Write a byte over SRQ, once the drive has signalled it's ready with
    /// CLK.
    pub(crate) fn srqburst_write(&mut self, byte: u8) -> Result<(), BusError> {
        self.hw
            .set_release(Lines::ATN, Lines::SRQ | Lines::CLOCK | Lines::DATA);
        self.hw.block_us(SRQBURST_WRITE_HOLD_US);
        self.spin_while(|hw| !hw.get(Lines::CLOCK))?;

        self.srq_write(byte);
        self.hw.block_us(SRQBURST_READ_HOLD_US);
        self.hw.release(Lines::ATN);

        self.spin_while(|hw| hw.get(Lines::CLOCK))
    }

    /// Write the next byte of an SRQ track transfer, once the drive has
    /// toggled CLK.  The drive code is tight, so only a short wait is
    /// allowed.
    pub(crate) fn srq_write_handshaked(&mut self, byte: u8, toggle: bool) -> Result<(), BusError> {
        let mut polls = 0;
        while self.hw.get(Lines::CLOCK) != toggle {
            polls += 1;
            if polls >= WRITE_HANDSHAKE_POLLS {
                debug!("Nib: SRQ write handshake timed out");
                return Err(BusError::Timeout);
            }
            self.hw.spin();
        }
        self.srq_write(byte);
        Ok(())
    }

    /// Clock a byte in over SRQ, MSB first.  The drive pulses SRQ for each
    /// bit, and DATA is sampled shortly after the pulse ends.
    #[inline(always)]
    pub(crate) fn srq_read_byte(&mut self) -> Result<u8, BusError> {
        let mut byte = 0;
        for _ in 0..8 {
            self.spin_while(|hw| !hw.get(Lines::SRQ))?;
            self.spin_while(|hw| hw.get(Lines::SRQ))?;
            self.hw.block_ns(READ_SAMPLE_NS);

            byte = (byte << 1) | (!self.hw.get(Lines::DATA) as u8);
        }
        Ok(byte)
    }

    // Clock a byte out over SRQ, MSB first.  nibtools relies on the exact
    // pulse timing.
    #[inline(always)]
    fn srq_write(&mut self, mut byte: u8) {
        for _ in 0..8 {
            if byte & 0x80 != 0 {
                self.hw.release(Lines::DATA);
            } else {
                self.hw.set(Lines::DATA);
            }
            self.hw.set(Lines::SRQ);
            byte <<= 1;
            self.hw.block_ns(BIT_ASSERT_NS);
            self.hw.release(Lines::SRQ);
            self.hw.block_ns(BIT_SETTLE_NS);
        }
    }
}

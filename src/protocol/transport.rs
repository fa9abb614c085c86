//! Contains the Transport trait: the single-byte wire primitives of every
//! protocol the IEC bus supports.  The read and write loops are written
//! against this, so they can be driven by a mock in tests.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Duration;

use super::iec::IecDriver;
use super::session::BusSession;
use crate::driver::BusError;
use crate::infra::lines::{IecHardware, Lines};
use crate::util::time::iec::IEC_T_R;

#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Whether the host has asked for the current transfer to stop.
    fn is_cancelled(&self) -> bool;

    fn feed(&mut self);

    fn set_lines(&mut self, lines: Lines);

    fn release_lines(&mut self, lines: Lines);

    /// Yield for (at least) `duration`.
    async fn settle(&mut self, duration: Duration);

    /// Leave the bus safe after a failed transfer: wait the minimum frame to
    /// release time, then let go of every line.
    fn abort_transfer(&mut self);

    //
    // Standard CBM protocol
    //

    /// Take the bus for a write, with or without ATN, and wait for a
    /// listener.
    fn cbm_write_start(&mut self, atn: bool) -> Result<(), BusError>;

    /// Write a byte, with EOI if requested.
    async fn cbm_write_byte(&mut self, byte: u8, eoi: bool) -> Result<(), BusError>;

    /// Finish a successful write, turning the bus around if `talk`.
    async fn cbm_write_finish(&mut self, talk: bool) -> Result<(), BusError>;

    /// Read and acknowledge a byte.  None if the talker has already
    /// signalled EOI.
    async fn cbm_read_byte(&mut self, session: &mut BusSession) -> Result<Option<u8>, BusError>;

    //
    // Alternate protocols used by OpenCBM's drive-side transfer code
    //

    async fn s1_read_byte(&mut self) -> Result<u8, BusError>;
    async fn s1_write_byte(&mut self, byte: u8) -> Result<(), BusError>;
    async fn s2_read_byte(&mut self) -> Result<u8, BusError>;
    async fn s2_write_byte(&mut self, byte: u8) -> Result<(), BusError>;
    async fn p2_read_byte(&mut self) -> Result<u8, BusError>;
    async fn p2_write_byte(&mut self, byte: u8) -> Result<(), BusError>;
    async fn pp_read_pair(&mut self) -> Result<[u8; 2], BusError>;
    async fn pp_write_pair(&mut self, pair: [u8; 2]) -> Result<(), BusError>;

    //
    // Nibbler parallel burst
    //

    fn parburst_read(&mut self) -> Result<u8, BusError>;
    fn parburst_write(&mut self, byte: u8) -> Result<(), BusError>;
    fn nib_read_handshaked(&mut self, toggle: bool) -> Result<u8, BusError>;
    fn nib_write_handshaked(&mut self, byte: u8, toggle: bool) -> Result<(), BusError>;

    /// Closes a written track: a final handshaked 0x00, then a burst read
    /// of the drive's dummy result.
    fn nib_write_track_end(&mut self, toggle: bool) -> Result<(), BusError>;

    //
    // Nibbler SRQ fast serial
    //

    fn srqburst_read(&mut self) -> Result<u8, BusError>;
    fn srqburst_write(&mut self, byte: u8) -> Result<(), BusError>;
    fn srq_read_byte(&mut self) -> Result<u8, BusError>;
    fn srq_write_handshaked(&mut self, byte: u8, toggle: bool) -> Result<(), BusError>;
}

impl<H: IecHardware> Transport for IecDriver<H> {
    fn is_cancelled(&self) -> bool {
        self.hw.is_cancelled()
    }

    fn feed(&mut self) {
        self.hw.feed();
    }

    fn set_lines(&mut self, lines: Lines) {
        self.hw.set(lines);
    }

    fn release_lines(&mut self, lines: Lines) {
        self.hw.release(lines);
    }

    async fn settle(&mut self, duration: Duration) {
        self.hw.yield_for(duration).await;
    }

    fn abort_transfer(&mut self) {
        self.hw.block_us(IEC_T_R);
        self.hw.release(Lines::PRIMARY | Lines::SRQ);
    }

    fn cbm_write_start(&mut self, atn: bool) -> Result<(), BusError> {
        IecDriver::cbm_write_start(self, atn)
    }

    async fn cbm_write_byte(&mut self, byte: u8, eoi: bool) -> Result<(), BusError> {
        IecDriver::cbm_write_byte(self, byte, eoi).await
    }

    async fn cbm_write_finish(&mut self, talk: bool) -> Result<(), BusError> {
        IecDriver::cbm_write_finish(self, talk).await
    }

    async fn cbm_read_byte(&mut self, session: &mut BusSession) -> Result<Option<u8>, BusError> {
        IecDriver::cbm_read_byte(self, session).await
    }

    async fn s1_read_byte(&mut self) -> Result<u8, BusError> {
        IecDriver::s1_read_byte(self).await
    }

    async fn s1_write_byte(&mut self, byte: u8) -> Result<(), BusError> {
        IecDriver::s1_write_byte(self, byte).await
    }

    async fn s2_read_byte(&mut self) -> Result<u8, BusError> {
        IecDriver::s2_read_byte(self).await
    }

    async fn s2_write_byte(&mut self, byte: u8) -> Result<(), BusError> {
        IecDriver::s2_write_byte(self, byte).await
    }

    async fn p2_read_byte(&mut self) -> Result<u8, BusError> {
        IecDriver::p2_read_byte(self).await
    }

    async fn p2_write_byte(&mut self, byte: u8) -> Result<(), BusError> {
        IecDriver::p2_write_byte(self, byte).await
    }

    async fn pp_read_pair(&mut self) -> Result<[u8; 2], BusError> {
        IecDriver::pp_read_pair(self).await
    }

    async fn pp_write_pair(&mut self, pair: [u8; 2]) -> Result<(), BusError> {
        IecDriver::pp_write_pair(self, pair).await
    }

    fn parburst_read(&mut self) -> Result<u8, BusError> {
        IecDriver::parburst_read(self)
    }

    fn parburst_write(&mut self, byte: u8) -> Result<(), BusError> {
        IecDriver::parburst_write(self, byte)
    }

    fn nib_read_handshaked(&mut self, toggle: bool) -> Result<u8, BusError> {
        IecDriver::nib_read_handshaked(self, toggle)
    }

    fn nib_write_handshaked(&mut self, byte: u8, toggle: bool) -> Result<(), BusError> {
        IecDriver::nib_write_handshaked(self, byte, toggle)
    }

    fn nib_write_track_end(&mut self, toggle: bool) -> Result<(), BusError> {
        IecDriver::nib_write_handshaked(self, 0, toggle)?;
        IecDriver::parburst_read(self).map(|_| ())
    }

    fn srqburst_read(&mut self) -> Result<u8, BusError> {
        IecDriver::srqburst_read(self)
    }

    fn srqburst_write(&mut self, byte: u8) -> Result<(), BusError> {
        IecDriver::srqburst_write(self, byte)
    }

    fn srq_read_byte(&mut self) -> Result<u8, BusError> {
        IecDriver::srq_read_byte(self)
    }

    fn srq_write_handshaked(&mut self, byte: u8, toggle: bool) -> Result<(), BusError> {
        IecDriver::srq_write_handshaked(self, byte, toggle)
    }
}

//! This file implements the Commodore IEC protocol driver.  Based on
//! the xum1541 source code.
//!
//! The driver is generic over the platform's [`IecHardware`], so the same
//! code runs against real GPIOs and against the simulated bus in tests.
//!
//! We have two choices for a delay:
//! * block - busy-waits for the duration indicated.  Used where precise
//!   timing is required, which is most of the byte level handshake.
//! * yield - lets something else run, so the pause may be longer than
//!   requested.  Used for the long, unbounded waits (for a listener, for the
//!   bus to become free).
//!
//! Irrespective of which is used, long waits must feed the watchdog and
//! check for cancellation.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::session::BusSession;
use super::{ProtocolFlags, ProtocolType, read, write};
use crate::constants::{
    IEC_CLOSE, IEC_LISTEN, IEC_OPEN, IEC_SECONDARY, IEC_TALK, IEC_UNLISTEN, IEC_UNTALK,
};
use crate::driver::{BusError, ProtocolDriver};
use crate::infra::lines::{IecHardware, Lines};
use crate::transfer::{ByteSink, ByteSource, HostChannel, InTransfer, OutTransfer, SliceSource};
use crate::types::DeviceAddress;
use crate::util::time::iec::{
    BUS_FREE_CHECK_YIELD, BUS_FREE_TIMEOUT, EOI_ACK_HOLD_US, FOREVER_TIMEOUT, IEC_T_BB,
    IEC_T_NE, IEC_T_S, IEC_T_S_PAD, IEC_T_TK_NS, IEC_T_V, IEC_WAIT_POLL,
    INIT_SETTLE_US, LISTENER_WAIT_INTERVAL, READ_BYTE_GAP_US, READ_CLK_START_POLL,
    READ_CLK_START_TIMEOUT, READ_EOI_POLL_US, READ_EOI_POLLS, RESET_HOLD, WAIT_2MS_POLL_US,
    WAIT_2MS_POLLS, WRITE_TALK_CLK_TIMEOUT,
};
use crate::util::time::iec_delay;

const NO_LINES: Lines = Lines::empty();

// The IEC protocol driver implementation
pub struct IecDriver<H: IecHardware> {
    pub(crate) hw: H,
}

impl<H: IecHardware> ProtocolDriver for IecDriver<H> {
    /// Timing is not critical here, so we use yield.
    async fn reset(&mut self, session: &mut BusSession, forever: bool) -> Result<(), BusError> {
        debug!("Reset");
        self.hw
            .release(Lines::DATA | Lines::ATN | Lines::CLOCK | Lines::SRQ);

        // Reset EOI state
        session.clear_eoi();
        session.set_do_not_release_bus(false);

        // Hold reset line active.  Some drives need much more than 30ms.
        self.hw.set(Lines::RESET);
        self.hw.yield_for(RESET_HOLD).await;
        self.hw.release(Lines::RESET);

        let result = self.wait_for_free_bus(forever).await;
        debug!("Reset: done {:?}", result);
        result
    }

    async fn raw_write<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        flags: ProtocolFlags,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        self.transfer_write(session, ProtocolType::Cbm, len, flags, host)
            .await
    }

    async fn raw_read<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        self.transfer_read(session, ProtocolType::Cbm, len, host).await
    }

    // As this is wait forever, timing with the loop isn't critical, so we
    // use yield.
    async fn wait(
        &mut self,
        _session: &mut BusSession,
        line: u8,
        state: u8,
    ) -> Result<(), BusError> {
        let mask = Lines::from_host(line);
        let want = if state != 0 { mask } else { NO_LINES };
        self.hw
            .wait_until(mask, want, IEC_WAIT_POLL, FOREVER_TIMEOUT)
            .await
    }

    fn poll(&mut self) -> u8 {
        (self.hw.active() & Lines::PRIMARY).bits()
    }

    fn set_release(&mut self, set: u8, release: u8) {
        let set = Lines::from_host(set);
        let release = Lines::from_host(release);
        if release.is_empty() {
            self.hw.set(set);
        } else if set.is_empty() {
            self.hw.release(release);
        } else {
            self.hw.set_release(set, release);
        }
    }
}

// Various other functions
impl<H: IecHardware> IecDriver<H> {
    /// Creates the driver, leaving all lines released.
    pub fn new(mut hw: H) -> Self {
        hw.release(Lines::PRIMARY | Lines::SRQ);
        hw.block_us(INIT_SETTLE_US);
        Self { hw }
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Check if the bus is free.
    ///
    /// Every exit path takes ~200us, so that wait_for_free_bus() timing is
    /// correct.  Hence we block throughout.
    pub fn check_if_bus_free(&mut self) -> bool {
        // Release all lines and wait for drive reaction time
        self.hw.release(Lines::PRIMARY);
        self.hw.block_us(50);

        // If DATA is held, drive is not yet ready
        if self.hw.get(Lines::DATA) {
            self.hw.block_us(150);
            return false;
        }

        // Ensure DATA is stable - it has been seen to glitch if stable for
        // less than ~38us before ATN is pulled.
        self.hw.block_us(50);
        if self.hw.get(Lines::DATA) {
            self.hw.block_us(100);
            return false;
        }

        // Assert ATN and wait for drive reaction
        self.hw.set(Lines::ATN);
        self.hw.block_us(100);

        // If DATA is still unset, no drive answered
        if !self.hw.get(Lines::DATA) {
            self.hw.release(Lines::ATN);
            return false;
        }

        // Test releasing ATN
        self.hw.release(Lines::ATN);
        self.hw.block_us(100);

        // Check if drive released DATA
        !self.hw.get(Lines::DATA)
    }

    /// Wait for the bus to be free
    ///
    /// Timing is not criticial here, so we use yield.
    pub async fn wait_for_free_bus(&mut self, forever: bool) -> Result<(), BusError> {
        // Figure out the time to wait
        let timeout = if forever {
            FOREVER_TIMEOUT
        } else {
            BUS_FREE_TIMEOUT
        };
        let deadline = self.hw.now() + timeout;

        loop {
            // Check if bus is free
            if self.check_if_bus_free() {
                break Ok(());
            }

            // Check if we should cancel
            if self.hw.is_cancelled() {
                info!("Aborted waiting for free bus");
                break Err(BusError::Cancelled);
            }

            if self.hw.now() >= deadline {
                debug!("Timed out waiting for the bus to be free (expected if no drive)");
                break Err(BusError::Timeout);
            }

            // Wait so we don't tight loop
            self.hw.feed();
            self.hw.yield_for(BUS_FREE_CHECK_YIELD).await;
        }
    }

    /// Wait up to 2ms for the lines in `mask` to leave the `active` state.
    ///
    /// * `wait_timeout_2ms(DATA, NO_LINES)` waits for DATA to be pulled.
    /// * `wait_timeout_2ms(DATA, DATA)` waits for DATA to be released.
    /// * `wait_timeout_2ms(ATN | RESET, ATN | RESET)` waits for at least one
    ///   of ATN and RESET to be released.
    ///
    /// Returns true if the lines changed state in time.  Timing is critical,
    /// so we block.
    pub fn wait_timeout_2ms(&mut self, mask: Lines, active: Lines) -> bool {
        let mut count = WAIT_2MS_POLLS;
        while self.hw.active() & mask == active && count != 0 {
            count -= 1;
            self.hw.block_us(WAIT_2MS_POLL_US);
        }
        self.hw.active() & mask != active
    }

    /// Wait for listener to release DATA line.
    ///
    /// The listener hold-off time is unbounded (printers can take a long
    /// time), so this waits forever unless cancelled.  Timing is not
    /// critical so we yield.
    pub async fn wait_for_listener(&mut self) -> Result<(), BusError> {
        // Release CLK to indicate we're ready to send
        self.hw.release(Lines::CLOCK);

        self.hw
            .wait_until(Lines::DATA, NO_LINES, LISTENER_WAIT_INTERVAL, FOREVER_TIMEOUT)
            .await
            .inspect_err(|_| info!("Aborted waiting for listener"))
    }

    /// Send a byte, LSB first.  Returns whether the listener acknowledged
    /// it.
    ///
    /// The IEC minimum setup time (20us) isn't enough for a 1541, nor is
    /// the typical 70us, so we use 75us.  The hold time doesn't appear to
    /// matter.
    fn send_byte(&mut self, mut byte: u8) -> bool {
        for _ in 0..8 {
            // Wait for setup time, with padding
            self.hw.block_us(IEC_T_S + IEC_T_S_PAD);

            // Set the bit value on the DATA line and wait for it to settle
            if byte & 1 == 0 {
                self.hw.set(Lines::DATA);
                iec_delay!(self.hw);
            }

            // Trigger clock edge and hold valid for the minimum time
            self.hw.release(Lines::CLOCK);
            self.hw.block_us(IEC_T_V);

            self.hw.set_release(Lines::CLOCK, Lines::DATA);
            byte >>= 1;
        }

        // Wait up to 2ms for the listener to acknowledge by pulling DATA
        self.wait_timeout_2ms(Lines::DATA, NO_LINES)
    }

    /// Receive a single byte, LSB first.  Called once the talker has
    /// pulled CLK to start the byte.
    fn receive_byte(&mut self) -> Result<u8, BusError> {
        // Wait for CLK to be asserted
        if !self.wait_timeout_2ms(Lines::CLOCK, NO_LINES) {
            debug!("Receive byte: no clock");
            return Err(BusError::Timeout);
        }

        let mut byte: u8 = 0;
        for _ in 0..8 {
            // Wait for CLK to be released - the bit is valid
            if !self.wait_timeout_2ms(Lines::CLOCK, Lines::CLOCK) {
                debug!("Receive byte: clock not released");
                return Err(BusError::Timeout);
            }

            byte >>= 1;
            if !self.hw.get(Lines::DATA) {
                byte |= 0x80;
            }

            // Wait for CLK to be asserted again
            if !self.wait_timeout_2ms(Lines::CLOCK, NO_LINES) {
                debug!("Receive byte: no clock in loop");
                return Err(BusError::Timeout);
            }
        }

        Ok(byte)
    }

    /// Write `len` bytes from `src` to the bus, using the standard CBM
    /// protocol.
    ///
    /// With ATN, the bytes are commands (LISTEN, TALK, etc) and no EOI is
    /// signalled.  Without, the last byte is sent with EOI.  With TALK,
    /// the bus is turned around afterwards, so the addressed device talks.
    pub async fn write_bytes<S: ByteSource>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        flags: ProtocolFlags,
        src: &mut S,
    ) -> Result<u16, (BusError, u16)> {
        write::write(self, session, ProtocolType::Cbm, len, flags, src).await
    }

    /// Read up to `len` bytes from the current talker into `sink`, stopping
    /// early if the talker signals EOI.
    pub async fn read_bytes<K: ByteSink>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        sink: &mut K,
    ) -> Result<u16, (BusError, u16)> {
        read::read(self, session, ProtocolType::Cbm, len, sink).await
    }

    /// Write `len` bytes from the host to the bus using `protocol`.  Only
    /// the standard CBM protocol checks the cable first, the others run
    /// custom drive code which was uploaded with it.
    pub async fn transfer_write<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        protocol: ProtocolType,
        len: u16,
        flags: ProtocolFlags,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        trace!("Write: {} {} bytes, flags {:?}", protocol, len, flags);
        let mut xfer = OutTransfer::new(host, len);
        let checked = if protocol == ProtocolType::Cbm {
            self.check_cable(session)
        } else {
            Ok(())
        };
        let result = match checked {
            Ok(()) => write::write(self, session, protocol, len, flags, &mut xfer).await,
            Err(e) => Err((e, 0)),
        };
        xfer.finish().await;
        result
    }

    /// Read up to `len` bytes from the bus to the host using `protocol`.
    /// Returns the number of bytes the host was sent.
    pub async fn transfer_read<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        protocol: ProtocolType,
        len: u16,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        trace!("Read: {} {} bytes requested", protocol, len);
        if protocol == ProtocolType::Cbm {
            if let Err(e) = self.check_cable(session) {
                return Err((e, 0));
            }
        }
        let mut xfer = InTransfer::new(host, len);
        let result = read::read(self, session, protocol, len, &mut xfer).await;
        let sent = xfer.finish().await;
        match result {
            Ok(_) => Ok(sent),
            Err((e, _)) => Err((e, sent)),
        }
    }

    /// Read the parallel port directly.
    pub fn pp_read(&mut self) -> u8 {
        let byte = self.hw.pp_read();
        self.pp_settle();
        byte
    }

    /// Write the parallel port directly.
    pub fn pp_write(&mut self, byte: u8) {
        self.hw.pp_write(byte);
        self.pp_settle();
    }

    /// Take the bus ready to write, checking a device is there to listen.
    pub(crate) fn cbm_write_start(&mut self, atn: bool) -> Result<(), BusError> {
        // If ATN and RESET are both held, there's at least one drive
        // attached but none are powered.  Bail now rather than getting stuck
        // waiting for a listener.
        if !self.wait_timeout_2ms(Lines::ATN | Lines::RESET, Lines::ATN | Lines::RESET) {
            info!("Write: no devices on bus");
            return Err(BusError::NoDevices);
        }

        self.hw.release(Lines::DATA);
        let start = if atn {
            Lines::CLOCK | Lines::ATN
        } else {
            Lines::CLOCK
        };
        self.hw.set(start);
        iec_delay!(self.hw);

        // Wait for any device to pull DATA after we set CLK.  This should
        // happen within 1ms, but we allow a bit longer.
        if !self.wait_timeout_2ms(Lines::DATA, NO_LINES) {
            info!("Write: no devices");
            self.hw.release(Lines::CLOCK | Lines::ATN);
            return Err(BusError::NoDevices);
        }

        // Wait a short while for the drive to be ready for us to release
        // CLK.  Below ~10us gets unreliable.
        self.hw.block_us(IEC_T_NE);
        Ok(())
    }

    /// Write one byte, signalling EOI first if `eoi`.
    pub(crate) async fn cbm_write_byte(&mut self, byte: u8, eoi: bool) -> Result<(), BusError> {
        // Be sure DATA has been pulled by the device.  If not, we timed
        // out without a device being ready.
        if !self.hw.get(Lines::DATA) {
            debug!("Write: device not present");
            return Err(BusError::NoDevice);
        }

        // Release CLK and wait forever for the listener to release DATA
        self.wait_for_listener().await?;

        // Signal EOI by waiting so long (200us or more) that the listener
        // pulls DATA, then wait for it to release it again.  Otherwise we
        // must set CLK within 60us.
        if eoi {
            self.wait_timeout_2ms(Lines::DATA, NO_LINES);
            self.wait_timeout_2ms(Lines::DATA, Lines::DATA);
        }
        self.hw.set(Lines::CLOCK);

        if !self.send_byte(byte) {
            return Err(BusError::NoAck);
        }
        self.hw.block_us(IEC_T_BB);
        Ok(())
    }

    /// Complete a write.  The per-byte IEC_T_BB delay is longer than the
    /// minimum time before releasing ATN (IEC_T_R).
    pub(crate) async fn cbm_write_finish(&mut self, talk: bool) -> Result<(), BusError> {
        if talk {
            self.talk_turnaround().await
        } else {
            self.hw.release(Lines::ATN);
            Ok(())
        }
    }

    /// Talker and listener exchange roles.
    async fn talk_turnaround(&mut self) -> Result<(), BusError> {
        // Hold DATA and release ATN, waiting talk-ATN release time
        self.hw.set_release(Lines::DATA, Lines::ATN);
        self.hw.block_ns(IEC_T_TK_NS);

        // Now release CLK and wait for device to grab it
        self.hw.release(Lines::CLOCK);
        iec_delay!(self.hw);

        self.hw
            .wait_until(
                Lines::CLOCK,
                Lines::CLOCK,
                LISTENER_WAIT_INTERVAL,
                WRITE_TALK_CLK_TIMEOUT,
            )
            .await
            .inspect_err(|e| info!("Write: talk turnaround failed: {}", e))
    }

    /// Read a single byte, acknowledging it.  None if EOI has already been
    /// seen.
    pub(crate) async fn cbm_read_byte(
        &mut self,
        session: &mut BusSession,
    ) -> Result<Option<u8>, BusError> {
        // Wait for clock to be released, with 1s timeout.  Typically times
        // out during a directory read.  Timing isn't critical, so yield.
        self.hw
            .wait_until(
                Lines::CLOCK,
                NO_LINES,
                READ_CLK_START_POLL,
                READ_CLK_START_TIMEOUT,
            )
            .await?;

        // Don't return data after EOI
        if session.eoi() {
            debug!("Read: EOI already seen");
            return Ok(None);
        }

        // Release DATA line to signal we're ready for data
        self.hw.release(Lines::DATA);

        // Wait up to 400us for CLK to be pulled by the drive
        let mut count = READ_EOI_POLLS;
        while !self.hw.get(Lines::CLOCK) && count != 0 {
            count -= 1;
            self.hw.block_us(READ_EOI_POLL_US);
        }

        // If it wasn't, the talker is signalling EOI, which we acknowledge
        if !self.hw.get(Lines::CLOCK) {
            debug!("Read: EOI signalled");
            session.set_eoi();
            self.hw.set(Lines::DATA);
            self.hw.block_us(EOI_ACK_HOLD_US);
            self.hw.release(Lines::DATA);
        }

        let byte = self.receive_byte()?;

        // Acknowledge byte received by pulling DATA, then give the talker
        // a moment before the next one
        self.hw.set(Lines::DATA);
        self.hw.block_us(READ_BYTE_GAP_US);
        Ok(Some(byte))
    }

    // Write command bytes under ATN.
    async fn atn_write(
        &mut self,
        session: &mut BusSession,
        bytes: &[u8],
        talk: bool,
    ) -> Result<(), BusError> {
        self.check_cable(session)?;
        let flags = if talk {
            ProtocolFlags::CBM_ATN | ProtocolFlags::CBM_TALK
        } else {
            ProtocolFlags::CBM_ATN
        };
        let mut src = SliceSource::new(bytes);
        self.write_bytes(session, bytes.len() as u16, flags, &mut src)
            .await
            .map(|_| ())
            .map_err(|(e, _)| e)
    }

    /// Tell a device to listen on a channel.
    pub async fn listen(
        &mut self,
        session: &mut BusSession,
        addr: DeviceAddress,
    ) -> Result<(), BusError> {
        let cmd = [IEC_LISTEN | addr.device(), IEC_SECONDARY | addr.secondary()];
        self.atn_write(session, &cmd, false).await
    }

    /// Tell a device to talk on a channel, and turn the bus around so it
    /// can.
    pub async fn talk(
        &mut self,
        session: &mut BusSession,
        addr: DeviceAddress,
    ) -> Result<(), BusError> {
        let cmd = [IEC_TALK | addr.device(), IEC_SECONDARY | addr.secondary()];
        self.atn_write(session, &cmd, true).await
    }

    /// Open a channel.  Follow with the file name, then unlisten().
    pub async fn open(
        &mut self,
        session: &mut BusSession,
        addr: DeviceAddress,
    ) -> Result<(), BusError> {
        let cmd = [IEC_LISTEN | addr.device(), IEC_OPEN | addr.secondary()];
        self.atn_write(session, &cmd, false).await
    }

    /// Close a channel.
    pub async fn close(
        &mut self,
        session: &mut BusSession,
        addr: DeviceAddress,
    ) -> Result<(), BusError> {
        let cmd = [IEC_LISTEN | addr.device(), IEC_CLOSE | addr.secondary()];
        self.atn_write(session, &cmd, false).await?;
        self.unlisten(session).await
    }

    pub async fn unlisten(&mut self, session: &mut BusSession) -> Result<(), BusError> {
        self.atn_write(session, &[IEC_UNLISTEN], false).await
    }

    pub async fn untalk(&mut self, session: &mut BusSession) -> Result<(), BusError> {
        self.atn_write(session, &[IEC_UNTALK], false).await
    }

    /// Let go of the bus entirely.
    pub fn release_bus(&mut self, session: &mut BusSession) -> Result<(), BusError> {
        session.set_do_not_release_bus(false);
        let result = self.check_cable(session);
        self.hw.release(Lines::PRIMARY | Lines::SRQ);
        result
    }
}

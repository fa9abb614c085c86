//! This file implements the IEEE-488 protocol driver, used for PET and
//! CBM-II drives (2031, 4040, 8050, 8250, SFD-1001) attached to the
//! adapter's IEEE-488 port.
//!
//! IEEE-488 moves a byte at a time over 8 data lines, paced by a three wire
//! handshake:
//! * the talker asserts DAV once the data is valid
//! * listeners hold NRFD (not ready for data) until they can take a byte
//! * listeners hold NDAC (not data accepted) until they have taken it.
//!
//! EOI accompanies the last byte.  Because the last byte written isn't
//! known until the host stops sending, one byte is always held back, and
//! sent with EOI when the next command goes out under ATN.
//!
//! Only the standard CBM protocol is supported over IEEE-488, and the host
//! sees the same raw read/write semantics as on IEC.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use embassy_time::Duration;

use crate::constants::{
    IEC_ADDRESS_MASK, IEC_CLOSE, IEC_LISTEN, IEC_OPEN, IEC_SECONDARY, IEC_TALK, IEC_UNLISTEN,
    IEC_UNTALK,
};
use crate::driver::{BusError, ProtocolDriver};
use crate::infra::lines::{IeeeHardware, IeeeLine};
use crate::protocol::ProtocolFlags;
use crate::protocol::session::BusSession;
use crate::transfer::{HostChannel, InTransfer, OutTransfer};
use crate::util::time::iec::{BUS_FREE_CHECK_YIELD, BUS_FREE_TIMEOUT, FOREVER_TIMEOUT};
use crate::util::time::ieee::{
    ATN_DAV_TIMEOUT, ATN_DELAY_US, BYTE_TIMEOUT, DATA_SETUP_US, DETECT_SETTLE_US, HANDSHAKE_POLL_US,
    IFC_HOLD, READ_RETRIES,
};

// The lines the bus-free check and presence probes look at
const HANDSHAKE: IeeeLine = IeeeLine::NRFD.union(IeeeLine::NDAC);

// The lines reported by IEC_POLL.  REN and SRQ aren't.
const POLLED: IeeeLine = IeeeLine::NDAC
    .union(IeeeLine::NRFD)
    .union(IeeeLine::ATN)
    .union(IeeeLine::IFC)
    .union(IeeeLine::DAV)
    .union(IeeeLine::EOI);

pub struct IeeeDriver<E: IeeeHardware> {
    pub(crate) hw: E,

    /// The byte held back so it can be sent with EOI.
    last_byte: Option<u8>,

    /// A device has been told to listen.
    listening: bool,

    /// A device has been told to talk.
    talking: bool,
}

impl<E: IeeeHardware> ProtocolDriver for IeeeDriver<E> {
    async fn reset(&mut self, session: &mut BusSession, forever: bool) -> Result<(), BusError> {
        debug!("IEEE: reset");
        self.init_lines();
        session.clear_eoi();

        self.hw.set(IeeeLine::IFC);
        self.hw.yield_for(IFC_HOLD).await;
        self.hw.release(IeeeLine::IFC);

        self.wait_for_free_bus(forever).await
    }

    async fn raw_write<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        flags: ProtocolFlags,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        trace!("IEEE: write {} bytes, flags {:?}", len, flags);
        session.clear_eoi();
        let mut xfer = OutTransfer::new(host, len);
        let result = self.write_from(len, flags, &mut xfer).await;
        xfer.finish().await;
        result.map(|_| len).map_err(|e| {
            debug!("IEEE: write failed {}", e);
            (e, 0)
        })
    }

    async fn raw_read<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        trace!("IEEE: read {} bytes", len);
        let mut xfer = InTransfer::new(host, len);
        let result = self.read_into(session, len, &mut xfer).await;
        let sent = xfer.finish().await;
        result.map(|_| sent).map_err(|e| (e, sent))
    }

    // There's nothing to wait on for IEEE-488
    async fn wait(
        &mut self,
        _session: &mut BusSession,
        _line: u8,
        _state: u8,
    ) -> Result<(), BusError> {
        Ok(())
    }

    fn poll(&mut self) -> u8 {
        (self.hw.active() & POLLED).bits()
    }

    fn set_release(&mut self, _set: u8, _release: u8) {
        debug!("IEEE: set/release not supported");
    }
}

impl<E: IeeeHardware> IeeeDriver<E> {
    pub fn new(hw: E) -> Self {
        Self {
            hw,
            last_byte: None,
            listening: false,
            talking: false,
        }
    }

    pub fn hardware(&self) -> &E {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut E {
        &mut self.hw
    }

    /// Whether a device has been told to listen, and not unlistened.
    pub fn listening(&self) -> bool {
        self.listening
    }

    /// Whether a device has been told to talk, and not untalked.
    pub fn talking(&self) -> bool {
        self.talking
    }

    fn init_lines(&mut self) {
        self.hw.init();
        self.last_byte = None;
        self.listening = false;
        self.talking = false;
    }

    /// Look for a powered on device.  Devices pull DAV and EOI up, so with
    /// our own pull-ups off they only read released if one is there.
    ///
    /// Must be quick, as it runs before IEC is probed.
    pub fn detect(&mut self) -> bool {
        self.init_lines();
        self.hw.block_us(DETECT_SETTLE_US);

        self.hw.float(IeeeLine::DAV | IeeeLine::EOI);
        self.hw.block_us(DETECT_SETTLE_US);
        let present = !self.hw.get(IeeeLine::DAV | IeeeLine::EOI);

        if present {
            info!("IEEE: device present");
            self.init_lines();
        } else {
            debug!("IEEE: no device");
        }
        present
    }

    /// Check if the bus is free: nobody is holding the handshake, and a
    /// device answers ATN then lets go again.
    ///
    /// Every exit path takes ~200us, so that wait_for_free_bus() timing is
    /// correct.
    pub fn check_if_bus_free(&mut self) -> bool {
        self.hw.block_us(10);
        if self.hw.get(HANDSHAKE) {
            self.hw.block_us(190);
            return false;
        }

        self.hw.set(IeeeLine::ATN);
        self.hw.block_us(10);
        if !self.hw.get(HANDSHAKE) {
            // Nobody answered
            self.hw.release(IeeeLine::ATN);
            self.hw.block_us(180);
            return false;
        }

        self.hw.release(IeeeLine::ATN);
        self.hw.block_us(50);
        if self.hw.get(HANDSHAKE) {
            self.hw.block_us(100);
            if self.hw.get(HANDSHAKE) {
                self.hw.block_us(30);
                return false;
            }
        }

        self.hw.block_us(130);
        !self.hw.get(HANDSHAKE)
    }

    /// Wait for the bus to be free.  Timing is not critical, so we yield.
    pub async fn wait_for_free_bus(&mut self, forever: bool) -> Result<(), BusError> {
        let timeout = if forever {
            FOREVER_TIMEOUT
        } else {
            BUS_FREE_TIMEOUT
        };
        let deadline = self.hw.now() + timeout;

        loop {
            if self.check_if_bus_free() {
                break Ok(());
            }
            if self.hw.is_cancelled() {
                info!("IEEE: aborted waiting for free bus");
                break Err(BusError::Cancelled);
            }
            if self.hw.now() >= deadline {
                debug!("IEEE: timed out waiting for the bus to be free");
                break Err(BusError::Timeout);
            }
            self.hw.feed();
            self.hw.yield_for(BUS_FREE_CHECK_YIELD).await;
        }
    }

    // Wait for any of `line` to be `active`, polling until `timeout`.
    fn wait_line(&mut self, line: IeeeLine, active: bool, timeout: Duration) -> bool {
        let deadline = self.hw.now() + timeout;
        loop {
            if self.hw.get(line) == active {
                return true;
            }
            if self.hw.now() >= deadline {
                return false;
            }
            self.hw.feed();
            self.hw.block_us(HANDSHAKE_POLL_US);
        }
    }

    // Wait, without a timeout, for `line` to reach `active`.  Only the host
    // can get us out of here.
    fn hold_off(&mut self, line: IeeeLine, active: bool) -> Result<(), BusError> {
        while self.hw.get(line) != active {
            if self.hw.is_cancelled() {
                return Err(BusError::Cancelled);
            }
            self.hw.feed();
            self.hw.spin();
        }
        Ok(())
    }

    /// Hand a byte to the listeners.
    fn byte_out(&mut self, byte: u8) -> Result<(), BusError> {
        self.hw.release(IeeeLine::DAV);

        // A listener always holds one of these
        if !self.hw.get(HANDSHAKE) {
            debug!("IEEE: device not present");
            return Err(BusError::NoDevice);
        }

        self.hold_off(IeeeLine::NRFD, false)?;

        self.hw.data_out(byte);
        self.hw.block_us(DATA_SETUP_US);
        self.hw.set(IeeeLine::DAV);

        let accepted = self.wait_line(IeeeLine::NDAC, false, BYTE_TIMEOUT);

        self.hw.release(IeeeLine::DAV);
        self.hw.data_in();

        if accepted {
            Ok(())
        } else {
            debug!("IEEE: write timeout");
            Err(BusError::Timeout)
        }
    }

    /// Take a byte from the talker.
    fn byte_in(&mut self, session: &mut BusSession) -> Result<u8, BusError> {
        self.hw.set(IeeeLine::NDAC);
        self.hw.release(IeeeLine::NRFD);

        if !self.wait_line(IeeeLine::DAV, true, BYTE_TIMEOUT) {
            self.hw.set(IeeeLine::NDAC | IeeeLine::NRFD);
            return Err(BusError::Timeout);
        }

        self.hw.block_us(1);
        let byte = self.hw.data_in();
        if self.hw.get(IeeeLine::EOI) {
            trace!("IEEE: EOI");
            session.set_eoi();
        }

        self.hw.set(IeeeLine::NRFD);
        self.hw.block_us(1);
        self.hw.release(IeeeLine::NDAC);

        // The talker releases DAV once it sees we've got it
        let released = self.hold_off(IeeeLine::DAV, false);
        self.hw.set(IeeeLine::NDAC);
        released.map(|_| byte)
    }

    /// Send a command byte under ATN, first flushing any held back byte
    /// with EOI.  ATN is left set on success, ready for the secondary.
    fn atn_out(&mut self, byte: u8) -> Result<(), BusError> {
        self.hw.release(IeeeLine::NRFD | IeeeLine::NDAC);

        if let Some(last) = self.last_byte.take() {
            self.hw.set(IeeeLine::EOI);
            let result = self.byte_out(last);
            self.hw.release(IeeeLine::EOI);
            if let Err(e) = result {
                debug!("IEEE: final byte not sent {}", e);
            }
        } else if !self.wait_line(IeeeLine::DAV, false, ATN_DAV_TIMEOUT) {
            debug!("IEEE: talker holding DAV");
            return Err(BusError::Timeout);
        }

        self.hw.set(IeeeLine::ATN);
        self.hw.block_us(ATN_DELAY_US);

        self.byte_out(byte).inspect_err(|_| self.hw.release(IeeeLine::ATN))
    }

    fn sec_listen(&mut self, sa: u8) -> Result<(), BusError> {
        let result = self.byte_out(sa);
        if result.is_ok() {
            self.listening = true;
        }
        self.hw.release(IeeeLine::ATN);
        result
    }

    // On success the bus is turned around, with us as listener, not ready
    fn sec_talk(&mut self, sa: u8) -> Result<(), BusError> {
        let result = self.byte_out(sa);
        if result.is_ok() {
            self.hw.set(IeeeLine::NRFD | IeeeLine::NDAC);
            self.talking = true;
        }
        self.hw.release(IeeeLine::ATN);
        result
    }

    // Queue a data byte, sending the one before it
    fn bsout(&mut self, byte: u8) -> Result<(), BusError> {
        if let Some(last) = self.last_byte {
            self.byte_out(last)?;
        }
        self.last_byte = Some(byte);
        Ok(())
    }

    fn atn_release(&mut self) {
        self.hw.release(IeeeLine::ATN);
        self.hw.block_us(ATN_DELAY_US);
    }

    pub fn untalk(&mut self) -> Result<(), BusError> {
        let result = self.atn_out(IEC_UNTALK);
        self.atn_release();
        self.talking = false;
        result
    }

    pub fn unlisten(&mut self) -> Result<(), BusError> {
        let result = self.atn_out(IEC_UNLISTEN);
        self.atn_release();
        self.listening = false;
        result
    }

    pub fn listen(&mut self, device: u8, sa: u8) -> Result<(), BusError> {
        self.atn_out(IEC_LISTEN | (device & IEC_ADDRESS_MASK))?;
        self.sec_listen(IEC_SECONDARY | (sa & IEC_ADDRESS_MASK))
    }

    pub fn talk(&mut self, device: u8, sa: u8) -> Result<(), BusError> {
        self.atn_out(IEC_TALK | (device & IEC_ADDRESS_MASK))?;
        self.sec_talk(IEC_SECONDARY | (sa & 0x0F))
    }

    pub fn open(&mut self, device: u8, sa: u8) -> Result<(), BusError> {
        self.atn_out(IEC_LISTEN | (device & IEC_ADDRESS_MASK))?;
        self.sec_listen(IEC_OPEN | (sa & 0x0F))
    }

    /// Close a channel.  Always unlistens, even if the close failed.
    pub fn close(&mut self, device: u8, sa: u8) -> Result<(), BusError> {
        let result = self
            .atn_out(IEC_LISTEN | (device & IEC_ADDRESS_MASK))
            .and_then(|_| self.sec_listen(IEC_CLOSE | (sa & 0x0F)));
        let unlisten = self.unlisten();
        result.and(unlisten)
    }

    // Turn the host's raw write, which for ATN carries the primary and
    // secondary address, into the equivalent IEEE-488 sequence.
    async fn write_from<C: HostChannel>(
        &mut self,
        len: u16,
        flags: ProtocolFlags,
        xfer: &mut OutTransfer<'_, C>,
    ) -> Result<(), BusError> {
        let mut remaining = len;

        if flags.contains(ProtocolFlags::CBM_ATN) && remaining >= 1 {
            let device = xfer.next_byte().await?;
            remaining -= 1;

            if remaining == 0 || device & IEC_ADDRESS_MASK == IEC_ADDRESS_MASK {
                if device & IEC_TALK != 0 {
                    self.untalk()?;
                }
                if device & IEC_LISTEN != 0 {
                    self.unlisten()?;
                }
            } else {
                let sa = xfer.next_byte().await?;
                remaining -= 1;

                if flags.contains(ProtocolFlags::CBM_TALK) {
                    self.talk(device, sa)?;
                    remaining = 0;
                } else if remaining <= 2 {
                    match sa & 0xF0 {
                        IEC_CLOSE => self.close(device, sa)?,
                        IEC_OPEN => self.open(device, sa)?,
                        IEC_SECONDARY => self.listen(device, sa)?,
                        _ => debug!("IEEE: unknown secondary {:#04x}", sa),
                    }
                }
            }
        }

        while remaining > 0 {
            let byte = xfer.next_byte().await?;
            self.bsout(byte)?;
            remaining -= 1;
            self.hw.feed();
        }

        Ok(())
    }

    async fn read_into<C: HostChannel>(
        &mut self,
        session: &mut BusSession,
        len: u16,
        xfer: &mut InTransfer<'_, C>,
    ) -> Result<(), BusError> {
        let mut count = 0;
        while count < len {
            // Nothing more to read once the talker has signalled the end
            if session.eoi() {
                break;
            }

            let mut timeouts = 0;
            let byte = loop {
                match self.byte_in(session) {
                    Ok(byte) => break byte,
                    Err(BusError::Timeout) if timeouts < READ_RETRIES => {
                        if self.hw.is_cancelled() {
                            return Err(BusError::Cancelled);
                        }
                        timeouts += 1;
                    }
                    Err(e) => return Err(e),
                }
            };

            xfer.push(byte).await?;
            count += 1;
            self.hw.feed();
        }
        Ok(())
    }
}

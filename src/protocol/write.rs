//! This file implements the writing of bytes to the drive, for all supported
//! protocols.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::iec::IecDriver;
use super::nib::{parburst_write_checked, srqburst_write_checked};
use super::session::{BusSession, CableState};
use super::transport::Transport;
use super::{ProtocolFlags, ProtocolType};
use crate::constants::{IEC_UNLISTEN, IEC_UNTALK};
use crate::driver::BusError;
use crate::infra::lines::{IecHardware, Lines};
use crate::transfer::ByteSource;
use crate::util::time::iec_delay;

// PP moves bytes in pairs
const PP_WRITE_ITER_BYTES: u16 = 2;

/// Main write routine which handles all protocols.
///
/// See [`super::read::read`] for more information about the specific
/// protocols.
///
/// Implements the following steps:
/// - Calls the protocol specific startup routine to prep for writing
/// - Runs the main write loop, taking bytes from the source and sending
///   them to the drive.
/// - Terminates the write routine
/// - Returns the number of bytes written, or an error.
///
/// Returns
/// - Ok(u16) - Number of bytes written
/// - Err((BusError, u16)) - Error and number of bytes written to the
///   drive, before the error occurred.
pub async fn write<T: Transport, S: ByteSource>(
    t: &mut T,
    session: &mut BusSession,
    protocol: ProtocolType,
    len: u16,
    flags: ProtocolFlags,
    src: &mut S,
) -> Result<u16, (BusError, u16)> {
    if protocol == ProtocolType::Cbm {
        session.clear_eoi();
    }

    // nibtools drive code requires at least one data byte, so the track
    // loops don't start without one either
    if len == 0 {
        return Ok(0);
    }
    t.feed();

    // Do protocol specific startup routine.  Propagate any error, as we
    // don't need to terminate (startup_write() must do any clean-up).
    if let Err(e) = startup_write(t, session, protocol, flags) {
        session.set_cable_state(CableState::ErrorOccurred);
        return Err((e, 0));
    }

    let loop_result = write_main_loop(t, session, protocol, flags, len, src).await;

    // Protocol specific termination routine - we terminate whether or not
    // we hit an error.
    let result = terminate_write(t, session, protocol, flags, loop_result).await;
    t.feed();

    trace!("Write: {} result {:?}", protocol, result);
    result
}

fn startup_write<T: Transport>(
    t: &mut T,
    session: &mut BusSession,
    protocol: ProtocolType,
    flags: ProtocolFlags,
) -> Result<(), BusError> {
    match protocol {
        ProtocolType::Cbm => t.cbm_write_start(flags.contains(ProtocolFlags::CBM_ATN)),
        ProtocolType::Nib => {
            t.release_lines(Lines::DATA);

            // Kick off the transfer by replaying the saved burst writes.  The
            // 1541 and 1571 drive code differ in how many there are.
            for byte in session.nib.take_saved() {
                t.parburst_write(byte)?;
            }
            Ok(())
        }
        ProtocolType::NibSrq => {
            t.release_lines(Lines::SRQ | Lines::CLOCK | Lines::DATA | Lines::ATN);
            for byte in session.nib.take_saved() {
                t.srqburst_write(byte)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// The outcome of the main loop: bytes written, and the last of them.
struct Written {
    count: u16,
    last: u8,
}

async fn write_main_loop<T: Transport, S: ByteSource>(
    t: &mut T,
    session: &mut BusSession,
    protocol: ProtocolType,
    flags: ProtocolFlags,
    len: u16,
    src: &mut S,
) -> Result<Written, (BusError, u16)> {
    let atn = flags.contains(ProtocolFlags::CBM_ATN);
    let mut done = Written { count: 0, last: 0 };

    while done.count < len {
        if t.is_cancelled() {
            return Err((BusError::Cancelled, done.count));
        }

        let count = done.count;
        let byte = src.next_byte().await.map_err(|e| (e, count))?;
        let toggle = count & 1 == 1;
        let mut step = 1;

        let result = match protocol {
            ProtocolType::Cbm => {
                // With ATN these are commands, which never carry EOI
                let eoi = !atn && count == len - 1;
                t.cbm_write_byte(byte, eoi).await
            }
            ProtocolType::S1 => t.s1_write_byte(byte).await,
            ProtocolType::S2 => t.s2_write_byte(byte).await,
            ProtocolType::P2 => t.p2_write_byte(byte).await,
            ProtocolType::PP => {
                // An odd length is padded
                let second = if count + 1 < len {
                    src.next_byte().await.map_err(|e| (e, count))?
                } else {
                    0
                };
                step = PP_WRITE_ITER_BYTES.min(len - count);
                t.pp_write_pair([byte, second]).await
            }
            ProtocolType::Nib => t.nib_write_handshaked(byte, toggle),
            ProtocolType::NibCommand => parburst_write_checked(t, session, byte),
            ProtocolType::NibSrq => t.srq_write_handshaked(byte, toggle),
            ProtocolType::NibSrqCommand => srqburst_write_checked(t, session, byte),
            _ => {
                warn!("Write: unsupported protocol {}", protocol);
                Err(BusError::Unsupported)
            }
        };

        if let Err(e) = result {
            debug!("Write: {} byte {} failed: {}", protocol, count, e);
            return Err((e, count));
        }
        done.count += step;
        done.last = byte;
        t.feed();
    }

    Ok(done)
}

async fn terminate_write<T: Transport>(
    t: &mut T,
    session: &mut BusSession,
    protocol: ProtocolType,
    flags: ProtocolFlags,
    loop_result: Result<Written, (BusError, u16)>,
) -> Result<u16, (BusError, u16)> {
    let result = match loop_result {
        Ok(written) => {
            let count = written.count;
            let finished = match protocol {
                ProtocolType::Cbm => t
                    .cbm_write_finish(flags.contains(ProtocolFlags::CBM_TALK))
                    .await
                    .map(|_| {
                        if flags.contains(ProtocolFlags::CBM_ATN) {
                            // The bus stays held for an addressed device
                            // until it is told to unlisten or untalk
                            let released =
                                written.last == IEC_UNLISTEN || written.last == IEC_UNTALK;
                            session.set_do_not_release_bus(!released);
                        }
                        session.set_cable_state(CableState::SuccessfullyUsed);
                    }),

                // Write a final zero byte and read back the dummy result
                ProtocolType::Nib => t.nib_write_track_end(count & 1 == 1),

                // Read back the dummy result
                ProtocolType::NibSrq => t.srqburst_read().map(|_| ()),
                _ => Ok(()),
            };
            finished.map(|_| count).map_err(|e| (e, count))
        }
        Err(e) => Err(e),
    };

    if let Err((e, count)) = result {
        info!("Write: {} failed after {} bytes: {}", protocol, count, e);
        t.abort_transfer();
        session.set_cable_state(CableState::ErrorOccurred);
        if protocol == ProtocolType::Cbm {
            session.set_do_not_release_bus(false);
        }
    }
    result
}

// The alternate protocol byte primitives.
impl<H: IecHardware> IecDriver<H> {
    // S1 sends a bit at a time, MSB first, each bit twice:
    // - Set DATA to the bit, release CLK, wait for the drive to pull CLK
    // - Invert DATA, wait for the drive to release CLK
    // - Pull CLK and release DATA, wait for the drive to pull DATA
    pub(crate) async fn s1_write_byte(&mut self, mut byte: u8) -> Result<(), BusError> {
        for _ in 0..8 {
            let one = byte & 0x80 != 0;
            if one {
                self.hw.set(Lines::DATA);
            } else {
                self.hw.release(Lines::DATA);
            }
            iec_delay!(self.hw);

            // Be sure DATA is stable before CLK is released
            self.hw.release(Lines::CLOCK);
            iec_delay!(self.hw);
            self.handshake(Lines::CLOCK, Lines::CLOCK).await?;

            // Send the bit a second time, inverted
            if one {
                self.hw.release(Lines::DATA);
            } else {
                self.hw.set(Lines::DATA);
            }
            self.handshake(Lines::CLOCK, Lines::empty()).await?;

            self.hw.set_release(Lines::CLOCK, Lines::DATA);
            iec_delay!(self.hw);
            self.handshake(Lines::DATA, Lines::DATA).await?;

            byte <<= 1;
        }
        Ok(())
    }

    // S2 sends two bits per iteration, LSB first, toggling ATN for each and
    // waiting for the drive to follow with CLK.
    pub(crate) async fn s2_write_byte(&mut self, mut byte: u8) -> Result<(), BusError> {
        for _ in 0..4 {
            self.s2_data_bit(byte & 1 != 0);
            byte >>= 1;
            self.hw.release(Lines::ATN);
            self.handshake(Lines::CLOCK, Lines::empty()).await?;

            self.s2_data_bit(byte & 1 != 0);
            byte >>= 1;
            self.hw.set(Lines::ATN);
            self.handshake(Lines::CLOCK, Lines::CLOCK).await?;
        }

        self.hw.release(Lines::DATA);
        iec_delay!(self.hw);
        Ok(())
    }

    fn s2_data_bit(&mut self, bit: bool) {
        if bit {
            self.hw.set(Lines::DATA);
        } else {
            self.hw.release(Lines::DATA);
        }
        iec_delay!(self.hw);
    }

    // P2 writes a byte to the parallel port, then handshakes with CLK,
    // waiting for the drive to release and then pull DATA.
    pub(crate) async fn p2_write_byte(&mut self, byte: u8) -> Result<(), BusError> {
        self.hw.pp_write(byte);
        self.pp_settle();

        self.hw.release(Lines::CLOCK);
        self.handshake(Lines::DATA, Lines::empty()).await?;

        self.hw.set(Lines::CLOCK);
        self.handshake(Lines::DATA, Lines::DATA).await
    }

    // PP writes 2 bytes, the first once DATA is pulled, the second once it
    // is released, toggling CLK after each.
    pub(crate) async fn pp_write_pair(&mut self, pair: [u8; 2]) -> Result<(), BusError> {
        self.handshake(Lines::DATA, Lines::DATA).await?;
        self.hw.pp_write(pair[0]);
        self.pp_settle();
        self.hw.release(Lines::CLOCK);

        self.handshake(Lines::DATA, Lines::empty()).await?;
        self.hw.pp_write(pair[1]);
        self.pp_settle();
        self.hw.set(Lines::CLOCK);
        Ok(())
    }
}

//! This file implements the reading of bytes from the drive, for all
//! supported protocols.
//!
//! The main loop is generic over the [`Transport`], and the per-protocol
//! byte primitives for the alternate serial and parallel protocols are
//! implemented here on the [`IecDriver`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::ProtocolType;
use super::iec::IecDriver;
use super::nib::{parburst_read_checked, srqburst_read_checked};
use super::session::{BusSession, CableState};
use super::transport::Transport;
use crate::constants::{NIB_EARLY_EXIT_BIT, NIB_EARLY_EXIT_BYTE};
use crate::driver::BusError;
use crate::infra::lines::{IecHardware, Lines};
use crate::transfer::ByteSink;
use crate::util::time::iec::FOREVER_TIMEOUT;
use crate::util::time::iec_delay;
use crate::util::time::nib::{HANDSHAKE_POLL, PP_SETTLE_NS, TRACK_START_DELAY};

/// Some protocols may support specific options.  This is used to define and
/// control those options.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadOption {
    // No specific option
    None,

    // NIB parallel read mode should not exit early on receipt of special byte
    // (0x55)
    NibParReadNoEarlyExit,

    // NIB parallel read mode should exit early on receipt of special byte
    // (0x55)
    NibParReadEarlyExit,
}

/// Splits the host's length into the byte count and any options encoded
/// in it.
pub fn read_option(len: u16, protocol: ProtocolType) -> (u16, ReadOption) {
    match protocol {
        ProtocolType::Nib => {
            // Check whether early exit should be supported.
            if len & NIB_EARLY_EXIT_BIT == NIB_EARLY_EXIT_BIT {
                (len & !NIB_EARLY_EXIT_BIT, ReadOption::NibParReadEarlyExit)
            } else {
                (len, ReadOption::NibParReadNoEarlyExit)
            }
        }
        _ => (len, ReadOption::None),
    }
}

/// Main read routine which handles all protocols.
///
/// As well as the standard CBM IEC read protocol, this also supports:
/// - S1 Faster serial protocol developed for use with 1541 type drives.
/// - S2 Stock Commodore faster serial than S1, used by 1570, 1571 and
///   1581.
/// - PP Parallel protocol, offers improve rates above serial, and
///   requires a parallel port to be installed.
/// - P2 Parallel protocol 2, faster parallel protocol, again requiring a
///   parallel port.
/// - NIB and NIB_SRQ, whole track reads by the nibtools drive code, over
///   the parallel port or fast serial.
/// - NIB_COMMAND and NIB_SRQ_COMMAND, one burst handshake per byte.
///
/// The alternate protocols all rely on custom drive code, uploaded by the
/// host software (OpenCBM or nibtools) with standard CBM writes.
///
/// Returns
/// - Ok(u16) - Number of bytes read
/// - Err(BusError, u16) - Error and number of bytes read before the error
///   occurred.
///
/// EOI, and a NIB early exit, are not errors.  The fact that fewer bytes
/// than requested were returned demonstrates to the host that the read
/// ended early.
pub async fn read<T: Transport, K: ByteSink>(
    t: &mut T,
    session: &mut BusSession,
    protocol: ProtocolType,
    len: u16,
    sink: &mut K,
) -> Result<u16, (BusError, u16)> {
    let (len, option) = read_option(len, protocol);

    // The track loops would otherwise kick off the drive code for nothing
    if len == 0 {
        return Ok(0);
    }

    t.feed();
    startup_read(t, session, protocol).await;

    let result = read_main_loop(t, session, protocol, option, len, sink).await;

    // Protocol specific termination - we terminate whether we hit an error
    // or not.
    if let Err((e, count)) = result {
        info!("Read: {} failed after {} bytes: {}", protocol, count, e);
        t.abort_transfer();
        session.set_cable_state(CableState::ErrorOccurred);
        if protocol == ProtocolType::Cbm {
            session.set_do_not_release_bus(false);
        }
    } else {
        terminate_read(t, protocol);
        if protocol == ProtocolType::Cbm {
            session.set_cable_state(CableState::SuccessfullyUsed);
        }
    }
    t.feed();

    trace!("Read: {} result {:?}", protocol, result);
    result
}

/// Performs the specific protocol read startup routine.
async fn startup_read<T: Transport>(t: &mut T, session: &mut BusSession, protocol: ProtocolType) {
    match protocol {
        ProtocolType::Nib => {
            session.nib.resume();
            t.release_lines(Lines::DATA);

            // Wait for drive to be ready to send - 5ms is too short.
            // We yield here, because this is a long time.
            t.settle(TRACK_START_DELAY).await;

            // Kick off the transfer with a dummy byte, which we discard
            if let Err(e) = t.parburst_read() {
                debug!("Read: NIB start handshake failed: {}", e);
            }
        }
        ProtocolType::NibSrq => {
            session.nib.resume();
            t.release_lines(Lines::SRQ | Lines::CLOCK | Lines::DATA | Lines::ATN);
            t.settle(TRACK_START_DELAY).await;
            if let Err(e) = t.srqburst_read() {
                debug!("Read: NIB SRQ start handshake failed: {}", e);
            }

            // Pulling CLK signals the drive to start sending
            t.set_lines(Lines::CLOCK);
        }
        _ => {}
    }
}

/// Performs specific protocol read termination, after a successful read.
fn terminate_read<T: Transport>(t: &mut T, protocol: ProtocolType) {
    match protocol {
        ProtocolType::Nib => {
            // All bytes read ok so read the final dummy byte
            if let Err(e) = t.parburst_read() {
                debug!("Read: NIB final handshake failed: {}", e);
            }
        }
        ProtocolType::NibSrq => {
            if let Err(e) = t.srqburst_read() {
                debug!("Read: NIB SRQ final handshake failed: {}", e);
            }
            t.release_lines(Lines::SRQ | Lines::CLOCK | Lines::DATA | Lines::ATN);
        }
        _ => {}
    }
}

// Main read loop, which receives bytes and hands them to the sink.
async fn read_main_loop<T: Transport, K: ByteSink>(
    t: &mut T,
    session: &mut BusSession,
    protocol: ProtocolType,
    option: ReadOption,
    len: u16,
    sink: &mut K,
) -> Result<u16, (BusError, u16)> {
    let mut count: u16 = 0;

    while count < len {
        if t.is_cancelled() {
            return Err((BusError::Cancelled, count));
        }

        let mut early_exit = false;
        match protocol {
            ProtocolType::Cbm => match t.cbm_read_byte(session).await {
                Ok(Some(byte)) => {
                    sink.push(byte).await.map_err(|e| (e, count))?;
                    count += 1;
                    early_exit = session.eoi();
                }
                Ok(None) => early_exit = true,
                Err(e) => return Err((e, count)),
            },
            ProtocolType::S1 | ProtocolType::S2 | ProtocolType::P2 => {
                let byte = match protocol {
                    ProtocolType::S1 => t.s1_read_byte().await,
                    ProtocolType::S2 => t.s2_read_byte().await,
                    _ => t.p2_read_byte().await,
                }
                .map_err(|e| (e, count))?;
                sink.push(byte).await.map_err(|e| (e, count))?;
                count += 1;
            }
            ProtocolType::PP => {
                // Two bytes per handshake.  An odd length drops the last.
                let pair = t.pp_read_pair().await.map_err(|e| (e, count))?;
                for byte in pair {
                    if count < len {
                        sink.push(byte).await.map_err(|e| (e, count))?;
                        count += 1;
                    }
                }
            }
            ProtocolType::Nib => {
                let byte = t
                    .nib_read_handshaked(count & 1 == 1)
                    .map_err(|e| (e, count))?;
                sink.push(byte).await.map_err(|e| (e, count))?;
                count += 1;

                // Used by nibtools to scan the track density
                if option == ReadOption::NibParReadEarlyExit && byte == NIB_EARLY_EXIT_BYTE {
                    debug!("Read: NIB early exit after {} bytes", count);
                    early_exit = true;
                }
            }
            ProtocolType::NibCommand => {
                let byte = parburst_read_checked(t, session).map_err(|e| (e, count))?;
                sink.push(byte).await.map_err(|e| (e, count))?;
                count += 1;
            }
            ProtocolType::NibSrq => {
                let byte = t.srq_read_byte().map_err(|e| (e, count))?;

                // The drive stops once CLK is released, which must happen
                // before the last byte is read
                if len >= 2 && count == len - 2 {
                    t.release_lines(Lines::CLOCK);
                }
                sink.push(byte).await.map_err(|e| (e, count))?;
                count += 1;
            }
            ProtocolType::NibSrqCommand => {
                let byte = srqburst_read_checked(t, session).map_err(|e| (e, count))?;
                sink.push(byte).await.map_err(|e| (e, count))?;
                count += 1;
            }
            _ => {
                warn!("Read: unsupported protocol {}", protocol);
                return Err((BusError::Unsupported, count));
            }
        }

        t.feed();
        if early_exit {
            break;
        }
    }

    Ok(count)
}

// The alternate protocol byte primitives.  All waits are handshakes with
// custom drive code, so are unbounded but cancellable.
impl<H: IecHardware> IecDriver<H> {
    // Wait until the masked lines reach `want`.
    pub(super) async fn handshake(&mut self, mask: Lines, want: Lines) -> Result<(), BusError> {
        self.hw
            .wait_until(mask, want, HANDSHAKE_POLL, FOREVER_TIMEOUT)
            .await
    }

    // S1 involves reading a bit at a time, starting with the MSB, as follows:
    // - Wait for DATA line to be released
    // - Release CLK
    // - Pause briefly to allow it to stabilise
    // - Read CLK - this is our next bit
    // - Pull DATA to acknowledge the bit
    // - Wait for CLK to change
    // - Release DATA
    // - Pause briefly to allow DATA to stabilize
    // - Wait for DATA to be pulled
    // - Pull CLK
    pub(crate) async fn s1_read_byte(&mut self) -> Result<u8, BusError> {
        let mut byte = 0;

        for _ in 0..8 {
            self.handshake(Lines::DATA, Lines::empty()).await?;

            self.hw.release(Lines::CLOCK);
            iec_delay!(self.hw);

            let bit = self.hw.get(Lines::CLOCK);
            byte = (byte >> 1) | ((bit as u8) << 7);

            self.hw.set(Lines::DATA);

            // Wait for CLK to change
            let changed = if bit { Lines::empty() } else { Lines::CLOCK };
            self.handshake(Lines::CLOCK, changed).await?;

            self.hw.release(Lines::DATA);
            iec_delay!(self.hw);

            self.handshake(Lines::DATA, Lines::DATA).await?;

            self.hw.set(Lines::CLOCK);
        }

        Ok(byte)
    }

    // S2 involves reading a bit every time the CLOCK line changes, with the
    // first bit coming when the CLOCK line is released, and hence the
    // second when it is pulled.
    //
    // After we detect the CLOCK changing, we pause to make sure DATA has time
    // to stabilise.  We flip ATN once we've read the bit.
    pub(crate) async fn s2_read_byte(&mut self) -> Result<u8, BusError> {
        let mut byte = 0;

        for _ in 0..4 {
            self.handshake(Lines::CLOCK, Lines::empty()).await?;
            iec_delay!(self.hw);
            byte = (byte >> 1) | ((self.hw.get(Lines::DATA) as u8) << 7);
            self.hw.release(Lines::ATN);

            self.handshake(Lines::CLOCK, Lines::CLOCK).await?;
            iec_delay!(self.hw);
            byte = (byte >> 1) | ((self.hw.get(Lines::DATA) as u8) << 7);
            self.hw.set(Lines::ATN);
        }

        Ok(byte)
    }

    // P2 involves reading a single byte from the parallel port as follows:
    // - Release CLK
    // - Wait for DATA to be released
    // - Read the byte
    // - Set CLK
    // - Wait for DATA to be pulled
    pub(crate) async fn p2_read_byte(&mut self) -> Result<u8, BusError> {
        self.hw.release(Lines::CLOCK);
        self.handshake(Lines::DATA, Lines::empty()).await?;

        let byte = self.hw.pp_read();

        self.hw.set(Lines::CLOCK);
        self.handshake(Lines::DATA, Lines::DATA).await?;

        Ok(byte)
    }

    // PP involves reading 2 bytes:
    // - Wait for DATA to be pulled
    // - Read the byte from the parallel bus
    // - Release CLK
    // - Wait for DATA to be released
    // - Read the second byte from the parallel bus
    // - Set CLK
    pub(crate) async fn pp_read_pair(&mut self) -> Result<[u8; 2], BusError> {
        self.handshake(Lines::DATA, Lines::DATA).await?;
        let first = self.hw.pp_read();
        self.hw.release(Lines::CLOCK);

        self.handshake(Lines::DATA, Lines::empty()).await?;
        let second = self.hw.pp_read();
        self.hw.set(Lines::CLOCK);

        Ok([first, second])
    }

    // Parallel port output settle time, shared with the write primitives
    pub(crate) fn pp_settle(&mut self) {
        self.hw.block_ns(PP_SETTLE_NS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::transport::{MockTransport, Primitive};
    use crate::transfer::SliceSink;
    use embassy_futures::block_on;

    #[test]
    fn nib_length_carries_early_exit_flag() {
        assert_eq!(
            read_option(0x8000 | 6000, ProtocolType::Nib),
            (6000, ReadOption::NibParReadEarlyExit)
        );
        assert_eq!(
            read_option(6000, ProtocolType::Nib),
            (6000, ReadOption::NibParReadNoEarlyExit)
        );
        assert_eq!(
            read_option(0x8000, ProtocolType::Cbm),
            (0x8000, ReadOption::None)
        );
    }

    #[test]
    fn each_protocol_reads_with_its_own_primitive() {
        let cases = [
            (ProtocolType::Cbm, Primitive::CbmRead),
            (ProtocolType::S1, Primitive::S1Read),
            (ProtocolType::S2, Primitive::S2Read),
            (ProtocolType::P2, Primitive::P2Read),
            (ProtocolType::PP, Primitive::PpReadPair),
            (ProtocolType::Nib, Primitive::NibReadHandshaked),
            (ProtocolType::NibCommand, Primitive::ParburstRead),
            (ProtocolType::NibSrq, Primitive::SrqReadByte),
            (ProtocolType::NibSrqCommand, Primitive::SrqburstRead),
        ];
        for (protocol, primitive) in cases {
            let len = 10u16;
            let mut t = MockTransport::new();
            let mut session = BusSession::default();
            let mut buf = [0u8; 16];
            let mut sink = SliceSink::new(&mut buf);
            let read = block_on(read(&mut t, &mut session, protocol, len, &mut sink));
            assert_eq!(read, Ok(len), "{protocol:?}");

            // PP moves two bytes per handshake
            let expected = if protocol == ProtocolType::PP {
                len as usize / 2
            } else {
                len as usize
            };
            assert_eq!(t.count(primitive), expected, "{protocol:?}");
        }
    }

    #[test]
    fn nib_track_read_brackets_with_burst_handshakes() {
        let mut t = MockTransport::new();
        let mut session = BusSession::default();
        let mut buf = [0u8; 8];
        let mut sink = SliceSink::new(&mut buf);
        block_on(read(&mut t, &mut session, ProtocolType::Nib, 8, &mut sink)).unwrap();
        assert_eq!(t.count(Primitive::ParburstRead), 2);
        assert_eq!(t.toggles(), &[false, true, false, true, false, true, false, true]);
    }

    #[test]
    fn nib_early_exit_stops_after_marker() {
        let mut t = MockTransport::new();
        t.set_read_data(&[0x10, 0x20, 0x55, 0x30]);
        let mut session = BusSession::default();
        let mut buf = [0u8; 8];
        let mut sink = SliceSink::new(&mut buf);
        let read = block_on(read(&mut t, &mut session, ProtocolType::Nib, 0x8008, &mut sink));
        assert_eq!(read, Ok(3));
        assert_eq!(sink.filled(), &[0x10, 0x20, 0x55]);
    }

    #[test]
    fn zero_length_track_read_does_nothing() {
        let mut t = MockTransport::new();
        let mut session = BusSession::default();
        let mut buf = [0u8; 1];
        let mut sink = SliceSink::new(&mut buf);
        assert_eq!(
            block_on(read(&mut t, &mut session, ProtocolType::NibSrq, 0, &mut sink)),
            Ok(0)
        );
        assert!(t.calls().is_empty());
    }

    #[test]
    fn srq_track_read_releases_clock_before_last_byte() {
        let mut t = MockTransport::new();
        let mut session = BusSession::default();
        let mut buf = [0u8; 4];
        let mut sink = SliceSink::new(&mut buf);
        block_on(read(&mut t, &mut session, ProtocolType::NibSrq, 4, &mut sink)).unwrap();

        let calls = t.calls();
        let release = calls
            .iter()
            .position(|c| *c == Primitive::Release(Lines::CLOCK))
            .expect("CLK released");
        let reads: std::vec::Vec<usize> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Primitive::SrqReadByte)
            .map(|(ii, _)| ii)
            .collect();
        assert!(release > reads[2] && release < reads[3]);
    }

    #[test]
    fn failed_read_releases_the_bus() {
        let mut t = MockTransport::new();
        t.fail_after(Primitive::S1Read, 3, BusError::Cancelled);
        let mut session = BusSession::default();
        let mut buf = [0u8; 8];
        let mut sink = SliceSink::new(&mut buf);
        let read = block_on(read(&mut t, &mut session, ProtocolType::S1, 8, &mut sink));
        assert_eq!(read, Err((BusError::Cancelled, 3)));
        assert_eq!(t.calls().last(), Some(&Primitive::Abort));
    }

    #[test]
    fn failed_parallel_read_marks_cable_for_retest() {
        let mut t = MockTransport::new();
        t.fail_after(Primitive::P2Read, 2, BusError::Timeout);
        let mut session = BusSession::default();
        session.set_cable_state(CableState::SuccessfullyUsed);
        let mut buf = [0u8; 8];
        let mut sink = SliceSink::new(&mut buf);
        let read = block_on(read(&mut t, &mut session, ProtocolType::P2, 8, &mut sink));
        assert_eq!(read, Err((BusError::Timeout, 2)));
        assert_eq!(session.cable_state(), CableState::ErrorOccurred);
    }
}

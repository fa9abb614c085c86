//! This file implements the Commodore 153x tape driver.
//!
//! A capture streams the time between each edge on the deck's READ line to
//! the host, and a write plays the same format back out on WRITE.  Each
//! delta is sent as a record:
//! * short - under 0x8000 ticks - 2 bytes, big-endian
//! * long - 5 bytes, big-endian, with the top bit of the first byte set.
//!
//! A write is preceded by a record giving the number of delta bytes that
//! follow.
//!
//! Every operation reports a [`TapeStatus`] to the host, rather than an
//! error, as the host tools key off the specific codes.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use bitflags::bitflags;
use core::fmt;

use crate::constants::TAPE_FIRMWARE_VERSION;
use crate::driver::{BusError, ProtocolDriver};
use crate::infra::tape::{TapeDeck, TapeInterrupt};
use crate::protocol::ProtocolFlags;
use crate::protocol::session::BusSession;
use crate::transfer::{HostChannel, InTransfer, OutTransfer};
use crate::util::time::tape::{IO_SETTLE, SENSE_POLL, SENSE_SETTLE};

/// Deltas below this are sent as short records.
const SHORT_DELTA_LIMIT: u64 = 0x8000;

/// Marks a long record.
const LONG_DELTA_FLAG: u8 = 0x80;

/// Long records carry 39 bits.
const MAX_DELTA: u64 = (1 << 39) - 1;

bitflags! {
    /// The tape state register.  Sent as-is by a config download, and
    /// the two edge bits may be set by a config upload.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TapeState: u8 {
        const CONFIG_READ = 0x01;
        const CONFIG_WRITE = 0x02;
        const CAPTURING = 0x04;
        const WRITING = 0x08;
        /// The last motor setting is still being applied.
        const MOTOR_CONTROL = 0x10;
        const WRITE_START_FALLING = 0x20;
        const READ_START_FALLING = 0x40;
        /// The deck has been unplugged.  Sticky, as hot-plugging isn't
        /// supported.
        const DISCONNECTED = 0x80;
    }
}

impl TapeState {
    const CONFIGURED: TapeState = TapeState::CONFIG_READ.union(TapeState::CONFIG_WRITE);
    const EDGES: TapeState = TapeState::READ_START_FALLING.union(TapeState::WRITE_START_FALLING);
}

#[cfg(feature = "defmt")]
impl defmt::Format for TapeState {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "TapeState({=u8:#04x})", self.bits());
    }
}

/// Result codes returned to the host in the status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum TapeStatus {
    Ok = 1,
    DevicePresent = 2,
    DeviceNotPresent = 3,
    ConfiguredForRead = 4,
    ConfiguredForWrite = 5,
    SenseOnPlay = 6,
    SenseOnStop = 7,
    MotorOn = 8,
    MotorOff = 9,
    CaptureFinished = 10,
    WriteFinished = 11,
    ConfigUploaded = 12,
    ConfigDownloaded = 13,
    Error = 255,
    DeviceDisconnected = 254,
    DeviceNotConfigured = 253,
    SenseNotOnRecord = 252,
    SenseNotOnPlay = 251,
    WriteInterruptedByStop = 250,
    UsbSendByte = 249,
    UsbRecvByte = 248,
    ExternalBreak = 247,
}

impl fmt::Display for TapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u16)
    }
}

/// Encode a delta as a record, returning the buffer and the bytes used.
/// Deltas too long for a record are clamped.
pub fn encode_delta(delta: u64) -> ([u8; 5], usize) {
    if delta < SHORT_DELTA_LIMIT {
        ([(delta >> 8) as u8, delta as u8, 0, 0, 0], 2)
    } else {
        let delta = delta.min(MAX_DELTA);
        (
            [
                (delta >> 32) as u8 | LONG_DELTA_FLAG,
                (delta >> 24) as u8,
                (delta >> 16) as u8,
                (delta >> 8) as u8,
                delta as u8,
            ],
            5,
        )
    }
}

// Pull the next record from the host.  Returns the delta and the number of
// bytes it took.
async fn receive_delta<C: HostChannel>(
    xfer: &mut OutTransfer<'_, C>,
) -> Result<(u64, u32), BusError> {
    let first = xfer.next_byte().await?;
    let second = xfer.next_byte().await?;
    if first & LONG_DELTA_FLAG == 0 {
        return Ok(((first as u64) << 8 | second as u64, 2));
    }

    let mut delta = ((first & !LONG_DELTA_FLAG) as u64) << 8 | second as u64;
    for _ in 0..3 {
        delta = delta << 8 | xfer.next_byte().await? as u64;
    }
    Ok((delta, 5))
}

pub struct TapeDriver<T: TapeDeck> {
    pub(crate) deck: T,
    state: TapeState,

    /// Status of the capture or write in progress.
    status: TapeStatus,

    /// Set by a break, to end any sense wait until the next prepare.
    stop_wait: bool,
}

impl<T: TapeDeck> ProtocolDriver for TapeDriver<T> {
    async fn reset(&mut self, _session: &mut BusSession, _forever: bool) -> Result<(), BusError> {
        self.external_break();
        Ok(())
    }

    // The deck is driven by the tape commands, not raw transfers
    async fn raw_write<C: HostChannel>(
        &mut self,
        _session: &mut BusSession,
        _len: u16,
        _flags: ProtocolFlags,
        _host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        Err((BusError::Unsupported, 0))
    }

    async fn raw_read<C: HostChannel>(
        &mut self,
        _session: &mut BusSession,
        _len: u16,
        _host: &mut C,
    ) -> Result<u16, (BusError, u16)> {
        Err((BusError::Unsupported, 0))
    }

    async fn wait(
        &mut self,
        _session: &mut BusSession,
        _line: u8,
        _state: u8,
    ) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn poll(&mut self) -> u8 {
        0
    }

    fn set_release(&mut self, _set: u8, _release: u8) {}
}

impl<T: TapeDeck> TapeDriver<T> {
    pub fn new(deck: T) -> Self {
        Self {
            deck,
            state: TapeState::empty(),
            status: TapeStatus::Ok,
            stop_wait: false,
        }
    }

    pub fn deck(&self) -> &T {
        &self.deck
    }

    pub fn deck_mut(&mut self) -> &mut T {
        &mut self.deck
    }

    pub fn state(&self) -> TapeState {
        self.state
    }

    pub fn version(&self) -> u16 {
        TAPE_FIRMWARE_VERSION
    }

    /// Look for a deck.
    pub fn probe(&mut self) -> bool {
        self.state = TapeState::empty();
        let present = self.deck.detect();
        if present {
            info!("Tape: deck present");
        }
        present
    }

    /// Take over the bus for tape.  Captures start on a falling edge by
    /// default.
    pub fn enter_mode(&mut self) {
        self.state.insert(TapeState::READ_START_FALLING);
        self.state.remove(TapeState::WRITE_START_FALLING);
        self.reset_ports();
    }

    fn reset_ports(&mut self) {
        self.deck.reset_ports();
        self.state.insert(TapeState::MOTOR_CONTROL);
        self.deck.set_motor(false);
    }

    fn connected(&mut self) -> bool {
        if self.state.contains(TapeState::DISCONNECTED) || !self.deck.connected() {
            self.state.insert(TapeState::DISCONNECTED);
            false
        } else {
            true
        }
    }

    // Drop any read or write configuration, turning the motor off unless
    // told to keep it
    fn basic_config(&mut self, keep_motor: bool) {
        self.state.remove(TapeState::CONFIGURED);
        if !keep_motor {
            self.state.insert(TapeState::MOTOR_CONTROL);
            self.deck.set_motor(false);
        }
    }

    fn disconnected(&mut self) -> TapeStatus {
        debug!("Tape: deck disconnected");
        self.basic_config(false);
        TapeStatus::DeviceDisconnected
    }

    fn set_motor(&mut self, on: bool) -> TapeStatus {
        if !self.connected() {
            return self.disconnected();
        }
        self.state.insert(TapeState::MOTOR_CONTROL);
        self.deck.set_motor(on);
        if on {
            TapeStatus::MotorOn
        } else {
            TapeStatus::MotorOff
        }
    }

    pub fn motor_on(&mut self) -> TapeStatus {
        self.set_motor(true)
    }

    pub fn motor_off(&mut self) -> TapeStatus {
        self.set_motor(false)
    }

    fn prepare(&mut self, config: TapeState) -> TapeStatus {
        self.stop_wait = false;

        // Switching direction, so keep the motor as it is
        if self.state.intersects(TapeState::CONFIGURED - config) {
            self.basic_config(true);
        }

        self.status = TapeStatus::Ok;
        self.reset_ports();
        if self.motor_on() == TapeStatus::DeviceDisconnected {
            return TapeStatus::DeviceDisconnected;
        }

        self.state.insert(config);
        if config == TapeState::CONFIG_READ {
            TapeStatus::ConfiguredForRead
        } else {
            TapeStatus::ConfiguredForWrite
        }
    }

    /// Configure the deck to capture, and start the motor.
    pub fn prepare_capture(&mut self) -> TapeStatus {
        self.prepare(TapeState::CONFIG_READ)
    }

    /// Configure the deck to write, and start the motor.
    pub fn prepare_write(&mut self) -> TapeStatus {
        self.prepare(TapeState::CONFIG_WRITE)
    }

    pub fn get_sense(&mut self) -> TapeStatus {
        if !self.state.intersects(TapeState::CONFIGURED) {
            return TapeStatus::DeviceNotConfigured;
        }
        if !self.connected() {
            return self.disconnected();
        }
        if self.deck.sense_play() {
            TapeStatus::SenseOnPlay
        } else {
            TapeStatus::SenseOnStop
        }
    }

    // Wait for the deck keys to reach `play`.  Only a break or an unplug
    // gets us out early.
    async fn wait_for_sense(&mut self, play: bool) -> TapeStatus {
        if !self.state.intersects(TapeState::CONFIGURED) {
            return TapeStatus::DeviceNotConfigured;
        }

        loop {
            if self.stop_wait || self.deck.is_cancelled() {
                return TapeStatus::ExternalBreak;
            }
            if !self.connected() {
                return self.disconnected();
            }
            if self.deck.sense_play() == play {
                return if play {
                    TapeStatus::SenseOnPlay
                } else {
                    TapeStatus::SenseOnStop
                };
            }
            self.deck.feed();
            self.deck.yield_for(SENSE_POLL).await;
        }
    }

    pub async fn wait_for_stop_sense(&mut self) -> TapeStatus {
        self.wait_for_sense(false).await
    }

    pub async fn wait_for_play_sense(&mut self) -> TapeStatus {
        self.wait_for_sense(true).await
    }

    fn start_capture(&mut self) -> TapeStatus {
        if !self.state.contains(TapeState::CONFIG_READ) {
            return TapeStatus::DeviceNotConfigured;
        }
        if !self.connected() {
            return self.disconnected();
        }

        self.state.insert(TapeState::CAPTURING);
        self.deck
            .start_capture(self.state.contains(TapeState::READ_START_FALLING));

        if self.get_sense() != TapeStatus::SenseOnPlay {
            self.stop_capture();
            return TapeStatus::SenseNotOnPlay;
        }
        self.status
    }

    fn stop_capture(&mut self) {
        self.deck.stop_capture();
        self.state.remove(TapeState::CAPTURING);
    }

    fn start_write(&mut self) -> TapeStatus {
        if !self.state.contains(TapeState::CONFIG_WRITE) {
            return TapeStatus::DeviceNotConfigured;
        }
        if !self.connected() {
            return self.disconnected();
        }

        self.state.insert(TapeState::WRITING);
        self.deck
            .start_write(self.state.contains(TapeState::WRITE_START_FALLING));

        if self.get_sense() != TapeStatus::SenseOnPlay {
            self.stop_write();
            return TapeStatus::SenseNotOnRecord;
        }
        self.status
    }

    fn stop_write(&mut self) {
        self.deck.stop_write();
        self.state.remove(TapeState::WRITING);
    }

    /// Capture until STOP is pressed, streaming the deltas to the host.
    pub async fn capture<C: HostChannel>(&mut self, host: &mut C, len: u16) -> TapeStatus {
        self.deck.feed();
        let mut xfer = InTransfer::new(host, len);
        self.deck.yield_for(IO_SETTLE).await;
        self.deck.yield_for(SENSE_SETTLE).await;

        self.status = self.start_capture();
        let mut edges: u32 = 0;

        while self.status == TapeStatus::Ok {
            if self.deck.is_cancelled() {
                self.stop_capture();
                self.status = TapeStatus::ExternalBreak;
                break;
            }

            match self.deck.next_edge().await {
                Ok(delta) => {
                    let (record, used) = encode_delta(delta);
                    for byte in &record[..used] {
                        if xfer.push(*byte).await.is_err() {
                            self.stop_capture();
                            self.status = TapeStatus::UsbSendByte;
                            break;
                        }
                    }
                    edges += 1;
                }
                Err(TapeInterrupt::Stop) => {
                    self.stop_capture();
                    break;
                }
                Err(TapeInterrupt::Disconnected) => {
                    self.stop_capture();
                    self.state.insert(TapeState::DISCONNECTED);
                    self.status = TapeStatus::DeviceDisconnected;
                }
            }
            self.deck.feed();
        }

        if xfer.flush().await.is_err() && self.status == TapeStatus::Ok {
            self.status = TapeStatus::UsbSendByte;
        }
        let sent = xfer.finish().await;
        debug!("Tape: captured {} edges, {} bytes", edges, sent);

        self.basic_config(false);
        match self.status {
            TapeStatus::Ok => TapeStatus::CaptureFinished,
            status => status,
        }
    }

    /// Play back deltas received from the host until they run out.
    pub async fn write<C: HostChannel>(&mut self, host: &mut C, len: u16) -> TapeStatus {
        self.deck.feed();
        let mut xfer = OutTransfer::new(host, len);
        self.deck.yield_for(IO_SETTLE).await;

        // The leading record is the number of delta bytes to follow
        let mut remaining = 0;
        self.status = match receive_delta(&mut xfer).await {
            Ok((count, _)) => {
                remaining = count;
                self.start_write()
            }
            Err(_) => TapeStatus::UsbRecvByte,
        };

        while self.status == TapeStatus::Ok && remaining > 0 {
            if self.deck.is_cancelled() {
                self.stop_write();
                self.status = TapeStatus::ExternalBreak;
                break;
            }

            let delta = match receive_delta(&mut xfer).await {
                Ok((delta, used)) => {
                    remaining = remaining.saturating_sub(used as u64);
                    delta
                }
                Err(_) => {
                    self.stop_write();
                    self.status = TapeStatus::UsbRecvByte;
                    break;
                }
            };

            match self.deck.emit_edge(delta).await {
                Ok(()) => (),
                Err(TapeInterrupt::Stop) => {
                    self.stop_write();
                    self.status = TapeStatus::WriteInterruptedByStop;
                }
                Err(TapeInterrupt::Disconnected) => {
                    self.stop_write();
                    self.state.insert(TapeState::DISCONNECTED);
                    self.status = TapeStatus::DeviceDisconnected;
                }
            }
            self.deck.feed();
        }

        if self.state.contains(TapeState::WRITING) {
            self.stop_write();
        }
        if remaining > 0 {
            debug!("Tape: write stopped with {} bytes to go", remaining);
        }
        xfer.finish().await;

        self.basic_config(false);
        match self.status {
            TapeStatus::Ok => TapeStatus::WriteFinished,
            status => status,
        }
    }

    /// Take the edge configuration from the host.
    pub async fn upload_config<C: HostChannel>(&mut self, host: &mut C, len: u16) -> TapeStatus {
        self.deck.feed();
        let mut xfer = OutTransfer::new(host, len);
        self.deck.yield_for(IO_SETTLE).await;

        let status = match xfer.next_byte().await {
            Ok(config) => {
                self.state.remove(TapeState::EDGES);
                self.state
                    .insert(TapeState::from_bits_truncate(config) & TapeState::EDGES);
                TapeStatus::ConfigUploaded
            }
            Err(_) => TapeStatus::UsbRecvByte,
        };
        xfer.finish().await;
        status
    }

    /// Send the state register to the host.
    pub async fn download_config<C: HostChannel>(
        &mut self,
        host: &mut C,
        len: u16,
    ) -> TapeStatus {
        self.deck.feed();
        let state = self.state.bits();
        let mut xfer = InTransfer::new(host, len);
        self.deck.yield_for(IO_SETTLE).await;

        let sent = xfer.push(state).await.and(xfer.flush().await);
        xfer.finish().await;
        match sent {
            Ok(()) => TapeStatus::ConfigDownloaded,
            Err(_) => TapeStatus::UsbSendByte,
        }
    }

    /// Abandon whatever the deck is doing, and stop any sense wait until
    /// the next prepare.
    pub fn external_break(&mut self) {
        info!("Tape: break");
        self.stop_wait = true;
        if self.state.contains(TapeState::CAPTURING) {
            self.stop_capture();
        }
        if self.state.contains(TapeState::WRITING) {
            self.stop_write();
        }
        self.reset_ports();
        self.basic_config(false);
        self.status = TapeStatus::ExternalBreak;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::HostMock;
    use crate::test::tape::SimDeck;
    use embassy_futures::block_on;
    use std::vec::Vec;

    fn ready() -> TapeDriver<SimDeck> {
        let mut driver = TapeDriver::new(SimDeck::new());
        assert!(driver.probe());
        driver.enter_mode();
        driver
    }

    fn records(deltas: &[u64]) -> Vec<u8> {
        deltas
            .iter()
            .flat_map(|d| {
                let (record, used) = encode_delta(*d);
                record[..used].to_vec()
            })
            .collect()
    }

    #[test]
    fn delta_records() {
        assert_eq!(encode_delta(0x1234), ([0x12, 0x34, 0, 0, 0], 2));
        assert_eq!(encode_delta(0x7FFF).1, 2);
        assert_eq!(encode_delta(0x8000), ([0x80, 0x00, 0x00, 0x80, 0x00], 5));
        assert_eq!(
            encode_delta(0x01_2345_6789),
            ([0x81, 0x23, 0x45, 0x67, 0x89], 5)
        );
        assert_eq!(encode_delta(u64::MAX), ([0xFF; 5], 5));
    }

    #[test]
    fn received_records_decode() {
        let data = records(&[0x0100, 0x12_3456, 0x7FFF]);
        let mut host = HostMock::new(&data);
        let mut xfer = OutTransfer::new(&mut host, data.len() as u16);
        block_on(async {
            assert_eq!(receive_delta(&mut xfer).await, Ok((0x0100, 2)));
            assert_eq!(receive_delta(&mut xfer).await, Ok((0x12_3456, 5)));
            assert_eq!(receive_delta(&mut xfer).await, Ok((0x7FFF, 2)));
            assert_eq!(receive_delta(&mut xfer).await, Err(BusError::Io));
        });
    }

    #[test]
    fn enter_mode_sets_default_edges_and_stops_motor() {
        let driver = ready();
        assert!(driver.state().contains(TapeState::READ_START_FALLING));
        assert!(!driver.state().contains(TapeState::WRITE_START_FALLING));
        assert!(driver.state().contains(TapeState::MOTOR_CONTROL));
        assert!(!driver.deck().motor());
    }

    #[test]
    fn motor_control() {
        let mut driver = ready();
        assert_eq!(driver.motor_on(), TapeStatus::MotorOn);
        assert!(driver.deck().motor());
        assert_eq!(driver.motor_off(), TapeStatus::MotorOff);
        assert!(!driver.deck().motor());
    }

    #[test]
    fn disconnect_is_sticky() {
        let mut driver = ready();
        driver.deck_mut().unplug();
        assert_eq!(driver.motor_on(), TapeStatus::DeviceDisconnected);
        driver.deck_mut().plug();
        assert_eq!(driver.motor_on(), TapeStatus::DeviceDisconnected);
        assert!(driver.state().contains(TapeState::DISCONNECTED));
    }

    #[test]
    fn sense_needs_configuration() {
        let mut driver = ready();
        assert_eq!(driver.get_sense(), TapeStatus::DeviceNotConfigured);
        assert_eq!(driver.prepare_capture(), TapeStatus::ConfiguredForRead);
        assert!(driver.deck().motor());
        assert_eq!(driver.get_sense(), TapeStatus::SenseOnStop);
        driver.deck_mut().press_play();
        assert_eq!(driver.get_sense(), TapeStatus::SenseOnPlay);
    }

    #[test]
    fn switching_direction_drops_other_config() {
        let mut driver = ready();
        driver.prepare_capture();
        assert_eq!(driver.prepare_write(), TapeStatus::ConfiguredForWrite);
        assert!(driver.state().contains(TapeState::CONFIG_WRITE));
        assert!(!driver.state().contains(TapeState::CONFIG_READ));
    }

    #[test]
    fn wait_for_play_then_stop() {
        let mut driver = ready();
        driver.prepare_capture();
        driver.deck_mut().press_play_at(5_000);
        assert_eq!(
            block_on(driver.wait_for_play_sense()),
            TapeStatus::SenseOnPlay
        );
        assert!(driver.deck().now_ms() >= 5_000);

        driver.deck_mut().press_stop_at(8_000);
        assert_eq!(
            block_on(driver.wait_for_stop_sense()),
            TapeStatus::SenseOnStop
        );
    }

    #[test]
    fn break_ends_sense_wait_until_next_prepare() {
        let mut driver = ready();
        driver.prepare_capture();
        driver.external_break();
        // The break dropped the configuration
        assert_eq!(
            block_on(driver.wait_for_play_sense()),
            TapeStatus::DeviceNotConfigured
        );

        driver.prepare_capture();
        driver.deck_mut().abort();
        assert_eq!(
            block_on(driver.wait_for_play_sense()),
            TapeStatus::ExternalBreak
        );
    }

    #[test]
    fn capture_streams_records_until_stop() {
        let mut driver = ready();
        driver.prepare_capture();
        driver.deck_mut().press_play();
        driver.deck_mut().queue_edges(&[0x0200, 0x0300, 0x4_0000, 0x0180]);

        let mut host = HostMock::new(&[]);
        let status = block_on(driver.capture(&mut host, 0x8000));
        assert_eq!(status, TapeStatus::CaptureFinished);
        assert_eq!(host.sent(), records(&[0x0200, 0x0300, 0x4_0000, 0x0180]));
        assert_eq!(driver.deck().capture_edge(), Some(true));
        assert!(!driver.deck().capturing());
        assert!(!driver.deck().motor());
        assert!(!driver.state().intersects(TapeState::CONFIGURED));
    }

    #[test]
    fn capture_without_play_fails() {
        let mut driver = ready();
        driver.prepare_capture();
        let mut host = HostMock::new(&[]);
        let status = block_on(driver.capture(&mut host, 0x8000));
        assert_eq!(status, TapeStatus::SenseNotOnPlay);
        assert!(host.sent().is_empty());
    }

    #[test]
    fn capture_unconfigured_fails() {
        let mut driver = ready();
        let mut host = HostMock::new(&[]);
        let status = block_on(driver.capture(&mut host, 0x8000));
        assert_eq!(status, TapeStatus::DeviceNotConfigured);
    }

    #[test]
    fn capture_reports_unplug() {
        let mut driver = ready();
        driver.prepare_capture();
        driver.deck_mut().press_play();
        driver.deck_mut().queue_edges(&[0x0200]);
        driver.deck_mut().unplug_after_edges();

        let mut host = HostMock::new(&[]);
        let status = block_on(driver.capture(&mut host, 0x8000));
        assert_eq!(status, TapeStatus::DeviceDisconnected);
        assert_eq!(host.sent(), records(&[0x0200]));
    }

    #[test]
    fn capture_reports_host_failure() {
        let mut driver = ready();
        driver.prepare_capture();
        driver.deck_mut().press_play();
        driver.deck_mut().queue_edges(&[0x0200; 40]);

        let mut host = HostMock::new(&[]);
        host.fail_sends();
        let status = block_on(driver.capture(&mut host, 0x8000));
        assert_eq!(status, TapeStatus::UsbSendByte);
        assert!(!driver.deck().capturing());
    }

    #[test]
    fn write_plays_deltas_back() {
        let mut driver = ready();
        driver.prepare_write();
        driver.deck_mut().press_play();

        let deltas = [0x0250, 0x9_0000, 0x0100];
        let body = records(&deltas);
        let mut data = records(&[body.len() as u64]);
        data.extend_from_slice(&body);

        let mut host = HostMock::new(&data);
        let status = block_on(driver.write(&mut host, data.len() as u16));
        assert_eq!(status, TapeStatus::WriteFinished);
        assert_eq!(driver.deck().emitted(), &deltas);
        assert_eq!(driver.deck().write_edge(), Some(false));
        assert!(!driver.deck().writing());
        assert_eq!(host.unread(), 0);
    }

    #[test]
    fn write_without_record_fails() {
        let mut driver = ready();
        driver.prepare_write();
        let data = records(&[2, 0x0100]);
        let mut host = HostMock::new(&data);
        let status = block_on(driver.write(&mut host, data.len() as u16));
        assert_eq!(status, TapeStatus::SenseNotOnRecord);
        // The rest of the host's data is drained
        assert_eq!(host.unread(), 0);
    }

    #[test]
    fn write_stopped_by_user() {
        let mut driver = ready();
        driver.prepare_write();
        driver.deck_mut().press_play();
        driver.deck_mut().stop_after_emits(1);

        let body = records(&[0x0100, 0x0200, 0x0300]);
        let mut data = records(&[body.len() as u64]);
        data.extend_from_slice(&body);

        let mut host = HostMock::new(&data);
        let status = block_on(driver.write(&mut host, data.len() as u16));
        assert_eq!(status, TapeStatus::WriteInterruptedByStop);
        assert_eq!(driver.deck().emitted(), &[0x0100]);
        assert_eq!(host.unread(), 0);
    }

    #[test]
    fn write_short_of_data() {
        let mut driver = ready();
        driver.prepare_write();
        driver.deck_mut().press_play();

        // Claims 6 bytes, but only sends 2
        let mut data = records(&[6]);
        data.extend_from_slice(&records(&[0x0100]));

        let mut host = HostMock::new(&data);
        let status = block_on(driver.write(&mut host, data.len() as u16));
        assert_eq!(status, TapeStatus::UsbRecvByte);
    }

    #[test]
    fn config_upload_sets_only_edge_bits() {
        let mut driver = ready();
        let mut host = HostMock::new(&[0xFF]);
        assert_eq!(
            block_on(driver.upload_config(&mut host, 1)),
            TapeStatus::ConfigUploaded
        );
        assert!(driver.state().contains(TapeState::EDGES));
        assert!(!driver.state().contains(TapeState::DISCONNECTED));

        let mut host = HostMock::new(&[]);
        assert_eq!(
            block_on(driver.download_config(&mut host, 1)),
            TapeStatus::ConfigDownloaded
        );
        assert_eq!(host.sent(), &[driver.state().bits()]);
    }

    #[test]
    fn config_upload_without_data_fails() {
        let mut driver = ready();
        let mut host = HostMock::new(&[]);
        assert_eq!(
            block_on(driver.upload_config(&mut host, 0)),
            TapeStatus::UsbRecvByte
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(TapeStatus::CaptureFinished as u16, 10);
        assert_eq!(TapeStatus::ExternalBreak as u16, 247);
        assert_eq!(TapeDriver::new(SimDeck::new()).version(), 0x0001);
    }
}

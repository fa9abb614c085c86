//! Contains the per-session bus state.  This is created when the host opens
//! a command sequence and passed by reference into each driver call.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use heapless::Vec;

use crate::types::CableType;

/// How far the current cable has been verified.  Ordered, so "at least
/// tested" is a simple comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CableState {
    #[default]
    Unknown,
    ErrorOccurred,
    Tested,
    SuccessfullyUsed,
}

/// The bus state owned by the dispatcher.
#[derive(Debug, Default)]
pub struct BusSession {
    /// Set when the talker signals end-of-data, cleared at the start of
    /// every write.
    eoi: bool,

    /// Set while a device has been addressed to listen and the bus is being
    /// held for it.  The cable test must not disturb the lines meanwhile.
    do_not_release_bus: bool,

    /// The cable in use, as last detected.
    cable: CableType,

    /// The user's cable choice, overriding detection.
    cable_override: Option<CableType>,

    cable_state: CableState,

    /// The nibbler command filter, see [`NibCommandFilter`].
    pub nib: NibCommandFilter,
}

impl BusSession {
    pub fn new(cable_override: Option<CableType>) -> Self {
        Self {
            cable_override,
            ..Self::default()
        }
    }

    pub fn eoi(&self) -> bool {
        self.eoi
    }

    pub fn set_eoi(&mut self) {
        self.eoi = true;
    }

    pub fn clear_eoi(&mut self) {
        self.eoi = false;
    }

    pub fn do_not_release_bus(&self) -> bool {
        self.do_not_release_bus
    }

    pub fn set_do_not_release_bus(&mut self, hold: bool) {
        self.do_not_release_bus = hold;
    }

    pub fn cable(&self) -> CableType {
        self.cable
    }

    pub fn set_cable(&mut self, cable: CableType) {
        self.cable = cable;
    }

    pub fn cable_override(&self) -> Option<CableType> {
        self.cable_override
    }

    pub fn cable_state(&self) -> CableState {
        self.cable_state
    }

    pub fn set_cable_state(&mut self, state: CableState) {
        if state != self.cable_state {
            trace!("Cable state {:?} -> {:?}", self.cable_state, state);
        }
        self.cable_state = state;
    }
}

/// Number of command bytes which may be held back while suppressed.
pub const NIB_SAVED_WRITES_MAX: usize = 4;

/// The nibtools command prefix.
const NIB_COMMAND_PREFIX: [u8; 4] = [0x00, 0x55, 0xAA, 0xFF];

/// Command opcodes which are followed by a whole-track transfer.
const NIB_TRACK_COMMANDS: [u8; 7] = [0x03, 0x04, 0x05, 0x0B, 0x13, 0x14, 0x16];

/// Watches nibtools burst commands for a read or write track request.
///
/// nibtools writes `00 55 AA FF <cmd>` and then does a handshaked burst to
/// learn the drive is ready, before the polled track transfer.  Over USB
/// the gap between that handshake and the transfer can be tens of ms, which
/// the drive code won't tolerate.  So once a track command is seen, further
/// burst writes are saved rather than sent, and burst reads are faked, until
/// the track transfer itself replays the saved bytes immediately before it
/// starts polling.
#[derive(Debug, Default)]
pub struct NibCommandFilter {
    suppress: bool,
    cmd_index: usize,
    saved: Vec<u8, NIB_SAVED_WRITES_MAX>,
}

impl NibCommandFilter {
    /// Whether burst transfers are currently being held back.
    pub fn suppressed(&self) -> bool {
        self.suppress
    }

    /// Offer a byte about to be burst written.  Returns true if it should
    /// be sent now, false if it has been saved for the track transfer.
    pub fn check_write(&mut self, data: u8) -> bool {
        if self.suppress {
            if self.saved.push(data).is_err() {
                warn!("Nib filter: saved writes full, dropping {:#04x}", data);
            }
            return false;
        }

        if self.cmd_index == NIB_COMMAND_PREFIX.len() {
            if NIB_TRACK_COMMANDS.contains(&data) {
                debug!("Nib filter: track command {:#04x}, suppressing", data);
                self.suppress = true;
            }
            self.cmd_index = 0;
        } else if NIB_COMMAND_PREFIX[self.cmd_index] == data {
            self.cmd_index += 1;
        } else {
            self.cmd_index = 0;
            if NIB_COMMAND_PREFIX[0] == data {
                self.cmd_index += 1;
            }
        }

        true
    }

    /// Ends suppression ahead of a track transfer, returning the bytes to
    /// replay first.
    pub fn take_saved(&mut self) -> Vec<u8, NIB_SAVED_WRITES_MAX> {
        self.suppress = false;
        core::mem::take(&mut self.saved)
    }

    /// Ends suppression ahead of a track read.  Any saved writes are kept.
    pub fn resume(&mut self) {
        self.suppress = false;
    }

    /// Forget everything, as on INIT.
    pub fn reset(&mut self) {
        self.suppress = false;
        self.cmd_index = 0;
        self.saved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(filter: &mut NibCommandFilter, bytes: &[u8]) -> std::vec::Vec<bool> {
        bytes.iter().map(|&b| filter.check_write(b)).collect()
    }

    #[test]
    fn read_track_command_suppresses_following_writes() {
        let mut filter = NibCommandFilter::default();
        let sent = feed(&mut filter, &[0x00, 0x55, 0xAA, 0xFF, 0x03]);
        assert!(sent.iter().all(|&s| s));
        assert!(filter.suppressed());

        assert!(!filter.check_write(0x42));
        assert!(!filter.check_write(0x43));
        let saved = filter.take_saved();
        assert_eq!(saved.as_slice(), &[0x42, 0x43]);
        assert!(!filter.suppressed());
    }

    #[test]
    fn other_command_leaves_writes_unsuppressed() {
        let mut filter = NibCommandFilter::default();
        feed(&mut filter, &[0x00, 0x55, 0xAA, 0xFF, 0x01]);
        assert!(!filter.suppressed());
        assert!(filter.check_write(0x42));
    }

    #[test]
    fn every_track_opcode_suppresses() {
        for &op in NIB_TRACK_COMMANDS.iter() {
            let mut filter = NibCommandFilter::default();
            feed(&mut filter, &[0x00, 0x55, 0xAA, 0xFF, op]);
            assert!(filter.suppressed(), "opcode {op:#04x}");
        }
    }

    #[test]
    fn interrupted_prefix_restarts_matching() {
        let mut filter = NibCommandFilter::default();
        // Broken by 0x12, then a 0x00 restarts the match immediately
        feed(&mut filter, &[0x00, 0x55, 0x12, 0x00, 0x55, 0xAA, 0xFF, 0x04]);
        assert!(filter.suppressed());

        let mut filter = NibCommandFilter::default();
        feed(&mut filter, &[0x00, 0x55, 0xAA, 0x00, 0xFF, 0x03]);
        assert!(!filter.suppressed());
    }

    #[test]
    fn saved_writes_are_bounded() {
        let mut filter = NibCommandFilter::default();
        feed(&mut filter, &[0x00, 0x55, 0xAA, 0xFF, 0x05]);
        for ii in 0..6 {
            assert!(!filter.check_write(ii));
        }
        assert_eq!(filter.take_saved().len(), NIB_SAVED_WRITES_MAX);
    }

    #[test]
    fn cable_state_is_ordered() {
        assert!(CableState::Unknown < CableState::ErrorOccurred);
        assert!(CableState::ErrorOccurred < CableState::Tested);
        assert!(CableState::Tested < CableState::SuccessfullyUsed);
    }
}

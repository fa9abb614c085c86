//! Infrastructure modules for iec1541: the seams the platform plugs its
//! hardware into.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod lines;
pub mod tape;
pub mod watchdog;

use embassy_time::Instant;

use crate::util::time::Clock;
use lines::{IeeeHardware, IeeeLine, IeeeLines};
use tape::{TapeDeck, TapeInterrupt};
use watchdog::Supervisor;

/// Stands in for an IEEE-488 port or tape deck a board doesn't have.  Its
/// presence probes always fail, so it is never bound.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFitted;

impl Clock for NotFitted {
    fn now(&self) -> Instant {
        Instant::from_ticks(0)
    }

    fn block_ns(&mut self, _ns: u32) {}

    fn block_us(&mut self, _us: u64) {}

    fn spin(&mut self) {}

    async fn yield_us(&mut self, _us: u64) {}
}

impl Supervisor for NotFitted {
    fn feed(&mut self) {}

    fn is_cancelled(&self) -> bool {
        true
    }
}

// With no port fitted nothing pulls the lines up, so they all read active
impl IeeeLines for NotFitted {
    fn set(&mut self, _lines: IeeeLine) {}

    fn release(&mut self, _lines: IeeeLine) {}

    fn active(&self) -> IeeeLine {
        IeeeLine::all()
    }

    fn float(&mut self, _lines: IeeeLine) {}

    fn init(&mut self) {}

    fn data_out(&mut self, _byte: u8) {}

    fn data_in(&mut self) -> u8 {
        0
    }
}

impl IeeeHardware for NotFitted {}

impl TapeDeck for NotFitted {
    fn detect(&mut self) -> bool {
        false
    }

    fn connected(&self) -> bool {
        false
    }

    fn sense_play(&self) -> bool {
        false
    }

    fn set_motor(&mut self, _on: bool) {}

    fn reset_ports(&mut self) {}

    fn start_capture(&mut self, _falling_edge: bool) {}

    async fn next_edge(&mut self) -> Result<u64, TapeInterrupt> {
        Err(TapeInterrupt::Disconnected)
    }

    fn stop_capture(&mut self) {}

    fn start_write(&mut self, _falling_edge: bool) {}

    async fn emit_edge(&mut self, _delta: u64) -> Result<(), TapeInterrupt> {
        Err(TapeInterrupt::Disconnected)
    }

    fn stop_write(&mut self) {}
}

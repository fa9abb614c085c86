//! Contains the seam between the tape driver and a 153x deck interface.
//!
//! The deck reports signal edges as the time since the previous edge, in
//! timer ticks, and plays back edges given the same way.  How the ticks
//! are measured (input capture, PIO, a timer interrupt) is up to the board.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use crate::infra::watchdog::Supervisor;
use crate::util::time::Clock;

/// Why a deck stopped delivering or accepting edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TapeInterrupt {
    /// The user pressed STOP.
    Stop,
    /// The deck was unplugged.
    Disconnected,
}

/// A 153x tape deck, as attached to the adapter.
#[allow(async_fn_in_trait)]
pub trait TapeDeck: Clock + Supervisor {
    /// Probe for a deck.  Called once, when the bus is bound.
    fn detect(&mut self) -> bool;

    /// Whether the deck is still plugged in.
    fn connected(&self) -> bool;

    /// Whether PLAY (or RECORD) is pressed.
    fn sense_play(&self) -> bool;

    fn set_motor(&mut self, on: bool);

    /// Return the READ, WRITE and SENSE ports to their idle state.
    fn reset_ports(&mut self);

    /// Start timing edges on READ.  `falling_edge` selects which edge
    /// starts the first interval.
    fn start_capture(&mut self, falling_edge: bool);

    /// The ticks until the next edge on READ.
    async fn next_edge(&mut self) -> Result<u64, TapeInterrupt>;

    fn stop_capture(&mut self);

    /// Get ready to toggle WRITE.  `falling_edge` selects the level of the
    /// first edge.
    fn start_write(&mut self, falling_edge: bool);

    /// Toggle WRITE `delta` ticks after the previous toggle.
    async fn emit_edge(&mut self, delta: u64) -> Result<(), TapeInterrupt>;

    fn stop_write(&mut self);
}

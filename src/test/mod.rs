//! Various test objects for iec1541.
//!
//! [`SimBus`] is a simulated IEC bus, implementing [`IecHardware`] with
//! virtual time.  Whenever the adapter changes a line, or time passes, the
//! device on the other end (a [`SimPeer`]) is stepped until the bus is
//! stable, so the drivers see the device react exactly as they would on
//! real hardware, without any real waiting.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod ieee;

pub use device::{BurstDrive, SimDrive};

use embassy_time::Instant;
use std::vec::Vec;

use crate::driver::BusError;
use crate::infra::lines::{IecHardware, IecLines, Lines};
use crate::infra::watchdog::Supervisor;
use crate::transfer::HostChannel;
use crate::types::CableType;
use crate::util::time::Clock;

// Maximum number of times the peer is stepped while the bus settles.  A
// well-behaved peer needs two or three.
const SETTLE_STEPS: usize = 64;

// The smallest unit of virtual time a spin or yield takes.
const SPIN_NS: u64 = 100;

/// A simulated device on the bus.
pub trait SimPeer {
    /// React to the bus, and to any timer which has expired.  Returns true
    /// if anything changed, in which case the bus is stepped again.
    fn step(&mut self, now_ns: u64, bus: Lines, host_port: Option<u8>) -> bool;

    /// The lines this device is pulling.
    fn lines(&self) -> Lines;

    /// When this device next needs stepping, regardless of the bus.
    fn deadline(&self) -> Option<u64>;

    /// What this device is driving onto the parallel port, if anything.
    fn port(&self) -> Option<u8> {
        None
    }

    /// Number of data bytes received, used to cancel transfers part way.
    fn data_bytes(&self) -> usize {
        0
    }
}

/// How the simulated adapter is wired to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCable {
    Passive,
    Inverting,
    /// RESET follows ATN.
    Xe,
}

/// Faults a [`SimDrive`] can be told to exhibit.  Positions count data
/// bytes received after the fault is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Don't acknowledge the given byte.
    NoAck { at: usize },
    /// Let go of the bus, for good, after this many bytes.
    Vanish { after: usize },
}

pub struct SimBus<P: SimPeer = SimDrive> {
    now_ns: u64,
    host: Lines,
    host_port: Option<u8>,
    stuck: Lines,
    peer: P,
    cable: SimCable,
    configured: Option<CableType>,
    abort: bool,
    cancel_at: usize,
    feeds: usize,
}

impl SimBus<SimDrive> {
    pub fn with_drive(drive: SimDrive) -> Self {
        Self::with_peer(drive)
    }

    pub fn drive(&self) -> &SimDrive {
        &self.peer
    }

    pub fn drive_mut(&mut self) -> &mut SimDrive {
        &mut self.peer
    }
}

impl SimBus<Idle> {
    /// A bus with nothing attached.
    pub fn empty() -> Self {
        Self::with_peer(Idle::default())
    }

    /// Have the "device" pull `line` between the two times.
    pub fn peer_pulse(&mut self, line: Lines, start_ns: u64, end_ns: u64) {
        self.peer.pulses.push((line, start_ns, end_ns));
        self.settle();
    }
}

impl<P: SimPeer> SimBus<P> {
    pub fn with_peer(peer: P) -> Self {
        let mut bus = Self {
            now_ns: 0,
            host: Lines::empty(),
            host_port: None,
            stuck: Lines::empty(),
            peer,
            cable: SimCable::Passive,
            configured: None,
            abort: false,
            cancel_at: usize::MAX,
            feeds: 0,
        };
        bus.settle();
        bus
    }

    pub fn with_cable(mut self, cable: SimCable) -> Self {
        self.cable = cable;
        self
    }

    /// Swap the cable.
    pub fn set_cable(&mut self, cable: SimCable) {
        self.cable = cable;
        self.settle();
    }

    /// Hold `lines` active, as a shorted or broken cable would.
    pub fn stick(&mut self, lines: Lines) {
        self.stuck |= lines;
        self.settle();
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }

    /// Cancel once the peer has received `count` more data bytes.
    pub fn cancel_after_bytes(&mut self, count: usize) {
        self.cancel_at = self.peer.data_bytes() + count;
    }

    /// Cancel now.
    pub fn abort(&mut self) {
        self.abort = true;
    }

    pub fn configured_cable(&self) -> Option<CableType> {
        self.configured
    }

    pub fn feeds(&self) -> usize {
        self.feeds
    }

    fn level(&self) -> Lines {
        let mut level = self.host | self.peer.lines() | self.stuck;
        if self.cable == SimCable::Xe && self.host.contains(Lines::ATN) {
            level |= Lines::RESET;
        }
        level
    }

    fn settle(&mut self) {
        for _ in 0..SETTLE_STEPS {
            let bus = self.level();
            if !self.peer.step(self.now_ns, bus, self.host_port) {
                break;
            }
        }
    }

    // Move time on, stepping the peer at each of its deadlines on the way.
    fn advance(&mut self, ns: u64) {
        let target = self.now_ns + ns;
        while let Some(deadline) = self.peer.deadline() {
            if deadline > target {
                break;
            }
            self.now_ns = self.now_ns.max(deadline);
            self.settle();
            if self.peer.deadline() == Some(deadline) {
                // Peer didn't act on it, so don't spin on it forever
                break;
            }
        }
        self.now_ns = target;
        self.settle();
    }
}

impl<P: SimPeer> Clock for SimBus<P> {
    fn now(&self) -> Instant {
        Instant::from_micros(self.now_ns / 1000)
    }

    fn block_ns(&mut self, ns: u32) {
        self.advance(ns as u64);
    }

    fn block_us(&mut self, us: u64) {
        self.advance(us * 1000);
    }

    fn spin(&mut self) {
        self.advance(SPIN_NS);
    }

    async fn yield_us(&mut self, us: u64) {
        self.advance((us * 1000).max(SPIN_NS));
    }
}

impl<P: SimPeer> IecLines for SimBus<P> {
    fn set(&mut self, lines: Lines) {
        self.host |= lines;
        self.settle();
    }

    fn release(&mut self, lines: Lines) {
        self.host &= !lines;
        self.settle();
    }

    fn set_release(&mut self, set: Lines, release: Lines) {
        self.host = (self.host | set) & !release;
        self.settle();
    }

    fn active(&self) -> Lines {
        self.level()
    }

    fn driven(&self) -> Lines {
        self.host
    }

    fn raw_atn(&self) -> (bool, bool) {
        let input = self.level().contains(Lines::ATN) ^ (self.cable == SimCable::Inverting);
        (self.host.contains(Lines::ATN), input)
    }

    fn configure_cable(&mut self, cable: CableType) {
        self.configured = Some(cable);
    }

    fn pp_read(&mut self) -> u8 {
        self.host_port = None;
        self.settle();
        self.peer.port().unwrap_or(0xFF)
    }

    fn pp_write(&mut self, data: u8) {
        self.host_port = Some(data);
        self.settle();
    }
}

impl<P: SimPeer> Supervisor for SimBus<P> {
    fn feed(&mut self) {
        self.feeds += 1;
    }

    fn is_cancelled(&self) -> bool {
        self.abort || self.peer.data_bytes() >= self.cancel_at
    }
}

impl<P: SimPeer> IecHardware for SimBus<P> {}

/// A peer which does nothing but pull lines at given times.
#[derive(Debug, Default)]
pub struct Idle {
    pulses: Vec<(Lines, u64, u64)>,
    lines: Lines,
    last_ns: u64,
}

impl SimPeer for Idle {
    fn step(&mut self, now_ns: u64, _bus: Lines, _host_port: Option<u8>) -> bool {
        self.last_ns = now_ns;
        let lines = self
            .pulses
            .iter()
            .filter(|(_, start, end)| *start <= now_ns && now_ns < *end)
            .fold(Lines::empty(), |acc, (line, _, _)| acc | *line);
        let changed = lines != self.lines;
        self.lines = lines;
        changed
    }

    fn lines(&self) -> Lines {
        self.lines
    }

    fn deadline(&self) -> Option<u64> {
        self.pulses
            .iter()
            .flat_map(|(_, start, end)| [*start, *end])
            .filter(|t| *t > self.last_ns)
            .min()
    }
}

/// The host end of the command transport.
#[derive(Debug, Default)]
pub struct HostMock {
    to_send: Vec<u8>,
    pos: usize,
    sent: Vec<u8>,
    chunks: Vec<usize>,
    fail_send: bool,
}

impl HostMock {
    /// A host which will supply `data` to the device.
    pub fn new(data: &[u8]) -> Self {
        Self {
            to_send: data.to_vec(),
            ..Self::default()
        }
    }

    /// Make every send fail, as if the host went away.
    pub fn fail_sends(&mut self) {
        self.fail_send = true;
    }

    /// Everything the device sent.
    pub fn sent(&self) -> &[u8] {
        &self.sent
    }

    /// The size of each send.
    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    /// Bytes the device hasn't taken yet.
    pub fn unread(&self) -> usize {
        self.to_send.len() - self.pos
    }
}

impl HostChannel for HostMock {
    async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, BusError> {
        let count = buf.len().min(self.unread());
        buf[..count].copy_from_slice(&self.to_send[self.pos..self.pos + count]);
        self.pos += count;
        Ok(count)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), BusError> {
        if self.fail_send {
            return Err(BusError::Io);
        }
        self.sent.extend_from_slice(data);
        self.chunks.push(data.len());
        Ok(())
    }
}

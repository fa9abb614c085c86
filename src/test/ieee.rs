//! A simulated IEEE-488 bus, with an optional drive attached.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Instant;
use std::collections::VecDeque;
use std::vec::Vec;

use super::{SETTLE_STEPS, SPIN_NS};
use crate::constants::{IEC_ADDRESS_MASK, IEC_UNLISTEN, IEC_UNTALK};
use crate::infra::lines::{IeeeHardware, IeeeLine, IeeeLines};
use crate::infra::watchdog::Supervisor;
use crate::util::time::Clock;

/// A drive on the IEEE-488 bus.  It answers ATN, listens and talks as
/// addressed, and handshakes instantly.
#[derive(Debug, Default)]
pub struct IeeeDrive {
    device: u8,
    listening: bool,
    talking: bool,
    accepted: bool,
    sending: bool,
    in_ifc: bool,
    lines: IeeeLine,
    data: Option<u8>,
    commands: Vec<u8>,
    received: Vec<u8>,
    eoi_at: Option<usize>,
    to_send: VecDeque<u8>,
    resets: usize,
}

impl IeeeDrive {
    pub fn new(device: u8) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    /// Data to talk, with EOI on the last byte.
    pub fn queue(&mut self, data: &[u8]) {
        self.to_send.extend(data.iter().copied());
    }

    /// Bytes received under ATN.
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    /// Data bytes received.
    pub fn data(&self) -> &[u8] {
        &self.received
    }

    /// The position of the first data byte sent with EOI.
    pub fn eoi_at(&self) -> Option<usize> {
        self.eoi_at
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn talking(&self) -> bool {
        self.talking
    }

    /// How many times IFC has been pulsed.
    pub fn resets(&self) -> usize {
        self.resets
    }

    fn command(&mut self, byte: u8) {
        self.commands.push(byte);
        match byte {
            IEC_UNLISTEN => self.listening = false,
            IEC_UNTALK => self.talking = false,
            b if b & 0xE0 == 0x20 => self.listening = b & IEC_ADDRESS_MASK == self.device,
            b if b & 0xE0 == 0x40 => self.talking = b & IEC_ADDRESS_MASK == self.device,
            _ => (),
        }
    }

    fn listen_step(&mut self, bus: IeeeLine, data: u8, atn: bool) {
        self.sending = false;
        self.data = None;
        self.lines.remove(IeeeLine::DAV | IeeeLine::EOI);

        let dav = bus.contains(IeeeLine::DAV);
        if dav && !self.accepted {
            self.accepted = true;
            if atn {
                self.command(data);
            } else {
                self.received.push(data);
                if bus.contains(IeeeLine::EOI) && self.eoi_at.is_none() {
                    self.eoi_at = Some(self.received.len() - 1);
                }
            }
            self.lines = IeeeLine::NRFD;
        } else if !dav {
            self.accepted = false;
            self.lines = IeeeLine::NDAC;
        }
    }

    fn talk_step(&mut self, bus: IeeeLine) {
        self.accepted = false;
        self.lines.remove(IeeeLine::NRFD | IeeeLine::NDAC);

        if self.sending {
            if !bus.contains(IeeeLine::NDAC) {
                self.sending = false;
                self.data = None;
                self.lines.remove(IeeeLine::DAV | IeeeLine::EOI);
                self.to_send.pop_front();
            }
        } else if let Some(&byte) = self.to_send.front() {
            // Only talk with a listener there and ready
            if !bus.contains(IeeeLine::NRFD) && bus.contains(IeeeLine::NDAC) {
                self.data = Some(byte);
                self.lines.insert(IeeeLine::DAV);
                if self.to_send.len() == 1 {
                    self.lines.insert(IeeeLine::EOI);
                }
                self.sending = true;
            }
        }
    }

    fn step(&mut self, bus: IeeeLine, data: u8) -> bool {
        let before = (
            self.lines,
            self.data,
            self.listening,
            self.talking,
            self.accepted,
            self.sending,
            self.in_ifc,
        );

        if bus.contains(IeeeLine::IFC) {
            if !self.in_ifc {
                self.resets += 1;
            }
            self.in_ifc = true;
            self.listening = false;
            self.talking = false;
            self.accepted = false;
            self.sending = false;
            self.lines = IeeeLine::empty();
            self.data = None;
        } else {
            self.in_ifc = false;
            let atn = bus.contains(IeeeLine::ATN);
            if atn || self.listening {
                self.listen_step(bus, data, atn);
            } else if self.talking {
                self.talk_step(bus);
            } else {
                self.accepted = false;
                self.sending = false;
                self.lines = IeeeLine::empty();
                self.data = None;
            }
        }

        before
            != (
                self.lines,
                self.data,
                self.listening,
                self.talking,
                self.accepted,
                self.sending,
                self.in_ifc,
            )
    }
}

pub struct SimIeee {
    now_ns: u64,
    host: IeeeLine,
    host_data: Option<u8>,
    floating: IeeeLine,
    drive: Option<IeeeDrive>,
    abort: bool,
}

impl SimIeee {
    pub fn with_drive(drive: IeeeDrive) -> Self {
        Self {
            now_ns: 0,
            host: IeeeLine::empty(),
            host_data: None,
            floating: IeeeLine::empty(),
            drive: Some(drive),
            abort: false,
        }
    }

    /// A port with nothing plugged in.
    pub fn empty() -> Self {
        Self {
            drive: None,
            ..Self::with_drive(IeeeDrive::default())
        }
    }

    pub fn drive(&self) -> &IeeeDrive {
        self.drive.as_ref().expect("no drive attached")
    }

    pub fn drive_mut(&mut self) -> &mut IeeeDrive {
        self.drive.as_mut().expect("no drive attached")
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// The lines the adapter is driving.
    pub fn host_lines(&self) -> IeeeLine {
        self.host
    }

    pub fn abort(&mut self) {
        self.abort = true;
    }

    fn level(&self) -> IeeeLine {
        match &self.drive {
            Some(drive) => self.host | drive.lines,
            // Floated lines with nothing to pull them up read active
            None => self.host | self.floating,
        }
    }

    fn settle(&mut self) {
        for _ in 0..SETTLE_STEPS {
            let bus = self.level();
            let data = self.host_data.unwrap_or(0);
            match self.drive.as_mut() {
                Some(drive) => {
                    if !drive.step(bus, data) {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    fn advance(&mut self, ns: u64) {
        self.now_ns += ns;
        self.settle();
    }
}

impl Clock for SimIeee {
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

impl IeeeLines for SimIeee {
    fn set(&mut self, lines: IeeeLine) {
        self.host |= lines;
        self.settle();
    }

    fn release(&mut self, lines: IeeeLine) {
        self.host &= !lines;
        self.settle();
    }

    fn active(&self) -> IeeeLine {
        self.level()
    }

    fn float(&mut self, lines: IeeeLine) {
        self.host &= !lines;
        self.floating |= lines;
        self.settle();
    }

    fn init(&mut self) {
        self.host = IeeeLine::empty();
        self.floating = IeeeLine::empty();
        self.host_data = None;
        self.settle();
    }

    fn data_out(&mut self, byte: u8) {
        self.host_data = Some(byte);
        self.settle();
    }

    fn data_in(&mut self) -> u8 {
        self.host_data = None;
        self.settle();
        self.drive.as_ref().and_then(|d| d.data).unwrap_or(0)
    }
}

impl Supervisor for SimIeee {
    fn feed(&mut self) {}

    fn is_cancelled(&self) -> bool {
        self.abort
    }
}

impl IeeeHardware for SimIeee {}

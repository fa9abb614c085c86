//! This module implements the Protocol handler, which decodes and actions
//! the host's control requests and bulk commands, binding them to one of
//! the bus drivers.
//!
//! The bus kind is chosen the first time the host initializes the adapter:
//! a tape deck if one is attached, otherwise an IEEE-488 device if one
//! answers, otherwise the IEC bus.  From then on every bus-level command is
//! routed to that driver, via [`ProtocolDriver`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

mod cable;
pub mod iec;
pub mod nib;
pub mod read;
pub mod session;
pub mod transport;
pub mod write;

use bitflags::bitflags;
use core::fmt;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::constants::{
    CAP_IEEE488, CAP_TAP, CAPABILITIES_IEC, CMD_READ, CMD_WRITE, COMMAND_LEN, CTRL_ECHO,
    CTRL_ENTER_BOOTLOADER, CTRL_INIT, CTRL_RESET, CTRL_SHUTDOWN, CTRL_TAP_BREAK,
    ERROR_DISK_CMD_IN_TAPE_MODE, ERROR_TAPE_CMD_IN_DISK_MODE, INIT_RESPONSE_LEN, IOCTL_CLEAR_EOI,
    IOCTL_GET_EOI, IOCTL_IEC_POLL, IOCTL_IEC_SETRELEASE, IOCTL_IEC_WAIT, IOCTL_PARBURST_READ,
    IOCTL_PARBURST_WRITE, IOCTL_PP_READ, IOCTL_PP_WRITE, IOCTL_SRQBURST_READ,
    IOCTL_SRQBURST_WRITE, IOCTL_TAP_GET_SENSE, IOCTL_TAP_GET_VER, IOCTL_TAP_MOTOR_OFF,
    IOCTL_TAP_MOTOR_ON, IOCTL_TAP_PREPARE_CAPTURE, IOCTL_TAP_PREPARE_WRITE,
    IOCTL_TAP_WAIT_FOR_PLAY_SENSE, IOCTL_TAP_WAIT_FOR_STOP_SENSE, PROTOCOL_VERSION,
    STATE_CMD_IN_PROGRESS, STATE_DOING_RESET, STATE_IEEE488_PRESENT, STATE_NO_DEVICE,
    STATE_TAPE_PRESENT, STATUS_BUSY, STATUS_ERROR, STATUS_LEN, STATUS_READY,
};
use crate::driver::{BusError, ProtocolDriver};
use crate::ieee::IeeeDriver;
use crate::infra::NotFitted;
use crate::infra::lines::{IecHardware, IeeeHardware};
use crate::infra::tape::TapeDeck;
use crate::tape::{TapeDriver, TapeStatus};
use crate::transfer::{HostChannel, OutTransfer};
use crate::types::CableType;
use iec::IecDriver;
use nib::{
    parburst_read_checked, parburst_write_checked, srqburst_read_checked, srqburst_write_checked,
};
use session::BusSession;

/// Which bus the handler has bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusKind {
    Iec,
    Ieee488,
    Tape,
}

/// Run-time configuration, supplied by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusConfig {
    /// The user's choice of IEC cable.  `None` autodetects.
    pub cable: Option<CableType>,

    /// Whether to look for an IEEE-488 device on INIT.
    pub probe_ieee: bool,

    /// Whether to look for a tape deck on INIT.
    pub probe_tape: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            cable: None,
            probe_ieee: true,
            probe_tape: true,
        }
    }
}

/// What the transport should return to the host once a bulk command has
/// been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkResponse {
    /// Send this status record.
    Status(Status),

    /// The host doesn't expect a status record.
    NoStatus,

    /// The command failed before producing the status the host is waiting
    /// for.  USB transports stall their IN endpoint.
    Error,
}

/// Reasons a request from the host could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// The command record was the wrong size.
    Length,
    /// Unknown command or control request.
    Command,
    /// Unknown protocol.
    Protocol,
    /// Unknown flags, or flags used with a protocol other than CBM.
    Flags,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandError::Length => "bad command length",
            CommandError::Command => "unsupported command",
            CommandError::Protocol => "unsupported protocol",
            CommandError::Flags => "unsupported flags",
        };
        f.write_str(s)
    }
}

// Dispatches to whichever driver is bound.  `$d` is the driver, and the
// body may borrow the session alongside it.
macro_rules! bound {
    ($self:ident, $bus:expr, $d:ident => $body:expr) => {
        match $bus {
            BusKind::Iec => {
                let $d = &mut $self.iec;
                $body
            }
            BusKind::Ieee488 => {
                let $d = &mut $self.ieee;
                $body
            }
            BusKind::Tape => {
                let $d = &mut $self.tape;
                $body
            }
        }
    };
}

/// `ProtocolHandler` handles the host's control requests and bulk commands.
///
/// The IEEE-488 port and tape deck are optional: boards without them use
/// [`NotFitted`], which is never detected.
pub struct ProtocolHandler<H: IecHardware, E: IeeeHardware = NotFitted, T: TapeDeck = NotFitted>
{
    pub(crate) iec: IecDriver<H>,
    pub(crate) ieee: IeeeDriver<E>,
    pub(crate) tape: TapeDriver<T>,

    // Set on the first INIT (or bulk command), and never changed
    bus: Option<BusKind>,

    session: BusSession,

    // The device state reported by INIT
    state: u8,

    // Whether the host has a command sequence open, and whether INIT just
    // reset the bus
    cmd_seq: u8,

    // Whether a device answered on the bound bus
    device_present: bool,

    config: BusConfig,
}

impl<H: IecHardware, E: IeeeHardware, T: TapeDeck> ProtocolHandler<H, E, T> {
    pub fn new(iec: H, ieee: E, tape: T, config: BusConfig) -> Self {
        Self {
            iec: IecDriver::new(iec),
            ieee: IeeeDriver::new(ieee),
            tape: TapeDriver::new(tape),
            bus: None,
            session: BusSession::new(config.cable),
            state: 0,
            cmd_seq: 0,
            device_present: false,
            config,
        }
    }

    /// The bus bound by INIT, if it has happened yet.
    pub fn bus(&self) -> Option<BusKind> {
        self.bus
    }

    pub fn session(&self) -> &BusSession {
        &self.session
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The capabilities reported by INIT.
    pub fn capabilities(&self) -> u8 {
        let mut caps = CAPABILITIES_IEC;
        if self.config.probe_ieee {
            caps |= CAP_IEEE488;
        }
        if self.config.probe_tape {
            caps |= CAP_TAP;
        }
        caps
    }

    // Probe for tape, then IEEE-488, falling back to IEC.
    async fn bind(&mut self) -> BusKind {
        self.state = 0;

        let bus = if self.config.probe_tape && self.tape.probe() {
            self.tape.enter_mode();
            self.state |= STATE_TAPE_PRESENT;
            self.device_present = true;
            BusKind::Tape
        } else if self.config.probe_ieee && self.ieee.detect() {
            self.state |= STATE_IEEE488_PRESENT;
            self.device_present = self.ieee.wait_for_free_bus(false).await.is_ok();
            BusKind::Ieee488
        } else {
            if let Err(e) = self.iec.check_cable(&mut self.session) {
                warn!("Cable check failed: {}", e);
            }
            self.device_present = self.iec.wait_for_free_bus(false).await.is_ok();
            BusKind::Iec
        };

        info!(
            "Bound to {:?}, device {}",
            bus,
            if self.device_present {
                "present"
            } else {
                "not present"
            }
        );
        self.bus = Some(bus);
        bus
    }

    async fn bound_bus(&mut self) -> BusKind {
        match self.bus {
            Some(bus) => bus,
            None => {
                info!("No bus bound - probe now");
                self.bind().await
            }
        }
    }

    // A quick check a device has turned up since the bus was bound.
    fn recheck_device(&mut self, bus: BusKind) -> bool {
        match bus {
            BusKind::Iec => self.iec.check_if_bus_free(),
            BusKind::Ieee488 => self.ieee.check_if_bus_free(),
            BusKind::Tape => true,
        }
    }

    async fn reset(&mut self, forever: bool) {
        let Some(bus) = self.bus else {
            debug!("Reset before INIT - ignoring");
            return;
        };
        let result = bound!(self, bus, d => d.reset(&mut self.session, forever).await);
        if let Err(e) = result {
            info!("Reset: {}", e);
        }
    }

    /// Handle a control request, filling in `reply`.  Returns the number
    /// of reply bytes to send.
    pub async fn handle_control(
        &mut self,
        request: u8,
        reply: &mut [u8; INIT_RESPONSE_LEN],
    ) -> Result<usize, CommandError> {
        let request = ControlRequest::try_from(request).inspect_err(|_| {
            warn!("Unsupported control request {}", request);
        })?;
        debug!("Control request {:?}", request);

        match request {
            ControlRequest::Echo => {
                reply[0] = request as u8;
                Ok(1)
            }
            ControlRequest::Init => Ok(self.init(reply).await),
            ControlRequest::Shutdown => {
                self.cmd_seq = 0;
                Ok(0)
            }
            ControlRequest::Reset => {
                // INIT may have just done it
                if self.cmd_seq & STATE_DOING_RESET == 0 {
                    self.reset(false).await;
                }
                Ok(0)
            }
            ControlRequest::TapBreak => {
                if self.bus == Some(BusKind::Tape) {
                    self.reset(false).await;
                } else {
                    debug!("Tape break in disk mode - ignoring");
                }
                Ok(0)
            }
            ControlRequest::EnterBootloader => {
                info!("Bootloader not supported");
                Err(CommandError::Command)
            }
        }
    }

    async fn init(&mut self, reply: &mut [u8; INIT_RESPONSE_LEN]) -> usize {
        self.session.nib.reset();

        let bus = match self.bus {
            Some(bus) => {
                if !self.device_present {
                    self.device_present = self.recheck_device(bus);
                }
                bus
            }
            None => self.bind().await,
        };

        reply.fill(0);
        reply[0] = PROTOCOL_VERSION;
        reply[1] = self.capabilities();
        reply[2] = self.state;

        // The last command sequence never finished, probably because the
        // host was interrupted.  Get the bus back to a known state.
        if self.cmd_seq != 0 {
            info!("Command sequence interrupted - resetting {:?}", bus);
            reply[2] |= STATE_DOING_RESET;
            self.cmd_seq = STATE_DOING_RESET;
            self.reset(false).await;
        }
        self.cmd_seq |= STATE_CMD_IN_PROGRESS;

        if !self.device_present {
            reply[2] |= STATE_NO_DEVICE;
        }
        INIT_RESPONSE_LEN
    }

    /// Handle a bulk command.  Any data the command moves is exchanged with
    /// `host` before this returns.
    pub async fn handle_bulk<C: HostChannel>(
        &mut self,
        request: &[u8],
        host: &mut C,
    ) -> Result<BulkResponse, CommandError> {
        // Clear the "just did reset" flag whatever the command
        self.cmd_seq &= !STATE_DOING_RESET;

        let command = Command::new(request)?;
        let bus = self.bound_bus().await;
        trace!(
            "Bulk: {:?} {:#04x} {:#04x} {:#04x}",
            command.command, command.bytes[1], command.bytes[2], command.bytes[3]
        );

        let response = match command.command {
            CommandType::Read => self.read(bus, &command, host).await,
            CommandType::Write => self.write(bus, &command, host).await,
            CommandType::GetEoi => BulkResponse::Status(Status::ready(self.session.eoi() as u16)),
            CommandType::ClearEoi => {
                self.session.clear_eoi();
                BulkResponse::NoStatus
            }
            CommandType::IecWait => {
                let (line, state) = (command.bytes[1], command.bytes[2]);
                match bound!(self, bus, d => d.wait(&mut self.session, line, state).await) {
                    Ok(()) => self.poll(bus),
                    Err(e) => {
                        info!("Wait ended: {}", e);
                        BulkResponse::NoStatus
                    }
                }
            }
            CommandType::IecPoll => self.poll(bus),
            CommandType::IecSetRelease => {
                let (set, release) = (command.bytes[1], command.bytes[2]);
                bound!(self, bus, d => d.set_release(set, release));
                BulkResponse::NoStatus
            }
            CommandType::PpRead
            | CommandType::PpWrite
            | CommandType::ParburstRead
            | CommandType::ParburstWrite
            | CommandType::SrqburstRead
            | CommandType::SrqburstWrite => self.port(bus, &command),
            _ => self.tape_ioctl(bus, &command).await,
        };

        Ok(response)
    }

    /// Handle a bulk command, sending any status record to the host.
    /// Errors are reported with an error record, where the host expects a
    /// record, and undecodable commands are dropped.
    pub async fn bulk<C: HostChannel>(
        &mut self,
        request: &[u8],
        host: &mut C,
    ) -> Result<(), BusError> {
        let status = match self.handle_bulk(request, host).await {
            Ok(BulkResponse::Status(status)) => status,
            Ok(BulkResponse::NoStatus) => return Ok(()),
            Ok(BulkResponse::Error) => Status::error(0),
            Err(e) => {
                warn!("Failed to parse command - drop it: {}", e);
                return Ok(());
            }
        };
        trace!("Status {:?}", status);
        host.send(&status.to_bytes()).await
    }

    fn poll(&mut self, bus: BusKind) -> BulkResponse {
        let lines = bound!(self, bus, d => d.poll());
        trace!("Poll: {:#04x}", lines);
        BulkResponse::Status(Status::ready(lines as u16))
    }

    async fn read<C: HostChannel>(
        &mut self,
        bus: BusKind,
        command: &Command,
        host: &mut C,
    ) -> BulkResponse {
        let tape_protocol = command.protocol.is_tape();
        match bus {
            BusKind::Tape => match command.protocol {
                ProtocolType::Tap => {
                    let status = self.tape.capture(host, command.len).await;
                    tape_status(status)
                }
                ProtocolType::TapConfig => {
                    let status = self.tape.download_config(host, command.len).await;
                    tape_status(status)
                }
                _ => {
                    info!("Disk READ in tape mode");
                    BulkResponse::NoStatus
                }
            },
            _ if tape_protocol => {
                info!("Tape READ in disk mode");
                BulkResponse::Status(Status::error(ERROR_TAPE_CMD_IN_DISK_MODE as u16))
            }
            BusKind::Ieee488 => {
                // Only CBM is supported, whatever was asked for
                let result = self.ieee.raw_read(&mut self.session, command.len, host).await;
                log_transfer("READ", result);
                BulkResponse::NoStatus
            }
            BusKind::Iec => {
                let result = self
                    .iec
                    .transfer_read(&mut self.session, command.protocol, command.len, host)
                    .await;
                log_transfer("READ", result);
                BulkResponse::NoStatus
            }
        }
    }

    async fn write<C: HostChannel>(
        &mut self,
        bus: BusKind,
        command: &Command,
        host: &mut C,
    ) -> BulkResponse {
        let tape_protocol = command.protocol.is_tape();
        match bus {
            BusKind::Tape => match command.protocol {
                ProtocolType::Tap => tape_status(self.tape.write(host, command.len).await),
                ProtocolType::TapConfig => {
                    tape_status(self.tape.upload_config(host, command.len).await)
                }
                _ => {
                    info!("Disk WRITE in tape mode");
                    OutTransfer::new(host, command.len).finish().await;
                    BulkResponse::Status(Status::error(ERROR_DISK_CMD_IN_TAPE_MODE as u16))
                }
            },
            _ if tape_protocol => {
                info!("Tape WRITE in disk mode");
                OutTransfer::new(host, command.len).finish().await;
                BulkResponse::Status(Status::error(ERROR_TAPE_CMD_IN_DISK_MODE as u16))
            }
            BusKind::Ieee488 => {
                let result = self
                    .ieee
                    .raw_write(&mut self.session, command.len, command.flags, host)
                    .await;
                BulkResponse::Status(Status::ready(log_transfer("WRITE", result)))
            }
            BusKind::Iec => {
                let result = self
                    .iec
                    .transfer_write(
                        &mut self.session,
                        command.protocol,
                        command.len,
                        command.flags,
                        host,
                    )
                    .await;
                let written = log_transfer("WRITE", result);
                if command.protocol.write_send_status() {
                    BulkResponse::Status(Status::ready(written))
                } else {
                    BulkResponse::NoStatus
                }
            }
        }
    }

    // Direct parallel port and burst access, IEC only
    fn port(&mut self, bus: BusKind, command: &Command) -> BulkResponse {
        let reads = matches!(
            command.command,
            CommandType::PpRead | CommandType::ParburstRead | CommandType::SrqburstRead
        );
        match bus {
            BusKind::Iec => (),
            BusKind::Ieee488 => {
                info!("{:?} not supported over IEEE-488", command.command);
                return if reads {
                    BulkResponse::Error
                } else {
                    BulkResponse::NoStatus
                };
            }
            BusKind::Tape => {
                info!("{:?} in tape mode", command.command);
                return if reads {
                    BulkResponse::Status(Status::error(ERROR_DISK_CMD_IN_TAPE_MODE as u16))
                } else {
                    BulkResponse::NoStatus
                };
            }
        }

        let byte = command.bytes[1];
        let session = &mut self.session;
        let result = match command.command {
            CommandType::PpRead => Ok(Some(self.iec.pp_read())),
            CommandType::PpWrite => {
                self.iec.pp_write(byte);
                Ok(None)
            }
            CommandType::ParburstRead => parburst_read_checked(&mut self.iec, session).map(Some),
            CommandType::ParburstWrite => {
                parburst_write_checked(&mut self.iec, session, byte).map(|()| None)
            }
            CommandType::SrqburstRead => srqburst_read_checked(&mut self.iec, session).map(Some),
            CommandType::SrqburstWrite => {
                srqburst_write_checked(&mut self.iec, session, byte).map(|()| None)
            }
            _ => Err(BusError::Internal),
        };

        match result {
            Ok(Some(value)) => BulkResponse::Status(Status::ready(value as u16)),
            Ok(None) => BulkResponse::NoStatus,
            Err(e) => {
                info!("{:?} failed: {}", command.command, e);
                if reads {
                    BulkResponse::Error
                } else {
                    BulkResponse::NoStatus
                }
            }
        }
    }

    async fn tape_ioctl(&mut self, bus: BusKind, command: &Command) -> BulkResponse {
        if bus != BusKind::Tape {
            info!("{:?} in disk mode", command.command);
            return BulkResponse::Status(Status::error(ERROR_TAPE_CMD_IN_DISK_MODE as u16));
        }

        let status = match command.command {
            CommandType::TapGetVer => {
                return BulkResponse::Status(Status::ready(self.tape.version()));
            }
            CommandType::TapMotorOn => self.tape.motor_on(),
            CommandType::TapMotorOff => self.tape.motor_off(),
            CommandType::TapPrepareCapture => self.tape.prepare_capture(),
            CommandType::TapPrepareWrite => self.tape.prepare_write(),
            CommandType::TapGetSense => self.tape.get_sense(),
            CommandType::TapWaitForStopSense => self.tape.wait_for_stop_sense().await,
            CommandType::TapWaitForPlaySense => self.tape.wait_for_play_sense().await,
            _ => {
                error!("{:?} is not a tape command", command.command);
                return BulkResponse::Error;
            }
        };
        tape_status(status)
    }
}

fn tape_status(status: TapeStatus) -> BulkResponse {
    debug!("Tape: {}", status);
    BulkResponse::Status(Status::ready(status as u16))
}

// Log a transfer's outcome, returning the count reported to the host.  A
// failed write reports nothing written.
fn log_transfer(kind: &str, result: Result<u16, (BusError, u16)>) -> u16 {
    match result {
        Ok(count) => {
            trace!("{}: {} bytes", kind, count);
            count
        }
        Err((e, count)) => {
            info!("{}: failed after {} bytes: {}", kind, count, e);
            0
        }
    }
}

/// The control requests the host may make.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlRequest {
    Echo = CTRL_ECHO,
    Init = CTRL_INIT,
    Reset = CTRL_RESET,
    Shutdown = CTRL_SHUTDOWN,
    EnterBootloader = CTRL_ENTER_BOOTLOADER,
    TapBreak = CTRL_TAP_BREAK,
}

impl TryFrom<u8> for ControlRequest {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            CTRL_ECHO => Ok(Self::Echo),
            CTRL_INIT => Ok(Self::Init),
            CTRL_RESET => Ok(Self::Reset),
            CTRL_SHUTDOWN => Ok(Self::Shutdown),
            CTRL_ENTER_BOOTLOADER => Ok(Self::EnterBootloader),
            CTRL_TAP_BREAK => Ok(Self::TapBreak),
            _ => Err(CommandError::Command),
        }
    }
}

/// The type of Command received from the host.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandType {
    /// The host is requesting data from the device.
    Read = CMD_READ,

    /// The host is sending data to the device.
    Write = CMD_WRITE,

    GetEoi = IOCTL_GET_EOI,
    ClearEoi = IOCTL_CLEAR_EOI,
    PpRead = IOCTL_PP_READ,
    PpWrite = IOCTL_PP_WRITE,
    IecPoll = IOCTL_IEC_POLL,
    IecWait = IOCTL_IEC_WAIT,
    IecSetRelease = IOCTL_IEC_SETRELEASE,
    ParburstRead = IOCTL_PARBURST_READ,
    ParburstWrite = IOCTL_PARBURST_WRITE,
    SrqburstRead = IOCTL_SRQBURST_READ,
    SrqburstWrite = IOCTL_SRQBURST_WRITE,
    TapMotorOn = IOCTL_TAP_MOTOR_ON,
    TapGetVer = IOCTL_TAP_GET_VER,
    TapPrepareCapture = IOCTL_TAP_PREPARE_CAPTURE,
    TapPrepareWrite = IOCTL_TAP_PREPARE_WRITE,
    TapGetSense = IOCTL_TAP_GET_SENSE,
    TapWaitForStopSense = IOCTL_TAP_WAIT_FOR_STOP_SENSE,
    TapWaitForPlaySense = IOCTL_TAP_WAIT_FOR_PLAY_SENSE,
    TapMotorOff = IOCTL_TAP_MOTOR_OFF,
}

// Implement TryFrom for CommandType so we can parse an incoming byte into a
// CommandType.
impl TryFrom<u8> for CommandType {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            CMD_READ => Ok(Self::Read),
            CMD_WRITE => Ok(Self::Write),
            IOCTL_GET_EOI => Ok(Self::GetEoi),
            IOCTL_CLEAR_EOI => Ok(Self::ClearEoi),
            IOCTL_PP_READ => Ok(Self::PpRead),
            IOCTL_PP_WRITE => Ok(Self::PpWrite),
            IOCTL_IEC_POLL => Ok(Self::IecPoll),
            IOCTL_IEC_WAIT => Ok(Self::IecWait),
            IOCTL_IEC_SETRELEASE => Ok(Self::IecSetRelease),
            IOCTL_PARBURST_READ => Ok(Self::ParburstRead),
            IOCTL_PARBURST_WRITE => Ok(Self::ParburstWrite),
            IOCTL_SRQBURST_READ => Ok(Self::SrqburstRead),
            IOCTL_SRQBURST_WRITE => Ok(Self::SrqburstWrite),
            IOCTL_TAP_MOTOR_ON => Ok(Self::TapMotorOn),
            IOCTL_TAP_GET_VER => Ok(Self::TapGetVer),
            IOCTL_TAP_PREPARE_CAPTURE => Ok(Self::TapPrepareCapture),
            IOCTL_TAP_PREPARE_WRITE => Ok(Self::TapPrepareWrite),
            IOCTL_TAP_GET_SENSE => Ok(Self::TapGetSense),
            IOCTL_TAP_WAIT_FOR_STOP_SENSE => Ok(Self::TapWaitForStopSense),
            IOCTL_TAP_WAIT_FOR_PLAY_SENSE => Ok(Self::TapWaitForPlaySense),
            IOCTL_TAP_MOTOR_OFF => Ok(Self::TapMotorOff),
            _ => Err(CommandError::Command),
        }
    }
}

/// A Command object is created from the incoming command record, and used
/// to determine the type of command, the protocol, and the length of any
/// data associated with the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    // The type of command.  This is the first byte of the record.
    command: CommandType,

    // The protocol used by the command.  This is the high nibble of the
    // second byte, for READ and WRITE only.
    protocol: ProtocolType,

    // Any protocol flags, the low nibble of the second byte.  Only used
    // when ProtocolType is Cbm.
    flags: ProtocolFlags,

    // The length of any data associated with the command, encoded in the
    // third and fourth bytes as a little endian u16.  The IOCTLs use these
    // bytes as arguments instead.
    len: u16,

    bytes: [u8; COMMAND_LEN],
}

impl Command {
    /// Create a new Command object from a command record, checking the
    /// length and contents are valid.
    pub fn new(bytes: &[u8]) -> Result<Self, CommandError> {
        let bytes: [u8; COMMAND_LEN] = bytes.try_into().map_err(|_| {
            info!("Unexpected command length: {}", bytes.len());
            CommandError::Length
        })?;

        let command = CommandType::try_from(bytes[0]).inspect_err(|_| {
            info!("Unsupported command: {:#04x}", bytes[0]);
        })?;

        // The protocol and flags are only meaningful for READ and WRITE
        let (protocol, flags) = if matches!(command, CommandType::Read | CommandType::Write) {
            let protocol = ProtocolType::try_from(bytes[1]).inspect_err(|_| {
                info!("Unsupported protocol: {:#04x}", bytes[1]);
            })?;
            let flags = ProtocolFlags::from_bits(bytes[1] & 0x0F).ok_or_else(|| {
                info!("Unsupported flags: {:#04x}", bytes[1]);
                CommandError::Flags
            })?;
            if !flags.is_empty() && protocol != ProtocolType::Cbm {
                info!("Flags {:?} not supported with {}", flags, protocol);
                return Err(CommandError::Flags);
            }
            (protocol, flags)
        } else {
            (ProtocolType::None, ProtocolFlags::empty())
        };

        Ok(Self {
            command,
            protocol,
            flags,
            len: u16::from_le_bytes([bytes[2], bytes[3]]),
            bytes,
        })
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn flags(&self) -> ProtocolFlags {
        self.flags
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Supported READ and WRITE protocols.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolType {
    None = 0x00,
    Cbm = 0x10,
    S1 = 0x20,
    S2 = 0x30,
    PP = 0x40,
    P2 = 0x50,
    Nib = 0x60,
    NibCommand = 0x70,
    NibSrq = 0x80,
    NibSrqCommand = 0x90,
    Tap = 0xA0,
    TapConfig = 0xB0,
}

impl ProtocolType {
    /// Whether a WRITE with this protocol returns a status record.
    pub fn write_send_status(self) -> bool {
        matches!(self, Self::Cbm | Self::Tap | Self::TapConfig)
    }

    pub fn is_tape(self) -> bool {
        matches!(self, Self::Tap | Self::TapConfig)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Cbm => "CBM",
            Self::S1 => "S1",
            Self::S2 => "S2",
            Self::PP => "PP",
            Self::P2 => "P2",
            Self::Nib => "NIB",
            Self::NibCommand => "NIB command",
            Self::NibSrq => "NIB SRQ",
            Self::NibSrqCommand => "NIB SRQ command",
            Self::Tap => "TAP",
            Self::TapConfig => "TAP config",
        };
        f.write_str(s)
    }
}

/// Implement `TryFrom` for `ProtocolType` in order to parse an incoming byte
/// into a `ProtocolType`.
impl TryFrom<u8> for ProtocolType {
    type Error = CommandError;

    // Protocol is the high order nibble
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0xF0 {
            0x10 => Ok(Self::Cbm),
            0x20 => Ok(Self::S1),
            0x30 => Ok(Self::S2),
            0x40 => Ok(Self::PP),
            0x50 => Ok(Self::P2),
            0x60 => Ok(Self::Nib),
            0x70 => Ok(Self::NibCommand),
            0x80 => Ok(Self::NibSrq),
            0x90 => Ok(Self::NibSrqCommand),
            0xA0 => Ok(Self::Tap),
            0xB0 => Ok(Self::TapConfig),
            _ => Err(CommandError::Protocol),
        }
    }
}

bitflags! {
    /// Flags modifying a CBM WRITE (and READ, where they are ignored).
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolFlags: u8 {
        /// Turn the bus around to TALK after an ATN write.
        const CBM_TALK = 0x01;
        /// Send the bytes under ATN.
        const CBM_ATN = 0x02;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ProtocolFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ProtocolFlags({=u8:#04x})", self.bits());
    }
}

/// The status code used in the status record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusCode {
    /// The device is busy.  The host may retry later.
    Busy = STATUS_BUSY,

    /// The command was successful.
    Ok = STATUS_READY,

    /// The command failed, or was invalid.
    Error = STATUS_ERROR,
}

/// A Status is returned to the host after certain commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    /// The status code to return.
    pub code: StatusCode,

    /// The value to return.  This is typically the number of bytes
    /// processed, or an error code.
    pub value: u16,
}

impl Status {
    pub const fn ready(value: u16) -> Self {
        Self {
            code: StatusCode::Ok,
            value,
        }
    }

    pub const fn error(value: u16) -> Self {
        Self {
            code: StatusCode::Error,
            value,
        }
    }

    /// Convert the Status into the record sent to the host.
    pub fn to_bytes(&self) -> [u8; STATUS_LEN] {
        let mut bytes = [0; STATUS_LEN];
        bytes[0] = self.code as u8;
        bytes[1..3].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{
        CAP_CBM, CAP_NIB, CAP_NIB_SRQ, ERROR_TAPE_CMD_IN_DISK_MODE, TAPE_FIRMWARE_VERSION,
    };
    use crate::infra::lines::{IecLines, Lines};
    use crate::test::ieee::{IeeeDrive, SimIeee};
    use crate::test::tape::SimDeck;
    use crate::test::{HostMock, SimBus, SimDrive};
    use embassy_futures::block_on;

    type IecHandler = ProtocolHandler<SimBus>;

    fn iec() -> IecHandler {
        ProtocolHandler::new(
            SimBus::with_drive(SimDrive::new(8)),
            NotFitted,
            NotFitted,
            BusConfig::default(),
        )
    }

    fn init<H: IecHardware, E: IeeeHardware, T: TapeDeck>(
        handler: &mut ProtocolHandler<H, E, T>,
    ) -> [u8; INIT_RESPONSE_LEN] {
        let mut reply = [0xFF; INIT_RESPONSE_LEN];
        let len = block_on(handler.handle_control(CTRL_INIT, &mut reply)).unwrap();
        assert_eq!(len, INIT_RESPONSE_LEN);
        reply
    }

    fn bulk<H: IecHardware, E: IeeeHardware, T: TapeDeck>(
        handler: &mut ProtocolHandler<H, E, T>,
        request: [u8; 4],
        host: &mut HostMock,
    ) -> BulkResponse {
        block_on(handler.handle_bulk(&request, host)).unwrap()
    }

    fn ioctl<H: IecHardware, E: IeeeHardware, T: TapeDeck>(
        handler: &mut ProtocolHandler<H, E, T>,
        cmd: u8,
        arg1: u8,
        arg2: u8,
    ) -> BulkResponse {
        bulk(handler, [cmd, arg1, arg2, 0], &mut HostMock::new(&[]))
    }

    #[test]
    fn command_decoding() {
        let cmd = Command::new(&[CMD_WRITE, 0x12, 0x34, 0x12]).unwrap();
        assert_eq!(cmd.command(), CommandType::Write);
        assert_eq!(cmd.protocol(), ProtocolType::Cbm);
        assert_eq!(cmd.flags(), ProtocolFlags::CBM_ATN);
        assert_eq!(cmd.len(), 0x1234);

        // IOCTL arguments aren't protocols
        let cmd = Command::new(&[IOCTL_IEC_WAIT, 0x02, 0x01, 0]).unwrap();
        assert_eq!(cmd.protocol(), ProtocolType::None);

        assert_eq!(Command::new(&[CMD_READ, 0x10, 0]), Err(CommandError::Length));
        assert_eq!(Command::new(&[0x42, 0x10, 0, 0]), Err(CommandError::Command));
        assert_eq!(Command::new(&[CMD_READ, 0xC0, 0, 0]), Err(CommandError::Protocol));
        assert_eq!(Command::new(&[CMD_READ, 0x00, 0, 0]), Err(CommandError::Protocol));
        assert_eq!(Command::new(&[CMD_WRITE, 0x14, 0, 0]), Err(CommandError::Flags));
        assert_eq!(Command::new(&[CMD_WRITE, 0x62, 0, 0]), Err(CommandError::Flags));
    }

    #[test]
    fn status_record_is_little_endian() {
        assert_eq!(Status::ready(0x0102).to_bytes(), [0x02, 0x02, 0x01]);
        assert_eq!(
            Status::error(ERROR_TAPE_CMD_IN_DISK_MODE as u16).to_bytes(),
            [0x03, 0x9A, 0xFF]
        );
    }

    #[test]
    fn echo_returns_request() {
        let mut handler = iec();
        let mut reply = [0; INIT_RESPONSE_LEN];
        assert_eq!(block_on(handler.handle_control(CTRL_ECHO, &mut reply)), Ok(1));
        assert_eq!(reply[0], CTRL_ECHO);
        assert_eq!(
            block_on(handler.handle_control(0x40, &mut reply)),
            Err(CommandError::Command)
        );
        assert_eq!(
            block_on(handler.handle_control(CTRL_ENTER_BOOTLOADER, &mut reply)),
            Err(CommandError::Command)
        );
    }

    #[test]
    fn init_binds_iec_and_reports_capabilities() {
        let mut handler = iec();
        assert_eq!(handler.bus(), None);
        let reply = init(&mut handler);
        assert_eq!(handler.bus(), Some(BusKind::Iec));
        assert_eq!(
            reply,
            [
                PROTOCOL_VERSION,
                CAP_CBM | CAP_NIB | CAP_NIB_SRQ | CAP_IEEE488 | CAP_TAP,
                0,
                0,
                0,
                0,
                0,
                0
            ]
        );
    }

    #[test]
    fn capabilities_follow_config() {
        let config = BusConfig {
            probe_ieee: false,
            probe_tape: false,
            ..BusConfig::default()
        };
        let handler: IecHandler = ProtocolHandler::new(
            SimBus::with_drive(SimDrive::new(8)),
            NotFitted,
            NotFitted,
            config,
        );
        assert_eq!(handler.capabilities(), CAPABILITIES_IEC);
    }

    #[test]
    fn init_without_drive_reports_no_device() {
        let mut handler: ProtocolHandler<_> =
            ProtocolHandler::new(SimBus::empty(), NotFitted, NotFitted, BusConfig::default());
        let reply = init(&mut handler);
        assert_eq!(reply[2], STATE_NO_DEVICE);
    }

    #[test]
    fn interrupted_sequence_resets_on_init() {
        let mut handler = iec();
        init(&mut handler);
        assert_eq!(handler.iec.hw.drive().resets(), 0);

        // No SHUTDOWN, so the next INIT resets the bus
        let reply = init(&mut handler);
        assert_eq!(reply[2], STATE_DOING_RESET);
        assert_eq!(handler.iec.hw.drive().resets(), 1);

        // ...and the host's own RESET is skipped
        let mut buf = [0; INIT_RESPONSE_LEN];
        block_on(handler.handle_control(CTRL_RESET, &mut buf)).unwrap();
        assert_eq!(handler.iec.hw.drive().resets(), 1);

        // Until another command has run
        ioctl(&mut handler, IOCTL_GET_EOI, 0, 0);
        block_on(handler.handle_control(CTRL_RESET, &mut buf)).unwrap();
        assert_eq!(handler.iec.hw.drive().resets(), 2);
    }

    #[test]
    fn shutdown_ends_sequence() {
        let mut handler = iec();
        init(&mut handler);
        let mut buf = [0; INIT_RESPONSE_LEN];
        assert_eq!(block_on(handler.handle_control(CTRL_SHUTDOWN, &mut buf)), Ok(0));
        let reply = init(&mut handler);
        assert_eq!(reply[2], 0);
        assert_eq!(handler.iec.hw.drive().resets(), 0);
    }

    #[test]
    fn cbm_write_returns_count() {
        let mut handler = iec();
        init(&mut handler);
        let mut host = HostMock::new(&[0x28, 0x6F]);
        let response = bulk(&mut handler, [CMD_WRITE, 0x12, 2, 0], &mut host);
        assert_eq!(response, BulkResponse::Status(Status::ready(2)));
        assert_eq!(handler.iec.hw.drive().atn_bytes(), &[0x28, 0x6F]);
    }

    #[test]
    fn failed_cbm_write_reports_zero() {
        let mut handler: ProtocolHandler<_> =
            ProtocolHandler::new(SimBus::empty(), NotFitted, NotFitted, BusConfig::default());
        init(&mut handler);
        let mut host = HostMock::new(&[0x28]);
        let response = bulk(&mut handler, [CMD_WRITE, 0x12, 1, 0], &mut host);
        assert_eq!(response, BulkResponse::Status(Status::ready(0)));
        assert!(handler.iec.hw.active().is_empty());
    }

    #[test]
    fn cbm_read_sends_data_without_status() {
        let mut handler = iec();
        init(&mut handler);
        handler.iec.hw.drive_mut().set_status(b"00, OK,00,00\r");

        let mut host = HostMock::new(&[0x48, 0x6F]);
        let response = bulk(&mut handler, [CMD_WRITE, 0x13, 2, 0], &mut host);
        assert_eq!(response, BulkResponse::Status(Status::ready(2)));

        let mut host = HostMock::new(&[]);
        let response = bulk(&mut handler, [CMD_READ, 0x10, 64, 0], &mut host);
        assert_eq!(response, BulkResponse::NoStatus);
        assert_eq!(host.sent(), b"00, OK,00,00\r");

        assert_eq!(
            ioctl(&mut handler, IOCTL_GET_EOI, 0, 0),
            BulkResponse::Status(Status::ready(1))
        );
        assert_eq!(ioctl(&mut handler, IOCTL_CLEAR_EOI, 0, 0), BulkResponse::NoStatus);
        assert_eq!(
            ioctl(&mut handler, IOCTL_GET_EOI, 0, 0),
            BulkResponse::Status(Status::ready(0))
        );
    }

    #[test]
    fn bulk_sends_status_record() {
        let mut handler = iec();
        init(&mut handler);
        let mut host = HostMock::new(&[0x28, 0x6F]);
        block_on(handler.bulk(&[CMD_WRITE, 0x12, 2, 0], &mut host)).unwrap();
        assert_eq!(host.sent(), &[STATUS_READY, 2, 0]);

        // Undecodable commands are dropped
        let mut host = HostMock::new(&[]);
        block_on(handler.bulk(&[0x42, 0, 0, 0], &mut host)).unwrap();
        assert!(host.sent().is_empty());
    }

    #[test]
    fn bulk_binds_without_init() {
        let mut handler = iec();
        assert_eq!(
            ioctl(&mut handler, IOCTL_IEC_POLL, 0, 0),
            BulkResponse::Status(Status::ready(0))
        );
        assert_eq!(handler.bus(), Some(BusKind::Iec));
    }

    #[test]
    fn poll_setrelease_and_wait() {
        let mut handler: ProtocolHandler<_> =
            ProtocolHandler::new(SimBus::empty(), NotFitted, NotFitted, BusConfig::default());
        init(&mut handler);
        assert_eq!(ioctl(&mut handler, IOCTL_IEC_SETRELEASE, 0x04, 0), BulkResponse::NoStatus);
        assert!(handler.iec.hw.get(Lines::ATN));
        assert_eq!(
            ioctl(&mut handler, IOCTL_IEC_POLL, 0, 0),
            BulkResponse::Status(Status::ready(0x04))
        );

        // Already satisfied, so the wait falls through to a poll
        assert_eq!(
            ioctl(&mut handler, IOCTL_IEC_WAIT, 0x04, 1),
            BulkResponse::Status(Status::ready(0x04))
        );

        ioctl(&mut handler, IOCTL_IEC_SETRELEASE, 0, 0x04);
        handler.iec.hw.abort();
        assert_eq!(ioctl(&mut handler, IOCTL_IEC_WAIT, 0x04, 1), BulkResponse::NoStatus);
    }

    #[test]
    fn tape_commands_refused_in_disk_mode() {
        let mut handler = iec();
        init(&mut handler);
        let refused = BulkResponse::Status(Status::error(ERROR_TAPE_CMD_IN_DISK_MODE as u16));
        assert_eq!(ioctl(&mut handler, IOCTL_TAP_MOTOR_ON, 0, 0), refused);
        assert_eq!(ioctl(&mut handler, IOCTL_TAP_GET_VER, 0, 0), refused);

        let mut host = HostMock::new(&[0; 10]);
        assert_eq!(bulk(&mut handler, [CMD_WRITE, 0xA0, 10, 0], &mut host), refused);
        assert_eq!(host.unread(), 0);
    }

    fn ieee() -> ProtocolHandler<SimBus<crate::test::Idle>, SimIeee> {
        ProtocolHandler::new(
            SimBus::empty(),
            SimIeee::with_drive(IeeeDrive::new(8)),
            NotFitted,
            BusConfig::default(),
        )
    }

    #[test]
    fn init_binds_ieee_when_present() {
        let mut handler = ieee();
        let reply = init(&mut handler);
        assert_eq!(handler.bus(), Some(BusKind::Ieee488));
        assert_eq!(reply[2], STATE_IEEE488_PRESENT);
    }

    #[test]
    fn ieee_forces_cbm_and_refuses_port_access() {
        let mut handler = ieee();
        init(&mut handler);

        let mut host = HostMock::new(&[0x28, 0x6F]);
        let response = bulk(&mut handler, [CMD_WRITE, 0x12, 2, 0], &mut host);
        assert_eq!(response, BulkResponse::Status(Status::ready(2)));
        assert_eq!(handler.ieee.hw.drive().commands(), &[0x28, 0x6F]);

        // Asked for S1, gets CBM, with a status.  The last byte waits for
        // EOI.
        let mut host = HostMock::new(&[0x41, 0x42]);
        let response = bulk(&mut handler, [CMD_WRITE, 0x20, 2, 0], &mut host);
        assert_eq!(response, BulkResponse::Status(Status::ready(2)));
        assert_eq!(handler.ieee.hw.drive().data(), &[0x41]);

        assert_eq!(ioctl(&mut handler, IOCTL_PP_READ, 0, 0), BulkResponse::Error);
        assert_eq!(ioctl(&mut handler, IOCTL_PARBURST_READ, 0, 0), BulkResponse::Error);
        assert_eq!(ioctl(&mut handler, IOCTL_PP_WRITE, 0x55, 0), BulkResponse::NoStatus);

        // The bulk wrapper turns the failure into an error record
        let mut host = HostMock::new(&[]);
        block_on(handler.bulk(&[IOCTL_SRQBURST_READ, 0, 0, 0], &mut host)).unwrap();
        assert_eq!(host.sent(), &[STATUS_ERROR, 0, 0]);
    }

    #[test]
    fn ieee_wait_always_succeeds() {
        let mut handler = ieee();
        init(&mut handler);
        assert!(matches!(
            ioctl(&mut handler, IOCTL_IEC_WAIT, 0x04, 1),
            BulkResponse::Status(_)
        ));
    }

    fn tape() -> ProtocolHandler<SimBus<crate::test::Idle>, NotFitted, SimDeck> {
        ProtocolHandler::new(SimBus::empty(), NotFitted, SimDeck::new(), BusConfig::default())
    }

    #[test]
    fn init_binds_tape_first() {
        let mut handler = tape();
        let reply = init(&mut handler);
        assert_eq!(handler.bus(), Some(BusKind::Tape));
        assert_eq!(reply[2], STATE_TAPE_PRESENT);
    }

    #[test]
    fn tape_not_probed_when_disabled() {
        let config = BusConfig {
            probe_tape: false,
            ..BusConfig::default()
        };
        let mut handler: ProtocolHandler<_, NotFitted, SimDeck> = ProtocolHandler::new(
            SimBus::with_drive(SimDrive::new(8)),
            NotFitted,
            SimDeck::new(),
            config,
        );
        init(&mut handler);
        assert_eq!(handler.bus(), Some(BusKind::Iec));
    }

    #[test]
    fn tape_ioctls_report_tape_status() {
        let mut handler = tape();
        init(&mut handler);
        assert_eq!(
            ioctl(&mut handler, IOCTL_TAP_GET_VER, 0, 0),
            BulkResponse::Status(Status::ready(TAPE_FIRMWARE_VERSION))
        );
        assert_eq!(
            ioctl(&mut handler, IOCTL_TAP_GET_SENSE, 0, 0),
            BulkResponse::Status(Status::ready(TapeStatus::DeviceNotConfigured as u16))
        );
        assert_eq!(
            ioctl(&mut handler, IOCTL_TAP_PREPARE_CAPTURE, 0, 0),
            BulkResponse::Status(Status::ready(TapeStatus::ConfiguredForRead as u16))
        );
        assert!(handler.tape.deck().motor());
        assert_eq!(
            ioctl(&mut handler, IOCTL_TAP_MOTOR_OFF, 0, 0),
            BulkResponse::Status(Status::ready(TapeStatus::MotorOff as u16))
        );
        assert!(!handler.tape.deck().motor());
    }

    #[test]
    fn tape_capture_over_bulk() {
        let mut handler = tape();
        init(&mut handler);
        ioctl(&mut handler, IOCTL_TAP_PREPARE_CAPTURE, 0, 0);
        handler.tape.deck_mut().press_play();
        handler.tape.deck_mut().queue_edges(&[0x0100, 0x9000]);

        let mut host = HostMock::new(&[]);
        let response = bulk(&mut handler, [CMD_READ, 0xA0, 0xFF, 0xFF], &mut host);
        assert_eq!(
            response,
            BulkResponse::Status(Status::ready(TapeStatus::CaptureFinished as u16))
        );
        assert_eq!(host.sent(), &[0x01, 0x00, 0x80, 0x00, 0x00, 0x90, 0x00]);
    }

    #[test]
    fn disk_commands_refused_in_tape_mode() {
        let mut handler = tape();
        init(&mut handler);
        let refused = BulkResponse::Status(Status::error(ERROR_DISK_CMD_IN_TAPE_MODE as u16));
        assert_eq!(ioctl(&mut handler, IOCTL_PP_READ, 0, 0), refused);

        let mut host = HostMock::new(&[0x28]);
        assert_eq!(bulk(&mut handler, [CMD_WRITE, 0x12, 1, 0], &mut host), refused);
        assert_eq!(host.unread(), 0);

        let mut host = HostMock::new(&[]);
        assert_eq!(bulk(&mut handler, [CMD_READ, 0x10, 1, 0], &mut host), BulkResponse::NoStatus);
        assert!(host.sent().is_empty());
    }

    #[test]
    fn tap_break_stops_tape() {
        let mut handler = tape();
        init(&mut handler);
        ioctl(&mut handler, IOCTL_TAP_PREPARE_CAPTURE, 0, 0);
        let mut buf = [0; INIT_RESPONSE_LEN];
        block_on(handler.handle_control(CTRL_TAP_BREAK, &mut buf)).unwrap();
        assert!(!handler.tape.deck().motor());

        // A sense wait ends at once until the next prepare
        assert_eq!(
            ioctl(&mut handler, IOCTL_TAP_WAIT_FOR_PLAY_SENSE, 0, 0),
            BulkResponse::Status(Status::ready(TapeStatus::DeviceNotConfigured as u16))
        );
    }
}

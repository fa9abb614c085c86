//! Contains constants shared across the crate: the host command protocol,
//! capability and state bits, and the IEC wire command bytes.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

//
// Host protocol
//

/// Protocol version reported in response to INIT.  This is the xum1541
/// protocol revision the host software expects.
pub const PROTOCOL_VERSION: u8 = 7;

/// Bulk command opcodes.  The IOCTLs are numbered from 20.
pub const CMD_READ: u8 = 8;
pub const CMD_WRITE: u8 = 9;
pub const IOCTL_GET_EOI: u8 = 23;
pub const IOCTL_CLEAR_EOI: u8 = 24;
pub const IOCTL_PP_READ: u8 = 25;
pub const IOCTL_PP_WRITE: u8 = 26;
pub const IOCTL_IEC_POLL: u8 = 27;
pub const IOCTL_IEC_WAIT: u8 = 28;
pub const IOCTL_IEC_SETRELEASE: u8 = 29;
pub const IOCTL_PARBURST_READ: u8 = 30;
pub const IOCTL_PARBURST_WRITE: u8 = 31;
pub const IOCTL_SRQBURST_READ: u8 = 32;
pub const IOCTL_SRQBURST_WRITE: u8 = 33;
pub const IOCTL_TAP_MOTOR_ON: u8 = 66;
pub const IOCTL_TAP_GET_VER: u8 = 67;
pub const IOCTL_TAP_PREPARE_CAPTURE: u8 = 68;
pub const IOCTL_TAP_PREPARE_WRITE: u8 = 69;
pub const IOCTL_TAP_GET_SENSE: u8 = 70;
pub const IOCTL_TAP_WAIT_FOR_STOP_SENSE: u8 = 71;
pub const IOCTL_TAP_WAIT_FOR_PLAY_SENSE: u8 = 72;
pub const IOCTL_TAP_MOTOR_OFF: u8 = 73;

/// Control requests.
pub const CTRL_ECHO: u8 = 0;
pub const CTRL_INIT: u8 = 1;
pub const CTRL_RESET: u8 = 2;
pub const CTRL_SHUTDOWN: u8 = 3;
pub const CTRL_ENTER_BOOTLOADER: u8 = 4;
pub const CTRL_TAP_BREAK: u8 = 5;

/// Status record codes.
pub const STATUS_BUSY: u8 = 1;
pub const STATUS_READY: u8 = 2;
pub const STATUS_ERROR: u8 = 3;

/// Device state bits, reported in response to INIT.
pub const STATE_DOING_RESET: u8 = 0x01;
pub const STATE_NO_DEVICE: u8 = 0x02;
pub const STATE_IEEE488_PRESENT: u8 = 0x10;
pub const STATE_TAPE_PRESENT: u8 = 0x20;

/// Set while the host has a command sequence open.  Never reported.
pub const STATE_CMD_IN_PROGRESS: u8 = 0x80;

/// Size of a command record received from the host.
pub const COMMAND_LEN: usize = 4;

/// Size of a status record returned to the host.
pub const STATUS_LEN: usize = 3;

/// Size of the response to the INIT control request.
pub const INIT_RESPONSE_LEN: usize = 8;

/// Size of the response to the ECHO control request.
pub const ECHO_RESPONSE_LEN: usize = 8;

/// Maximum number of bytes transferred by a single READ or WRITE.
pub const MAX_XFER_SIZE: u16 = 32768;

/// Size of the chunks data is passed to and from the host channel in.  This
/// is one full-speed USB bulk packet.
pub const HOST_CHUNK_SIZE: usize = 64;

/// Capability bits reported in response to INIT.
pub const CAP_CBM: u8 = 0x01;
pub const CAP_NIB: u8 = 0x02;
pub const CAP_NIB_SRQ: u8 = 0x04;
pub const CAP_IEEE488: u8 = 0x08;
pub const CAP_TAP: u8 = 0x10;

/// Capabilities of the IEC bus, which every adapter has.
pub const CAPABILITIES_IEC: u8 = CAP_CBM | CAP_NIB | CAP_NIB_SRQ;

/// Legacy error codes the host library uses to explain why a tape or disk
/// command was refused.  Reported as the (two's complement) status value.
pub const ERROR_NO_TAPE_SUPPORT: i16 = -100;
pub const ERROR_NO_DISK_TAPE_MODE: i16 = -101;
pub const ERROR_TAPE_CMD_IN_DISK_MODE: i16 = -102;
pub const ERROR_DISK_CMD_IN_TAPE_MODE: i16 = -103;

/// Length bit of a NIB READ requesting the read stops at the first 0x55.
pub const NIB_EARLY_EXIT_BIT: u16 = 0x8000;

/// Byte which terminates a NIB read early, when requested.
pub const NIB_EARLY_EXIT_BYTE: u8 = 0x55;

/// Byte returned by a checked burst read while command bytes are being
/// suppressed.
pub const NIB_SUPPRESSED_READ: u8 = 0x88;

//
// IEC wire command bytes, sent under ATN
//

pub const IEC_LISTEN: u8 = 0x20;
pub const IEC_TALK: u8 = 0x40;
pub const IEC_SECONDARY: u8 = 0x60;
pub const IEC_CLOSE: u8 = 0xE0;
pub const IEC_OPEN: u8 = 0xF0;
pub const IEC_UNLISTEN: u8 = 0x3F;
pub const IEC_UNTALK: u8 = 0x5F;

/// Device and secondary addresses are 5 bits on the wire.
pub const IEC_ADDRESS_MASK: u8 = 0x1F;

//
// 153x tape
//

/// Version reported by TAP_GET_VER.
pub const TAPE_FIRMWARE_VERSION: u16 = 0x0001;

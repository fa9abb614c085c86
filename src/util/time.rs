//! This file implements the timing abstraction and the wire timing constants
//! used by the bus drivers.
//!
//! The drivers have two choices for a delay:
//! * Clock::block_*() - busy-waits for the duration indicated.  This is used
//!   where timing is critical, such as within a byte.
//! * Clock::yield_*() - cooperatively yields for at least the duration
//!   indicated.  Because something else may be scheduled during the yield,
//!   the pause may be longer than requested.
//!
//! Sub-microsecond delays go through block_ns(), as an embassy-time tick is
//! usually 1us.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

/// Time source and delay provider for the bus drivers.  On hardware this is
/// typically a thin wrapper around embassy-time and a cycle-counting busy
/// loop.  Under test, the simulated bus implements it with virtual time.
#[allow(async_fn_in_trait)]
pub trait Clock {
    /// The current time.
    fn now(&self) -> Instant;

    /// Block for (at least) the given number of nanoseconds.
    fn block_ns(&mut self, ns: u32);

    /// Block for (at least) the given number of microseconds.
    fn block_us(&mut self, us: u64);

    /// A single iteration of a busy-wait poll loop.  Implementations may
    /// do nothing, or burn a handful of cycles.
    fn spin(&mut self);

    /// Yield to other tasks for at least the given number of microseconds.
    async fn yield_us(&mut self, us: u64);

    /// Yield for a specific Duration.
    async fn yield_for(&mut self, duration: Duration) {
        self.yield_us(duration.as_micros()).await;
    }
}

/// Macro to briefly delay in order to let the bus lines settle.
macro_rules! iec_delay {
    ($clock:expr) => {
        $clock.block_us(crate::util::time::iec::IEC_DELAY_US)
    };
}
pub(crate) use iec_delay;

pub mod iec {
    //! IEC protocol timers

    use embassy_time::Duration;

    /// Yield timeout for bus free check - how long to wait before checking
    /// again the loop.
    pub const BUS_FREE_CHECK_YIELD: Duration = Duration::from_millis(1);

    /// Total time to wait for the bus to be free, unless we're waiting
    /// forever.
    pub const BUS_FREE_TIMEOUT: Duration = Duration::from_millis(1500);

    /// How long RESET is held.  30ms is enough for most drives, but not all.
    pub const RESET_HOLD: Duration = Duration::from_millis(100);

    /// Time to wait between checks for a device to release DATA, after being
    /// told to LISTEN.
    pub const LISTENER_WAIT_INTERVAL: Duration = Duration::from_micros(1);

    /// Time to wait for CLK to be pulled down by the drive after telling it
    /// to enter TALK.
    pub const WRITE_TALK_CLK_TIMEOUT: Duration = Duration::from_secs(1);

    /// Time to wait for CLK to be released at the beginning on the main CBM
    /// protocol read loop, before reading a byte.
    pub const READ_CLK_START_TIMEOUT: Duration = Duration::from_secs(1);

    /// Poll interval while waiting for the talker to release CLK.
    pub const READ_CLK_START_POLL: Duration = Duration::from_micros(20);

    /// Number of polls, and the interval between them, while waiting for
    /// the talker to pull CLK after we release DATA.  If it doesn't within
    /// this window (400us) it is signalling EOI.
    pub const READ_EOI_POLLS: u32 = 200;
    pub const READ_EOI_POLL_US: u64 = 2;

    /// How long DATA is held to acknowledge EOI.
    pub const EOI_ACK_HOLD_US: u64 = 70;

    /// Pause after acknowledging a received byte.
    pub const READ_BYTE_GAP_US: u64 = 50;

    /// The bounded "2ms" wait is 200 polls at this interval.
    pub const WAIT_2MS_POLLS: u32 = 200;
    pub const WAIT_2MS_POLL_US: u64 = 10;

    /// Poll interval for the host's IEC_WAIT command.
    pub const IEC_WAIT_POLL: Duration = Duration::from_micros(10);

    /// Settle time after releasing the lines at init.
    pub const INIT_SETTLE_US: u64 = 10;

    /// Brief settle time after changing a line.
    pub const IEC_DELAY_US: u64 = 2;

    /// Settle time when testing the cable with all lines released.
    pub const CABLE_TEST_SETTLE_US: u64 = 1000;

    /// A "forever" timeout.  We can't use Duration::MAX, as that's a u64, and
    /// would overflow when added to an Instant.  So we set it to a year
    /// (ish).
    pub const FOREVER_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

    // A set of low-level IEC bus timings, taken from xum1541.  All are in us.

    /// Typical non-EOI response to RFD time
    pub const IEC_T_NE: u64 = 40;

    /// Min talker bit setup time (70 typical)
    pub const IEC_T_S: u64 = 20;

    /// Extra setup time on top of IEC_T_S - a 1541 doesn't reliably see
    /// bits with less than ~72us of setup.
    pub const IEC_T_S_PAD: u64 = 55;

    /// Min data valid time (20 typical)
    pub const IEC_T_V: u64 = 20;

    /// Min frame to release of ATN time
    pub const IEC_T_R: u64 = 20;

    /// Min time between bytes
    pub const IEC_T_BB: u64 = 100;

    /// Talk-attention release time, in ns.  xum1541 calls _delay_us(-1)
    /// here, which is undefined, so we pick a short delay.
    pub const IEC_T_TK_NS: u32 = 500;
}

pub mod nib {
    //! Parallel nibbler burst and alternate protocol timers

    use embassy_time::Duration;

    /// Settle time before a track transfer begins - 5ms is too short.
    pub const TRACK_START_DELAY: Duration = Duration::from_millis(10);

    /// Hold after setting ATN before polling DATA during a burst handshake.
    pub const PARBURST_ATN_HOLD_US: u64 = 5;

    /// Delay between the drive releasing DATA and sampling the port.
    pub const PARBURST_SAMPLE_US: u64 = 1;

    /// Time parallel data is held valid after a burst write.  5us always
    /// fails but 10us works.
    pub const PARBURST_WRITE_HOLD_US: u64 = 10;

    /// Poll interval for the alternate protocol handshakes, which are
    /// unbounded but cancellable.
    pub const HANDSHAKE_POLL: Duration = Duration::from_micros(1);

    /// Parallel port settle time, in ns.
    pub const PP_SETTLE_NS: u32 = 500;

    /// Per-byte timeout for the handshaked transfers.  Generous, to allow
    /// for slow custom drive code.
    pub const BYTE_TIMEOUT: Duration = Duration::from_millis(3300);
}

pub mod srq {
    //! SRQ fast serial timers.  nibtools relies on these - do not change.

    /// Time SRQ is asserted for, per bit, when writing.
    pub const BIT_ASSERT_NS: u32 = 300;

    /// Time after releasing SRQ before the next bit, when writing.
    pub const BIT_SETTLE_NS: u32 = 935;

    /// Delay after SRQ is released before sampling DATA, when reading.
    pub const READ_SAMPLE_NS: u32 = 375;

    /// Hold after setting ATN at the start of an SRQ burst read, in us.
    pub const SRQBURST_READ_HOLD_US: u64 = 1;

    /// Hold after setting ATN at the start of an SRQ burst write, in us.
    pub const SRQBURST_WRITE_HOLD_US: u64 = 5;

    /// Number of polls for CLK to toggle during a handshaked SRQ write.
    pub const WRITE_HANDSHAKE_POLLS: u32 = 100;
}

pub mod ieee {
    //! IEEE-488 timers

    use embassy_time::Duration;

    /// Settle time after asserting or releasing ATN.
    pub const ATN_DELAY_US: u64 = 90;

    /// Per-byte handshake timeout.
    pub const BYTE_TIMEOUT: Duration = Duration::from_millis(65);

    /// Poll interval for the timed handshake waits.
    pub const HANDSHAKE_POLL_US: u64 = 10;

    /// Max time to wait for a talker to release DAV before taking ATN.
    pub const ATN_DAV_TIMEOUT: Duration = Duration::from_millis(255);

    /// Number of handshake timeouts tolerated per byte in a raw read.
    pub const READ_RETRIES: u32 = 20;

    /// How long IFC is held for on reset.
    pub const IFC_HOLD: Duration = Duration::from_millis(50);

    /// Data setup time before asserting DAV.
    pub const DATA_SETUP_US: u64 = 5;

    /// Settle time used by the presence probe.
    pub const DETECT_SETTLE_US: u64 = 100;
}

pub mod tape {
    //! 153x tape timers

    use embassy_time::Duration;

    /// Poll interval for the cancellable sense waits.
    pub const SENSE_POLL: Duration = Duration::from_millis(1);

    /// Settle time before a capture, write or config transfer starts.
    pub const IO_SETTLE: Duration = Duration::from_millis(10);

    /// Extra wait before a capture, to let the SENSE line stop bouncing.
    pub const SENSE_SETTLE: Duration = Duration::from_millis(30);
}

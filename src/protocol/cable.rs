//! This file implements cable detection and verification.
//!
//! The cable type (passive XM1541, active/inverting XA1541, or the XE1541
//! variant with RESET wired to follow ATN) is either set by the user or
//! detected from the ATN output and input levels.  The first time a cable
//! is seen it is tested, by checking the lines follow what we drive, and
//! the result cached in the [`BusSession`] until a different cable is
//! detected or a transfer fails.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::iec::IecDriver;
use super::session::{BusSession, CableState};
use crate::driver::BusError;
use crate::infra::lines::{IecHardware, Lines};
use crate::types::CableType;
use crate::util::time::iec::CABLE_TEST_SETTLE_US;
use crate::util::time::iec_delay;

// XE1541 shares its ATN polarity with the XM1541, so they can't be told
// apart by polarity alone
fn polarity(cable: CableType) -> CableType {
    match cable {
        CableType::Xe1541 => CableType::Xm1541,
        other => other,
    }
}

impl<H: IecHardware> IecDriver<H> {
    /// Work out the cable type from the ATN output and input levels.  An
    /// inverting cable reads back the opposite of what we drive.
    pub fn detect_cable(&self) -> CableType {
        let (out, input) = self.hw.raw_atn();
        if out != input {
            CableType::Xa1541
        } else {
            CableType::Xm1541
        }
    }

    /// Check the lines behave as the given cable should.  Returns the
    /// cable found, which is XE1541 if RESET follows ATN.
    pub fn test_cable(
        &mut self,
        session: &BusSession,
        cable: CableType,
    ) -> Result<CableType, BusError> {
        // If a line is set by us, it must read back as set too
        let driven = self.hw.driven() & Lines::PRIMARY;
        if self.hw.active() & driven != driven {
            info!("Cable: driven lines {:?} do not follow", driven);
            return Err(BusError::Io);
        }

        // Don't disturb a device we're holding the bus for
        if session.do_not_release_bus() {
            debug!("Cable: bus held, skipping extra tests");
            return Ok(cable);
        }

        // Release all lines, and check they all read released
        self.hw.release(Lines::PRIMARY);
        self.hw.block_us(CABLE_TEST_SETTLE_US);
        let stuck = self.hw.active() & Lines::PRIMARY;
        if !stuck.is_empty() {
            info!("Cable: lines {:?} set, but they should not be", stuck);
            return Err(BusError::Io);
        }

        // Set ATN.  With an XE1541, RESET follows it.
        self.hw.set(Lines::ATN);
        iec_delay!(self.hw);
        let found = if self.hw.get(Lines::RESET) {
            info!("Cable: RESET reacts to ATN, so XE1541");
            CableType::Xe1541
        } else {
            if !self.hw.get(Lines::DATA) {
                debug!("Cable: DATA does not react to ATN");
            }
            cable
        };
        self.hw.release(Lines::ATN);

        Ok(found)
    }

    /// Make sure the cable is known and working before a transfer.
    pub fn check_cable(&mut self, session: &mut BusSession) -> Result<(), BusError> {
        let previous = session.cable();

        let (cable, state) = match session.cable_override() {
            Some(cable) => (cable, CableState::Tested),
            None => (self.detect_cable(), CableState::Unknown),
        };

        // A cable of different polarity to the one we had means it's been
        // swapped, and everything we knew is void
        let mismatch =
            previous != CableType::Unknown && polarity(previous) != polarity(cable);
        if mismatch {
            info!("Cable: was {}, now {}", previous, cable);
            session.set_cable_state(CableState::Unknown);
            session.set_do_not_release_bus(false);
        }

        // A user override is taken as tested
        if state == CableState::Tested && session.cable_state() < CableState::Tested {
            session.set_cable(cable);
            session.set_cable_state(CableState::Tested);
            self.hw.configure_cable(cable);
        }

        if session.cable_state() >= CableState::Tested {
            return if session.cable() == CableType::Xe1541 {
                Err(BusError::UnsupportedCable)
            } else {
                Ok(())
            };
        }

        // Detection can't tell an XE1541 from an XM1541, so we keep what the
        // test found before if the polarity still agrees
        let cable = if !mismatch && previous == CableType::Xe1541 {
            previous
        } else {
            cable
        };
        self.hw.configure_cable(cable);

        match self.test_cable(session, cable) {
            Ok(found) => {
                session.set_cable(found);
                session.set_cable_state(CableState::Tested);
                if found != cable {
                    self.hw.configure_cable(found);
                }
                if found == CableType::Xe1541 {
                    warn!("Cable: XE1541 is not supported");
                    Err(BusError::UnsupportedCable)
                } else {
                    info!("Cable: using {}", found);
                    Ok(())
                }
            }
            Err(e) => {
                info!("Cable: could not validate {}", cable);
                session.set_cable(cable);
                session.set_cable_state(CableState::ErrorOccurred);
                if mismatch {
                    Err(BusError::CableMismatch)
                } else {
                    Err(e)
                }
            }
        }
    }
}

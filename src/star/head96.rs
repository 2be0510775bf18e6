// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! CoRe 96 head operations.
//!
//! The head moves as one unit and is addressed by its A1 position. Its
//! drives use their own unit conventions: the Z drive counts 0.005 mm
//! increments, the Y drive 0.015625 mm, the dispense drive 0.019 µL.
//! Channel involvement is a 96-bit pattern sent as 24 uppercase hex
//! characters with A1 at the least significant bit.

use crate::codec::{tenths, Command};
use crate::constant::{
    HEAD96_UL_PER_INCREMENT, HEAD96_Y_MM_PER_INCREMENT, HEAD96_Y_SPEED_CURRENT,
    HEAD96_Y_SPEED_LEGACY, HEAD96_Z_MM_PER_INCREMENT,
};
use crate::error::Error;
use crate::liquid::{DispenseMode, LiquidClass};
use crate::resources::{Container, Coordinate, DeckResource, Tip};
use crate::safety::check_head96_position;
use crate::transport::Transport;

use super::Star;

/// Z drive increments for a deck-space mm value.
pub fn z_increments(mm: f64) -> i64 {
    (mm / HEAD96_Z_MM_PER_INCREMENT).round() as i64
}

/// Y drive increments for a deck-space mm value.
pub fn y_increments(mm: f64) -> i64 {
    (mm / HEAD96_Y_MM_PER_INCREMENT).round() as i64
}

/// Dispense drive increments for a µL value.
pub fn volume_increments(ul: f64) -> i64 {
    (ul / HEAD96_UL_PER_INCREMENT).round() as i64
}

/// 96-bit channel pattern as 24 hex characters, A1 at the LSB.
pub fn channel_mask(pattern: &[bool; 96]) -> String {
    let mut mask = String::with_capacity(24);
    for nibble in (0..24).rev() {
        let mut value = 0u8;
        for bit in 0..4 {
            if pattern[nibble * 4 + bit] {
                value |= 1 << bit;
            }
        }
        mask.push(std::char::from_digit(value as u32, 16).expect("nibble < 16"));
    }
    mask.to_ascii_uppercase()
}

pub const ALL_CHANNELS: [bool; 96] = [true; 96];

/// Read the head firmware date and pick the Y speed envelope. Heads
/// flashed before 2021 top out at 390.625 mm/s, newer ones at 625 mm/s.
pub(crate) fn query_speed_envelope<T: Transport>(star: &mut Star<T>) -> Result<f64, Error> {
    let reply = star.send(&Command::new("H0", "EV"), "ev########")?;
    let date = reply.int("ev")?;
    let year = date / 10_000;
    Ok(if year >= 2021 {
        HEAD96_Y_SPEED_CURRENT
    } else {
        HEAD96_Y_SPEED_LEGACY
    })
}

impl<T: Transport> Star<T> {
    fn require_head96(&self) -> Result<(), Error> {
        if !self.core96_installed {
            return Err(Error::State("no 96 head installed".to_string()));
        }
        Ok(())
    }

    /// Maximum Y speed of the installed head, mm/s.
    pub fn head96_max_y_speed(&self) -> f64 {
        self.head96_max_y_speed
    }

    pub fn head96_has_tips(&self) -> bool {
        self.head96_tip.has_tip()
    }

    /// Volume held per tip of the head, µL.
    pub fn head96_tip_volume(&self) -> f64 {
        self.head96_volume.volume()
    }

    /// Pick up a full rack of tips with the head. `a1` is the center of
    /// the rack's A1 spot.
    pub fn head96_pick_up_tips(
        &mut self,
        a1: Coordinate,
        tip: &Tip,
        pattern: &[bool; 96],
    ) -> Result<(), Error> {
        self.require_head96()?;
        self.ensure_iswap_parked()?;
        check_head96_position(a1.x, a1.y, a1.z)?;

        self.head96_tip.add_tip(tip.clone())?;

        // a1's z reports the collar top, same as a channel tip spot
        let begin = a1.z + tip.tip_size.engagement_correction();
        let end = begin - crate::constant::TIP_PICKUP_STROKE;
        let cmd = Command::new("H0", "EP")
            .string("hm", &channel_mask(pattern))
            .int("xs", tenths(a1.x), 5)
            .int("yh", y_increments(a1.y), 6)
            .int("tb", z_increments(begin), 6)
            .int("te", z_increments(end), 6);
        match self.send(&cmd, "") {
            Ok(_) => {
                self.head96_tip.commit();
                self.head96_volume =
                    crate::tracker::VolumeTracker::new("96 head", tip.maximal_volume);
                Ok(())
            }
            Err(e) => {
                self.head96_tip.rollback();
                Err(e)
            }
        }
    }

    /// Eject the head's tips at the given A1 position (a rack or the
    /// trash chute).
    pub fn head96_discard_tips(&mut self, a1: Coordinate) -> Result<(), Error> {
        self.require_head96()?;
        self.ensure_iswap_parked()?;
        check_head96_position(a1.x, a1.y, a1.z)?;

        self.head96_tip.remove_tip()?;

        let cmd = Command::new("H0", "ER")
            .int("xs", tenths(a1.x), 5)
            .int("yh", y_increments(a1.y), 6)
            .int("zh", z_increments(a1.z), 6);
        match self.send(&cmd, "") {
            Ok(_) => {
                self.head96_tip.commit();
                self.head96_volume = crate::tracker::VolumeTracker::new("96 head", 0.0);
                Ok(())
            }
            Err(e) => {
                self.head96_tip.rollback();
                Err(e)
            }
        }
    }

    /// Aspirate the same volume through every involved channel of the
    /// head. `container` is the well under A1 (or a reservoir).
    pub fn head96_aspirate(
        &mut self,
        container: &Container,
        volume: f64,
        class: &LiquidClass,
        pattern: &[bool; 96],
    ) -> Result<(), Error> {
        self.require_head96()?;
        self.ensure_iswap_parked()?;

        let tip = self
            .head96_tip
            .tip()
            .cloned()
            .ok_or_else(|| Error::NoTip("96 head".to_string()))?;
        let a1 = container.center();
        let surface = container.bottom_z() + 1.0;
        check_head96_position(a1.x, a1.y, surface + tip.total_tip_length)?;

        let involved = pattern.iter().filter(|b| **b).count() as f64;
        container.tracker_mut().remove(volume * involved)?;
        if let Err(e) = self.head96_volume.add(volume) {
            container.tracker_mut().rollback();
            return Err(e);
        }

        let corrected = if self.disable_volume_correction {
            volume
        } else {
            class.correct_volume(volume)
        };
        let cmd = Command::new("H0", "EA")
            .string("hm", &channel_mask(pattern))
            .int("xs", tenths(a1.x), 5)
            .int("yh", y_increments(a1.y), 6)
            .int("zh", z_increments(surface), 6)
            .int("af", volume_increments(class.aspiration_flow_rate), 5)
            .int("aa", volume_increments(corrected), 6);
        match self.send(&cmd, "") {
            Ok(_) => {
                container.tracker_mut().commit();
                self.head96_volume.commit();
                Ok(())
            }
            Err(e) => {
                container.tracker_mut().rollback();
                self.head96_volume.rollback();
                Err(e)
            }
        }
    }

    /// Dispense through every involved channel of the head.
    pub fn head96_dispense(
        &mut self,
        container: &Container,
        volume: f64,
        class: &LiquidClass,
        mode: DispenseMode,
        pattern: &[bool; 96],
    ) -> Result<(), Error> {
        self.require_head96()?;
        self.ensure_iswap_parked()?;

        let tip = self
            .head96_tip
            .tip()
            .cloned()
            .ok_or_else(|| Error::NoTip("96 head".to_string()))?;
        let a1 = container.center();
        let surface = container.bottom_z() + 1.0;
        check_head96_position(a1.x, a1.y, surface + tip.total_tip_length)?;

        let involved = pattern.iter().filter(|b| **b).count() as f64;
        self.head96_volume.remove(volume)?;
        if let Err(e) = container.tracker_mut().add(volume * involved) {
            self.head96_volume.rollback();
            return Err(e);
        }

        let corrected = if self.disable_volume_correction {
            volume
        } else {
            class.correct_volume(volume)
        };
        let cmd = Command::new("H0", "ED")
            .string("hm", &channel_mask(pattern))
            .int("xs", tenths(a1.x), 5)
            .int("yh", y_increments(a1.y), 6)
            .int("zh", z_increments(surface), 6)
            .int("dm", mode.code() as i64, 1)
            .int("df", volume_increments(class.dispense_flow_rate), 5)
            .int("da", volume_increments(corrected), 6);
        match self.send(&cmd, "") {
            Ok(_) => {
                container.tracker_mut().commit();
                self.head96_volume.commit();
                Ok(())
            }
            Err(e) => {
                container.tracker_mut().rollback();
                self.head96_volume.rollback();
                Err(e)
            }
        }
    }

    /// Move the head's A1 to an absolute deck position. Not retried.
    pub fn head96_move_to(&mut self, position: Coordinate, y_speed: f64) -> Result<(), Error> {
        self.require_head96()?;
        self.ensure_iswap_parked()?;
        check_head96_position(position.x, position.y, position.z)?;

        let capped = y_speed.min(self.head96_max_y_speed);
        let cmd = Command::new("H0", "EM")
            .int("xs", tenths(position.x), 5)
            .int("yh", y_increments(position.y), 6)
            .int("zh", z_increments(position.z), 6)
            .int("yv", y_increments(capped), 6);
        self.send_with_retry(&cmd, "", false).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::star_with;
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert_eq!(z_increments(180.5), 36_100);
        assert_eq!(y_increments(108.0), 6_912);
        assert_eq!(volume_increments(95.0), 5_000);
    }

    #[test]
    fn test_channel_mask_a1_is_lsb() {
        let mut pattern = [false; 96];
        pattern[0] = true;
        assert_eq!(channel_mask(&pattern), "000000000000000000000001");

        pattern[0] = false;
        pattern[95] = true;
        assert_eq!(channel_mask(&pattern), "800000000000000000000000");

        assert_eq!(channel_mask(&ALL_CHANNELS), "FFFFFFFFFFFFFFFFFFFFFFFF");
    }

    #[test]
    fn test_head_box_violations_all_reported() {
        let mut star = star_with(&[]);
        let err = star
            .head96_move_to(Coordinate::new(1000.0, 50.0, 100.0), 300.0)
            .unwrap_err();
        match err {
            Error::Safety(s) => assert_eq!(s.violations.len(), 3),
            other => panic!("expected safety error, got {:?}", other),
        }
    }

    fn star_with_head_firmware(date: &str) -> Star<super::super::tests::MockTransport> {
        let transport = super::super::tests::MockTransport::new(&[
            "C0RMid0001kb11kp08",
            "C0QMid0002xl06xw1F40",
            "C0INid0003",
            &format!("H0EVid0004ev{}", date),
        ]);
        Star::new(transport).unwrap()
    }

    #[test]
    fn test_speed_envelope_from_firmware_date() {
        let legacy = star_with_head_firmware("20191101");
        assert_eq!(legacy.head96_max_y_speed(), HEAD96_Y_SPEED_LEGACY);

        let current = star_with_head_firmware("20210301");
        assert_eq!(current.head96_max_y_speed(), HEAD96_Y_SPEED_CURRENT);
    }
}

// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! iSWAP and CoRe gripper plate handling.
//!
//! A plate move is atomic for the caller but sequences pick-up, optional
//! intermediate positions and drop on the wire. The driver holds a single
//! pickup slot: starting a second pickup before dropping the first is a
//! state error, matching the single physical gripper.

use crate::codec::{tenths, Command};
use crate::error::Error;
use crate::resources::{
    normalize_degrees, require_cardinal, Coordinate, DeckResource, GripDirection, Plate,
};
use crate::transport::Transport;

use super::Star;

/// How far the jaws open beyond the grip width before closing, mm.
const JAW_CLEARANCE: f64 = 3.0;

/// Where and how to grab a plate.
#[derive(Debug, Clone, Copy)]
pub struct PickupParams {
    pub offset: Coordinate,
    /// Jaw engagement below the plate's top edge, mm.
    pub pickup_distance_from_top: f64,
    pub grip_direction: GripDirection,
}

impl Default for PickupParams {
    fn default() -> Self {
        PickupParams {
            offset: Coordinate::default(),
            pickup_distance_from_top: 8.0,
            grip_direction: GripDirection::Front,
        }
    }
}

/// Where and how to set a plate down.
#[derive(Debug, Clone, Copy)]
pub struct DropParams {
    /// Center of the destination site.
    pub destination: Coordinate,
    /// Z-rotation of the destination site, degrees.
    pub destination_rotation: i32,
    /// Top surface Z of the destination site.
    pub destination_top: f64,
    pub offset: Coordinate,
    pub grip_direction: GripDirection,
}

/// Rotation a move applies to the plate: the angle between the two grip
/// approaches, a multiple of 90°.
pub fn rotation_applied(pickup: GripDirection, drop: GripDirection) -> i32 {
    normalize_degrees(drop.angle() - pickup.angle())
}

/// Jaw span for a plate gripped from the given side.
pub fn grip_width(plate: &Plate, direction: GripDirection) -> f64 {
    match direction {
        GripDirection::Front | GripDirection::Back => plate.absolute_size_x(),
        GripDirection::Left | GripDirection::Right => plate.absolute_size_y(),
    }
}

pub(crate) fn park<T: Transport>(star: &mut Star<T>) -> Result<(), Error> {
    star.send(&Command::new("C0", "PG"), "")?;
    star.iswap_parked = true;
    Ok(())
}

impl<T: Transport> Star<T> {
    fn require_iswap(&self) -> Result<(), Error> {
        if !self.iswap_installed {
            return Err(Error::State("no iSWAP installed".to_string()));
        }
        Ok(())
    }

    pub fn iswap_parked(&self) -> bool {
        self.iswap_parked
    }

    /// The plate currently held by the gripper, if any.
    pub fn held_plate(&self) -> Option<&Plate> {
        self.held_plate.as_ref()
    }

    /// Move the iSWAP to its parked position outside the work envelope.
    pub fn park_iswap(&mut self) -> Result<(), Error> {
        self.require_iswap()?;
        park(self)
    }

    /// Grab a plate. The gripper can hold exactly one resource; the
    /// pickup slot stays occupied until the matching drop.
    pub fn iswap_pick_up_plate(
        &mut self,
        plate: &Plate,
        params: PickupParams,
    ) -> Result<(), Error> {
        self.require_iswap()?;
        if let Some(held) = &self.held_plate {
            return Err(Error::State(format!(
                "gripper already holds '{}', drop it before picking up '{}'",
                held.name(),
                plate.name()
            )));
        }
        require_cardinal(plate.rotation())?;

        let center = plate.center().offset(params.offset);
        let grip_z = plate.top_z() - params.pickup_distance_from_top;
        let width = grip_width(plate, params.grip_direction);

        let cmd = Command::new("C0", "PP")
            .int("xp", tenths(center.x), 5)
            .int("yp", tenths(center.y), 4)
            .int("zp", tenths(grip_z), 5)
            .int("gr", params.grip_direction as i64, 1)
            .int("gw", tenths(width), 4)
            .int("go", tenths(width + JAW_CLEARANCE), 4);
        self.send(&cmd, "")?;

        self.iswap_parked = false;
        self.held_plate = Some(plate.clone());
        self.held_grip_direction = Some(params.grip_direction);
        self.held_pickup_distance = params.pickup_distance_from_top;
        Ok(())
    }

    /// Set the held plate down. Returns the plate with its location and
    /// rotation updated for the new site.
    pub fn iswap_drop_plate(&mut self, params: DropParams) -> Result<Plate, Error> {
        self.require_iswap()?;
        let held = self
            .held_plate
            .as_ref()
            .ok_or_else(|| Error::State("gripper holds nothing to drop".to_string()))?
            .clone();
        require_cardinal(params.destination_rotation)?;

        // Which way the plate was grabbed decides how much this move
        // rotates it.
        let pickup_direction = self.held_grip_direction.unwrap_or(GripDirection::Front);
        let applied = rotation_applied(pickup_direction, params.grip_direction);

        let target = params.destination.offset(params.offset);
        let approach_z =
            params.destination_top + held.absolute_size_z() - self.held_pickup_distance;

        let cmd = Command::new("C0", "PR")
            .int("xp", tenths(target.x), 5)
            .int("yp", tenths(target.y), 4)
            .int("zp", tenths(approach_z), 5)
            .int("gr", params.grip_direction as i64, 1);
        self.send(&cmd, "")?;

        let mut plate = held;
        // rotation relative to the new site: what the move applied,
        // minus however the site itself is rotated
        plate.set_rotation(plate.rotation() + applied - params.destination_rotation);
        plate.set_location(Coordinate {
            x: target.x - plate.absolute_size_x() / 2.0,
            y: target.y - plate.absolute_size_y() / 2.0,
            z: params.destination_top,
        });
        self.held_plate = None;
        self.held_grip_direction = None;
        Ok(plate)
    }

    /// Pick up, optionally pass through intermediate positions, and
    /// drop: one atomic plate move from the caller's perspective.
    pub fn iswap_move_plate(
        &mut self,
        plate: &mut Plate,
        pickup: PickupParams,
        drop: DropParams,
        intermediates: &[Coordinate],
    ) -> Result<(), Error> {
        self.iswap_pick_up_plate(plate, pickup)?;
        for position in intermediates {
            let cmd = Command::new("C0", "PM")
                .int("xp", tenths(position.x), 5)
                .int("yp", tenths(position.y), 4)
                .int("zp", tenths(position.z), 5);
            self.send(&cmd, "")?;
        }
        let moved = self.iswap_drop_plate(drop)?;
        *plate = moved;
        Ok(())
    }

    /// Grab a plate with the CoRe gripper tools mounted on two channels.
    pub fn core_pick_up_plate(
        &mut self,
        plate: &Plate,
        front_channel: usize,
        back_channel: usize,
        params: PickupParams,
    ) -> Result<(), Error> {
        if front_channel >= self.num_channels() || back_channel >= self.num_channels() {
            return Err(Error::InvalidInput(format!(
                "gripper channels {} and {} must exist on a {}-channel instrument",
                front_channel,
                back_channel,
                self.num_channels()
            )));
        }
        if let Some(held) = &self.held_plate {
            return Err(Error::State(format!(
                "gripper already holds '{}'",
                held.name()
            )));
        }

        let center = plate.center().offset(params.offset);
        let grip_z = plate.top_z() - params.pickup_distance_from_top;
        let width = grip_width(plate, params.grip_direction);

        let cmd = Command::new("C0", "ZP")
            .int("xs", tenths(center.x), 5)
            .int("yj", tenths(center.y), 4)
            .int("zj", tenths(grip_z), 5)
            .int("pf", front_channel as i64 + 1, 2)
            .int("pb", back_channel as i64 + 1, 2)
            .int("gw", tenths(width), 4);
        self.send(&cmd, "")?;

        self.held_plate = Some(plate.clone());
        self.held_grip_direction = Some(params.grip_direction);
        Ok(())
    }

    /// Release a plate held by the CoRe gripper.
    pub fn core_release_plate(&mut self, params: DropParams) -> Result<Plate, Error> {
        let held = self
            .held_plate
            .as_ref()
            .ok_or_else(|| Error::State("gripper holds nothing to release".to_string()))?
            .clone();

        let pickup_direction = self.held_grip_direction.unwrap_or(GripDirection::Front);
        let applied = rotation_applied(pickup_direction, params.grip_direction);
        let target = params.destination.offset(params.offset);

        let cmd = Command::new("C0", "ZR")
            .int("xs", tenths(target.x), 5)
            .int("yj", tenths(target.y), 4)
            .int("zj", tenths(params.destination_top + held.absolute_size_z()), 5);
        self.send(&cmd, "")?;

        let mut plate = held;
        plate.set_rotation(plate.rotation() + applied);
        plate.set_location(Coordinate {
            x: target.x - plate.absolute_size_x() / 2.0,
            y: target.y - plate.absolute_size_y() / 2.0,
            z: params.destination_top,
        });
        self.held_plate = None;
        self.held_grip_direction = None;
        Ok(plate)
    }

    /// Entry point for the explicitly dangerous trajectories.
    pub fn hazardous(&mut self) -> hazard::HazardousMoves<T> {
        hazard::HazardousMoves { star: self }
    }
}

/// Moves that leave the deck proper. Reaching a hotel uses a
/// down-forward-down trajectory with no collision protection from the
/// firmware; callers opt in by going through this namespace.
pub mod hazard {
    use super::*;

    pub struct HazardousMoves<'a, T: Transport> {
        pub(super) star: &'a mut Star<T>,
    }

    impl<'a, T: Transport> HazardousMoves<'a, T> {
        /// Drop the held plate into an off-deck hotel slot. The
        /// destination is NOT range-checked against the deck.
        pub fn drop_plate_to_hotel(
            &mut self,
            params: DropParams,
        ) -> Result<Plate, Error> {
            self.star.require_iswap()?;
            let held = self
                .star
                .held_plate
                .as_ref()
                .ok_or_else(|| Error::State("gripper holds nothing to drop".to_string()))?
                .clone();

            let target = params.destination.offset(params.offset);
            // down-forward-down: descend to hotel level, drive in, settle
            let cmd = Command::new("C0", "PR")
                .int("xp", tenths(target.x), 5)
                .int("yp", tenths(target.y), 4)
                .int("zp", tenths(params.destination_top + held.absolute_size_z()), 5)
                .int("gr", params.grip_direction as i64, 1)
                .int("ht", 1, 1);
            self.star.send(&cmd, "")?;

            let mut plate = held;
            plate.set_location(Coordinate {
                x: target.x - plate.absolute_size_x() / 2.0,
                y: target.y - plate.absolute_size_y() / 2.0,
                z: params.destination_top,
            });
            self.star.held_plate = None;
            self.star.held_grip_direction = None;
            Ok(plate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::star_with;
    use super::*;
    use crate::resources::Coordinate;

    fn plate() -> Plate {
        Plate::new(
            "assay-1",
            Coordinate::new(200.0, 300.0, 100.0),
            (127.76, 85.48, 14.5),
        )
    }

    #[test]
    fn test_rotation_from_direction_pair() {
        assert_eq!(rotation_applied(GripDirection::Front, GripDirection::Back), 180);
        assert_eq!(rotation_applied(GripDirection::Front, GripDirection::Right), 90);
        assert_eq!(rotation_applied(GripDirection::Left, GripDirection::Front), 90);
        assert_eq!(rotation_applied(GripDirection::Back, GripDirection::Back), 0);
    }

    #[test]
    fn test_grip_width_follows_direction() {
        let plate = plate();
        assert_eq!(grip_width(&plate, GripDirection::Front), 127.76);
        assert_eq!(grip_width(&plate, GripDirection::Left), 85.48);
    }

    #[test]
    fn test_second_pickup_is_rejected() {
        let mut star = star_with(&["C0PPid####", "C0PPid####"]);
        star.iswap_pick_up_plate(&plate(), PickupParams::default())
            .unwrap();
        let err = star
            .iswap_pick_up_plate(&plate(), PickupParams::default())
            .unwrap_err();
        match err {
            Error::State(msg) => assert!(msg.contains("already holds")),
            other => panic!("expected state error, got {:?}", other),
        }
    }

    #[test]
    fn test_move_rotates_plate() {
        let mut star = star_with(&["C0PPid####", "C0PRid####"]);
        let mut p = plate();
        star.iswap_move_plate(
            &mut p,
            PickupParams {
                grip_direction: GripDirection::Front,
                ..PickupParams::default()
            },
            DropParams {
                destination: Coordinate::new(400.0, 300.0, 100.0),
                destination_rotation: 0,
                destination_top: 100.0,
                offset: Coordinate::default(),
                grip_direction: GripDirection::Back,
            },
            &[],
        )
        .unwrap();
        assert_eq!(p.rotation(), 180);
        assert!(star.held_plate().is_none());
        // drop telegram carries the BACK grip direction code
        let drop = star.transport.requests.last().unwrap().clone();
        assert!(drop.contains("gr3"), "telegram was {}", drop);
    }

    #[test]
    fn test_unparked_iswap_parks_before_channel_move() {
        let mut star = star_with(&["C0PPid####", "C0PGid####", "C0MYid####"]);
        star.iswap_pick_up_plate(&plate(), PickupParams::default())
            .unwrap();
        assert!(!star.iswap_parked());
        star.move_channel_y(0, 300.0).unwrap();
        assert!(star.iswap_parked());
        let sent: Vec<&String> = star.transport.requests.iter().collect();
        let park_pos = sent.iter().position(|r| r.contains("C0PG")).unwrap();
        let move_pos = sent.iter().position(|r| r.contains("C0MY")).unwrap();
        assert!(park_pos < move_pos);
    }
}

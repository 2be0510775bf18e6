// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The labware contract the drivers consume, and the concrete resource
//! types the operations reference.
//!
//! Geometry math (plate layouts, well spacing, deck serialization) lives
//! outside this crate; the drivers only need absolute locations, sizes,
//! rotations and a few capacity figures, all in mm and µL. Conversion to
//! the firmware's 0.1 mm integer units happens at the codec boundary.

use crate::error::Error;
use crate::tracker::{TipTracker, VolumeTracker};
use std::cell::{Ref, RefCell, RefMut};

/// A point in deck space, mm. X grows to the right, Y to the back,
/// Z upwards.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coordinate {
    pub const fn new(x: f64, y: f64, z: f64) -> Coordinate {
        Coordinate { x, y, z }
    }

    pub fn offset(&self, other: Coordinate) -> Coordinate {
        Coordinate {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }
}

/// Side the gripper approaches a plate from. The discriminants are the
/// firmware's grip direction codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GripDirection {
    Front = 1,
    Right = 2,
    Back = 3,
    Left = 4,
}

impl GripDirection {
    /// Deck-space angle of the approach, degrees.
    pub fn angle(self) -> i32 {
        match self {
            GripDirection::Front => 0,
            GripDirection::Right => 90,
            GripDirection::Back => 180,
            GripDirection::Left => 270,
        }
    }
}

/// Normalize an angle into [0, 360).
pub fn normalize_degrees(angle: i32) -> i32 {
    angle.rem_euclid(360)
}

/// Tip size class. Selects the engagement-height correction at pickup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipSize {
    Low,
    Standard,
    High,
    Xl,
}

impl TipSize {
    /// Correction applied to both engagement heights, mm.
    pub fn engagement_correction(self) -> f64 {
        match self {
            TipSize::Low => -2.0,
            TipSize::Standard | TipSize::High => 0.0,
            TipSize::Xl => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipPickupMethod {
    OutOfRack,
    OutOfWashLiquid,
}

/// Immutable description of a disposable tip type.
#[derive(Debug, Clone, PartialEq)]
pub struct Tip {
    pub has_filter: bool,
    /// Full length including the part inside the channel, mm
    pub total_tip_length: f64,
    /// How deep the tip sits in the channel, mm
    pub fitting_depth: f64,
    pub maximal_volume: f64,
    pub tip_size: TipSize,
    pub pickup_method: TipPickupMethod,
}

impl Tip {
    pub fn new(has_filter: bool, total_tip_length: f64, maximal_volume: f64, tip_size: TipSize) -> Tip {
        Tip {
            has_filter,
            total_tip_length,
            fitting_depth: crate::constant::TIP_FITTING_DEPTH,
            maximal_volume,
            tip_size,
            pickup_method: TipPickupMethod::OutOfRack,
        }
    }

    /// Standard 300 µL filtered tip.
    pub fn standard_volume_filter() -> Tip {
        Tip::new(true, 59.9, 300.0, TipSize::Standard)
    }

    /// 1000 µL filtered tip.
    pub fn high_volume_filter() -> Tip {
        Tip::new(true, 95.1, 1000.0, TipSize::High)
    }

    /// Lowest head-space Z a channel carrying this tip may command before
    /// the tip bottoms out, given the head-space floor.
    pub fn z_floor(&self, head_space_floor: f64) -> f64 {
        head_space_floor - self.total_tip_length + self.fitting_depth
    }
}

/// The geometry interface every operated-on resource provides.
/// Implemented here for the concrete types below; external labware
/// libraries implement it for theirs.
pub trait DeckResource {
    fn name(&self) -> &str;
    /// Left-front-bottom corner in deck space.
    fn absolute_location(&self) -> Coordinate;
    fn absolute_size_x(&self) -> f64;
    fn absolute_size_y(&self) -> f64;
    fn absolute_size_z(&self) -> f64;
    /// Z-rotation in degrees; multiples of 90 for gripper operations.
    fn absolute_rotation(&self) -> i32 {
        0
    }
    fn has_lid(&self) -> bool {
        false
    }
    /// Cavity base to outer base, mm.
    fn material_z_thickness(&self) -> f64 {
        0.0
    }
    /// Liquid surface height above the cavity bottom for a volume.
    /// Only needed when surface following or height probing is used.
    fn compute_height_from_volume(&self, _volume: f64) -> Option<f64> {
        None
    }
    fn compute_volume_from_height(&self, _height: f64) -> Option<f64> {
        None
    }

    fn center(&self) -> Coordinate {
        let loc = self.absolute_location();
        Coordinate {
            x: loc.x + self.absolute_size_x() / 2.0,
            y: loc.y + self.absolute_size_y() / 2.0,
            z: loc.z,
        }
    }

    fn top_z(&self) -> f64 {
        self.absolute_location().z + self.absolute_size_z()
    }

    fn bottom_z(&self) -> f64 {
        self.absolute_location().z + self.material_z_thickness()
    }
}

/// A liquid-holding cavity: a well, a trough, a reagent reservoir.
#[derive(Debug)]
pub struct Container {
    name: String,
    location: Coordinate,
    size_x: f64,
    size_y: f64,
    size_z: f64,
    material_z_thickness: f64,
    max_volume: f64,
    tracker: RefCell<VolumeTracker>,
}

impl Container {
    pub fn new(
        name: impl Into<String>,
        location: Coordinate,
        size: (f64, f64, f64),
        max_volume: f64,
    ) -> Container {
        let name = name.into();
        let tracker = RefCell::new(VolumeTracker::new(name.clone(), max_volume));
        Container {
            name,
            location,
            size_x: size.0,
            size_y: size.1,
            size_z: size.2,
            material_z_thickness: 0.0,
            max_volume,
            tracker,
        }
    }

    pub fn with_material_z_thickness(mut self, thickness: f64) -> Container {
        self.material_z_thickness = thickness;
        self
    }

    pub fn max_volume(&self) -> f64 {
        self.max_volume
    }

    pub fn tracker(&self) -> Ref<VolumeTracker> {
        self.tracker.borrow()
    }

    pub fn tracker_mut(&self) -> RefMut<VolumeTracker> {
        self.tracker.borrow_mut()
    }

    pub fn set_volume(&self, volume: f64) {
        self.tracker.borrow_mut().set_volume(volume);
    }

    pub fn volume(&self) -> f64 {
        self.tracker.borrow().volume()
    }
}

impl DeckResource for Container {
    fn name(&self) -> &str {
        &self.name
    }

    fn absolute_location(&self) -> Coordinate {
        self.location
    }

    fn absolute_size_x(&self) -> f64 {
        self.size_x
    }

    fn absolute_size_y(&self) -> f64 {
        self.size_y
    }

    fn absolute_size_z(&self) -> f64 {
        self.size_z
    }

    fn material_z_thickness(&self) -> f64 {
        self.material_z_thickness
    }
}

/// One addressable position in a tip rack. At most one tip at a time.
#[derive(Debug)]
pub struct TipSpot {
    name: String,
    /// Center of the spot in deck space
    location: Coordinate,
    size_x: f64,
    size_y: f64,
    tracker: RefCell<TipTracker>,
}

impl TipSpot {
    pub fn new(name: impl Into<String>, location: Coordinate, tip: Option<Tip>) -> TipSpot {
        let name = name.into();
        let tracker = match tip {
            Some(tip) => TipTracker::with_tip(name.clone(), tip),
            None => TipTracker::new(name.clone()),
        };
        TipSpot {
            name,
            location,
            size_x: 9.0,
            size_y: 9.0,
            tracker: RefCell::new(tracker),
        }
    }

    pub fn has_tip(&self) -> bool {
        self.tracker.borrow().has_tip()
    }

    pub fn tip(&self) -> Option<Tip> {
        self.tracker.borrow().tip().cloned()
    }

    pub fn tracker_mut(&self) -> RefMut<TipTracker> {
        self.tracker.borrow_mut()
    }
}

impl DeckResource for TipSpot {
    fn name(&self) -> &str {
        &self.name
    }

    fn absolute_location(&self) -> Coordinate {
        // stored as center already
        Coordinate {
            x: self.location.x - self.size_x / 2.0,
            y: self.location.y - self.size_y / 2.0,
            z: self.location.z,
        }
    }

    fn absolute_size_x(&self) -> f64 {
        self.size_x
    }

    fn absolute_size_y(&self) -> f64 {
        self.size_y
    }

    fn absolute_size_z(&self) -> f64 {
        0.0
    }
}

/// A microtiter plate as the gripper and the carousel see it: a box with
/// a rotation, a lid flag and a unique name.
#[derive(Debug, Clone)]
pub struct Plate {
    name: String,
    location: Coordinate,
    size_x: f64,
    size_y: f64,
    size_z: f64,
    rotation: i32,
    has_lid: bool,
}

impl Plate {
    pub fn new(name: impl Into<String>, location: Coordinate, size: (f64, f64, f64)) -> Plate {
        Plate {
            name: name.into(),
            location,
            size_x: size.0,
            size_y: size.1,
            size_z: size.2,
            rotation: 0,
            has_lid: false,
        }
    }

    pub fn with_rotation(mut self, degrees: i32) -> Plate {
        self.rotation = normalize_degrees(degrees);
        self
    }

    pub fn with_lid(mut self) -> Plate {
        self.has_lid = true;
        self
    }

    pub fn rotation(&self) -> i32 {
        self.rotation
    }

    pub fn set_rotation(&mut self, degrees: i32) {
        self.rotation = normalize_degrees(degrees);
    }

    pub fn set_location(&mut self, location: Coordinate) {
        self.location = location;
    }

    /// Height the plate occupies in a rack slot; a lid adds 3 mm.
    pub fn effective_height(&self) -> f64 {
        if self.has_lid {
            self.size_z + 3.0
        } else {
            self.size_z
        }
    }
}

impl DeckResource for Plate {
    fn name(&self) -> &str {
        &self.name
    }

    fn absolute_location(&self) -> Coordinate {
        self.location
    }

    fn absolute_size_x(&self) -> f64 {
        self.size_x
    }

    fn absolute_size_y(&self) -> f64 {
        self.size_y
    }

    fn absolute_size_z(&self) -> f64 {
        self.size_z
    }

    fn absolute_rotation(&self) -> i32 {
        self.rotation
    }

    fn has_lid(&self) -> bool {
        self.has_lid
    }
}

/// A drop target that accepts any tip regardless of volume.
#[derive(Debug, Clone)]
pub struct Trash {
    location: Coordinate,
}

impl Trash {
    pub fn new(location: Coordinate) -> Trash {
        Trash { location }
    }

    pub fn location(&self) -> Coordinate {
        self.location
    }
}

/// Checks a value is a multiple of 90°, as gripper rotations must be.
pub fn require_cardinal(degrees: i32) -> Result<i32, Error> {
    let normalized = normalize_degrees(degrees);
    if normalized % 90 != 0 {
        return Err(Error::InvalidInput(format!(
            "rotation must be a multiple of 90 degrees, got {}",
            degrees
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grip_direction_codes() {
        assert_eq!(GripDirection::Front as i32, 1);
        assert_eq!(GripDirection::Back as i32, 3);
        assert_eq!(GripDirection::Back.angle() - GripDirection::Front.angle(), 180);
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(-90), 270);
        assert_eq!(normalize_degrees(450), 90);
        assert_eq!(normalize_degrees(360), 0);
    }

    #[test]
    fn test_tip_z_floor() {
        let tip = Tip::new(true, 95.1, 1000.0, TipSize::High);
        let floor = tip.z_floor(99.98);
        assert!((floor - (99.98 - 95.1 + 8.0)).abs() < 1e-9);
    }

    #[test]
    fn test_effective_height_with_lid() {
        let plate = Plate::new("p", Coordinate::default(), (127.0, 86.0, 14.5));
        assert_eq!(plate.effective_height(), 14.5);
        let lidded = plate.with_lid();
        assert_eq!(lidded.effective_height(), 17.5);
    }

    #[test]
    fn test_require_cardinal() {
        assert_eq!(require_cardinal(270).unwrap(), 270);
        assert_eq!(require_cardinal(-90).unwrap(), 270);
        assert!(require_cardinal(45).is_err());
    }

    #[test]
    fn test_container_center() {
        let well = Container::new(
            "A1",
            Coordinate::new(100.0, 200.0, 50.0),
            (9.0, 9.0, 10.0),
            400.0,
        );
        let center = well.center();
        assert_eq!(center.x, 104.5);
        assert_eq!(center.y, 204.5);
        assert_eq!(center.z, 50.0);
    }
}

// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Persistent rack inventory of a Cytomat.
//!
//! The inventory is the device's source of truth for which slot holds
//! which plate. It is serialized to one YAML file per device and
//! rewritten atomically on every change: write to a temp file in the
//! same directory, sync, rename. Slot keys are strings so a YAML reader
//! never mistakes a leading zero for an octal number.

use crate::error::{Error, InventoryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One plate slot position addressed as (rack, slot), both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLocation {
    pub rack: u8,
    pub slot: u16,
}

/// Geometry of a rack model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RackType {
    /// Number of plate positions in the rack
    pub num_slots: u16,
    /// Distance between two plate positions, mm
    pub pitch: f64,
}

/// A plate as the carousel knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CytomatPlate {
    pub uid: String,
    pub has_lid: bool,
    /// Plate height, mm. Used for the pitch clearance check.
    pub height: f64,
}

impl CytomatPlate {
    pub fn new(uid: impl Into<String>, has_lid: bool, height: f64) -> CytomatPlate {
        CytomatPlate {
            uid: uid.into(),
            has_lid,
            height,
        }
    }

    /// Slot height the plate needs; a lid adds 3 mm.
    pub fn effective_height(&self) -> f64 {
        if self.has_lid {
            self.height + 3.0
        } else {
            self.height
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rack {
    pub rack_index: u8,
    #[serde(rename = "type")]
    pub kind: RackType,
    /// Slot number (as a string key) to plate, `~` for empty.
    pub idx: BTreeMap<String, Option<CytomatPlate>>,
}

impl Rack {
    fn empty(rack_index: u8, kind: RackType) -> Rack {
        let idx = (1..=kind.num_slots)
            .map(|slot| (slot.to_string(), None))
            .collect();
        Rack {
            rack_index,
            kind,
            idx,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct State {
    racks: Vec<Rack>,
}

/// The rack inventory plus the file it persists to.
#[derive(Debug)]
pub struct Inventory {
    state: State,
    path: PathBuf,
}

impl Inventory {
    /// Load the inventory from `path`, or generate a fresh one from the
    /// rack configuration when the file does not exist yet.
    pub fn load_or_create(path: impl Into<PathBuf>, racks: &[RackType]) -> Result<Inventory, Error> {
        let path = path.into();
        let state = if path.exists() {
            let text = fs::read_to_string(&path)?;
            let state: State = serde_yaml::from_str(&text)?;
            validate(&state)?;
            state
        } else {
            let state = State {
                racks: racks
                    .iter()
                    .enumerate()
                    .map(|(i, kind)| Rack::empty(i as u8 + 1, *kind))
                    .collect(),
            };
            let inventory = Inventory {
                state,
                path: path.clone(),
            };
            inventory.save()?;
            return Ok(inventory);
        };
        Ok(Inventory { state, path })
    }

    pub fn racks(&self) -> &[Rack] {
        &self.state.racks
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file atomically: a crash mid-save leaves the old
    /// inventory intact, never a truncated one.
    pub fn save(&self) -> Result<(), Error> {
        let text = serde_yaml::to_string(&self.state)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(text.as_bytes())?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error.kind()))?;
        Ok(())
    }

    pub fn plate_at(&self, location: StorageLocation) -> Option<&CytomatPlate> {
        self.state
            .racks
            .iter()
            .find(|r| r.rack_index == location.rack)
            .and_then(|r| r.idx.get(&location.slot.to_string()))
            .and_then(|p| p.as_ref())
    }

    fn rack_mut(&mut self, rack: u8) -> Result<&mut Rack, InventoryError> {
        self.state
            .racks
            .iter_mut()
            .find(|r| r.rack_index == rack)
            .ok_or(InventoryError::RackNotFound(rack))
    }

    fn check_slot(rack: &Rack, slot: u16) -> Result<(), InventoryError> {
        if slot == 0 || slot > rack.kind.num_slots {
            return Err(InventoryError::SlotOutOfRange {
                rack: rack.rack_index,
                slot,
                num_slots: rack.kind.num_slots,
            });
        }
        Ok(())
    }

    /// Everything [`Inventory::add_plate`] enforces, without mutating:
    /// slot bounds, slot emptiness, UID uniqueness, pitch clearance.
    /// Drivers run this before any wire traffic so a plate is never
    /// physically stored in a slot the inventory would then reject.
    pub fn validate_add(
        &self,
        location: StorageLocation,
        plate: &CytomatPlate,
    ) -> Result<(), Error> {
        if self.find_plate(&plate.uid).is_some() {
            return Err(InventoryError::DuplicateUid(plate.uid.clone()).into());
        }
        let rack = self
            .state
            .racks
            .iter()
            .find(|r| r.rack_index == location.rack)
            .ok_or(InventoryError::RackNotFound(location.rack))?;
        Self::check_slot(rack, location.slot)?;
        if plate.effective_height() >= rack.kind.pitch {
            return Err(InventoryError::PitchTooSmall {
                pitch: rack.kind.pitch,
                height: plate.effective_height(),
            }
            .into());
        }
        if let Some(Some(existing)) = rack.idx.get(&location.slot.to_string()) {
            return Err(InventoryError::SlotOccupied {
                rack: location.rack,
                slot: location.slot,
                uid: existing.uid.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Record a plate at a slot and persist.
    pub fn add_plate(
        &mut self,
        location: StorageLocation,
        plate: CytomatPlate,
    ) -> Result<(), Error> {
        self.validate_add(location, &plate)?;
        let rack = self.rack_mut(location.rack)?;
        let slot = rack.idx.entry(location.slot.to_string()).or_insert(None);
        *slot = Some(plate);
        self.save()
    }

    /// Take a plate out of a slot and persist.
    pub fn remove_plate(&mut self, location: StorageLocation) -> Result<CytomatPlate, Error> {
        let rack = self.rack_mut(location.rack)?;
        Self::check_slot(rack, location.slot)?;
        let slot = rack.idx.entry(location.slot.to_string()).or_insert(None);
        let plate = slot.take().ok_or(InventoryError::SlotEmpty {
            rack: location.rack,
            slot: location.slot,
        })?;
        self.save()?;
        Ok(plate)
    }

    pub fn find_plate(&self, uid: &str) -> Option<StorageLocation> {
        for rack in &self.state.racks {
            for (slot, plate) in &rack.idx {
                if let Some(plate) = plate {
                    if plate.uid == uid {
                        if let Ok(slot) = slot.parse::<u16>() {
                            return Some(StorageLocation {
                                rack: rack.rack_index,
                                slot,
                            });
                        }
                    }
                }
            }
        }
        None
    }

    /// Smallest-pitch free slot that still clears the plate.
    pub fn find_slot_for(&self, plate: &CytomatPlate) -> Result<StorageLocation, Error> {
        let height = plate.effective_height();
        let mut candidates: Vec<&Rack> = self
            .state
            .racks
            .iter()
            .filter(|r| r.kind.pitch > height)
            .collect();
        candidates.sort_by(|a, b| {
            a.kind
                .pitch
                .partial_cmp(&b.kind.pitch)
                .expect("finite pitches")
        });
        for rack in candidates {
            let mut slots: Vec<u16> = rack
                .idx
                .iter()
                .filter(|(_, plate)| plate.is_none())
                .filter_map(|(slot, _)| slot.parse::<u16>().ok())
                .collect();
            slots.sort_unstable();
            if let Some(slot) = slots.first() {
                return Ok(StorageLocation {
                    rack: rack.rack_index,
                    slot: *slot,
                });
            }
        }
        Err(InventoryError::NoFreeSlot(height).into())
    }

    pub fn list_plates_by_prefix(&self, prefix: &str) -> Vec<String> {
        let mut uids = Vec::new();
        for rack in &self.state.racks {
            for plate in rack.idx.values().flatten() {
                if plate.uid.starts_with(prefix) {
                    uids.push(plate.uid.clone());
                }
            }
        }
        uids.sort();
        uids
    }
}

fn validate(state: &State) -> Result<(), Error> {
    let mut seen = std::collections::HashSet::new();
    for rack in &state.racks {
        for (slot, plate) in &rack.idx {
            let number = slot.parse::<u16>().map_err(|_| {
                Error::InvalidInput(format!("slot key '{}' is not a number", slot))
            })?;
            check_loaded_slot(rack, number)?;
            if let Some(plate) = plate {
                if !seen.insert(plate.uid.clone()) {
                    return Err(InventoryError::DuplicateUid(plate.uid.clone()).into());
                }
            }
        }
    }
    Ok(())
}

fn check_loaded_slot(rack: &Rack, slot: u16) -> Result<(), Error> {
    if slot == 0 || slot > rack.kind.num_slots {
        return Err(InventoryError::SlotOutOfRange {
            rack: rack.rack_index,
            slot,
            num_slots: rack.kind.num_slots,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MT_RACK: RackType = RackType {
        num_slots: 21,
        pitch: 23.0,
    };
    const DW_RACK: RackType = RackType {
        num_slots: 10,
        pitch: 50.0,
    };

    fn temp_inventory(racks: &[RackType]) -> (tempfile::TempDir, Inventory) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cytomat_C6002.yaml");
        let inventory = Inventory::load_or_create(&path, racks).unwrap();
        (dir, inventory)
    }

    fn plate(uid: &str) -> CytomatPlate {
        CytomatPlate::new(uid, false, 14.5)
    }

    #[test]
    fn test_fresh_inventory_has_empty_slots() {
        let (_dir, inventory) = temp_inventory(&[MT_RACK]);
        assert_eq!(inventory.racks().len(), 1);
        assert_eq!(inventory.racks()[0].idx.len(), 21);
        assert!(inventory.racks()[0].idx.values().all(|p| p.is_none()));
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let (dir, mut inventory) = temp_inventory(&[DW_RACK, MT_RACK]);
        inventory
            .add_plate(StorageLocation { rack: 2, slot: 18 }, plate("ab-0042"))
            .unwrap();

        let path = dir.path().join("cytomat_C6002.yaml");
        let reloaded = Inventory::load_or_create(&path, &[DW_RACK, MT_RACK]).unwrap();
        let found = reloaded
            .plate_at(StorageLocation { rack: 2, slot: 18 })
            .unwrap();
        assert_eq!(found.uid, "ab-0042");
        assert_eq!(
            reloaded.find_plate("ab-0042"),
            Some(StorageLocation { rack: 2, slot: 18 })
        );
    }

    #[test]
    fn test_duplicate_uid_rejected() {
        let (_dir, mut inventory) = temp_inventory(&[DW_RACK, MT_RACK]);
        inventory
            .add_plate(StorageLocation { rack: 1, slot: 1 }, plate("dup"))
            .unwrap();
        let err = inventory
            .add_plate(StorageLocation { rack: 2, slot: 1 }, plate("dup"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Inventory(InventoryError::DuplicateUid(_))
        ));
    }

    #[test]
    fn test_pitch_clearance_enforced() {
        let (_dir, mut inventory) = temp_inventory(&[MT_RACK]);
        // 21 mm plate with a lid needs 24 mm, rack pitch is 23
        let tall = CytomatPlate::new("tall", true, 21.0);
        let err = inventory
            .add_plate(StorageLocation { rack: 1, slot: 1 }, tall)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Inventory(InventoryError::PitchTooSmall { .. })
        ));
    }

    #[test]
    fn test_slot_bounds() {
        let (_dir, mut inventory) = temp_inventory(&[DW_RACK]);
        let err = inventory
            .add_plate(StorageLocation { rack: 1, slot: 11 }, plate("p"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Inventory(InventoryError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_find_slot_prefers_smallest_pitch() {
        let (_dir, mut inventory) = temp_inventory(&[DW_RACK, MT_RACK]);
        // 14.5 mm plate fits the 23 mm microtiter rack
        let location = inventory.find_slot_for(&plate("new")).unwrap();
        assert_eq!(location.rack, 2);
        assert_eq!(location.slot, 1);

        // a deep-well plate only fits the 50 mm rack
        let deep = CytomatPlate::new("deep", false, 40.0);
        let location = inventory.find_slot_for(&deep).unwrap();
        assert_eq!(location.rack, 1);

        // nothing fits a 60 mm monster
        let monster = CytomatPlate::new("monster", false, 60.0);
        assert!(inventory.find_slot_for(&monster).is_err());
    }

    #[test]
    fn test_remove_empty_slot_fails() {
        let (_dir, mut inventory) = temp_inventory(&[MT_RACK]);
        let err = inventory
            .remove_plate(StorageLocation { rack: 1, slot: 3 })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Inventory(InventoryError::SlotEmpty { .. })
        ));
    }

    #[test]
    fn test_list_by_prefix() {
        let (_dir, mut inventory) = temp_inventory(&[DW_RACK, MT_RACK]);
        inventory
            .add_plate(StorageLocation { rack: 2, slot: 1 }, plate("assay-001"))
            .unwrap();
        inventory
            .add_plate(StorageLocation { rack: 2, slot: 2 }, plate("assay-002"))
            .unwrap();
        inventory
            .add_plate(StorageLocation { rack: 1, slot: 1 }, plate("control-001"))
            .unwrap();
        assert_eq!(
            inventory.list_plates_by_prefix("assay-"),
            vec!["assay-001".to_string(), "assay-002".to_string()]
        );
    }
}

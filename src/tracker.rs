// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Two-phase state trackers for tips and liquid volumes.
//!
//! An operation stages its changes on the pending state; a successful
//! reply commits, an error rolls back. A channelized error commits and
//! rolls back per channel, which is what makes partial success possible.
//!
//! Tracking may be disabled globally for diagnostics. Disabled trackers
//! skip their preconditions but still stage and commit, so the recorded
//! state follows whatever the hardware was told to do.

use crate::error::Error;
use crate::resources::Tip;
use std::sync::atomic::{AtomicBool, Ordering};

static TIP_TRACKING: AtomicBool = AtomicBool::new(true);
static VOLUME_TRACKING: AtomicBool = AtomicBool::new(true);

pub fn set_tip_tracking(enabled: bool) {
    TIP_TRACKING.store(enabled, Ordering::Relaxed);
}

pub fn does_tip_tracking() -> bool {
    TIP_TRACKING.load(Ordering::Relaxed)
}

pub fn set_volume_tracking(enabled: bool) {
    VOLUME_TRACKING.store(enabled, Ordering::Relaxed);
}

pub fn does_volume_tracking() -> bool {
    VOLUME_TRACKING.load(Ordering::Relaxed)
}

/// Tracks the liquid volume in one container or one mounted tip.
#[derive(Debug, Clone)]
pub struct VolumeTracker {
    /// Names the tracked thing in error messages.
    thing: String,
    max_volume: f64,
    volume: f64,
    pending: f64,
}

impl VolumeTracker {
    pub fn new(thing: impl Into<String>, max_volume: f64) -> VolumeTracker {
        VolumeTracker {
            thing: thing.into(),
            max_volume,
            volume: 0.0,
            pending: 0.0,
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Committed plus staged volume.
    pub fn pending_volume(&self) -> f64 {
        self.pending
    }

    pub fn max_volume(&self) -> f64 {
        self.max_volume
    }

    pub fn free_volume(&self) -> f64 {
        self.max_volume - self.pending
    }

    /// Overwrite both committed and pending state, e.g. after the user
    /// refilled a reservoir by hand.
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume;
        self.pending = volume;
    }

    pub fn remove(&mut self, volume: f64) -> Result<(), Error> {
        if does_volume_tracking() && volume - self.pending > 1e-6 {
            return Err(Error::TooLittleLiquid(format!(
                "{} holds {}uL, cannot remove {}uL",
                self.thing, self.pending, volume
            )));
        }
        self.pending = (self.pending - volume).max(0.0);
        Ok(())
    }

    pub fn add(&mut self, volume: f64) -> Result<(), Error> {
        if does_volume_tracking() && volume - self.free_volume() > 1e-6 {
            return Err(Error::TooLittleVolume(format!(
                "{} has {}uL free, cannot add {}uL",
                self.thing,
                self.free_volume(),
                volume
            )));
        }
        self.pending = (self.pending + volume).min(self.max_volume);
        Ok(())
    }

    pub fn commit(&mut self) {
        self.volume = self.pending;
    }

    pub fn rollback(&mut self) {
        self.pending = self.volume;
    }
}

/// Tracks tip presence at one location: a channel or a tip spot.
#[derive(Debug, Clone)]
pub struct TipTracker {
    thing: String,
    tip: Option<Tip>,
    pending: Option<Tip>,
}

impl TipTracker {
    pub fn new(thing: impl Into<String>) -> TipTracker {
        TipTracker {
            thing: thing.into(),
            tip: None,
            pending: None,
        }
    }

    pub fn with_tip(thing: impl Into<String>, tip: Tip) -> TipTracker {
        TipTracker {
            thing: thing.into(),
            tip: Some(tip.clone()),
            pending: Some(tip),
        }
    }

    pub fn has_tip(&self) -> bool {
        self.pending.is_some()
    }

    pub fn tip(&self) -> Option<&Tip> {
        self.pending.as_ref()
    }

    pub fn committed_tip(&self) -> Option<&Tip> {
        self.tip.as_ref()
    }

    pub fn add_tip(&mut self, tip: Tip) -> Result<(), Error> {
        if does_tip_tracking() && self.pending.is_some() {
            return Err(Error::HasTip(self.thing.clone()));
        }
        self.pending = Some(tip);
        Ok(())
    }

    /// `Ok(None)` only happens with tracking disabled, where an empty
    /// location is not an error but there is nothing to hand over.
    pub fn remove_tip(&mut self) -> Result<Option<Tip>, Error> {
        match self.pending.take() {
            Some(tip) => Ok(Some(tip)),
            None if !does_tip_tracking() => Ok(None),
            None => Err(Error::NoTip(self.thing.clone())),
        }
    }

    pub fn commit(&mut self) {
        self.tip = self.pending.clone();
    }

    pub fn rollback(&mut self) {
        self.pending = self.tip.clone();
    }

    /// Drop all state, committed included. Used by "clear head state".
    pub fn clear(&mut self) {
        self.tip = None;
        self.pending = None;
    }
}

// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Hardware safety gate.
//!
//! Every motion-producing operation is validated here before any wire
//! traffic. A failed check reports all violations at once so the caller
//! sees the full picture instead of fixing one axis per attempt.

use crate::constant::{
    CHANNEL_REACH_PITCH, CHANNEL_Y_MAX, CHANNEL_Y_MIN, CHANNEL_Z_MAX, CHANNEL_Z_MIN,
    HEAD96_X_MAX, HEAD96_X_MIN, HEAD96_Y_MAX, HEAD96_Y_MIN, HEAD96_Z_MAX, HEAD96_Z_MIN,
    MIN_CHANNEL_SPACING, Y_TOLERANCE,
};
use crate::resources::Tip;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    AxisOutOfRange {
        axis: char,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Two adjacent channels closer than the anti-collision spacing.
    ChannelSpacing {
        back: usize,
        front: usize,
        distance: f64,
    },
    /// The channel cannot physically reach the commanded Y.
    OutOfReach {
        channel: usize,
        y: f64,
        min: f64,
        max: f64,
    },
    /// Commanded Z would drive the mounted tip below its floor.
    BelowTipFloor { z: f64, floor: f64 },
    IswapNotParked,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Violation::AxisOutOfRange { axis, value, min, max } => write!(
                f,
                "{} = {} mm outside [{}, {}]",
                axis, value, min, max
            ),
            Violation::ChannelSpacing { back, front, distance } => write!(
                f,
                "channels {} and {} would be {:.2} mm apart, minimum is {} mm",
                back, front, distance, MIN_CHANNEL_SPACING
            ),
            Violation::OutOfReach { channel, y, min, max } => write!(
                f,
                "channel {} cannot reach y = {} mm, its window is [{:.1}, {:.1}]",
                channel, y, min, max
            ),
            Violation::BelowTipFloor { z, floor } => write!(
                f,
                "z = {} mm is below the mounted tip's floor of {:.2} mm",
                z, floor
            ),
            Violation::IswapNotParked => write!(f, "iSWAP is not in its parked position"),
        }
    }
}

/// One or more safety violations; nothing was sent to the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyError {
    pub violations: Vec<Violation>,
}

impl std::error::Error for SafetyError {}

impl fmt::Display for SafetyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "safety violation: ")?;
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

impl SafetyError {
    fn from_violations(violations: Vec<Violation>) -> Result<(), SafetyError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SafetyError { violations })
        }
    }
}

/// Y window channel `i` of `n` can physically reach. Channels in front
/// of it limit the front end, channels behind it the back end.
pub fn reach_window(channel: usize, num_channels: usize) -> (f64, f64) {
    let min = CHANNEL_Y_MIN + CHANNEL_REACH_PITCH * (num_channels - 1 - channel) as f64;
    let max = CHANNEL_Y_MAX - CHANNEL_REACH_PITCH * channel as f64;
    (min, max)
}

/// Validate and, with `make_space`, repair a set of simultaneous channel
/// Y moves. `current` holds every channel's present Y back to front;
/// `moves` are `(channel, y)` targets. Returns the full resulting Y
/// vector. Channels not listed in `moves` may be shifted by the minimum
/// delta needed when `make_space` is set; otherwise any conflict fails.
pub fn plan_channel_y(
    current: &[f64],
    moves: &[(usize, f64)],
    make_space: bool,
) -> Result<Vec<f64>, SafetyError> {
    let n = current.len();
    let mut desired = current.to_vec();
    let mut is_target = vec![false; n];
    let mut violations = Vec::new();

    for (channel, y) in moves {
        let (min, max) = reach_window(*channel, n);
        if *y < min - Y_TOLERANCE || *y > max + Y_TOLERANCE {
            violations.push(Violation::OutOfReach {
                channel: *channel,
                y: *y,
                min,
                max,
            });
            continue;
        }
        desired[*channel] = *y;
        is_target[*channel] = true;
    }
    if !violations.is_empty() {
        return Err(SafetyError { violations });
    }

    if make_space {
        // Push untargeted channels backward, then forward, so targets
        // stay exactly where the caller put them.
        for i in (0..n.saturating_sub(1)).rev() {
            if !is_target[i] && desired[i] < desired[i + 1] + MIN_CHANNEL_SPACING {
                desired[i] = desired[i + 1] + MIN_CHANNEL_SPACING;
            }
        }
        for i in 1..n {
            if !is_target[i] && desired[i] > desired[i - 1] - MIN_CHANNEL_SPACING {
                desired[i] = desired[i - 1] - MIN_CHANNEL_SPACING;
            }
        }
    }

    for i in 0..n {
        let (min, max) = reach_window(i, n);
        if desired[i] < min - Y_TOLERANCE || desired[i] > max + Y_TOLERANCE {
            violations.push(Violation::OutOfReach {
                channel: i,
                y: desired[i],
                min,
                max,
            });
        }
    }
    for i in 1..n {
        let distance = desired[i - 1] - desired[i];
        if distance < MIN_CHANNEL_SPACING - Y_TOLERANCE {
            violations.push(Violation::ChannelSpacing {
                back: i - 1,
                front: i,
                distance,
            });
        }
    }

    SafetyError::from_violations(violations).map(|_| desired)
}

/// The commanded A1 position of the 96 head must stay inside its box.
/// All out-of-range components are reported at once.
pub fn check_head96_position(x: f64, y: f64, z: f64) -> Result<(), SafetyError> {
    let mut violations = Vec::new();
    for (axis, value, min, max) in [
        ('x', x, HEAD96_X_MIN, HEAD96_X_MAX),
        ('y', y, HEAD96_Y_MIN, HEAD96_Y_MAX),
        ('z', z, HEAD96_Z_MIN, HEAD96_Z_MAX),
    ] {
        if value < min || value > max {
            violations.push(Violation::AxisOutOfRange { axis, value, min, max });
        }
    }
    SafetyError::from_violations(violations)
}

/// Head-space Z window for a pipetting channel.
pub fn check_channel_z(z: f64) -> Result<(), SafetyError> {
    if z < CHANNEL_Z_MIN || z > CHANNEL_Z_MAX {
        return Err(SafetyError {
            violations: vec![Violation::AxisOutOfRange {
                axis: 'z',
                value: z,
                min: CHANNEL_Z_MIN,
                max: CHANNEL_Z_MAX,
            }],
        });
    }
    Ok(())
}

/// Tip-space Z floor: with a tip mounted, the tip end must not be driven
/// below the head-space floor minus the part of the tip that sticks out.
/// Enforced before every liquid-detection probe.
pub fn check_tip_space_z(z: f64, tip: &Tip) -> Result<(), SafetyError> {
    let floor = tip.z_floor(CHANNEL_Z_MIN);
    if z < floor {
        return Err(SafetyError {
            violations: vec![Violation::BelowTipFloor { z, floor }],
        });
    }
    Ok(())
}

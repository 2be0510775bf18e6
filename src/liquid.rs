// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Liquid classes: the per-(tip, liquid) parameter bundles the pipetting
//! encoders substitute when the caller does not override them.

/// Hardware dispense mode as the boolean trio callers think in. The
/// firmware integer 0..4 is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispenseMode {
    /// Dispense from above the liquid at high speed.
    pub jet: bool,
    /// Append the blow-out air volume after the liquid.
    pub blow_out: bool,
    /// Empty the tip completely regardless of tracked volume.
    pub empty: bool,
}

impl DispenseMode {
    pub fn code(self) -> u8 {
        if self.empty {
            4
        } else if self.jet {
            if self.blow_out {
                1
            } else {
                0
            }
        } else if self.blow_out {
            3
        } else {
            2
        }
    }
}

/// A per-(tip, liquid, jet, blow-out) bundle of flow rates, timings and a
/// volume-correction curve. Tables of these live outside the crate; the
/// encoders only read them.
#[derive(Debug, Clone)]
pub struct LiquidClass {
    pub name: String,
    /// µL/s
    pub aspiration_flow_rate: f64,
    /// µL/s
    pub dispense_flow_rate: f64,
    /// µL
    pub blow_out_air_volume: f64,
    /// s
    pub settling_time: f64,
    /// mm/s, speed of the Z swap move out of the liquid
    pub swap_speed: f64,
    /// mm retracted when a clot is detected
    pub clot_retract_height: f64,
    /// (nominal, corrected) pairs sorted by nominal volume, µL
    correction_curve: Vec<(f64, f64)>,
}

impl LiquidClass {
    pub fn new(name: impl Into<String>) -> LiquidClass {
        LiquidClass {
            name: name.into(),
            aspiration_flow_rate: 100.0,
            dispense_flow_rate: 120.0,
            blow_out_air_volume: 0.0,
            settling_time: 0.5,
            swap_speed: 2.0,
            clot_retract_height: 0.0,
            correction_curve: Vec::new(),
        }
    }

    pub fn with_correction_curve(mut self, mut points: Vec<(f64, f64)>) -> LiquidClass {
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite volumes"));
        self.correction_curve = points;
        self
    }

    /// Map a nominal volume through the piecewise-linear correction
    /// curve. Outside the curve the nearest segment's ratio extends.
    pub fn correct_volume(&self, nominal: f64) -> f64 {
        let curve = &self.correction_curve;
        if curve.is_empty() {
            return nominal;
        }
        if curve.len() == 1 || nominal <= curve[0].0 {
            let (n, c) = curve[0];
            return if n > 0.0 { nominal * c / n } else { nominal };
        }
        let (last_n, last_c) = curve[curve.len() - 1];
        if nominal >= last_n {
            return if last_n > 0.0 { nominal * last_c / last_n } else { nominal };
        }
        for window in curve.windows(2) {
            let (n0, c0) = window[0];
            let (n1, c1) = window[1];
            if nominal >= n0 && nominal <= n1 {
                let t = (nominal - n0) / (n1 - n0);
                return c0 + t * (c1 - c0);
            }
        }
        nominal
    }
}

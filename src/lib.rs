// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate provides the core driver layer for two laboratory
//! instruments on serial links: the Hamilton Microlab STAR pipetting
//! robot and the Thermo Cytomat plate carousel.
//!
//! Typed operations are validated against the hardware safety rules,
//! encoded into the instruments' telegram formats, sent with per-verb
//! timeouts and a retry ladder, and decoded back into typed results.
//! Tip, volume and plate state is tracked two-phase: staged before the
//! wire call, committed on success, rolled back on failure, with
//! per-channel partial commits when only some channels fail.
//!
//! One driver owns one serial connection; everything serializes through
//! `&mut self`, matching the one-command-in-flight protocol.
//!
//! # Examples
//! ```no_run
//! # use mlstar::constant::STAR_BAUD;
//! # use mlstar::resources::{Coordinate, Tip, TipSpot};
//! # use mlstar::serial;
//! # use mlstar::star::Star;
//! # use mlstar::transport::{Framing, Options};
//!
//! # fn main() {
//!     let options = Options::new("/dev/ttyUSB0", STAR_BAUD, Framing::UntilQuiet);
//!     let transport = serial::Transport::connect(options).unwrap();
//!     let mut star = match Star::new(transport) {
//!         Ok(star) => star,
//!         Err(e) => {
//!             println!("{}", e);
//!             return;
//!         }
//!     };
//!
//!     let spot = TipSpot::new(
//!         "A1",
//!         Coordinate::new(117.9, 145.8, 164.45),
//!         Some(Tip::standard_volume_filter()),
//!     );
//!
//!     match star.pick_up_tips(&[&spot], &[0]) {
//!         Ok(()) => println!("channel 0 has a tip"),
//!         Err(e) => println!("error: {}", e),
//!     }
//! # }
//! ```
pub mod codec;
pub mod constant;
pub mod cytomat;
pub mod error;
pub mod liquid;
pub mod resources;
pub mod safety;
pub mod serial;
pub mod star;
pub mod tracker;
pub mod transport;

// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Autoload operations: carrier loading, presence scans, barcode
//! reading and the loading-tray LEDs.
//!
//! The autoload serves 54 equally spaced deck rails. Presence scans
//! return a hex bitmask where bit `n` (from the least significant end)
//! stands for rail `n + 1`.

use bitflags::bitflags;
use crate::codec::Command;
use crate::constant::NUM_RAILS;
use crate::error::Error;
use crate::transport::Transport;

use super::Star;

bitflags! {
    /// Barcode symbologies the autoload reader will accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Symbology: u8 {
        const ISBT = 1 << 0;
        const CODE128 = 1 << 1;
        const CODE39 = 1 << 2;
        const CODABAR = 1 << 3;
        const I2OF5 = 1 << 4;
        const UPC = 1 << 5;
        const EAN8 = 1 << 6;
    }
}

/// A successfully read barcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barcode(pub String);

/// Scan direction over the barcode window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    Horizontal = 0,
    Vertical = 1,
}

/// Rails flagged in a presence bitmask, 1-based, ascending.
pub fn rails_from_mask(mask: u64) -> Vec<u8> {
    (0..NUM_RAILS)
        .filter(|rail| mask & (1u64 << rail) != 0)
        .map(|rail| rail + 1)
        .collect()
}

fn check_rail(rail: u8) -> Result<(), Error> {
    if rail == 0 || rail > NUM_RAILS {
        return Err(Error::InvalidInput(format!(
            "rail {} outside 1..{}",
            rail, NUM_RAILS
        )));
    }
    Ok(())
}

/// `00` in a barcode reply means the window held no readable code.
fn parse_barcode_reply(field: &str) -> Result<Vec<Option<Barcode>>, Error> {
    let mut parts = field.split('/');
    match parts.next() {
        Some("bb") => {}
        _ => {
            return Err(Error::Protocol(format!(
                "barcode reply does not start with bb: '{}'",
                field
            )))
        }
    }
    Ok(parts
        .map(|code| {
            if code == "00" || code.is_empty() {
                None
            } else {
                Some(Barcode(code.to_string()))
            }
        })
        .collect())
}

impl<T: Transport> Star<T> {
    fn require_autoload(&self) -> Result<(), Error> {
        if !self.autoload_installed {
            return Err(Error::State("no autoload installed".to_string()));
        }
        Ok(())
    }

    /// Home the autoload sled.
    pub fn initialize_autoload(&mut self) -> Result<(), Error> {
        self.require_autoload()?;
        self.ensure_iswap_parked()?;
        self.send(&Command::new("I0", "CI"), "").map(|_| ())
    }

    /// Pull the carrier presented at the loading tray onto the deck at
    /// the given rail.
    pub fn load_carrier(&mut self, rail: u8) -> Result<(), Error> {
        self.require_autoload()?;
        check_rail(rail)?;
        self.ensure_iswap_parked()?;
        let cmd = Command::new("I0", "CO").int("cp", rail as i64, 2);
        self.send(&cmd, "").map(|_| ())
    }

    /// Push the carrier at the given rail back out onto the loading
    /// tray.
    pub fn unload_carrier(&mut self, rail: u8) -> Result<(), Error> {
        self.require_autoload()?;
        check_rail(rail)?;
        self.ensure_iswap_parked()?;
        let cmd = Command::new("I0", "CU").int("cp", rail as i64, 2);
        self.send(&cmd, "").map(|_| ())
    }

    /// Which deck rails currently carry something.
    pub fn scan_deck_presence(&mut self) -> Result<Vec<u8>, Error> {
        self.require_autoload()?;
        self.ensure_iswap_parked()?;
        let reply = self.send(&Command::new("I0", "CS"), "cm**************")?;
        Ok(rails_from_mask(reply.hex("cm")?))
    }

    /// Move the sled along the loading tray and report its occupancy
    /// with the same mask convention as the deck scan.
    pub fn scan_loading_tray(&mut self) -> Result<Vec<u8>, Error> {
        self.require_autoload()?;
        self.ensure_iswap_parked()?;
        let reply = self.send(&Command::new("I0", "CT"), "ct**************")?;
        Ok(rails_from_mask(reply.hex("ct")?))
    }

    /// Read the barcodes of `num_containers` containers on the carrier
    /// at the given rail. Unreadable windows come back as `None`, so the
    /// result always holds `num_containers` entries in carrier order.
    pub fn read_carrier_barcodes(
        &mut self,
        rail: u8,
        num_containers: u8,
        window_width: f64,
        direction: ScanDirection,
        symbologies: Symbology,
    ) -> Result<Vec<Option<Barcode>>, Error> {
        self.require_autoload()?;
        check_rail(rail)?;
        self.ensure_iswap_parked()?;
        let cmd = Command::new("I0", "CL")
            .int("cp", rail as i64, 2)
            .int("cn", num_containers as i64, 2)
            .int("cw", crate::codec::tenths(window_width), 4)
            .int("cd", direction as i64, 1)
            .hex("cb", symbologies.bits() as u64, 2);
        let reply = self.send(&cmd, "bc&")?;
        let codes = parse_barcode_reply(reply.text("bc")?)?;
        if codes.len() != num_containers as usize {
            return Err(Error::Protocol(format!(
                "expected {} barcode windows, reply held {}",
                num_containers,
                codes.len()
            )));
        }
        Ok(codes)
    }

    /// Drive the loading tray LEDs: one 54-bit pattern for on/off, one
    /// for blink/steady, both with bit `n` standing for rail `n + 1`.
    pub fn set_loading_indicators(&mut self, on: u64, blink: u64) -> Result<(), Error> {
        self.require_autoload()?;
        let rail_mask = (1u64 << NUM_RAILS) - 1;
        let cmd = Command::new("I0", "CE")
            .hex("cl", on & rail_mask, 14)
            .hex("cb", blink & rail_mask, 14);
        self.send(&cmd, "").map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::star_with;
    use super::*;

    #[test]
    fn test_rails_from_mask_lsb_is_rail_one() {
        assert_eq!(rails_from_mask(0b1), vec![1]);
        assert_eq!(rails_from_mask(0b1010), vec![2, 4]);
        assert_eq!(rails_from_mask(1 << 53), vec![54]);
    }

    #[test]
    fn test_rail_bounds() {
        let mut star = star_with(&[]);
        assert!(star.load_carrier(0).is_err());
        assert!(star.load_carrier(55).is_err());
    }

    #[test]
    fn test_barcode_reply_maps_unreadable_to_none() {
        let codes = parse_barcode_reply("bb/ABC123/DEF456/00/XYZ789/00").unwrap();
        assert_eq!(codes.len(), 5);
        assert_eq!(codes[0], Some(Barcode("ABC123".to_string())));
        assert_eq!(codes[2], None);
        assert_eq!(codes[3], Some(Barcode("XYZ789".to_string())));
        assert_eq!(codes[4], None);
    }

    #[test]
    fn test_barcode_scan_round_trip() {
        let mut star = star_with(&["I0CLid####bcbb/ABC123/DEF456/00/XYZ789/00"]);
        let codes = star
            .read_carrier_barcodes(
                5,
                5,
                38.0,
                ScanDirection::Horizontal,
                Symbology::CODE128 | Symbology::CODE39,
            )
            .unwrap();
        assert_eq!(codes.len(), 5);
        assert_eq!(codes[1], Some(Barcode("DEF456".to_string())));
        assert_eq!(codes[2], None);
        // the window width went out in 0.1 mm units
        let sent = star.transport.requests.last().unwrap();
        assert!(sent.contains("cw0380"), "telegram was {}", sent);
    }

    #[test]
    fn test_deck_scan_decodes_rails() {
        // rails 1, 2 and 30 present
        let mut star = star_with(&["I0CSid####cm00000020000003"]);
        let rails = star.scan_deck_presence().unwrap();
        assert_eq!(rails, vec![1, 2, 30]);
    }

    #[test]
    fn test_led_masks_are_truncated_to_rails() {
        let mut star = star_with(&["I0CEid####"]);
        star.set_loading_indicators(u64::MAX, 0).unwrap();
        let sent = star.transport.requests.last().unwrap();
        assert!(sent.contains("cl3FFFFFFFFFFFFF"), "telegram was {}", sent);
    }
}

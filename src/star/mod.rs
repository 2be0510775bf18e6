// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Driver for the STAR liquid handler.
//!
//! One [`Star`] owns one serial connection and the persistent logical
//! state behind it: which channel carries which tip, how much liquid each
//! tip holds, where each tip came from, and whether the iSWAP is parked.
//! State changes are staged before the telegram goes out and committed
//! only on a successful reply; a channelized error commits exactly the
//! channels that did not fail.

pub mod autoload;
pub mod head96;
pub mod iswap;

use crate::codec::{decode, tenth_ul, tenths, Command, IdAllocator, Reply};
use crate::constant::{read_timeout, DEFAULT_RETRIES, POLL_INTERVAL, RETRY_DELAY};
use crate::error::{classify_reply, Error};
use crate::liquid::{DispenseMode, LiquidClass};
use crate::resources::{Container, Coordinate, DeckResource, Plate, Tip, TipSize, TipSpot, Trash};
use crate::safety::{check_tip_space_z, plan_channel_y};
use crate::tracker::{TipTracker, VolumeTracker};
use crate::transport::Transport;
use std::thread;
use std::time::Duration;

/// The channel involvement pattern is always 16 positions wide,
/// regardless of how many channels are installed.
const PATTERN_WIDTH: usize = 16;
/// Default traverse height between operations, mm.
const TRAVERSE_HEIGHT: f64 = 245.0;

/// Liquid level detection mode for an aspiration or dispense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LldMode {
    Off = 0,
    /// Capacitive (cLLD)
    Capacitive = 1,
    /// Pressure-based (pLLD)
    Pressure = 2,
}

impl Default for LldMode {
    fn default() -> Self {
        LldMode::Off
    }
}

/// Persistent state of one pipetting channel. Created at setup per
/// reported channel count, never destroyed.
#[derive(Debug)]
pub struct Channel {
    index: usize,
    tip: TipTracker,
    volume: VolumeTracker,
    /// Name of the tip spot the mounted tip was picked up from.
    origin: Option<String>,
    pending_origin: Option<String>,
    /// Last planned Y, mm. Used for anti-collision planning.
    y: f64,
}

impl Channel {
    fn new(index: usize, y: f64) -> Channel {
        Channel {
            index,
            tip: TipTracker::new(format!("channel {}", index)),
            volume: VolumeTracker::new(format!("tip on channel {}", index), 0.0),
            origin: None,
            pending_origin: None,
            y,
        }
    }

    pub fn has_tip(&self) -> bool {
        self.tip.has_tip()
    }

    pub fn tip(&self) -> Option<&Tip> {
        self.tip.tip()
    }

    /// Volume currently held in the mounted tip, µL.
    pub fn tip_volume(&self) -> f64 {
        self.volume.volume()
    }

    /// Where the mounted tip came from, for return-to-origin drops.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    fn commit(&mut self) {
        self.tip.commit();
        self.volume.commit();
        self.origin = self.pending_origin.clone();
    }

    fn rollback(&mut self) {
        self.tip.rollback();
        self.volume.rollback();
        self.pending_origin = self.origin.clone();
    }

    fn clear(&mut self) {
        self.tip.clear();
        self.volume = VolumeTracker::new(format!("tip on channel {}", self.index), 0.0);
        self.origin = None;
        self.pending_origin = None;
    }
}

/// Extended configuration as reported by the firmware at setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtendedConfiguration {
    /// Left X-drive configuration bit field: bit 1 iSWAP, bit 2 96 head.
    pub xl: u64,
    /// Raw deck width field
    pub xw: u64,
}

/// One per-channel aspiration.
#[derive(Debug)]
pub struct AspirateOp<'a> {
    pub container: &'a Container,
    /// Nominal volume, µL. The wire volume runs through the liquid
    /// class correction curve unless correction is disabled.
    pub volume: f64,
    pub class: &'a LiquidClass,
    pub offset: Coordinate,
    /// Liquid surface height above the container cavity bottom, mm.
    /// Filled in by a cLLD probe when `probe_liquid_height` is set.
    pub liquid_height: Option<f64>,
    /// Positive means deeper into the liquid, negative up out of it.
    pub immersion_depth: f64,
    pub lld: LldMode,
    /// Probe the surface capacitively first and aspirate at the
    /// detected height, bypassing the usual upward traversal.
    pub probe_liquid_height: bool,
    pub flow_rate: Option<f64>,
    pub blow_out_air_volume: Option<f64>,
    pub settling_time: Option<f64>,
    pub swap_speed: Option<f64>,
    pub clot_retract_height: Option<f64>,
}

impl<'a> AspirateOp<'a> {
    pub fn new(container: &'a Container, volume: f64, class: &'a LiquidClass) -> AspirateOp<'a> {
        AspirateOp {
            container,
            volume,
            class,
            offset: Coordinate::default(),
            liquid_height: None,
            immersion_depth: 2.0,
            lld: LldMode::Off,
            probe_liquid_height: false,
            flow_rate: None,
            blow_out_air_volume: None,
            settling_time: None,
            swap_speed: None,
            clot_retract_height: None,
        }
    }
}

/// One per-channel dispense.
#[derive(Debug)]
pub struct DispenseOp<'a> {
    pub container: &'a Container,
    pub volume: f64,
    pub class: &'a LiquidClass,
    pub offset: Coordinate,
    pub liquid_height: Option<f64>,
    pub immersion_depth: f64,
    pub lld: LldMode,
    pub mode: DispenseMode,
    pub flow_rate: Option<f64>,
    pub blow_out_air_volume: Option<f64>,
    pub settling_time: Option<f64>,
    pub swap_speed: Option<f64>,
}

impl<'a> DispenseOp<'a> {
    pub fn new(container: &'a Container, volume: f64, class: &'a LiquidClass) -> DispenseOp<'a> {
        DispenseOp {
            container,
            volume,
            class,
            offset: Coordinate::default(),
            liquid_height: None,
            immersion_depth: 0.0,
            lld: LldMode::Off,
            mode: DispenseMode::default(),
            flow_rate: None,
            blow_out_air_volume: None,
            settling_time: None,
            swap_speed: None,
        }
    }
}

/// Driver for one STAR instrument on one serial connection.
#[derive(Debug)]
pub struct Star<T: Transport> {
    transport: T,
    ids: IdAllocator,
    retries: u32,
    num_channels: usize,
    channels: Vec<Channel>,
    pub(crate) iswap_installed: bool,
    pub(crate) core96_installed: bool,
    pub(crate) autoload_installed: bool,
    pub(crate) iswap_parked: bool,
    pub(crate) held_plate: Option<Plate>,
    pub(crate) held_grip_direction: Option<crate::resources::GripDirection>,
    pub(crate) held_pickup_distance: f64,
    pub(crate) head96_max_y_speed: f64,
    pub(crate) head96_tip: TipTracker,
    pub(crate) head96_volume: VolumeTracker,
    extended_configuration: ExtendedConfiguration,
    /// Shift unlisted channels to make room for listed ones instead of
    /// failing on a spacing conflict.
    pub make_space: bool,
    /// Skip the liquid-class volume correction curve.
    pub disable_volume_correction: bool,
    /// Pause between resends; 5 s on hardware.
    pub retry_delay: Duration,
    /// Busy-bit poll period; 1 s on hardware.
    pub poll_interval: Duration,
}

impl<T: Transport> Star<T> {
    /// Connect-time setup: query the machine and extended configuration,
    /// detect installed modules, initialize, and create the channel
    /// state from the reported channel count.
    pub fn new(mut transport: T) -> Result<Star<T>, Error> {
        let mut ids = IdAllocator::new();

        let machine = exchange(
            &mut transport,
            &mut ids,
            &Command::new("C0", "RM"),
            "kb##kp##",
        )?;
        let kb = machine.int("kb")? as u64;
        let num_channels = machine.int("kp")? as usize;

        let extended = exchange(
            &mut transport,
            &mut ids,
            &Command::new("C0", "QM"),
            "xl**xw****",
        )?;
        let xl = extended.hex("xl")?;

        let mut star = Star {
            transport,
            ids,
            retries: DEFAULT_RETRIES,
            num_channels,
            channels: (0..num_channels)
                .map(|i| Channel::new(i, 600.0 - 9.0 * i as f64))
                .collect(),
            iswap_installed: xl & 0b10 != 0,
            core96_installed: xl & 0b100 != 0,
            autoload_installed: kb & 0b1000 != 0,
            iswap_parked: true,
            held_plate: None,
            held_grip_direction: None,
            held_pickup_distance: 8.0,
            head96_max_y_speed: crate::constant::HEAD96_Y_SPEED_LEGACY,
            head96_tip: TipTracker::new("96 head"),
            head96_volume: VolumeTracker::new("96 head", 0.0),
            extended_configuration: ExtendedConfiguration {
                xl,
                xw: extended.hex("xw")?,
            },
            make_space: true,
            disable_volume_correction: false,
            retry_delay: RETRY_DELAY,
            poll_interval: POLL_INTERVAL,
        };

        star.initialize()?;
        if star.core96_installed {
            star.head96_max_y_speed = head96::query_speed_envelope(&mut star)?;
        }
        Ok(star)
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// The underlying transport, e.g. to inspect a recording mock.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn channel(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn extended_configuration(&self) -> ExtendedConfiguration {
        self.extended_configuration
    }

    pub fn iswap_installed(&self) -> bool {
        self.iswap_installed
    }

    pub fn core96_installed(&self) -> bool {
        self.core96_installed
    }

    pub fn autoload_installed(&self) -> bool {
        self.autoload_installed
    }

    /// Home every drive.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.send(&Command::new("C0", "IN"), "").map(|_| ())
    }

    /// Forget all tracked tip and volume state, e.g. after manual
    /// intervention at the deck.
    pub fn clear_head_state(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
    }

    // # # # # # # # # telegram dispatch # # # # # # # #

    pub(crate) fn send(&mut self, cmd: &Command, fmt: &str) -> Result<Reply, Error> {
        self.send_with_retry(cmd, fmt, true)
    }

    /// `retry = false` is for idempotency-sensitive commands (explicit
    /// moves): resending those can double a motion that half-happened.
    pub(crate) fn send_with_retry(
        &mut self,
        cmd: &Command,
        fmt: &str,
        retry: bool,
    ) -> Result<Reply, Error> {
        let budget = if retry { self.retries } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match exchange(&mut self.transport, &mut self.ids, cmd, fmt) {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    if !is_firmware_error(&err) || attempt >= budget {
                        return Err(err);
                    }
                    log::warn!(
                        "command {}{} failed (attempt {}/{}): {}",
                        cmd.module(),
                        cmd.verb(),
                        attempt,
                        budget,
                        err
                    );
                    thread::sleep(self.retry_delay);
                    if attempt + 1 == budget {
                        self.recover()?;
                    }
                }
            }
        }
    }

    /// Last-resort recovery before the final resend: re-home, wait for
    /// the busy bit, and clear the error register if it is still set.
    fn recover(&mut self) -> Result<(), Error> {
        exchange(&mut self.transport, &mut self.ids, &Command::new("C0", "IN"), "")?;
        loop {
            let reply = exchange(
                &mut self.transport,
                &mut self.ids,
                &Command::new("C0", "QB"),
                "qb#",
            )?;
            if reply.int("qb")? == 0 {
                break;
            }
            thread::sleep(self.poll_interval);
        }
        let register = exchange(
            &mut self.transport,
            &mut self.ids,
            &Command::new("C0", "RE"),
            "ee##",
        )?;
        if register.int("ee")? != 0 {
            exchange(&mut self.transport, &mut self.ids, &Command::new("C0", "RF"), "")?;
        }
        Ok(())
    }

    /// Escape hatch: send a raw `<module><verb><params>` telegram. The
    /// identifier is stamped in; the reply is returned undecoded.
    pub fn send_raw_command(&mut self, raw: &str, timeout: Duration) -> Result<String, Error> {
        if raw.len() < 4 || !raw.is_ascii() {
            return Err(Error::InvalidInput(format!(
                "raw command needs a module and verb prefix: '{}'",
                raw
            )));
        }
        let id = self.ids.advance();
        let telegram = format!("{}id{:04}{}\r\n", &raw[..4], id, &raw[4..]);
        log::debug!("raw --> {}", telegram.trim_end());
        let reply = self.transport.send(telegram.as_bytes(), timeout)?;
        let text = String::from_utf8_lossy(&reply).to_string();
        log::debug!("raw <-- {}", text);
        Ok(text)
    }

    // # # # # # # # # channel queries # # # # # # # #

    /// Which channels report a mounted tip.
    pub fn request_tip_presence(&mut self) -> Result<Vec<bool>, Error> {
        let reply = self.send(&Command::new("C0", "RT"), "rt# (n)")?;
        Ok(reply.ints("rt")?.iter().map(|v| *v != 0).collect())
    }

    /// Head-space Z of one channel, mm.
    pub fn request_z_position(&mut self, channel: usize) -> Result<f64, Error> {
        self.check_channel(channel)?;
        let cmd = Command::new("C0", "RZ").int("pn", channel as i64 + 1, 2);
        let reply = self.send(&cmd, "rz#####")?;
        Ok(reply.int("rz")? as f64 / 10.0)
    }

    // # # # # # # # # channel moves # # # # # # # #

    /// Move one channel on Y. Not retried: a half-executed move must not
    /// be resent blindly.
    pub fn move_channel_y(&mut self, channel: usize, y: f64) -> Result<(), Error> {
        self.check_channel(channel)?;
        self.ensure_iswap_parked()?;
        let planned = self.plan_y(&[(channel, y)])?;
        let cmd = Command::new("C0", "MY")
            .int("pn", channel as i64 + 1, 2)
            .int("yp", tenths(y), 4);
        self.send_with_retry(&cmd, "", false)?;
        self.commit_y(planned);
        Ok(())
    }

    /// Move one channel on Z (head-space). Not retried.
    pub fn move_channel_z(&mut self, channel: usize, z: f64) -> Result<(), Error> {
        self.check_channel(channel)?;
        crate::safety::check_channel_z(z)?;
        if let Some(tip) = self.channels[channel].tip() {
            check_tip_space_z(z - tip.total_tip_length + tip.fitting_depth, tip)?;
        }
        let cmd = Command::new("C0", "MZ")
            .int("pn", channel as i64 + 1, 2)
            .int("zp", tenths(z), 5);
        self.send_with_retry(&cmd, "", false)?;
        Ok(())
    }

    // # # # # # # # # tip handling # # # # # # # #

    /// Pick up one tip per listed channel from the given spots.
    pub fn pick_up_tips(
        &mut self,
        spots: &[&TipSpot],
        use_channels: &[usize],
    ) -> Result<(), Error> {
        self.check_ops(spots.len(), use_channels)?;
        self.ensure_iswap_parked()?;

        let mut tips = Vec::with_capacity(spots.len());
        for spot in spots {
            match spot.tip() {
                Some(tip) => tips.push(tip),
                None => return Err(Error::NoTip(spot.name().to_string())),
            }
        }
        if tips
            .iter()
            .any(|t| tip_type_code(t) != tip_type_code(&tips[0]))
        {
            return Err(Error::InvalidInput(
                "all tips of one pickup must share a tip type".to_string(),
            ));
        }

        let moves: Vec<(usize, f64)> = use_channels
            .iter()
            .zip(spots.iter())
            .map(|(ch, spot)| (*ch, spot.center().y))
            .collect();
        let planned = self.plan_y(&moves)?;

        // Stage: spots empty out, channels mount.
        for (i, (&channel, spot)) in use_channels.iter().zip(spots.iter()).enumerate() {
            if let Err(e) = spot.tracker_mut().remove_tip() {
                self.rollback_pickup(&use_channels[..i], &spots[..i]);
                return Err(e);
            }
            let state = &mut self.channels[channel];
            if let Err(e) = state.tip.add_tip(tips[i].clone()) {
                spot.tracker_mut().rollback();
                self.rollback_pickup(&use_channels[..i], &spots[..i]);
                return Err(e);
            }
            state.pending_origin = Some(spot.name().to_string());
        }

        let cmd = self.tip_command("TP", spots, use_channels, &tips);
        match self.send(&cmd, "") {
            Ok(_) => {
                for (i, (&channel, spot)) in use_channels.iter().zip(spots.iter()).enumerate() {
                    let state = &mut self.channels[channel];
                    state.commit();
                    state.volume = VolumeTracker::new(
                        format!("tip on channel {}", channel),
                        tips[i].maximal_volume,
                    );
                    spot.tracker_mut().commit();
                }
                self.commit_y(planned);
                Ok(())
            }
            Err(Error::Channelized(ch)) => {
                for (&channel, spot) in use_channels.iter().zip(spots.iter()) {
                    let state = &mut self.channels[channel];
                    if ch.errors.contains_key(&channel) {
                        state.rollback();
                        spot.tracker_mut().rollback();
                    } else {
                        let tip = state.tip.tip().cloned();
                        state.commit();
                        if let Some(tip) = tip {
                            state.volume = VolumeTracker::new(
                                format!("tip on channel {}", channel),
                                tip.maximal_volume,
                            );
                        }
                        spot.tracker_mut().commit();
                    }
                }
                Err(Error::Channelized(ch))
            }
            Err(e) => {
                self.rollback_pickup(use_channels, spots);
                Err(e)
            }
        }
    }

    fn rollback_pickup(&mut self, channels: &[usize], spots: &[&TipSpot]) {
        for (&channel, spot) in channels.iter().zip(spots.iter()) {
            self.channels[channel].rollback();
            spot.tracker_mut().rollback();
        }
    }

    /// Return tips to the given spots. Tips must be empty unless
    /// `allow_remaining_volume` is set.
    pub fn drop_tips(
        &mut self,
        spots: &[&TipSpot],
        use_channels: &[usize],
        allow_remaining_volume: bool,
    ) -> Result<(), Error> {
        self.check_ops(spots.len(), use_channels)?;
        self.ensure_iswap_parked()?;

        for (&channel, spot) in use_channels.iter().zip(spots.iter()) {
            let state = &self.channels[channel];
            if !allow_remaining_volume
                && crate::tracker::does_volume_tracking()
                && state.volume.pending_volume() > 1e-6
            {
                return Err(Error::State(format!(
                    "tip on channel {} still holds {}uL; drop to trash or pass \
                     allow_remaining_volume",
                    channel,
                    state.volume.pending_volume()
                )));
            }
            if spot.has_tip() && crate::tracker::does_tip_tracking() {
                return Err(Error::HasTip(spot.name().to_string()));
            }
        }

        let moves: Vec<(usize, f64)> = use_channels
            .iter()
            .zip(spots.iter())
            .map(|(ch, spot)| (*ch, spot.center().y))
            .collect();
        let planned = self.plan_y(&moves)?;

        let mut tips = Vec::with_capacity(spots.len());
        for (i, (&channel, spot)) in use_channels.iter().zip(spots.iter()).enumerate() {
            let removed = match self.channels[channel].tip.remove_tip() {
                Ok(tip) => tip,
                Err(e) => {
                    self.rollback_pickup(&use_channels[..i], &spots[..i]);
                    return Err(e);
                }
            };
            // with tip tracking disabled the mounted type is unknown
            let tip = removed.unwrap_or_else(Tip::standard_volume_filter);
            if let Err(e) = spot.tracker_mut().add_tip(tip.clone()) {
                self.channels[channel].rollback();
                self.rollback_pickup(&use_channels[..i], &spots[..i]);
                return Err(e);
            }
            self.channels[channel].pending_origin = None;
            tips.push(tip);
        }

        let cmd = self.tip_command("TR", spots, use_channels, &tips);
        match self.send(&cmd, "") {
            Ok(_) => {
                for (&channel, spot) in use_channels.iter().zip(spots.iter()) {
                    let state = &mut self.channels[channel];
                    state.commit();
                    state.volume = VolumeTracker::new(format!("tip on channel {}", channel), 0.0);
                    spot.tracker_mut().commit();
                }
                self.commit_y(planned);
                Ok(())
            }
            Err(Error::Channelized(ch)) => {
                for (&channel, spot) in use_channels.iter().zip(spots.iter()) {
                    let state = &mut self.channels[channel];
                    if ch.errors.contains_key(&channel) {
                        state.rollback();
                        spot.tracker_mut().rollback();
                    } else {
                        state.commit();
                        state.volume =
                            VolumeTracker::new(format!("tip on channel {}", channel), 0.0);
                        spot.tracker_mut().commit();
                    }
                }
                Err(Error::Channelized(ch))
            }
            Err(e) => {
                self.rollback_pickup(use_channels, spots);
                Err(e)
            }
        }
    }

    /// Discard tips into the trash. The remaining-volume override is
    /// implicit here.
    pub fn discard_tips(&mut self, trash: &Trash, use_channels: &[usize]) -> Result<(), Error> {
        self.check_ops(use_channels.len(), use_channels)?;
        self.ensure_iswap_parked()?;

        for (i, &channel) in use_channels.iter().enumerate() {
            if let Err(e) = self.channels[channel].tip.remove_tip() {
                for &c in &use_channels[..i] {
                    self.channels[c].rollback();
                }
                return Err(e);
            }
            self.channels[channel].pending_origin = None;
        }

        let location = trash.location();
        let xs = vec![tenths(location.x); use_channels.len()];
        // fan the channels out over the trash in their parked spread
        let ys: Vec<i64> = use_channels
            .iter()
            .map(|ch| tenths(location.y - 9.0 * *ch as f64))
            .collect();
        let cmd = Command::new("C0", "TR")
            .bits("tm", &self.pattern(use_channels))
            .ints("xp", &xs, 5)
            .ints("yp", &ys, 4)
            .int("tp", tenths(location.z + 50.0), 5)
            .int("tz", tenths(location.z), 5)
            .int("th", tenths(TRAVERSE_HEIGHT), 5)
            .int("ti", 1, 1);
        match self.send(&cmd, "") {
            Ok(_) => {
                for &channel in use_channels {
                    let state = &mut self.channels[channel];
                    state.commit();
                    state.volume = VolumeTracker::new(format!("tip on channel {}", channel), 0.0);
                }
                Ok(())
            }
            Err(Error::Channelized(ch)) => {
                for &channel in use_channels {
                    let state = &mut self.channels[channel];
                    if ch.errors.contains_key(&channel) {
                        state.rollback();
                    } else {
                        state.commit();
                        state.volume =
                            VolumeTracker::new(format!("tip on channel {}", channel), 0.0);
                    }
                }
                Err(Error::Channelized(ch))
            }
            Err(e) => {
                for &channel in use_channels {
                    self.channels[channel].rollback();
                }
                Err(e)
            }
        }
    }

    /// The engagement heights go out as shared fields, so they follow
    /// the highest spot of the set. A spot's z reports the collar top
    /// of its seated tip; the channel stops the pickup stroke below it.
    fn tip_command(
        &self,
        verb: &'static str,
        spots: &[&TipSpot],
        use_channels: &[usize],
        tips: &[Tip],
    ) -> Command {
        let xs: Vec<i64> = spots.iter().map(|s| tenths(s.center().x)).collect();
        let ys: Vec<i64> = spots.iter().map(|s| tenths(s.center().y)).collect();
        let tip = &tips[0];
        let max_z = spots.iter().map(|s| s.center().z).fold(f64::MIN, f64::max);
        let correction = tip.tip_size.engagement_correction();
        let begin = max_z + correction;
        let end = begin - crate::constant::TIP_PICKUP_STROKE;
        Command::new("C0", verb)
            .bits("tm", &self.pattern(use_channels))
            .ints("xp", &xs, 5)
            .ints("yp", &ys, 4)
            .int("tt", tip_type_code(tip), 2)
            .int("tp", tenths(begin), 5)
            .int("tz", tenths(end), 5)
            .int("th", tenths(TRAVERSE_HEIGHT), 5)
            .int("td", 0, 1)
    }

    // # # # # # # # # liquid handling # # # # # # # #

    /// Probe the liquid surface capacitively with the listed channels.
    /// Returns the detected surface heights in deck mm.
    pub fn probe_liquid_heights(
        &mut self,
        containers: &[&Container],
        use_channels: &[usize],
    ) -> Result<Vec<f64>, Error> {
        self.check_ops(containers.len(), use_channels)?;
        self.ensure_iswap_parked()?;

        // each probe descends to its own container's cavity bottom in
        // the worst case
        for (&channel, container) in use_channels.iter().zip(containers.iter()) {
            let tip = self.channels[channel]
                .tip
                .tip()
                .ok_or_else(|| Error::NoTip(format!("channel {}", channel)))?;
            check_tip_space_z(container.bottom_z(), tip)?;
        }

        let moves: Vec<(usize, f64)> = use_channels
            .iter()
            .zip(containers.iter())
            .map(|(ch, c)| (*ch, c.center().y))
            .collect();
        let planned = self.plan_y(&moves)?;

        let xs: Vec<i64> = containers.iter().map(|c| tenths(c.center().x)).collect();
        let ys: Vec<i64> = containers.iter().map(|c| tenths(c.center().y)).collect();
        // zm is a shared field; send the deepest point of the set
        let deepest = containers
            .iter()
            .map(|c| c.bottom_z())
            .fold(f64::MIN, f64::max);
        let cmd = Command::new("C0", "ZL")
            .bits("tm", &self.pattern(use_channels))
            .ints("xp", &xs, 5)
            .ints("yp", &ys, 4)
            .int("zm", tenths(deepest), 5)
            .int("th", tenths(TRAVERSE_HEIGHT), 5);
        let reply = self.send(&cmd, "lh#### (n)")?;
        self.commit_y(planned);
        Ok(reply.ints("lh")?.iter().map(|v| *v as f64 / 10.0).collect())
    }

    /// Aspirate per channel. On a channelized error the non-failing
    /// channels and their containers commit; the failing ones roll back.
    pub fn aspirate(
        &mut self,
        ops: &[AspirateOp],
        use_channels: &[usize],
    ) -> Result<(), Error> {
        self.check_ops(ops.len(), use_channels)?;
        self.ensure_iswap_parked()?;

        // Resolve surfaces first: probing talks to the instrument, and
        // nothing must be staged yet if it fails.
        let mut surfaces = Vec::with_capacity(ops.len());
        for (i, op) in ops.iter().enumerate() {
            if op.probe_liquid_height {
                let heights =
                    self.probe_liquid_heights(&[op.container], &[use_channels[i]])?;
                surfaces.push(heights[0]);
            } else {
                let height = op.liquid_height.or_else(|| {
                    op.container
                        .compute_height_from_volume(op.container.volume())
                });
                surfaces.push(op.container.bottom_z() + height.unwrap_or(1.0));
            }
        }

        for (i, op) in ops.iter().enumerate() {
            let channel = use_channels[i];
            let tip = self.channels[channel]
                .tip
                .tip()
                .ok_or_else(|| Error::NoTip(format!("channel {}", channel)))?;
            check_tip_space_z(surfaces[i] - op.immersion_depth, tip)?;
        }

        let moves: Vec<(usize, f64)> = use_channels
            .iter()
            .zip(ops.iter())
            .map(|(ch, op)| (*ch, op.container.center().y + op.offset.y))
            .collect();
        let planned = self.plan_y(&moves)?;

        // Stage the transfer on both sides.
        for (i, op) in ops.iter().enumerate() {
            let channel = use_channels[i];
            let stage = op
                .container
                .tracker_mut()
                .remove(op.volume)
                .and_then(|_| self.channels[channel].volume.add(op.volume));
            if let Err(e) = stage {
                for op in &ops[..=i] {
                    op.container.tracker_mut().rollback();
                }
                for &c in &use_channels[..=i] {
                    self.channels[c].rollback();
                }
                return Err(e);
            }
        }

        let cmd = self.liquid_command("AS", ops, use_channels, &surfaces);
        match self.send(&cmd, "") {
            Ok(_) => {
                for (i, op) in ops.iter().enumerate() {
                    op.container.tracker_mut().commit();
                    self.channels[use_channels[i]].commit();
                }
                self.commit_y(planned);
                Ok(())
            }
            Err(Error::Channelized(ch)) => {
                // Shared containers make per-op commit ambiguous: first
                // roll everything back, then restage only the successes.
                for op in ops {
                    op.container.tracker_mut().rollback();
                }
                for (i, op) in ops.iter().enumerate() {
                    let channel = use_channels[i];
                    if ch.errors.contains_key(&channel) {
                        self.channels[channel].rollback();
                    } else {
                        op.container
                            .tracker_mut()
                            .remove(op.volume)
                            .expect("restaging a volume that fit before");
                        self.channels[channel].commit();
                    }
                }
                for op in ops {
                    op.container.tracker_mut().commit();
                }
                self.commit_y(planned);
                Err(Error::Channelized(ch))
            }
            Err(e) => {
                for (i, op) in ops.iter().enumerate() {
                    op.container.tracker_mut().rollback();
                    self.channels[use_channels[i]].rollback();
                }
                Err(e)
            }
        }
    }

    /// Dispense per channel, with the same partial-commit contract as
    /// [`Star::aspirate`].
    pub fn dispense(
        &mut self,
        ops: &[DispenseOp],
        use_channels: &[usize],
    ) -> Result<(), Error> {
        self.check_ops(ops.len(), use_channels)?;
        self.ensure_iswap_parked()?;

        let mut surfaces = Vec::with_capacity(ops.len());
        for op in ops {
            let height = op.liquid_height.or_else(|| {
                op.container
                    .compute_height_from_volume(op.container.volume())
            });
            surfaces.push(op.container.bottom_z() + height.unwrap_or(1.0));
        }

        for (i, op) in ops.iter().enumerate() {
            let channel = use_channels[i];
            let tip = self.channels[channel]
                .tip
                .tip()
                .ok_or_else(|| Error::NoTip(format!("channel {}", channel)))?;
            check_tip_space_z(surfaces[i] - op.immersion_depth, tip)?;
        }

        let moves: Vec<(usize, f64)> = use_channels
            .iter()
            .zip(ops.iter())
            .map(|(ch, op)| (*ch, op.container.center().y + op.offset.y))
            .collect();
        let planned = self.plan_y(&moves)?;

        for (i, op) in ops.iter().enumerate() {
            let channel = use_channels[i];
            let stage = self.channels[channel]
                .volume
                .remove(op.volume)
                .and_then(|_| op.container.tracker_mut().add(op.volume));
            if let Err(e) = stage {
                for op in &ops[..=i] {
                    op.container.tracker_mut().rollback();
                }
                for &c in &use_channels[..=i] {
                    self.channels[c].rollback();
                }
                return Err(e);
            }
        }

        let cmd = self.dispense_command(ops, use_channels, &surfaces);
        match self.send(&cmd, "") {
            Ok(_) => {
                for (i, op) in ops.iter().enumerate() {
                    op.container.tracker_mut().commit();
                    self.channels[use_channels[i]].commit();
                }
                self.commit_y(planned);
                Ok(())
            }
            Err(Error::Channelized(ch)) => {
                for op in ops {
                    op.container.tracker_mut().rollback();
                }
                for (i, op) in ops.iter().enumerate() {
                    let channel = use_channels[i];
                    if ch.errors.contains_key(&channel) {
                        self.channels[channel].rollback();
                    } else {
                        op.container
                            .tracker_mut()
                            .add(op.volume)
                            .expect("restaging a volume that fit before");
                        self.channels[channel].commit();
                    }
                }
                for op in ops {
                    op.container.tracker_mut().commit();
                }
                self.commit_y(planned);
                Err(Error::Channelized(ch))
            }
            Err(e) => {
                for (i, op) in ops.iter().enumerate() {
                    op.container.tracker_mut().rollback();
                    self.channels[use_channels[i]].rollback();
                }
                Err(e)
            }
        }
    }

    fn liquid_command(
        &self,
        verb: &'static str,
        ops: &[AspirateOp],
        use_channels: &[usize],
        surfaces: &[f64],
    ) -> Command {
        let xs: Vec<i64> = ops
            .iter()
            .map(|op| tenths(op.container.center().x + op.offset.x))
            .collect();
        let ys: Vec<i64> = ops
            .iter()
            .map(|op| tenths(op.container.center().y + op.offset.y))
            .collect();
        let volumes: Vec<i64> = ops
            .iter()
            .map(|op| {
                let v = if self.disable_volume_correction {
                    op.volume
                } else {
                    op.class.correct_volume(op.volume)
                };
                tenth_ul(v)
            })
            .collect();
        let surfaces_wire: Vec<i64> = surfaces.iter().map(|s| tenths(*s)).collect();
        let immersion: Vec<i64> = ops.iter().map(|op| tenths(op.immersion_depth)).collect();
        let flow: Vec<i64> = ops
            .iter()
            .map(|op| tenth_ul(op.flow_rate.unwrap_or(op.class.aspiration_flow_rate)))
            .collect();
        let blow_out: Vec<i64> = ops
            .iter()
            .map(|op| {
                tenth_ul(
                    op.blow_out_air_volume
                        .unwrap_or(op.class.blow_out_air_volume),
                )
            })
            .collect();
        let settling: Vec<i64> = ops
            .iter()
            .map(|op| (op.settling_time.unwrap_or(op.class.settling_time) * 10.0).round() as i64)
            .collect();
        let swap: Vec<i64> = ops
            .iter()
            .map(|op| tenths(op.swap_speed.unwrap_or(op.class.swap_speed)))
            .collect();
        let clot: Vec<i64> = ops
            .iter()
            .map(|op| {
                tenths(
                    op.clot_retract_height
                        .unwrap_or(op.class.clot_retract_height),
                )
            })
            .collect();
        let lld: Vec<i64> = ops.iter().map(|op| op.lld as i64).collect();

        Command::new("C0", verb)
            .bits("tm", &self.pattern(use_channels))
            .ints("xp", &xs, 5)
            .ints("yp", &ys, 4)
            .ints("av", &volumes, 5)
            .ints("ls", &surfaces_wire, 5)
            .ints("ip", &immersion, 4)
            .ints("lm", &lld, 1)
            .ints("fr", &flow, 5)
            .ints("ba", &blow_out, 5)
            .ints("se", &settling, 3)
            .ints("ss", &swap, 4)
            .ints("cr", &clot, 4)
            .int("th", tenths(TRAVERSE_HEIGHT), 5)
    }

    fn dispense_command(
        &self,
        ops: &[DispenseOp],
        use_channels: &[usize],
        surfaces: &[f64],
    ) -> Command {
        let xs: Vec<i64> = ops
            .iter()
            .map(|op| tenths(op.container.center().x + op.offset.x))
            .collect();
        let ys: Vec<i64> = ops
            .iter()
            .map(|op| tenths(op.container.center().y + op.offset.y))
            .collect();
        let volumes: Vec<i64> = ops
            .iter()
            .map(|op| {
                let v = if self.disable_volume_correction {
                    op.volume
                } else {
                    op.class.correct_volume(op.volume)
                };
                tenth_ul(v)
            })
            .collect();
        let surfaces_wire: Vec<i64> = surfaces.iter().map(|s| tenths(*s)).collect();
        let modes: Vec<i64> = ops.iter().map(|op| op.mode.code() as i64).collect();
        let flow: Vec<i64> = ops
            .iter()
            .map(|op| tenth_ul(op.flow_rate.unwrap_or(op.class.dispense_flow_rate)))
            .collect();
        let blow_out: Vec<i64> = ops
            .iter()
            .map(|op| {
                tenth_ul(
                    op.blow_out_air_volume
                        .unwrap_or(op.class.blow_out_air_volume),
                )
            })
            .collect();
        let settling: Vec<i64> = ops
            .iter()
            .map(|op| (op.settling_time.unwrap_or(op.class.settling_time) * 10.0).round() as i64)
            .collect();
        let swap: Vec<i64> = ops
            .iter()
            .map(|op| tenths(op.swap_speed.unwrap_or(op.class.swap_speed)))
            .collect();
        let lld: Vec<i64> = ops.iter().map(|op| op.lld as i64).collect();

        Command::new("C0", "DS")
            .bits("tm", &self.pattern(use_channels))
            .ints("xp", &xs, 5)
            .ints("yp", &ys, 4)
            .ints("dv", &volumes, 5)
            .ints("dm", &modes, 1)
            .ints("ls", &surfaces_wire, 5)
            .ints("lm", &lld, 1)
            .ints("fr", &flow, 5)
            .ints("ba", &blow_out, 5)
            .ints("se", &settling, 3)
            .ints("ss", &swap, 4)
            .int("th", tenths(TRAVERSE_HEIGHT), 5)
    }

    // # # # # # # # # shared helpers # # # # # # # #

    pub(crate) fn pattern(&self, use_channels: &[usize]) -> Vec<bool> {
        let mut bits = vec![false; PATTERN_WIDTH];
        for &channel in use_channels {
            bits[channel] = true;
        }
        bits
    }

    fn check_channel(&self, channel: usize) -> Result<(), Error> {
        if channel >= self.num_channels {
            return Err(Error::InvalidInput(format!(
                "channel {} does not exist, instrument has {}",
                channel, self.num_channels
            )));
        }
        Ok(())
    }

    fn check_ops(&self, num_ops: usize, use_channels: &[usize]) -> Result<(), Error> {
        if num_ops != use_channels.len() {
            return Err(Error::InvalidInput(format!(
                "got {} operations for {} channels",
                num_ops,
                use_channels.len()
            )));
        }
        if use_channels.is_empty() {
            return Err(Error::InvalidInput("no channels listed".to_string()));
        }
        for &channel in use_channels {
            self.check_channel(channel)?;
        }
        let mut sorted = use_channels.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != use_channels.len() {
            return Err(Error::InvalidInput(
                "a channel is listed more than once".to_string(),
            ));
        }
        Ok(())
    }

    fn plan_y(&self, moves: &[(usize, f64)]) -> Result<Vec<f64>, Error> {
        let current: Vec<f64> = self.channels.iter().map(|c| c.y).collect();
        Ok(plan_channel_y(&current, moves, self.make_space)?)
    }

    fn commit_y(&mut self, planned: Vec<f64>) {
        for (channel, y) in self.channels.iter_mut().zip(planned) {
            channel.y = y;
        }
    }

    /// Channel, head and autoload motion requires the iSWAP out of the
    /// work envelope; park it first when it is not.
    pub(crate) fn ensure_iswap_parked(&mut self) -> Result<(), Error> {
        if !self.iswap_installed || self.iswap_parked {
            return Ok(());
        }
        iswap::park(self)
    }
}

fn tip_type_code(tip: &Tip) -> i64 {
    match tip.tip_size {
        TipSize::Low => 1,
        TipSize::Standard => 2,
        TipSize::High => 3,
        TipSize::Xl => 4,
    }
}

/// Channelized errors are not retried: some channels succeeded, and
/// resending the whole telegram would repeat their work. The caller
/// gets the partial result instead.
fn is_firmware_error(err: &Error) -> bool {
    matches!(err, Error::Firmware(_) | Error::FirmwareMap(_))
}

/// One raw write-then-read exchange with id stamping and checking.
/// Retry and recovery live a level above in [`Star::send_with_retry`].
fn exchange<T: Transport>(
    transport: &mut T,
    ids: &mut IdAllocator,
    cmd: &Command,
    fmt: &str,
) -> Result<Reply, Error> {
    let id = ids.advance();
    let telegram = format!("{}\r\n", cmd.build(id));
    log::debug!("--> {}", telegram.trim_end());
    let raw = transport.send(telegram.as_bytes(), read_timeout(cmd.verb()))?;
    let text = String::from_utf8_lossy(&raw).to_string();
    log::debug!("<-- {}", text);

    if let Some(err) = classify_reply(&text) {
        return Err(err);
    }
    let reply = decode(&text, fmt)?;
    if reply.id != id {
        return Err(Error::Protocol(format!(
            "reply id {:04} does not match request id {:04}: '{}'",
            reply.id, id, text
        )));
    }
    Ok(reply)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::Transport as Exchange;
    use std::collections::VecDeque;

    /// Replays scripted replies and records every request.
    #[derive(Debug)]
    pub(crate) struct MockTransport {
        pub requests: Vec<String>,
        pub replies: VecDeque<Vec<u8>>,
    }

    impl MockTransport {
        pub fn new(replies: &[&str]) -> MockTransport {
            MockTransport {
                requests: Vec::new(),
                replies: replies.iter().map(|r| r.as_bytes().to_vec()).collect(),
            }
        }

        /// Standard setup dialogue: 8 channels, iSWAP + 96 head +
        /// autoload installed, 2023 head firmware.
        pub fn with_setup(extra: &[&str]) -> MockTransport {
            let mut replies = vec![
                "C0RMid0001kb11kp08".to_string(),
                "C0QMid0002xl06xw1F40".to_string(),
                "C0INid0003".to_string(),
                "H0EVid0004ev20230101".to_string(),
            ];
            let mut id = 5;
            for reply in extra {
                // scripted replies get sequential ids stamped in
                replies.push(reply.replace("id####", &format!("id{:04}", id)));
                id += 1;
            }
            MockTransport::new(&replies.iter().map(|s| s.as_str()).collect::<Vec<_>>())
        }
    }

    impl Exchange for MockTransport {
        fn send(&mut self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, Error> {
            self.requests
                .push(String::from_utf8_lossy(request).trim_end().to_string());
            match self.replies.pop_front() {
                Some(reply) if reply.is_empty() => Err(Error::NoResponse),
                Some(reply) => Ok(reply),
                None => Err(Error::NoResponse),
            }
        }
    }

    pub(crate) fn star_with(extra: &[&str]) -> Star<MockTransport> {
        Star::new(MockTransport::with_setup(extra)).expect("setup dialogue")
    }

    #[test]
    fn test_setup_detects_modules() {
        let star = star_with(&[]);
        assert_eq!(star.num_channels(), 8);
        assert!(star.iswap_installed());
        assert!(star.core96_installed());
        assert!(star.autoload_installed());
        assert_eq!(star.head96_max_y_speed, crate::constant::HEAD96_Y_SPEED_CURRENT);
    }

    #[test]
    fn test_id_mismatch_is_protocol_error() {
        // Setup sends RM with id0001 but the reply echoes id0002.
        let err = Star::new(MockTransport::new(&["C0RMid0002kb11kp08"])).unwrap_err();
        match err {
            Error::Protocol(msg) => assert!(msg.contains("id")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_no_response_surfaces() {
        let err = Star::new(MockTransport::new(&[])).unwrap_err();
        assert!(matches!(err, Error::NoResponse));
    }

    #[test]
    fn test_tip_presence_query() {
        let mut star = star_with(&["C0RTid####rt1 1 0 1 1 1 1 1"]);
        let presence = star.request_tip_presence().unwrap();
        assert_eq!(
            presence,
            vec![true, true, false, true, true, true, true, true]
        );
    }

    #[test]
    fn test_aspirate_dispense_volume_accounting() {
        let mut star = star_with(&["C0TPid####", "C0ASid####", "C0DSid####"]);

        let spot = TipSpot::new(
            "A1",
            Coordinate::new(117.9, 600.0, 164.45),
            Some(Tip::standard_volume_filter()),
        );
        star.pick_up_tips(&[&spot], &[0]).unwrap();

        let class = LiquidClass::new("water");
        let source = Container::new(
            "src",
            Coordinate::new(245.5, 595.5, 100.0),
            (9.0, 9.0, 10.0),
            400.0,
        );
        source.set_volume(200.0);
        star.aspirate(&[AspirateOp::new(&source, 100.0, &class)], &[0])
            .unwrap();
        assert_eq!(star.channel(0).tip_volume(), 100.0);
        assert_eq!(source.volume(), 100.0);

        let destination = Container::new(
            "dst",
            Coordinate::new(300.0, 595.5, 100.0),
            (9.0, 9.0, 10.0),
            400.0,
        );
        star.dispense(&[DispenseOp::new(&destination, 40.0, &class)], &[0])
            .unwrap();
        assert_eq!(star.channel(0).tip_volume(), 60.0);
        assert_eq!(destination.volume(), 40.0);

        // over-dispense fails before any wire traffic and changes nothing
        let sent = star.transport.requests.len();
        let err = star
            .dispense(&[DispenseOp::new(&destination, 100.0, &class)], &[0])
            .unwrap_err();
        assert!(matches!(err, Error::TooLittleLiquid(_)));
        assert_eq!(star.transport.requests.len(), sent);
        assert_eq!(star.channel(0).tip_volume(), 60.0);
        assert_eq!(destination.volume(), 40.0);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mut star = star_with(&["C0INid####", "C0INid####"]);
        star.initialize().unwrap();
        star.initialize().unwrap();
        assert_eq!(star.num_channels(), 8);
        assert!(!star.channel(0).has_tip());
    }

    #[test]
    fn test_out_of_range_move_sends_nothing() {
        let mut star = star_with(&[]);
        let sent_before = star.transport.requests.len();
        let err = star.move_channel_y(0, 700.0).unwrap_err();
        assert!(matches!(err, Error::Safety(_)));
        assert_eq!(star.transport.requests.len(), sent_before);
    }

    #[test]
    fn test_channel_z_below_head_floor_rejected() {
        let mut star = star_with(&[]);
        let err = star.move_channel_z(0, 99.0).unwrap_err();
        assert!(matches!(err, Error::Safety(_)));
    }
}

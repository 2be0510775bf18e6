// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Driver for the Cytomat plate carousel.
//!
//! The telegram format is `<cmd>:<verb> <params>` with a model-specific
//! terminator. Action commands answer `ok <hex>` with the overview
//! register as payload, check commands echo their verb, and `er <code>`
//! routes to the error decoder. Every high-level move waits for the
//! busy bit before and after.

pub mod inventory;

use crate::constant::{DEFAULT_RETRIES, POLL_INTERVAL, RETRY_DELAY};
use crate::error::{CytomatError, Error};
use crate::transport::Transport;
use bitflags::bitflags;
use std::path::Path;
use std::thread;
use std::time::Duration;

use inventory::{CytomatPlate, Inventory, RackType, StorageLocation};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Supported carousel models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    C6000,
    C6002,
    C2C425,
    C2C450Shake,
}

/// What a model can do besides store plates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub incubate: bool,
    pub cool: bool,
    pub shake: bool,
}

impl Model {
    pub fn as_str(self) -> &'static str {
        match self {
            Model::C6000 => "C6000",
            Model::C6002 => "C6002",
            Model::C2C425 => "C2C_425",
            Model::C2C450Shake => "C2C_450_SHAKE",
        }
    }

    /// One model speaks bare-CR telegrams, the rest CR LF.
    pub fn terminator(self) -> &'static str {
        match self {
            Model::C2C425 => "\r",
            _ => "\r\n",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            Model::C6000 => Capabilities { incubate: true, cool: false, shake: false },
            Model::C6002 => Capabilities { incubate: false, cool: true, shake: false },
            Model::C2C425 => Capabilities { incubate: false, cool: true, shake: false },
            Model::C2C450Shake => Capabilities { incubate: true, cool: true, shake: true },
        }
    }

    /// Factory rack fit per model.
    pub fn default_racks(self) -> Vec<RackType> {
        const MT: RackType = RackType { num_slots: 21, pitch: 23.0 };
        const MT24: RackType = RackType { num_slots: 24, pitch: 23.0 };
        const DW: RackType = RackType { num_slots: 10, pitch: 50.0 };
        const SHAKER: RackType = RackType { num_slots: 8, pitch: 44.0 };
        match self {
            Model::C6000 => vec![MT],
            Model::C6002 => vec![MT24, MT],
            Model::C2C425 => vec![DW, MT],
            Model::C2C450Shake => vec![SHAKER],
        }
    }
}

bitflags! {
    /// 8-bit status byte returned after every high-level command and by
    /// the `ch:bs` check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OverviewRegister: u8 {
        const TRANSFER_STATION_OCCUPIED = 1 << 0;
        const DEVICE_DOOR_OPEN = 1 << 1;
        const AUTOMATIC_GATE_OPEN = 1 << 2;
        const HANDLER_OCCUPIED = 1 << 3;
        const ERROR_REGISTER_SET = 1 << 4;
        const WARNING_REGISTER_SET = 1 << 5;
        const READY = 1 << 6;
        const BUSY = 1 << 7;
    }
}

/// Warning register codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningRegister {
    NoWarning,
    MotorCommunicationInterrupted,
    PlateNotLoadedOnShovel,
    PlateNotUnloadedFromShovel,
    ShovelNotExtended,
    ProcessTimeout,
    LiftDoorNotOpen,
    LiftDoorNotClosed,
    ShovelNotRetracted,
    InitializationDueToOpenDoor,
    TransferStationNotRotated,
    OtherMotorFault,
    CarouselReinitialized,
    /// Undocumented code, preserved verbatim.
    Unknown(String),
}

impl WarningRegister {
    fn from_code(code: &str) -> WarningRegister {
        match code {
            "00" => WarningRegister::NoWarning,
            "01" => WarningRegister::MotorCommunicationInterrupted,
            "02" => WarningRegister::PlateNotLoadedOnShovel,
            "03" => WarningRegister::PlateNotUnloadedFromShovel,
            "04" => WarningRegister::ShovelNotExtended,
            "05" => WarningRegister::ProcessTimeout,
            "06" => WarningRegister::LiftDoorNotOpen,
            "07" => WarningRegister::LiftDoorNotClosed,
            "08" => WarningRegister::ShovelNotRetracted,
            "09" => WarningRegister::InitializationDueToOpenDoor,
            "0C" => WarningRegister::TransferStationNotRotated,
            "0D" => WarningRegister::OtherMotorFault,
            "0E" => WarningRegister::CarouselReinitialized,
            other => WarningRegister::Unknown(other.to_string()),
        }
    }
}

/// Error register codes; read via `ch:be`, reset via `rs:be`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorRegister {
    NoError,
    MotorCommunicationInterrupted,
    NoPlateLoadedOnShovel,
    NoPlateUnloadedFromShovel,
    ShovelNotExtended,
    ProcessTimeout,
    LiftDoorNotOpen,
    LiftDoorNotClosed,
    ShovelNotRetracted,
    StepperControllerOverTemperature,
    OtherStepperControllerError,
    TransferStationNotRotated,
    HeatingOrGasSupplyDisturbed,
    FatalErrorDuringErrorRoutine,
    Unknown(String),
}

impl ErrorRegister {
    fn from_code(code: &str) -> ErrorRegister {
        match code {
            "00" => ErrorRegister::NoError,
            "01" => ErrorRegister::MotorCommunicationInterrupted,
            "02" => ErrorRegister::NoPlateLoadedOnShovel,
            "03" => ErrorRegister::NoPlateUnloadedFromShovel,
            "04" => ErrorRegister::ShovelNotExtended,
            "05" => ErrorRegister::ProcessTimeout,
            "06" => ErrorRegister::LiftDoorNotOpen,
            "07" => ErrorRegister::LiftDoorNotClosed,
            "08" => ErrorRegister::ShovelNotRetracted,
            "0A" => ErrorRegister::StepperControllerOverTemperature,
            "0B" => ErrorRegister::OtherStepperControllerError,
            "0C" => ErrorRegister::TransferStationNotRotated,
            "0D" => ErrorRegister::HeatingOrGasSupplyDisturbed,
            "FF" => ErrorRegister::FatalErrorDuringErrorRoutine,
            other => ErrorRegister::Unknown(other.to_string()),
        }
    }
}

/// Where the handler is working, from the action register's top bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTarget {
    InitPosition,
    WaitPosition,
    Stacker,
    TransferStation,
}

/// Decoded action register: target plus the running task code. Task
/// codes 0x01..0x1D are motor-level steps; the raw code is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRegister {
    pub target: ActionTarget,
    pub task: u8,
}

/// Swap station state from the `ch:sw` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapStation {
    /// Which of the two plate positions faces the gate, 1 or 2.
    pub position: u8,
    pub front_of_gate_occupied: bool,
    pub at_processor_occupied: bool,
}

bitflags! {
    /// Sensor states from the `ch:ts` check, 15 meaningful bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SensorRegister: u16 {
        const INIT_SENSOR_HEIGHT_MOTOR = 1 << 0;
        const INIT_SENSOR_CAROUSEL = 1 << 1;
        const SHOVEL_RETRACTED = 1 << 2;
        const SHOVEL_EXTENDED = 1 << 3;
        const SHOVEL_OCCUPIED = 1 << 4;
        const GATE_OPENED = 1 << 5;
        const GATE_CLOSED = 1 << 6;
        const TRANSFER_STATION_OCCUPIED = 1 << 7;
        const TRANSFER_STATION_POSITION_1 = 1 << 8;
        const TRANSFER_STATION_POSITION_2 = 1 << 9;
        const INNER_DOOR_OPENED = 1 << 10;
        const CAROUSEL_POSITION = 1 << 11;
        const HANDLER_TOWARDS_STACKER = 1 << 12;
        const HANDLER_TOWARDS_GATE = 1 << 13;
        const TRANSFER_STATION_SECOND_PLATE_OCCUPIED = 1 << 14;
    }
}

/// Incubation climate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncubationQuery {
    Co2,
    Humidity,
    O2,
    Temperature,
}

impl IncubationQuery {
    fn verb(self) -> &'static str {
        match self {
            IncubationQuery::Co2 => "ic",
            IncubationQuery::Humidity => "ih",
            IncubationQuery::O2 => "io",
            IncubationQuery::Temperature => "it",
        }
    }
}

/// `<nominal> <actual>` reading of one climate channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IncubationReading {
    pub nominal: f64,
    pub actual: f64,
}

/// Which top-of-stack shaker a frequency change addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shaker {
    One,
    Two,
    Both,
}

/// Driver for one Cytomat on one serial connection.
pub struct Cytomat<T: Transport> {
    transport: T,
    model: Model,
    inventory: Inventory,
    retries: u32,
    /// Overridable for tests; 5 s on hardware.
    pub retry_delay: Duration,
    /// Overridable for tests; 1 s on hardware.
    pub poll_interval: Duration,
}

impl<T: Transport> Cytomat<T> {
    /// Open a driver with the model's factory rack fit. The inventory
    /// file lives at `<data_dir>/cytomat_<model>.yaml` and is created
    /// from the rack configuration when missing.
    pub fn new(transport: T, model: Model, data_dir: impl AsRef<Path>) -> Result<Cytomat<T>, Error> {
        Self::with_racks(transport, model, data_dir, model.default_racks())
    }

    /// Open a driver for a machine with a non-factory rack fit.
    pub fn with_racks(
        transport: T,
        model: Model,
        data_dir: impl AsRef<Path>,
        racks: Vec<RackType>,
    ) -> Result<Cytomat<T>, Error> {
        let path = data_dir
            .as_ref()
            .join(format!("cytomat_{}.yaml", model.as_str()));
        let inventory = Inventory::load_or_create(path, &racks)?;
        Ok(Cytomat {
            transport,
            model,
            inventory,
            retries: DEFAULT_RETRIES,
            retry_delay: RETRY_DELAY,
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// The underlying transport, e.g. to inspect a recording mock.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    // # # # # # # # # telegram dispatch # # # # # # # #

    /// Send `<cmd>:<verb> <params>` and return the reply payload.
    /// Error replies run the retry ladder: sleep and resend, and ahead
    /// of the final attempt re-initialize and clear the error register.
    fn send_cmd(&mut self, cmd: &str, verb: &str, params: &str) -> Result<String, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exchange(cmd, verb, params) {
                Ok(payload) => return Ok(payload),
                Err(Error::Cytomat(code_error)) => {
                    if attempt >= self.retries {
                        if code_error == CytomatError::TelegramStructure {
                            // raw exchange: the diagnostic read must not
                            // re-enter the retry ladder
                            let register = self
                                .exchange("ch", "be", "")
                                .map(|payload| ErrorRegister::from_code(payload.trim()))?;
                            log::error!(
                                "telegram structure error persisted, error register: {:?}",
                                register
                            );
                        }
                        return Err(Error::Cytomat(code_error));
                    }
                    log::warn!(
                        "cytomat {}:{} failed (attempt {}/{}): {}",
                        cmd,
                        verb,
                        attempt,
                        self.retries,
                        code_error
                    );
                    thread::sleep(self.retry_delay);
                    if attempt + 1 == self.retries {
                        self.recover()?;
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn exchange(&mut self, cmd: &str, verb: &str, params: &str) -> Result<String, Error> {
        let telegram = if params.is_empty() {
            format!("{}:{}{}", cmd, verb, self.model.terminator())
        } else {
            format!("{}:{} {}{}", cmd, verb, params, self.model.terminator())
        };
        log::debug!("--> {}", telegram.trim_end());
        let raw = self.transport.send(telegram.as_bytes(), COMMAND_TIMEOUT)?;
        let text = String::from_utf8_lossy(&raw).to_string();
        log::debug!("<-- {}", text);

        let mut tokens = text.split_whitespace();
        let key = tokens
            .next()
            .ok_or_else(|| Error::Protocol("empty cytomat reply".to_string()))?;
        let payload = tokens.collect::<Vec<_>>().join(" ");

        // actions answer `ok`, checks echo their verb
        let check_verb = verb.split_whitespace().next().unwrap_or(verb);
        if key == "ok" || key == check_verb {
            return Ok(payload);
        }
        if key == "er" {
            return Err(Error::Cytomat(CytomatError::from_code(&payload)));
        }
        Err(Error::Protocol(format!(
            "unknown cytomat reply: '{}'",
            text
        )))
    }

    /// Pre-final-retry ladder: home the handler, wait for the busy bit,
    /// and reset the error register if it is still set. Raw exchanges
    /// throughout so recovery never re-enters the retry ladder.
    fn recover(&mut self) -> Result<(), Error> {
        self.exchange("ll", "in", "")?;
        loop {
            let payload = self.exchange("ch", "bs", "")?;
            if !Self::parse_overview(&payload)?.contains(OverviewRegister::BUSY) {
                break;
            }
            thread::sleep(self.poll_interval);
        }
        let payload = self.exchange("ch", "bs", "")?;
        if Self::parse_overview(&payload)?.contains(OverviewRegister::ERROR_REGISTER_SET) {
            self.exchange("rs", "be", "")?;
        }
        Ok(())
    }

    fn parse_overview(payload: &str) -> Result<OverviewRegister, Error> {
        let value = u8::from_str_radix(payload.trim(), 16).map_err(|_| {
            Error::Protocol(format!("overview register is not hex: '{}'", payload))
        })?;
        Ok(OverviewRegister::from_bits_retain(value))
    }

    // # # # # # # # # registers # # # # # # # #

    pub fn get_overview_register(&mut self) -> Result<OverviewRegister, Error> {
        let payload = self.send_cmd("ch", "bs", "")?;
        Self::parse_overview(&payload)
    }

    pub fn get_warning_register(&mut self) -> Result<WarningRegister, Error> {
        let payload = self.send_cmd("ch", "bw", "")?;
        Ok(WarningRegister::from_code(payload.trim()))
    }

    pub fn get_error_register(&mut self) -> Result<ErrorRegister, Error> {
        let payload = self.send_cmd("ch", "be", "")?;
        Ok(ErrorRegister::from_code(payload.trim()))
    }

    pub fn reset_error_register(&mut self) -> Result<(), Error> {
        self.send_cmd("rs", "be", "").map(|_| ())
    }

    pub fn get_action_register(&mut self) -> Result<ActionRegister, Error> {
        let payload = self.send_cmd("ch", "ba", "")?;
        let value = u8::from_str_radix(payload.trim(), 16).map_err(|_| {
            Error::Protocol(format!("action register is not hex: '{}'", payload))
        })?;
        let target = match value >> 5 {
            1 => ActionTarget::InitPosition,
            2 => ActionTarget::WaitPosition,
            3 => ActionTarget::Stacker,
            4 => ActionTarget::TransferStation,
            other => {
                return Err(Error::Protocol(format!(
                    "unknown action target {} in register {:02X}",
                    other, value
                )))
            }
        };
        Ok(ActionRegister {
            target,
            task: value & 0x1F,
        })
    }

    pub fn get_swap_register(&mut self) -> Result<SwapStation, Error> {
        let payload = self.send_cmd("ch", "sw", "")?;
        let digits: Vec<char> = payload.trim().chars().collect();
        if digits.len() < 3 {
            return Err(Error::Protocol(format!(
                "swap register payload too short: '{}'",
                payload
            )));
        }
        let digit = |c: char| c.to_digit(10).map(|d| d as u8);
        match (digit(digits[0]), digit(digits[1]), digit(digits[2])) {
            (Some(position @ 1..=2), Some(front), Some(processor)) => Ok(SwapStation {
                position,
                front_of_gate_occupied: front != 0,
                at_processor_occupied: processor != 0,
            }),
            _ => Err(Error::Protocol(format!(
                "malformed swap register payload: '{}'",
                payload
            ))),
        }
    }

    pub fn get_sensor_register(&mut self) -> Result<SensorRegister, Error> {
        let payload = self.send_cmd("ch", "ts", "")?;
        let value = u16::from_str_radix(payload.trim(), 16).map_err(|_| {
            Error::Protocol(format!("sensor register is not hex: '{}'", payload))
        })?;
        Ok(SensorRegister::from_bits_retain(value))
    }

    pub fn get_incubation(&mut self, query: IncubationQuery) -> Result<IncubationReading, Error> {
        let capabilities = self.model.capabilities();
        if query != IncubationQuery::Temperature && !capabilities.incubate {
            return Err(Error::State(format!(
                "model {} has no incubation control",
                self.model.as_str()
            )));
        }
        let payload = self.send_cmd("ch", query.verb(), "")?;
        let mut parts = payload.split_whitespace();
        let nominal = parts
            .next()
            .and_then(|v| v.trim_start_matches('+').parse::<f64>().ok());
        let actual = parts
            .next()
            .and_then(|v| v.trim_start_matches('+').parse::<f64>().ok());
        match (nominal, actual) {
            (Some(nominal), Some(actual)) => Ok(IncubationReading { nominal, actual }),
            _ => Err(Error::Protocol(format!(
                "malformed incubation reply: '{}'",
                payload
            ))),
        }
    }

    // # # # # # # # # low level # # # # # # # #

    /// Home the handler.
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.send_cmd("ll", "in", "").map(|_| ())
    }

    pub fn open_gate(&mut self) -> Result<OverviewRegister, Error> {
        let payload = self.send_cmd("ll", "gp", "002")?;
        Self::parse_overview(&payload)
    }

    pub fn close_gate(&mut self) -> Result<OverviewRegister, Error> {
        let payload = self.send_cmd("ll", "gp", "001")?;
        Self::parse_overview(&payload)
    }

    // # # # # # # # # polling # # # # # # # #

    /// Poll the busy bit at 1 Hz until it clears.
    pub fn wait_until_idle(&mut self) -> Result<(), Error> {
        loop {
            let register = self.get_overview_register()?;
            if !register.contains(OverviewRegister::BUSY) {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub fn wait_for_transfer_station_occupied(&mut self) -> Result<(), Error> {
        loop {
            let register = self.get_overview_register()?;
            if register.contains(OverviewRegister::TRANSFER_STATION_OCCUPIED) {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub fn wait_for_transfer_station_unoccupied(&mut self) -> Result<(), Error> {
        loop {
            let register = self.get_overview_register()?;
            if !register.contains(OverviewRegister::TRANSFER_STATION_OCCUPIED) {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
    }

    // # # # # # # # # carousel state machine # # # # # # # #

    /// Slot address in the firmware's convention: a zero-padded
    /// rack/slot pair on the C2C 425, an absolute 3-digit location
    /// everywhere else. The shaker model skips every other level and
    /// an unused leading rack.
    pub fn firmware_location(&self, location: StorageLocation) -> Result<String, Error> {
        let racks = self.inventory.racks();
        let rack = racks
            .iter()
            .find(|r| r.rack_index == location.rack)
            .ok_or(crate::error::InventoryError::RackNotFound(location.rack))?;
        if location.slot == 0 || location.slot > rack.kind.num_slots {
            return Err(crate::error::InventoryError::SlotOutOfRange {
                rack: location.rack,
                slot: location.slot,
                num_slots: rack.kind.num_slots,
            }
            .into());
        }

        if self.model == Model::C2C425 {
            return Ok(format!("{:02} {:02}", location.rack, location.slot));
        }

        let skipped: u16 = racks
            .iter()
            .filter(|r| r.rack_index < location.rack)
            .map(|r| r.kind.num_slots)
            .sum();
        let absolute = match self.model {
            Model::C2C450Shake => 15 + 2 * (skipped + location.slot),
            _ => skipped + location.slot,
        };
        Ok(format!("{:03}", absolute))
    }

    fn complex_command(&mut self, verb: &str, params: &str) -> Result<OverviewRegister, Error> {
        self.wait_until_idle()?;
        let payload = self.send_cmd("mv", verb, params)?;
        let register = Self::parse_overview(&payload)?;
        self.wait_until_idle()?;
        Ok(register)
    }

    /// `ts`: open the lift door, take the plate off the transfer
    /// station, close the door, store it.
    pub fn transfer_to_storage(
        &mut self,
        location: StorageLocation,
    ) -> Result<OverviewRegister, Error> {
        let address = self.firmware_location(location)?;
        self.complex_command("ts", &address)
    }

    /// `st`: fetch a plate from storage and present it on the transfer
    /// station.
    pub fn storage_to_transfer(
        &mut self,
        location: StorageLocation,
    ) -> Result<OverviewRegister, Error> {
        let address = self.firmware_location(location)?;
        self.complex_command("st", &address)
    }

    /// `sw`: fetch a plate from storage to the wait position.
    pub fn storage_to_wait(&mut self, location: StorageLocation) -> Result<OverviewRegister, Error> {
        let address = self.firmware_location(location)?;
        self.complex_command("sw", &address)
    }

    /// `ws`: store the plate held at the wait position.
    pub fn wait_to_storage(&mut self, location: StorageLocation) -> Result<OverviewRegister, Error> {
        let address = self.firmware_location(location)?;
        self.complex_command("ws", &address)
    }

    /// `wt`: move the waiting plate onto the transfer station.
    pub fn wait_to_transfer(&mut self) -> Result<OverviewRegister, Error> {
        self.complex_command("wt", "")
    }

    /// `tw`: take the plate off the transfer station to the wait
    /// position.
    pub fn transfer_to_wait(&mut self) -> Result<OverviewRegister, Error> {
        self.complex_command("tw", "")
    }

    /// `wh`: extend the waiting plate out of the device.
    pub fn wait_to_exposed(&mut self) -> Result<OverviewRegister, Error> {
        self.complex_command("wh", "")
    }

    /// `hw`: retract the exposed plate back to the wait position.
    pub fn exposed_to_wait(&mut self) -> Result<OverviewRegister, Error> {
        self.complex_command("hw", "")
    }

    /// `hs`: retract the exposed plate and store it.
    pub fn exposed_to_storage(
        &mut self,
        location: StorageLocation,
    ) -> Result<OverviewRegister, Error> {
        let address = self.firmware_location(location)?;
        self.complex_command("hs", &address)
    }

    /// `sh`: fetch a plate from storage and extend it out of the
    /// device.
    pub fn storage_to_exposed(
        &mut self,
        location: StorageLocation,
    ) -> Result<OverviewRegister, Error> {
        let address = self.firmware_location(location)?;
        self.complex_command("sh", &address)
    }

    /// `sn`: read the barcodes of a storage location range.
    pub fn read_storage_barcodes(
        &mut self,
        from_location: u16,
        to_location: u16,
    ) -> Result<OverviewRegister, Error> {
        if from_location > 999 || to_location > 999 {
            return Err(Error::InvalidInput(
                "storage location numbers are three digits".to_string(),
            ));
        }
        self.complex_command("sn", &format!("{:03} {:03}", from_location, to_location))
    }

    // # # # # # # # # shakers # # # # # # # #

    fn require_shaker(&self) -> Result<(), Error> {
        if !self.model.capabilities().shake {
            return Err(Error::State(format!(
                "model {} has no shakers",
                self.model.as_str()
            )));
        }
        Ok(())
    }

    pub fn init_shakers(&mut self) -> Result<(), Error> {
        self.require_shaker()?;
        self.send_cmd("ll", "vi", "").map(|_| ())
    }

    pub fn start_shaking(&mut self) -> Result<(), Error> {
        self.require_shaker()?;
        self.wait_until_idle()?;
        self.send_cmd("ll", "va", "").map(|_| ())
    }

    pub fn stop_shaking(&mut self) -> Result<(), Error> {
        self.require_shaker()?;
        self.wait_until_idle()?;
        self.send_cmd("ll", "vd", "").map(|_| ())
    }

    /// Set the shaking frequency (in 0.1 Hz steps) of one or both
    /// top-of-stack shakers.
    pub fn set_shaking_frequency(&mut self, frequency: u16, shaker: Shaker) -> Result<(), Error> {
        self.require_shaker()?;
        if frequency > 9_999 {
            return Err(Error::InvalidInput(format!(
                "frequency {} does not fit four digits",
                frequency
            )));
        }
        let params = format!("{:04}", frequency);
        match shaker {
            Shaker::One => self.send_cmd("se", "pb 20", &params).map(|_| ()),
            Shaker::Two => self.send_cmd("se", "pb 21", &params).map(|_| ()),
            Shaker::Both => {
                self.send_cmd("se", "pb 20", &params)?;
                self.send_cmd("se", "pb 21", &params).map(|_| ())
            }
        }
    }

    // # # # # # # # # plate workflow # # # # # # # #

    /// Store the plate waiting on the transfer station. The slot is
    /// validated up front but reserved in the inventory only after the
    /// firmware confirmed the move.
    pub fn insert_plate(
        &mut self,
        plate: CytomatPlate,
        location: StorageLocation,
    ) -> Result<OverviewRegister, Error> {
        self.inventory.validate_add(location, &plate)?;
        let register = self.transfer_to_storage(location)?;
        self.inventory.add_plate(location, plate)?;
        Ok(register)
    }

    /// Store the plate in the smallest free slot that clears it.
    pub fn insert_plate_anywhere(
        &mut self,
        plate: CytomatPlate,
    ) -> Result<StorageLocation, Error> {
        let location = self.inventory.find_slot_for(&plate)?;
        self.insert_plate(plate, location)?;
        Ok(location)
    }

    /// Fetch a plate to the transfer station and release its slot.
    pub fn retrieve_plate(&mut self, location: StorageLocation) -> Result<CytomatPlate, Error> {
        self.storage_to_transfer(location)?;
        self.inventory.remove_plate(location)
    }

    pub fn retrieve_plate_by_uid(&mut self, uid: &str) -> Result<CytomatPlate, Error> {
        let location = self
            .inventory
            .find_plate(uid)
            .ok_or_else(|| crate::error::InventoryError::PlateNotFound(uid.to_string()))?;
        self.retrieve_plate(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        requests: Vec<String>,
        replies: VecDeque<Vec<u8>>,
    }

    impl MockTransport {
        fn new(replies: &[&str]) -> MockTransport {
            MockTransport {
                requests: Vec::new(),
                replies: replies.iter().map(|r| r.as_bytes().to_vec()).collect(),
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, request: &[u8], _timeout: Duration) -> Result<Vec<u8>, Error> {
            self.requests
                .push(String::from_utf8_lossy(request).to_string());
            self.replies.pop_front().ok_or(Error::NoResponse)
        }
    }

    fn cytomat(model: Model, replies: &[&str]) -> (tempfile::TempDir, Cytomat<MockTransport>) {
        let dir = tempfile::tempdir().unwrap();
        let mut device = Cytomat::new(MockTransport::new(replies), model, dir.path()).unwrap();
        device.retry_delay = Duration::from_millis(1);
        device.poll_interval = Duration::from_millis(1);
        (dir, device)
    }

    #[test]
    fn test_overview_register_decodes() {
        let (_dir, mut device) = cytomat(Model::C6002, &["bs 40"]);
        let register = device.get_overview_register().unwrap();
        assert!(register.contains(OverviewRegister::READY));
        assert!(!register.contains(OverviewRegister::BUSY));
        assert_eq!(device.transport.requests.last().unwrap(), "ch:bs\r\n");
    }

    #[test]
    fn test_c2c425_uses_bare_cr() {
        let (_dir, mut device) = cytomat(Model::C2C425, &["bs 40"]);
        device.get_overview_register().unwrap();
        assert_eq!(device.transport.requests.last().unwrap(), "ch:bs\r");
    }

    #[test]
    fn test_firmware_location_absolute() {
        // C6002: rack 1 has 24 slots, so rack 2 slot 18 is 042
        let (_dir, device) = cytomat(Model::C6002, &[]);
        let address = device
            .firmware_location(StorageLocation { rack: 2, slot: 18 })
            .unwrap();
        assert_eq!(address, "042");
    }

    #[test]
    fn test_firmware_location_rack_slot_pair() {
        let (_dir, device) = cytomat(Model::C2C425, &[]);
        let address = device
            .firmware_location(StorageLocation { rack: 2, slot: 3 })
            .unwrap();
        assert_eq!(address, "02 03");
    }

    #[test]
    fn test_firmware_location_shaker_arithmetic() {
        let (_dir, device) = cytomat(Model::C2C450Shake, &[]);
        // 15 + 2 * (0 + 4) = 23
        let address = device
            .firmware_location(StorageLocation { rack: 1, slot: 4 })
            .unwrap();
        assert_eq!(address, "023");
    }

    #[test]
    fn test_unknown_location_errors_before_wire() {
        let (_dir, mut device) = cytomat(Model::C6000, &[]);
        let err = device
            .storage_to_transfer(StorageLocation { rack: 1, slot: 99 })
            .unwrap_err();
        assert!(matches!(err, Error::Inventory(_)));
        assert!(device.transport.requests.is_empty());
    }

    #[test]
    fn test_transfer_polls_busy_until_clear() {
        let (_dir, mut device) = cytomat(
            Model::C6002,
            &[
                "bs 40",  // idle before issuing
                "ok 60",  // ts accepted
                "bs C0",  // busy
                "bs C0",  // busy
                "bs C0",  // busy
                "bs 40",  // done
            ],
        );
        let plate = CytomatPlate::new("ab-0042", false, 14.5);
        device
            .insert_plate(plate, StorageLocation { rack: 2, slot: 18 })
            .unwrap();
        assert_eq!(device.transport.requests[1], "mv:ts 042\r\n");
        // plate landed in the inventory after the successful ts
        assert!(device
            .inventory()
            .plate_at(StorageLocation { rack: 2, slot: 18 })
            .is_some());
    }

    #[test]
    fn test_error_reply_maps_to_typed_error() {
        let (_dir, mut device) = cytomat(
            Model::C6002,
            &["bs 40", "er 05", "er 05", "ll ok", "bs 40", "bs 40", "er 05"],
        );
        device.retries = 1; // no ladder, direct surface
        let err = device
            .storage_to_transfer(StorageLocation { rack: 1, slot: 2 })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Cytomat(CytomatError::UnknownLocation)
        ));
    }

    #[test]
    fn test_retry_ladder_reinitializes_before_final_attempt() {
        let (_dir, mut device) = cytomat(
            Model::C6002,
            &[
                "er 03",  // attempt 1
                "er 03",  // attempt 2, ladder follows
                "ok 00",  // ll:in
                "bs 40",  // busy poll: idle
                "bs 50",  // overview: error register set
                "ok 00",  // rs:be
                "er 03",  // attempt 3, final
                "be 03",  // get_error_register after exhaustion
            ],
        );
        let err = device.send_cmd("mv", "st", "001").unwrap_err();
        assert!(matches!(
            err,
            Error::Cytomat(CytomatError::TelegramStructure)
        ));
        let requests = &device.transport.requests;
        assert!(requests.iter().any(|r| r.starts_with("ll:in")));
        assert!(requests.iter().any(|r| r.starts_with("rs:be")));
    }

    #[test]
    fn test_incubation_reading_strips_plus() {
        let (_dir, mut device) = cytomat(Model::C6000, &["it +37.0 +36.8"]);
        let reading = device.get_incubation(IncubationQuery::Temperature).unwrap();
        assert_eq!(reading.nominal, 37.0);
        assert_eq!(reading.actual, 36.8);
    }

    #[test]
    fn test_shaker_requires_capability() {
        let (_dir, mut device) = cytomat(Model::C6002, &[]);
        assert!(matches!(device.start_shaking(), Err(Error::State(_))));
    }

    #[test]
    fn test_shaker_frequency_zero_padded() {
        let (_dir, mut device) = cytomat(Model::C2C450Shake, &["ok 00"]);
        device.set_shaking_frequency(750, Shaker::One).unwrap();
        assert_eq!(
            device.transport.requests.last().unwrap(),
            "se:pb 20 0750\r\n"
        );
    }

    #[test]
    fn test_retrieve_updates_inventory() {
        let (_dir, mut device) = cytomat(
            Model::C6002,
            &[
                "bs 40", "ok 60", "bs 40", // insert
                "bs 40", "ok 60", "bs 40", // retrieve
            ],
        );
        let location = StorageLocation { rack: 2, slot: 1 };
        device
            .insert_plate(CytomatPlate::new("p1", true, 14.5), location)
            .unwrap();
        let plate = device.retrieve_plate(location).unwrap();
        assert_eq!(plate.uid, "p1");
        assert!(plate.has_lid);
        assert!(device.inventory().plate_at(location).is_none());
    }
}

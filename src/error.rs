// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Error taxonomy and the firmware error decoder.
//!
//! Three tiers, from the wire up:
//! 1. [`FirmwareError`]: a typed (module, code, trace) triple parsed out of
//!    an instrument reply, one of ~50 fixed kinds.
//! 2. [`ChannelizedError`]: an aggregate whose every member is a pipetting
//!    channel module, keyed by 0-indexed channel. Callers use it to commit
//!    the channels that did not fail.
//! 3. Library errors ([`Error::NoTip`], [`Error::HasTip`],
//!    [`Error::TooLittleLiquid`], [`Error::TooLittleVolume`]), promoted
//!    from specific trace codes and raised directly by the state trackers.

use crate::constant::{channel_index, MODULES};
use crate::safety::SafetyError;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("IO error: {0:?}")]
    Io(ErrorKind),
    /// The instrument returned zero bytes within the read timeout.
    /// Distinct from an error reply: the device is off or unplugged.
    #[error("instrument did not respond, is it turned on?")]
    NoResponse,
    /// Id mismatch, missing terminator, or an otherwise unparseable reply.
    /// Not recoverable; the caller should reset the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("response is missing field '{tag}' in '{response}'")]
    MissingField { tag: String, response: String },
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error("{0}")]
    Firmware(FirmwareError),
    #[error("firmware errors: {}", format_module_map(.0))]
    FirmwareMap(BTreeMap<String, FirmwareError>),
    #[error(transparent)]
    Channelized(ChannelizedError),
    #[error("no tip: {0}")]
    NoTip(String),
    #[error("tip already present: {0}")]
    HasTip(String),
    #[error("too little liquid: {0}")]
    TooLittleLiquid(String),
    #[error("too little volume: {0}")]
    TooLittleVolume(String),
    #[error("{0}")]
    Cytomat(#[from] CytomatError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("state error: {0}")]
    State(String),
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e.kind())
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Connect(e.to_string())
    }
}

fn format_module_map(map: &BTreeMap<String, FirmwareError>) -> String {
    map.iter()
        .map(|(m, e)| format!("{}: {}", m, e))
        .collect::<Vec<_>>()
        .join("; ")
}

/// What a firmware error code means, independent of the module it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareErrorKind {
    CommandSyntax,
    Hardware,
    CommandNotCompleted,
    ClotDetected,
    BarcodeUnreadable,
    TipTooLittleVolume,
    TipAlreadyFitted,
    NoTipPresent,
    NoCarrier,
    NotCompleted,
    DispenseWithPressureLld,
    NoTeachInSignal,
    LoadingTray,
    SequencedAspirationWithPressureLld,
    NotAllowedParameterCombination,
    CoverClose,
    Aspiration,
    WashFluidOrWaste,
    Incubation,
    TadmMeasurement,
    NoElement,
    ElementStillHolding,
    ElementLost,
    IllegalTargetPlatePosition,
    IllegalUserAccess,
    PositionNotReachable,
    UnexpectedLld,
    AreaAlreadyOccupied,
    ImpossibleToOccupyArea,
    AntiDropControl,
    Decapper,
    DecapperHandling,
    WrongCarrier,
    NoCarrierBarcode,
    LiquidLevel,
    NotDetected,
    NotAspirated,
    ImproperDispensation,
    NoLabware,
    UnexpectedLabware,
    WrongLabware,
    BarcodeMask,
    BarcodeNotUnique,
    BarcodeAlreadyUsed,
    KitLotExpired,
    Delimiter,
    Slave,
    /// Master trace 03 with a clean error code: the telegram itself was
    /// malformed.
    TelegramStructure,
    /// Promoted from slave trace 70/71: not enough liquid to aspirate.
    TooLittleLiquid,
    /// Promoted from slave trace 54: not enough space in the tip.
    TooLittleVolume,
    /// Promoted from slave trace 75: no tip fitted where one was required.
    NoTip,
    /// Undocumented code. The raw payload is preserved verbatim.
    Unknown,
}

impl FirmwareErrorKind {
    fn from_code(code: u8) -> FirmwareErrorKind {
        use FirmwareErrorKind::*;
        match code {
            1 => CommandSyntax,
            2 => Hardware,
            3 => CommandNotCompleted,
            4 => ClotDetected,
            5 => BarcodeUnreadable,
            6 => TipTooLittleVolume,
            7 => TipAlreadyFitted,
            8 => NoTipPresent,
            9 => NoCarrier,
            10 => NotCompleted,
            11 => DispenseWithPressureLld,
            12 => NoTeachInSignal,
            13 => LoadingTray,
            14 => SequencedAspirationWithPressureLld,
            15 => NotAllowedParameterCombination,
            16 => CoverClose,
            17 => Aspiration,
            18 => WashFluidOrWaste,
            19 => Incubation,
            20 => TadmMeasurement,
            21 => NoElement,
            22 => ElementStillHolding,
            23 => ElementLost,
            24 => IllegalTargetPlatePosition,
            25 => IllegalUserAccess,
            26 => PositionNotReachable,
            27 => UnexpectedLld,
            28 => AreaAlreadyOccupied,
            29 => ImpossibleToOccupyArea,
            30 => AntiDropControl,
            31 => Decapper,
            32 => DecapperHandling,
            33 => WrongCarrier,
            34 => NoCarrierBarcode,
            35 => LiquidLevel,
            36 => NotDetected,
            37 => NotAspirated,
            38 => ImproperDispensation,
            39 => NoLabware,
            40 => UnexpectedLabware,
            41 => WrongLabware,
            42 => BarcodeMask,
            43 => BarcodeNotUnique,
            44 => BarcodeAlreadyUsed,
            45 => KitLotExpired,
            46 => Delimiter,
            99 => Slave,
            _ => Unknown,
        }
    }

    fn text(self) -> &'static str {
        use FirmwareErrorKind::*;
        match self {
            CommandSyntax => "wrong command or command syntax",
            Hardware => "hardware error",
            CommandNotCompleted => "command not completed",
            ClotDetected => "clot detected during aspiration",
            BarcodeUnreadable => "barcode unreadable",
            TipTooLittleVolume => "too little volume in tip",
            TipAlreadyFitted => "tip already fitted",
            NoTipPresent => "no tip present where one was expected",
            NoCarrier => "no carrier present",
            NotCompleted => "not completed",
            DispenseWithPressureLld => "dispense with pressure LLD not allowed",
            NoTeachInSignal => "no teach-in signal",
            LoadingTray => "loading tray error",
            SequencedAspirationWithPressureLld => {
                "sequenced aspiration with pressure LLD not allowed"
            }
            NotAllowedParameterCombination => "parameter combination not allowed",
            CoverClose => "cover close error",
            Aspiration => "aspiration error",
            WashFluidOrWaste => "wash fluid or waste error",
            Incubation => "incubation error",
            TadmMeasurement => "TADM measurement error",
            NoElement => "no element present",
            ElementStillHolding => "element still holding",
            ElementLost => "element lost",
            IllegalTargetPlatePosition => "illegal target plate position",
            IllegalUserAccess => "illegal user access",
            PositionNotReachable => "position not reachable",
            UnexpectedLld => "unexpected liquid level detection",
            AreaAlreadyOccupied => "area already occupied",
            ImpossibleToOccupyArea => "impossible to occupy area",
            AntiDropControl => "anti drop control triggered",
            Decapper => "decapper error",
            DecapperHandling => "decapper handling error",
            WrongCarrier => "wrong carrier detected",
            NoCarrierBarcode => "no carrier barcode",
            LiquidLevel => "liquid level error",
            NotDetected => "not detected",
            NotAspirated => "not aspirated",
            ImproperDispensation => "improper dispensation",
            NoLabware => "no labware detected",
            UnexpectedLabware => "unexpected labware detected",
            WrongLabware => "wrong labware detected",
            BarcodeMask => "barcode mask mismatch",
            BarcodeNotUnique => "barcode not unique",
            BarcodeAlreadyUsed => "barcode already used",
            KitLotExpired => "kit lot expired",
            Delimiter => "delimiter error",
            Slave => "slave module error",
            TelegramStructure => "telegram structure error",
            TooLittleLiquid => "too little liquid to aspirate",
            TooLittleVolume => "too little free volume in tip",
            NoTip => "no tip fitted",
            Unknown => "unknown error code",
        }
    }
}

/// One `XX##/##` (or master `er##/##`) occurrence in a reply,
/// before any interpretation. Codes are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleError {
    pub module: String,
    pub code: u8,
    pub trace: u8,
    pub raw: String,
}

/// The outcome of scanning a reply for error substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedErrors {
    /// In order of appearance in the reply.
    pub entries: Vec<ModuleError>,
    /// Everything the scanner did not consume.
    pub residue: String,
}

/// A typed firmware error with its wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareError {
    pub kind: FirmwareErrorKind,
    pub module: String,
    pub module_name: &'static str,
    pub code: u8,
    pub trace: u8,
    pub raw: String,
}

impl fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} [{}]",
            self.module_name,
            self.module,
            self.kind.text(),
            self.raw
        )
    }
}

impl std::error::Error for FirmwareError {}

/// An aggregate error whose every failing module is a pipetting channel.
/// Keys are 0-indexed channel numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelizedError {
    pub errors: BTreeMap<usize, FirmwareError>,
}

impl ChannelizedError {
    pub fn failed_channels(&self) -> Vec<usize> {
        self.errors.keys().copied().collect()
    }
}

impl fmt::Display for ChannelizedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "channel errors: ")?;
        let mut first = true;
        for (channel, err) in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "channel {}: {}", channel, err)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelizedError {}

fn error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // One named capture per known module. The master reports as
        // `er##/##`, every slave as `<module>##/##`.
        let mut alternatives = vec![String::from(r"er(?P<C0>\d{2}/\d{2})")];
        for (id, _) in MODULES.iter().skip(1) {
            alternatives.push(format!(r"{}(?P<{}>\d{{2}}/\d{{2}})", id, id));
        }
        Regex::new(&alternatives.join("|")).expect("static module regex")
    })
}

fn module_name(module: &str) -> &'static str {
    MODULES
        .iter()
        .find(|(id, _)| *id == module)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown module")
}

/// Scan a reply for error substrings. Total: any input yields a (possibly
/// empty) entry list plus the unconsumed residue. No interpretation happens
/// here; promotion and aggregation are separate passes so they can be tested
/// in isolation.
pub fn parse_error_reply(reply: &str) -> ParsedErrors {
    let mut entries = Vec::new();
    let mut residue = String::new();
    let mut last_end = 0;

    for captures in error_regex().captures_iter(reply) {
        let overall = captures.get(0).expect("match 0 always present");
        residue.push_str(&reply[last_end..overall.start()]);
        last_end = overall.end();

        for &(id, _) in MODULES.iter() {
            if let Some(m) = captures.name(id) {
                let payload = m.as_str();
                // payload is `##/##` by construction
                let code = payload[..2].parse::<u8>().expect("two digits");
                let trace = payload[3..5].parse::<u8>().expect("two digits");
                entries.push(ModuleError {
                    module: id.to_string(),
                    code,
                    trace,
                    raw: overall.as_str().to_string(),
                });
                break;
            }
        }
    }
    residue.push_str(&reply[last_end..]);

    ParsedErrors { entries, residue }
}

/// Interpret one parsed entry. Trace promotion only applies to slave
/// modules; the master's trace field reports its own diagnostics.
pub fn typed_error(entry: &ModuleError) -> FirmwareError {
    let mut kind = FirmwareErrorKind::from_code(entry.code);
    if entry.module == "C0" && entry.code == 0 {
        // clean error code, nonzero trace: the master's own diagnostics
        kind = match entry.trace {
            3 => FirmwareErrorKind::TelegramStructure,
            _ => FirmwareErrorKind::Unknown,
        };
    } else if entry.module != "C0" {
        match entry.trace {
            70 | 71 => kind = FirmwareErrorKind::TooLittleLiquid,
            54 => kind = FirmwareErrorKind::TooLittleVolume,
            75 => kind = FirmwareErrorKind::NoTip,
            _ => {}
        }
    }
    FirmwareError {
        kind,
        module: entry.module.clone(),
        module_name: module_name(&entry.module),
        code: entry.code,
        trace: entry.trace,
        raw: entry.raw.clone(),
    }
}

/// Aggregate the errors present in a reply into the right error tier, or
/// `None` if the reply carries none (code 00 means "no error").
pub fn classify_reply(reply: &str) -> Option<Error> {
    let parsed = parse_error_reply(reply);
    // `00/00` means no error; a clean master code with a nonzero trace
    // still reports a master-level fault (e.g. `er00/03`).
    let mut entries: Vec<&ModuleError> = parsed
        .entries
        .iter()
        .filter(|e| e.code != 0 || (e.module == "C0" && e.trace != 0))
        .collect();
    if entries.is_empty() {
        return None;
    }

    // The master reports 99 whenever any slave failed; with the slave
    // entries present the master entry is redundant.
    if entries.len() > 1 {
        entries.retain(|e| !(e.module == "C0" && e.code == 99));
    }

    let typed: Vec<FirmwareError> = entries.iter().map(|e| typed_error(e)).collect();

    // When only channels failed the caller can commit partial success,
    // so the channelized form wins even over a lone entry.
    if typed.iter().all(|e| channel_index(&e.module).is_some()) {
        let errors = typed
            .into_iter()
            .map(|e| (channel_index(&e.module).expect("checked above"), e))
            .collect();
        return Some(Error::Channelized(ChannelizedError { errors }));
    }

    if typed.len() == 1 {
        return Some(Error::Firmware(typed.into_iter().next().expect("len 1")));
    }

    let map = typed.into_iter().map(|e| (e.module.clone(), e)).collect();
    Some(Error::FirmwareMap(map))
}

/// Cytomat error register / `er <code>` reply codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CytomatError {
    #[error("device still busy, new command not accepted")]
    Busy,
    #[error("command unknown")]
    CommandUnknown,
    #[error("telegram structure error")]
    TelegramStructure,
    #[error("incorrect parameter in telegram")]
    IncorrectParameter,
    #[error("unknown location number specified")]
    UnknownLocation,
    #[error("incorrect handler (start) position")]
    IncorrectHandlerPosition,
    #[error("command cannot be executed as shovel is extended")]
    ShovelExtended,
    #[error("handler already occupied")]
    HandlerOccupied,
    #[error("handler empty")]
    HandlerEmpty,
    #[error("transfer station empty")]
    TransferStationEmpty,
    #[error("transfer station occupied")]
    TransferStationOccupied,
    #[error("transfer station not in position")]
    TransferStationPosition,
    #[error("automatic lift door not configured")]
    LiftDoorNotConfigured,
    #[error("automatic lift door not open")]
    LiftDoorNotOpen,
    #[error("error while accessing internal memory")]
    MemoryAccess,
    #[error("incorrect password / unauthorized access")]
    UnauthorizedAccess,
    #[error("unknown cytomat error code: {0}")]
    Unknown(String),
}

impl CytomatError {
    /// Codes are two ASCII digits as sent by the device.
    pub fn from_code(code: &str) -> CytomatError {
        match code {
            "01" => CytomatError::Busy,
            "02" => CytomatError::CommandUnknown,
            "03" => CytomatError::TelegramStructure,
            "04" => CytomatError::IncorrectParameter,
            "05" => CytomatError::UnknownLocation,
            "11" => CytomatError::IncorrectHandlerPosition,
            "12" => CytomatError::ShovelExtended,
            "21" => CytomatError::HandlerOccupied,
            "22" => CytomatError::HandlerEmpty,
            "31" => CytomatError::TransferStationEmpty,
            "32" => CytomatError::TransferStationOccupied,
            "33" => CytomatError::TransferStationPosition,
            "41" => CytomatError::LiftDoorNotConfigured,
            "42" => CytomatError::LiftDoorNotOpen,
            "51" => CytomatError::MemoryAccess,
            "52" => CytomatError::UnauthorizedAccess,
            other => CytomatError::Unknown(other.to_string()),
        }
    }
}

/// Violations of the rack inventory invariants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InventoryError {
    #[error("rack {0} not found")]
    RackNotFound(u8),
    #[error("slot {slot} out of range for rack {rack} with {num_slots} slots")]
    SlotOutOfRange { rack: u8, slot: u16, num_slots: u16 },
    #[error("slot {slot} of rack {rack} already contains plate '{uid}'")]
    SlotOccupied { rack: u8, slot: u16, uid: String },
    #[error("no plate in slot {slot} of rack {rack}")]
    SlotEmpty { rack: u8, slot: u16 },
    #[error("plate '{0}' is already stored")]
    DuplicateUid(String),
    #[error("plate '{0}' not found in any rack")]
    PlateNotFound(String),
    #[error("no free slot with pitch above {0} mm")]
    NoFreeSlot(f64),
    #[error("rack pitch {pitch} mm does not clear plate height {height} mm")]
    PitchTooSmall { pitch: f64, height: f64 },
}

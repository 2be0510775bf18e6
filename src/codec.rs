// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Telegram codec for the STAR firmware protocol.
//!
//! A command is `<module><verb>` followed by `id####` and zero or more
//! tagged parameter fields. Integers are fixed-width zero-padded decimals,
//! hex fields fixed-width uppercase, repeated values space-separated
//! within one tag. Replies mirror the module/verb prefix and are decoded
//! against a format descriptor: a tag followed by `#` (signed decimal
//! digit), `*` (hex digit) or `&` (any character), optionally marked
//! ` (n)` for a whitespace-separated repeat.

use crate::constant::ID_WRAP;
use crate::error::Error;
use std::collections::HashMap;

/// Monotonic 4-digit request identifier, one per connection.
///
/// A reply whose id does not match the outstanding request is a hard
/// protocol error; the instrument may have started executing a stale
/// command, so it is never silently dropped.
#[derive(Debug)]
pub struct IdAllocator {
    next: u16,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        IdAllocator { next: 1 }
    }

    pub fn advance(&mut self) -> u16 {
        let id = self.next;
        self.next = (self.next + 1) % ID_WRAP;
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

/// Millimeters to the firmware's 0.1 mm integer unit.
pub fn tenths(mm: f64) -> i64 {
    (mm * 10.0).round() as i64
}

/// Microliters to the firmware's 0.1 µL integer unit.
pub fn tenth_ul(ul: f64) -> i64 {
    (ul * 10.0).round() as i64
}

/// Builds one outgoing telegram. The id is stamped at build time so a
/// resend gets a fresh identifier from the allocator.
#[derive(Debug, Clone)]
pub struct Command {
    module: &'static str,
    verb: &'static str,
    params: String,
}

impl Command {
    pub fn new(module: &'static str, verb: &'static str) -> Command {
        Command {
            module,
            verb,
            params: String::new(),
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn verb(&self) -> &'static str {
        self.verb
    }

    /// Fixed-width zero-padded decimal. Negative values carry a leading
    /// sign ahead of the padded digits.
    pub fn int(mut self, tag: &str, value: i64, width: usize) -> Command {
        self.params.push_str(tag);
        push_int(&mut self.params, value, width);
        self
    }

    /// Space-separated repeat of fixed-width decimals under one tag.
    pub fn ints(mut self, tag: &str, values: &[i64], width: usize) -> Command {
        self.params.push_str(tag);
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                self.params.push(' ');
            }
            push_int(&mut self.params, *v, width);
        }
        self
    }

    /// Fixed-width uppercase hex.
    pub fn hex(mut self, tag: &str, value: u64, width: usize) -> Command {
        self.params.push_str(tag);
        self.params.push_str(&format!("{:0>width$X}", value, width = width));
        self
    }

    /// Raw string value, e.g. a bit pattern or barcode mask.
    pub fn string(mut self, tag: &str, value: &str) -> Command {
        self.params.push_str(tag);
        self.params.push_str(value);
        self
    }

    /// Single 0/1 flag.
    pub fn flag(self, tag: &str, value: bool) -> Command {
        self.int(tag, value as i64, 1)
    }

    /// Channel involvement pattern, e.g. `tm1000000000000000`.
    pub fn bits(mut self, tag: &str, bits: &[bool]) -> Command {
        self.params.push_str(tag);
        for b in bits {
            self.params.push(if *b { '1' } else { '0' });
        }
        self
    }

    pub fn build(&self, id: u16) -> String {
        format!("{}{}id{:04}{}", self.module, self.verb, id, self.params)
    }
}

fn push_int(buf: &mut String, value: i64, width: usize) {
    if value < 0 {
        buf.push('-');
        buf.push_str(&format!("{:0>width$}", -value, width = width));
    } else {
        buf.push_str(&format!("{:0>width$}", value, width = width));
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Hex(u64),
    Str(String),
    Ints(Vec<i64>),
    Hexes(Vec<u64>),
    Strs(Vec<String>),
}

/// A decoded reply: module/verb echo, identifier, and the fields the
/// format descriptor asked for. Tags the descriptor does not mention are
/// left in the raw text and ignored.
#[derive(Debug, Clone)]
pub struct Reply {
    pub raw: String,
    pub module: String,
    pub verb: String,
    pub id: u16,
    fields: HashMap<String, Value>,
}

impl Reply {
    pub fn int(&self, tag: &str) -> Result<i64, Error> {
        match self.fields.get(tag) {
            Some(Value::Int(v)) => Ok(*v),
            _ => Err(self.missing(tag)),
        }
    }

    pub fn hex(&self, tag: &str) -> Result<u64, Error> {
        match self.fields.get(tag) {
            Some(Value::Hex(v)) => Ok(*v),
            _ => Err(self.missing(tag)),
        }
    }

    pub fn text(&self, tag: &str) -> Result<&str, Error> {
        match self.fields.get(tag) {
            Some(Value::Str(v)) => Ok(v),
            _ => Err(self.missing(tag)),
        }
    }

    pub fn ints(&self, tag: &str) -> Result<&[i64], Error> {
        match self.fields.get(tag) {
            Some(Value::Ints(v)) => Ok(v),
            _ => Err(self.missing(tag)),
        }
    }

    pub fn texts(&self, tag: &str) -> Result<&[String], Error> {
        match self.fields.get(tag) {
            Some(Value::Strs(v)) => Ok(v),
            _ => Err(self.missing(tag)),
        }
    }

    fn missing(&self, tag: &str) -> Error {
        Error::MissingField {
            tag: tag.to_string(),
            response: self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Decimal,
    Hex,
    Any,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    tag: String,
    kind: FieldKind,
    width: usize,
    repeated: bool,
}

fn parse_descriptor(fmt: &str) -> Result<Vec<FieldSpec>, Error> {
    let bytes = fmt.as_bytes();
    let mut specs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b' ' {
            i += 1;
            continue;
        }
        if i + 2 > bytes.len() {
            return Err(Error::InvalidInput(format!(
                "format descriptor truncated at '{}'",
                &fmt[i..]
            )));
        }
        let tag = fmt[i..i + 2].to_string();
        i += 2;
        let kind = match bytes.get(i) {
            Some(&b'#') => FieldKind::Decimal,
            Some(&b'*') => FieldKind::Hex,
            Some(&b'&') => FieldKind::Any,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "field '{}' in descriptor '{}' has no type symbol",
                    tag, fmt
                )))
            }
        };
        let symbol = bytes[i];
        let mut width = 0;
        while i < bytes.len() && bytes[i] == symbol {
            i += 1;
            width += 1;
        }
        let repeated = fmt[i..].starts_with(" (n)");
        if repeated {
            i += 4;
        }
        specs.push(FieldSpec { tag, kind, width, repeated });
    }
    Ok(specs)
}

/// Decode a reply against a format descriptor. The identifier is always
/// extracted, whether or not the descriptor mentions `id`.
pub fn decode(response: &str, fmt: &str) -> Result<Reply, Error> {
    if response.len() < 4 || !response.is_ascii() {
        return Err(Error::Protocol(format!(
            "reply too short to carry module and verb: '{}'",
            response
        )));
    }
    let module = response[..2].to_string();
    let verb = response[2..4].to_string();
    let body = &response[4..];

    let id_pos = body.find("id").ok_or_else(|| Error::Protocol(format!(
        "reply carries no id field: '{}'",
        response
    )))?;
    let id_digits = body
        .get(id_pos + 2..id_pos + 6)
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| Error::Protocol(format!("malformed id field: '{}'", response)))?;
    let id = id_digits.parse::<u16>().expect("checked digits");

    let mut fields = HashMap::new();
    for spec in parse_descriptor(fmt)? {
        if spec.tag == "id" {
            continue;
        }
        let start = body.find(spec.tag.as_str()).ok_or_else(|| Error::MissingField {
            tag: spec.tag.clone(),
            response: response.to_string(),
        })?;
        let value_text = &body[start + 2..];
        let value = parse_value(value_text, spec.kind, spec.width, spec.repeated).ok_or_else(|| {
            Error::MissingField {
                tag: spec.tag.clone(),
                response: response.to_string(),
            }
        })?;
        fields.insert(spec.tag, value);
    }

    Ok(Reply {
        raw: response.to_string(),
        module,
        verb,
        id,
        fields,
    })
}

fn parse_value(text: &str, kind: FieldKind, width: usize, repeated: bool) -> Option<Value> {
    if !repeated {
        return match kind {
            FieldKind::Decimal => scan_int(text, width).map(|(v, _)| Value::Int(v)),
            FieldKind::Hex => scan_hex(text, width).map(|(v, _)| Value::Hex(v)),
            FieldKind::Any => Some(Value::Str(scan_str(text).0.to_string())),
        };
    }

    match kind {
        FieldKind::Decimal => {
            let mut values = Vec::new();
            let mut rest = text;
            loop {
                let (v, n) = scan_int(rest, width)?;
                values.push(v);
                rest = &rest[n..];
                match continue_repeat(rest, |c| c.is_ascii_digit() || c == '-') {
                    Some(r) => rest = r,
                    None => break,
                }
            }
            Some(Value::Ints(values))
        }
        FieldKind::Hex => {
            let mut values = Vec::new();
            let mut rest = text;
            loop {
                let (v, n) = scan_hex(rest, width)?;
                values.push(v);
                rest = &rest[n..];
                match continue_repeat(rest, |c| c.is_ascii_hexdigit()) {
                    Some(r) => rest = r,
                    None => break,
                }
            }
            Some(Value::Hexes(values))
        }
        FieldKind::Any => {
            let mut values = Vec::new();
            let mut rest = text;
            loop {
                let (s, n) = scan_str(rest);
                values.push(s.to_string());
                rest = &rest[n..];
                match continue_repeat(rest, |c| !c.is_whitespace()) {
                    Some(r) => rest = r,
                    None => break,
                }
            }
            Some(Value::Strs(values))
        }
    }
}

/// A repeat continues over a single space when the next token still looks
/// like a value rather than the next tag.
fn continue_repeat(rest: &str, looks_like_value: impl Fn(char) -> bool) -> Option<&str> {
    let mut chars = rest.chars();
    if chars.next() != Some(' ') {
        return None;
    }
    match chars.next() {
        Some(c) if looks_like_value(c) => Some(&rest[1..]),
        _ => None,
    }
}

/// Reads at most `width` digits (plus a sign); the declared field width
/// keeps the scanner from running into a following tag whose letters
/// happen to be digits of a longer number.
fn scan_int(text: &str, width: usize) -> Option<(i64, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    if bytes.first() == Some(&b'-') || bytes.first() == Some(&b'+') {
        i = 1;
    }
    let start_digits = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() && i - start_digits < width {
        i += 1;
    }
    if i == start_digits {
        return None;
    }
    text[..i].parse::<i64>().ok().map(|v| (v, i))
}

/// Same width rule as [`scan_int`]; hex is additionally at risk of
/// eating tag letters a-f.
fn scan_hex(text: &str, width: usize) -> Option<(u64, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_hexdigit() && i < width.min(16) {
        i += 1;
    }
    if i == 0 {
        return None;
    }
    u64::from_str_radix(&text[..i], 16).ok().map(|v| (v, i))
}

fn scan_str(text: &str) -> (&str, usize) {
    let end = text.find(char::is_whitespace).unwrap_or_else(|| text.len());
    (&text[..end], end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_allocator_wraps() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.advance(), 1);
        assert_eq!(ids.advance(), 2);
        ids.next = 9_999;
        assert_eq!(ids.advance(), 9_999);
        assert_eq!(ids.advance(), 0);
        assert_eq!(ids.advance(), 1);
    }

    #[test]
    fn test_encode_tip_pickup() {
        let mut bits = vec![false; 16];
        bits[0] = true;
        let cmd = Command::new("C0", "TP")
            .bits("tm", &bits)
            .ints("xp", &[1179, 0], 5)
            .int("tt", 2, 2)
            .int("tp", 1644, 5)
            .int("tz", 1605, 5)
            .int("th", 2450, 5)
            .int("td", 0, 1);
        assert_eq!(
            cmd.build(1),
            "C0TPid0001tm1000000000000000xp01179 00000tt02tp01644tz01605th02450td0"
        );
    }

    #[test]
    fn test_encode_negative_and_hex() {
        let cmd = Command::new("H0", "EM").int("xs", -2710, 5).hex("xd", 0x2F, 2);
        assert_eq!(cmd.build(42), "H0EMid0042xs-02710xd2F");
    }

    #[test]
    fn test_decode_configuration_reply() {
        let reply = decode("C0RMid0007kb11kp08", "kb##kp##").unwrap();
        assert_eq!(reply.id, 7);
        assert_eq!(reply.module, "C0");
        assert_eq!(reply.verb, "RM");
        assert_eq!(reply.int("kb").unwrap(), 11);
        assert_eq!(reply.int("kp").unwrap(), 8);
    }

    #[test]
    fn test_decode_extracts_id_without_descriptor() {
        let reply = decode("C0ASid0042", "").unwrap();
        assert_eq!(reply.id, 42);
    }

    #[test]
    fn test_decode_repeated_ints() {
        let reply = decode("C0RTid0011rt1 1 0 1 1 1 1 1", "rt# (n)").unwrap();
        assert_eq!(reply.ints("rt").unwrap(), &[1, 1, 0, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_decode_repeat_stops_at_next_tag() {
        let reply = decode("C0QXid0002yp0635 0626 0617zp2500", "yp#### (n)zp####").unwrap();
        assert_eq!(reply.ints("yp").unwrap(), &[635, 626, 617]);
        assert_eq!(reply.int("zp").unwrap(), 2500);
    }

    #[test]
    fn test_decode_hex_field() {
        let reply = decode("C0QMid0003xl06xw1F40", "xl**xw****").unwrap();
        assert_eq!(reply.hex("xl").unwrap(), 6);
        assert_eq!(reply.hex("xw").unwrap(), 0x1F40);
    }

    #[test]
    fn test_decode_missing_tag_diagnostic() {
        let err = decode("C0RMid0007kb11", "kb##kp##").unwrap_err();
        match err {
            Error::MissingField { tag, response } => {
                assert_eq!(tag, "kp");
                assert_eq!(response, "C0RMid0007kb11");
            }
            other => panic!("expected missing field, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_negative_int() {
        let reply = decode("H0QPid0020xa-0271", "xa####").unwrap();
        assert_eq!(reply.int("xa").unwrap(), -271);
    }

    #[test]
    fn test_round_trip() {
        // Encoding the decoded fields with the original widths reproduces
        // the reply byte for byte.
        let raw = "C0RTid0011rt1 1 0 1 1 1 1 1";
        let reply = decode(raw, "rt# (n)").unwrap();
        let rebuilt = Command::new("C0", "RT")
            .ints("rt", reply.ints("rt").unwrap(), 1)
            .build(reply.id);
        assert_eq!(rebuilt, raw);
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(tenths(117.9), 1179);
        assert_eq!(tenths(164.4), 1644);
        assert_eq!(tenths(-27.1), -271);
        assert_eq!(tenth_ul(50.0), 500);
    }
}

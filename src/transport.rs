// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Transport definition for the instruments

use crate::error::Error;
use std::time::Duration;

/// How a reply is delimited on the wire.
///
/// The Cytomat terminates replies with a carriage return (one model) or
/// CR LF (the others). The STAR ends its record with a single terminator
/// byte; the driver reads until the line goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Read until the given byte, strip terminator bytes from the reply.
    Terminated(u8),
    /// Read until nothing more arrives within the inter-byte timeout.
    UntilQuiet,
}

/// An abstract serial exchange used by the drivers to send telegrams.
///
/// ## How can I implement `Transport`?
///
/// One call is one write-then-read exchange: implementors must write the
/// whole request, then collect the reply according to their [`Framing`].
/// A reply of zero bytes within the read timeout MUST surface as
/// [`Error::NoResponse`], never as an empty success, because it means
/// the instrument is off.
pub trait Transport {
    /// Send a request and return the reply, without terminator bytes.
    fn send(&mut self, request: &[u8], read_timeout: Duration) -> Result<Vec<u8>, Error>;
}

/// A set of options for a serial connection
#[derive(Debug, Clone)]
pub struct Options {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM4`
    pub port: String,
    /// 8N1 is fixed; only the rate varies per device
    pub baud: u32,
    pub write_timeout: Duration,
    /// Default read timeout; individual commands may pass a longer one
    pub read_timeout: Duration,
    pub framing: Framing,
}

impl Options {
    pub fn new(port: impl Into<String>, baud: u32, framing: Framing) -> Options {
        Options {
            port: port.into(),
            baud,
            write_timeout: crate::constant::DEFAULT_WRITE_TIMEOUT,
            read_timeout: crate::constant::DEFAULT_READ_TIMEOUT,
            framing,
        }
    }
}

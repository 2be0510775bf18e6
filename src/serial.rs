// Copyright 2024 The mlstar authors. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Serial port transport implementation

use crate::error::Error;
use crate::transport::{Framing, Options, Transport as Exchange};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Reply buffer; no telegram of either instrument comes close.
const MAX_REPLY: usize = 4096;
/// How long the line must stay silent before an unterminated read is
/// considered complete.
const QUIET_WINDOW: Duration = Duration::from_millis(100);

pub struct Transport {
    options: Options,
    port: Box<dyn SerialPort>,
}

impl Transport {
    /// Open the port with 8N1 framing and the configured timeouts.
    pub fn connect(options: Options) -> Result<Transport, Error> {
        let port = serialport::new(&options.port, options.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(options.read_timeout)
            .open()?;
        Ok(Transport { options, port })
    }

    fn read_terminated(&mut self, terminator: u8, deadline: Instant) -> Result<Vec<u8>, Error> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                return if reply.is_empty() {
                    Err(Error::NoResponse)
                } else {
                    Err(Error::Protocol(format!(
                        "reply not terminated within timeout: {:?}",
                        String::from_utf8_lossy(&reply)
                    )))
                };
            }
            match self.port.read(&mut byte) {
                Ok(0) => return Err(Error::NoResponse),
                Ok(_) => {
                    if byte[0] == terminator {
                        // CR LF framing leaves a CR before the LF terminator
                        if reply.last() == Some(&b'\r') {
                            reply.pop();
                        }
                        return Ok(reply);
                    }
                    if reply.len() == MAX_REPLY {
                        return Err(Error::Protocol("reply exceeds buffer".to_string()));
                    }
                    reply.push(byte[0]);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    if reply.is_empty() {
                        return Err(Error::NoResponse);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_until_quiet(&mut self, deadline: Instant) -> Result<Vec<u8>, Error> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];

        // Wait for the first byte up to the command timeout, then keep
        // reading while the line stays active.
        self.port.set_timeout(deadline.saturating_duration_since(Instant::now()))?;
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if reply.len() + n > MAX_REPLY {
                        return Err(Error::Protocol("reply exceeds buffer".to_string()));
                    }
                    reply.extend_from_slice(&chunk[..n]);
                    self.port.set_timeout(QUIET_WINDOW)?;
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        self.port.set_timeout(self.options.read_timeout)?;

        if reply.is_empty() {
            return Err(Error::NoResponse);
        }
        while let Some(b) = reply.last() {
            if *b == b'\r' || *b == b'\n' {
                reply.pop();
            } else {
                break;
            }
        }
        Ok(reply)
    }
}

impl Exchange for Transport {
    fn send(&mut self, request: &[u8], read_timeout: Duration) -> Result<Vec<u8>, Error> {
        self.port.set_timeout(self.options.write_timeout)?;
        self.port.write_all(request)?;
        self.port.flush()?;
        self.port.set_timeout(read_timeout)?;

        let deadline = Instant::now() + read_timeout;
        match self.options.framing {
            Framing::Terminated(terminator) => self.read_terminated(terminator, deadline),
            Framing::UntilQuiet => self.read_until_quiet(deadline),
        }
    }
}

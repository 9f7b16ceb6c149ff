// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Serial transport: message framing over any byte link.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serialport::SerialPort;

use cockpit_boot::frame::{self, FrameDecoder};
use cockpit_boot::Message;

use crate::client::ClientError;

/// Default timeout for serial operations in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default line rate of the bootloader UART.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Byte link with an adjustable read timeout.
pub trait Link: Read + Write {
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn name(&self) -> String {
        "?".to_string()
    }
}

impl Link for Box<dyn SerialPort> {
    fn timeout(&self) -> Duration {
        SerialPort::timeout(self.as_ref())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(self.as_mut(), timeout).map_err(io::Error::from)
    }

    fn name(&self) -> String {
        SerialPort::name(self.as_ref()).unwrap_or_else(|| "?".to_string())
    }
}

/// Open a serial port for the bootloader.
pub fn open(port_name: &str, baud: u32, timeout_ms: u64) -> Result<Transport<Box<dyn SerialPort>>> {
    let port = serialport::new(port_name, baud)
        .timeout(Duration::from_millis(timeout_ms))
        .open()
        .with_context(|| format!("Failed to open serial port {}", port_name))?;
    Ok(Transport::new(port))
}

/// Framed message transport for communicating with the bootloader.
pub struct Transport<L> {
    link: L,
    decoder: FrameDecoder,
    /// Replies decoded but not yet handed out.
    pending: VecDeque<Message>,
}

impl<L: Link> Transport<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn port_name(&self) -> String {
        self.link.name()
    }

    #[cfg(test)]
    pub fn link(&self) -> &L {
        &self.link
    }

    #[cfg(test)]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Send one message as a frame.
    pub fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let body = message.encode()?;
        let wire = frame::encode_vec(&body)?;
        log::trace!("tx tag {:#04x} ({} bytes)", message.tag(), wire.len());
        self.link.write_all(&wire)?;
        self.link.flush()?;
        Ok(())
    }

    /// Receive the next decodable message.
    ///
    /// Frames that pass the CRC but do not decode are skipped with a
    /// warning; the link's own timeout bounds each read and `wait` bounds
    /// the whole call.
    pub fn receive(&mut self, wait: Duration) -> Result<Message, ClientError> {
        let give_up = Instant::now() + wait;
        let mut buf = [0u8; 64];

        loop {
            if let Some(message) = self.pending.pop_front() {
                log::trace!("rx tag {:#04x} seq {}", message.tag(), message.sequence());
                return Ok(message);
            }
            if Instant::now() >= give_up {
                return Err(ClientError::Timeout);
            }
            let n = match self.link.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(ClientError::Timeout),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            for &byte in &buf[..n] {
                self.decoder.push(byte);
                while let Some(frame) = self.decoder.next_frame() {
                    match Message::decode(frame.body) {
                        Ok(message) => self.pending.push_back(message),
                        Err(e) => log::warn!("undecodable reply skipped: {}", e),
                    }
                }
            }
        }
    }

    /// Discard whatever the device sent that nobody asked for.
    pub fn drain_rx(&mut self) {
        let mut buf = [0u8; 64];
        let old_timeout = self.link.timeout();
        let _ = self.link.set_timeout(Duration::from_millis(10));
        while self.link.read(&mut buf).unwrap_or(0) > 0 {}
        let _ = self.link.set_timeout(old_timeout);
        self.decoder = FrameDecoder::new();
        self.pending.clear();
    }
}

//! Coprocessor serial port ([`Transport`] over the `serialport` crate).

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info};
use serialport::SerialPort;

use crate::link::Transport;

/// Longest line accepted before the buffer is discarded.
const MAX_LINE: usize = 4096;

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    buf: Vec<u8>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io::Error::from)?;
        info!("Serial port {path} open at {baud_rate} baud");
        Ok(Self {
            port,
            buf: Vec::with_capacity(256),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line).trim().to_owned();
        Some(text)
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        self.port.set_timeout(timeout).map_err(io::Error::from)?;
        let mut chunk = [0u8; 256];
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(Some(line));
                    }
                    if self.buf.len() > MAX_LINE {
                        debug!("Discarding {} bytes without a newline", self.buf.len());
                        self.buf.clear();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

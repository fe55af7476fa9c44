//! Arbitrary function generator control over a message bus
//!
//! Covers the subset of the AFG command set the fast scan path needs: channel
//! function/frequency, and the edit memory (`EMEM`) used to hold scan
//! waveforms. Waveform data travels as an IEEE 488.2 definite-length block of
//! big-endian u16 samples: `#<meta_len><data_len><bytes>`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use parking_lot::Mutex;
use std::io::{Cursor, Read};
use std::sync::Arc;

use super::interface::{Positioner, VisaBus};
use crate::error::ScanError;

/// Bus shared by every object talking to one instrument
pub type SharedBus = Arc<Mutex<Box<dyn VisaBus>>>;

pub fn shared_bus<B: VisaBus + 'static>(bus: B) -> SharedBus {
    Arc::new(Mutex::new(Box::new(bus)))
}

/// Largest level the edit memory accepts
pub const ARB_YMAX: u16 = 16382;

/// Largest number of points the edit memory holds
pub const ARB_MAX_POINTS: usize = 1 << 17;

/// Encode samples as a definite-length block
pub fn encode_block(samples: &[u16]) -> Result<Vec<u8>, ScanError> {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        data.write_u16::<BigEndian>(sample)?;
    }

    let data_len = data.len().to_string();
    let meta_len = data_len.len().to_string();
    if meta_len.len() != 1 {
        return Err(ScanError::Protocol(format!(
            "Block of {} bytes is too large for a definite-length header",
            data.len()
        )));
    }

    let mut block = Vec::with_capacity(2 + data_len.len() + data.len());
    block.push(b'#');
    block.extend_from_slice(meta_len.as_bytes());
    block.extend_from_slice(data_len.as_bytes());
    block.extend_from_slice(&data);
    Ok(block)
}

/// Decode a definite-length block into samples
pub fn decode_block(block: &[u8]) -> Result<Vec<u16>, ScanError> {
    let mut cursor = Cursor::new(block);

    let mut hash = [0u8; 1];
    cursor.read_exact(&mut hash)?;
    if hash[0] != b'#' {
        return Err(ScanError::Protocol(format!(
            "Block must start with '#', got {:#04x}",
            hash[0]
        )));
    }

    let mut meta = [0u8; 1];
    cursor.read_exact(&mut meta)?;
    let meta_len = parse_ascii_number(&meta)?;

    let mut len_digits = vec![0u8; meta_len];
    cursor.read_exact(&mut len_digits)?;
    let data_len = parse_ascii_number(&len_digits)?;

    if data_len % 2 != 0 {
        return Err(ScanError::Protocol(format!(
            "Block payload of {data_len} bytes is not a whole number of u16 samples"
        )));
    }

    // Header length is untrusted; never reserve more than the block can hold
    let mut samples = Vec::with_capacity((data_len / 2).min(block.len() / 2));
    for _ in 0..data_len / 2 {
        let sample = cursor.read_u16::<BigEndian>().map_err(|_| {
            ScanError::Protocol("Block payload truncated".to_string())
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

fn parse_ascii_number(digits: &[u8]) -> Result<usize, ScanError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| ScanError::Protocol(format!("Invalid block header digits {digits:?}")))
}

/// One output channel of an AFG
#[derive(Clone)]
pub struct AfgChannel {
    bus: SharedBus,
    channel: Option<u8>,
}

impl AfgChannel {
    /// `channel` is `None` for single-channel instruments
    pub fn new(bus: SharedBus, channel: Option<u8>) -> Self {
        Self { bus, channel }
    }

    fn cmd(&self, command: &str) -> String {
        match self.channel {
            Some(ch) => format!("source{ch}:{command}"),
            None => command.to_string(),
        }
    }

    pub fn mode(&self) -> Result<String, ScanError> {
        let reply = self.bus.lock().ask(&self.cmd("func?"))?;
        Ok(reply.trim().to_string())
    }

    pub fn set_mode(&self, mode: &str) -> Result<(), ScanError> {
        self.bus.lock().write(&self.cmd(&format!("func {mode}")))
    }

    pub fn freq(&self) -> Result<f64, ScanError> {
        let reply = self.bus.lock().ask(&self.cmd("freq?"))?;
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| ScanError::Protocol(format!("Invalid frequency reply '{reply}'")))
    }

    pub fn set_freq(&self, hz: f64) -> Result<(), ScanError> {
        self.bus.lock().write(&self.cmd(&format!("freq {hz}")))
    }
}

/// The AFG's arbitrary edit memory
#[derive(Clone)]
pub struct Arb {
    bus: SharedBus,
}

impl Arb {
    pub fn new(bus: SharedBus) -> Self {
        Self { bus }
    }

    pub fn is_selected(&self) -> Result<bool, ScanError> {
        let reply = self.bus.lock().ask("func?")?;
        Ok(reply.to_uppercase().contains("EMEM"))
    }

    pub fn select(&self) -> Result<(), ScanError> {
        self.bus.lock().write("func emem")
    }

    /// Wipe the edit memory to `npts` points (2..=131072), optionally filled with `level`
    pub fn initialize(&self, npts: usize, level: Option<u16>) -> Result<(), ScanError> {
        if !(2..=ARB_MAX_POINTS).contains(&npts) {
            return Err(ScanError::InvalidState(format!(
                "Edit memory length {npts} outside 2..={ARB_MAX_POINTS}"
            )));
        }
        self.bus.lock().write(&format!("data:define emem,{npts}"))?;
        if let Some(level) = level {
            self.add_line(1, npts, level, None)?;
        }
        Ok(())
    }

    /// Draw a line between two points; indices are 1-based
    pub fn add_line(&self, x0: usize, x1: usize, y0: u16, y1: Option<u16>) -> Result<(), ScanError> {
        let y1 = y1.unwrap_or(y0);
        self.bus
            .lock()
            .write(&format!("data:line emem,{x0},{y0},{x1},{y1}"))
    }

    pub fn npts(&self) -> Result<usize, ScanError> {
        let reply = self.bus.lock().ask("data:points? emem")?;
        reply
            .trim()
            .parse::<usize>()
            .map_err(|_| ScanError::Protocol(format!("Invalid points reply '{reply}'")))
    }

    pub fn set_npts(&self, npts: usize) -> Result<(), ScanError> {
        self.bus.lock().write(&format!("data:points emem,{npts}"))
    }

    pub fn data(&self) -> Result<Vec<u16>, ScanError> {
        let mut bus = self.bus.lock();
        bus.write("data:data? emem")?;
        let block = bus.read_raw()?;
        decode_block(&block)
    }

    pub fn set_data(&self, samples: &[u16]) -> Result<(), ScanError> {
        let block = encode_block(samples)?;
        let mut message = b"data:data emem,".to_vec();
        message.extend_from_slice(&block);
        debug!("Uploading {} points to edit memory", samples.len());
        self.bus.lock().write_raw(&message)
    }

    /// Read one point; `index` is 1-based
    pub fn point(&self, index: usize) -> Result<u16, ScanError> {
        let reply = self.bus.lock().ask(&format!("data:value? emem,{index}"))?;
        reply
            .trim()
            .parse::<u16>()
            .map_err(|_| ScanError::Protocol(format!("Invalid point reply '{reply}'")))
    }

    pub fn set_point(&self, index: usize, value: u16) -> Result<(), ScanError> {
        self.bus
            .lock()
            .write(&format!("data:value emem,{index},{value}"))
    }

    /// Copy the edit memory into a user register (`user1`, `user2`, ...)
    pub fn copy_to(&self, register: &str) -> Result<(), ScanError> {
        self.bus.lock().write(&format!("data:copy {register},emem"))
    }

    pub fn copy_from(&self, register: &str) -> Result<(), ScanError> {
        self.bus.lock().write(&format!("data:copy emem,{register}"))
    }
}

/// Uses point 1 of an AFG's edit memory as a DC level, so the AFG can stand in for a galvo DAC
pub struct AfgAsDac {
    arb: Arb,
    value: Option<i64>,
}

impl AfgAsDac {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            arb: Arb::new(bus),
            value: None,
        }
    }

    /// Read the level back from the instrument
    pub fn read_value(&self) -> Result<u16, ScanError> {
        self.arb.point(1)
    }
}

impl Positioner for AfgAsDac {
    fn set_value(&mut self, value: i64) -> Result<(), ScanError> {
        let level = u16::try_from(value)
            .ok()
            .filter(|level| *level <= ARB_YMAX)
            .ok_or_else(|| {
                ScanError::HardwareFault(format!("AFG level {value} outside 0..={ARB_YMAX}"))
            })?;
        self.arb.set_point(1, level)?;
        self.value = Some(value);
        Ok(())
    }

    fn value(&self) -> Option<i64> {
        self.value
    }
}

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

use super::interface::{AnalogOutput, Positioner};
use crate::error::ScanError;

/// Positioner shared between the scan worker and manual controls
pub type SharedPositioner = Arc<Mutex<Box<dyn Positioner>>>;

pub fn shared<P: Positioner + 'static>(positioner: P) -> SharedPositioner {
    Arc::new(Mutex::new(Box::new(positioner)))
}

/// Analog output channel that verifies every write
pub struct DacChannel {
    output: Box<dyn AnalogOutput>,
    value: Option<i64>,
}

impl DacChannel {
    pub fn new(output: Box<dyn AnalogOutput>) -> Self {
        Self {
            output,
            value: None,
        }
    }

    pub fn name(&self) -> &str {
        self.output.channel()
    }

    pub fn value(&self) -> Option<i64> {
        self.value
    }

    /// Write a raw sample, failing with `HardwareFault` unless exactly one sample was written
    pub fn set_value(&mut self, value: i64) -> Result<(), ScanError> {
        let sample = i16::try_from(value).map_err(|_| {
            ScanError::HardwareFault(format!(
                "Value {value} out of range for DAC channel {}",
                self.output.channel()
            ))
        })?;

        let written = self.output.write_raw(sample)?;
        if written != 1 {
            return Err(ScanError::HardwareFault(format!(
                "Partial write on {}: {written} of 1 samples",
                self.output.channel()
            )));
        }

        self.value = Some(value);
        Ok(())
    }
}

/// Widest DAC supported; raw samples are written as `i16`
pub const MAX_DAC_BITS: u32 = 15;

/// Galvanometer mirror driven by a DAC channel
///
/// Values wrap modulo `2^bits`; a reversed galvo writes the negated value so
/// that increasing positions always move the beam the same way on screen.
pub struct GalvoPixel {
    dac: DacChannel,
    max_value: i64,
    factor: i64,
    value: Option<i64>,
}

impl GalvoPixel {
    /// Fails with `InvalidState` unless `bits` is in `1..=MAX_DAC_BITS`
    pub fn new(output: Box<dyn AnalogOutput>, bits: u32, reverse: bool) -> Result<Self, ScanError> {
        if !(1..=MAX_DAC_BITS).contains(&bits) {
            return Err(ScanError::InvalidState(format!(
                "DAC on {} cannot have {bits} bits, expected 1..={MAX_DAC_BITS}",
                output.channel()
            )));
        }
        Ok(Self {
            dac: DacChannel::new(output),
            max_value: 1i64 << bits,
            factor: if reverse { -1 } else { 1 },
            value: None,
        })
    }

    pub fn name(&self) -> &str {
        self.dac.name()
    }

    pub fn max_value(&self) -> i64 {
        self.max_value
    }
}

impl Positioner for GalvoPixel {
    fn set_value(&mut self, value: i64) -> Result<(), ScanError> {
        let raw = (self.factor * value).rem_euclid(self.max_value);
        debug!("{} <- {} (raw {})", self.dac.name(), value, raw);
        self.dac.set_value(raw)?;
        self.value = Some(value.rem_euclid(self.max_value));
        Ok(())
    }

    fn value(&self) -> Option<i64> {
        self.value
    }
}

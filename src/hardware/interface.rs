use std::time::Duration;

use crate::error::ScanError;

/// Timing of a counter-output pulse, all in seconds on the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseTiming {
    pub initial_delay: Duration,
    pub low_time: Duration,
    pub high_time: Duration,
}

/// Sample clock for a buffered (finite-sample) counter task
#[derive(Debug, Clone, PartialEq)]
pub struct SampleClock {
    /// Terminal the clock edges arrive on (e.g. `PFI34`)
    pub source: String,
    /// Nominal rate handed to the driver; the external clock sets the real pace
    pub rate_hz: f64,
    /// Number of samples to acquire before the task is done
    pub samples: usize,
}

/// Edge-counter task configuration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EdgeCounterConfig {
    /// Pause the counter while this terminal is low
    pub pause_trigger: Option<String>,
    /// Latch one count per clock edge instead of free-running
    pub sample_clock: Option<SampleClock>,
}

/// Single-channel analog output, written one raw sample at a time
pub trait AnalogOutput: Send {
    /// Physical channel name, e.g. `Dev2/ao0`
    fn channel(&self) -> &str;

    /// Write one raw DAC sample and start immediately
    ///
    /// # Returns
    /// Number of samples the device reports as written. Anything other than 1
    /// means the write was not confirmed.
    fn write_raw(&mut self, sample: i16) -> Result<usize, ScanError>;
}

/// Counter-output task producing one gate pulse per start
pub trait PulseTask: Send {
    fn start(&mut self) -> Result<(), ScanError>;

    /// Block until the pulse has been generated, failing with `Timeout` past `timeout`
    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), ScanError>;

    /// Stop the task. May fail if the task is not running.
    fn stop(&mut self) -> Result<(), ScanError>;
}

/// Edge-counting task, either scalar (gated) or sample-clocked
pub trait CountTask: Send {
    fn start(&mut self) -> Result<(), ScanError>;

    /// Read the accumulated count of a scalar counter
    fn read_scalar(&mut self, timeout: Duration) -> Result<u32, ScanError>;

    /// Read up to `samples` latched values of a sample-clocked counter
    fn read_buffer(&mut self, samples: usize, timeout: Duration) -> Result<Vec<u32>, ScanError>;

    /// Block until a finite acquisition is complete
    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), ScanError>;

    /// Stop the task. May fail if the task is not running.
    fn stop(&mut self) -> Result<(), ScanError>;
}

/// Factory for DAQ card tasks
///
/// Implemented by real drivers and by [`super::sim::SimulatedDaq`]. Each call
/// allocates a fresh task; the caller owns it exclusively.
pub trait DaqDriver: Send {
    fn create_analog_output(&mut self, channel: &str) -> Result<Box<dyn AnalogOutput>, ScanError>;

    fn create_pulse(
        &mut self,
        channel: &str,
        timing: PulseTiming,
    ) -> Result<Box<dyn PulseTask>, ScanError>;

    fn create_edge_counter(
        &mut self,
        channel: &str,
        config: EdgeCounterConfig,
    ) -> Result<Box<dyn CountTask>, ScanError>;
}

/// Message-based instrument bus (GPIB/VISA style)
pub trait VisaBus: Send {
    /// Write a command and read back the text reply
    fn ask(&mut self, command: &str) -> Result<String, ScanError>;

    fn write(&mut self, command: &str) -> Result<(), ScanError>;

    fn write_raw(&mut self, data: &[u8]) -> Result<(), ScanError>;

    fn read_raw(&mut self) -> Result<Vec<u8>, ScanError>;
}

/// Anything that can hold a scan-axis position: a galvo on a DAC, or an AFG
pub trait Positioner: Send {
    fn set_value(&mut self, value: i64) -> Result<(), ScanError>;

    /// Last value successfully written, if any
    fn value(&self) -> Option<i64>;
}

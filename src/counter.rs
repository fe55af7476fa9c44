use log::{debug, warn};
use std::time::Duration;

use crate::error::ScanError;
use crate::hardware::{
    CountTask, DaqDriver, EdgeCounterConfig, PulseTask, PulseTiming, SampleClock,
};

/// Bound on waiting for a gate pulse and on reading back its count
pub const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle-low time before each gate pulse
pub const GATE_LOW_TIME: Duration = Duration::from_micros(100);

/// Width of the pulse that triggers an AFG burst
pub const TRIGGER_PULSE_WIDTH: Duration = Duration::from_millis(10);

/// Extra time allowed for a buffered burst beyond its nominal duration
pub const BURST_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Nominal sample clock rate handed to the driver for buffered counting
pub const BUFFERED_CLOCK_RATE_HZ: f64 = 10_000.0;

/// Internal output terminal of a paired counter, usable as a pause trigger
///
/// `Dev1/ctr1` becomes `/Dev1/Ctr1InternalOutput`.
pub fn internal_output_terminal(pulse_channel: &str) -> String {
    format!("/{}InternalOutput", pulse_channel.replace("ctr", "Ctr"))
}

/// Convert a raw count over `dwell` into counts per second
pub fn count_rate(count: u32, dwell: Duration) -> f64 {
    count as f64 / dwell.as_secs_f64()
}

/// Channel pair used for hardware-timed photon counting
#[derive(Debug, Clone, PartialEq)]
pub struct GatedCounter {
    pub pulse_channel: String,
    pub count_channel: String,
}

impl GatedCounter {
    pub fn new(pulse_channel: impl Into<String>, count_channel: impl Into<String>) -> Self {
        Self {
            pulse_channel: pulse_channel.into(),
            count_channel: count_channel.into(),
        }
    }

    /// Configure a pulse task of width `dwell` and an edge counter paused while the pulse is low
    pub fn configure(
        &self,
        driver: &mut dyn DaqDriver,
        dwell: Duration,
    ) -> Result<CounterHandle, ScanError> {
        let pulse = driver.create_pulse(
            &self.pulse_channel,
            PulseTiming {
                initial_delay: Duration::ZERO,
                low_time: GATE_LOW_TIME,
                high_time: dwell,
            },
        )?;
        let counter = driver.create_edge_counter(
            &self.count_channel,
            EdgeCounterConfig {
                pause_trigger: Some(internal_output_terminal(&self.pulse_channel)),
                sample_clock: None,
            },
        )?;
        debug!(
            "Configured gated counter {} -> {} ({:?} gate)",
            self.pulse_channel, self.count_channel, dwell
        );
        Ok(CounterHandle::new(pulse, counter, dwell))
    }

    /// Configure a sample-clocked counter latching `sample_count` values, plus a burst trigger pulse
    pub fn configure_buffered(
        &self,
        driver: &mut dyn DaqDriver,
        sample_count: usize,
        sample_clock: &str,
        pause_trigger: Option<&str>,
        timeout: Duration,
    ) -> Result<BufferedHandle, ScanError> {
        let counter = driver.create_edge_counter(
            &self.count_channel,
            EdgeCounterConfig {
                pause_trigger: pause_trigger.map(str::to_string),
                sample_clock: Some(SampleClock {
                    source: sample_clock.to_string(),
                    rate_hz: BUFFERED_CLOCK_RATE_HZ,
                    samples: sample_count,
                }),
            },
        )?;
        let pulse = driver.create_pulse(
            &self.pulse_channel,
            PulseTiming {
                initial_delay: Duration::ZERO,
                low_time: GATE_LOW_TIME,
                high_time: TRIGGER_PULSE_WIDTH,
            },
        )?;
        debug!(
            "Configured buffered counter on {} for {} samples clocked by {}",
            self.count_channel, sample_count, sample_clock
        );
        Ok(BufferedHandle {
            pulse,
            counter,
            samples: sample_count,
            timeout,
            armed: false,
        })
    }
}

/// Pulse + counter task pair for gated counting
///
/// Owns both tasks for the duration of a scan. Dropping the handle stops
/// whatever is still running, so tasks are released on every exit path.
pub struct CounterHandle {
    pulse: Box<dyn PulseTask>,
    counter: Box<dyn CountTask>,
    dwell: Duration,
    timeout: Duration,
    armed: bool,
}

impl CounterHandle {
    pub fn new(pulse: Box<dyn PulseTask>, counter: Box<dyn CountTask>, dwell: Duration) -> Self {
        Self {
            pulse,
            counter,
            dwell,
            timeout: FINISH_TIMEOUT,
            armed: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    /// Whether a gate is in flight
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm the counter, then fire the gate pulse
    pub fn start(&mut self) -> Result<(), ScanError> {
        if self.armed {
            return Err(ScanError::InvalidState(
                "Counter already has a gate in flight".to_string(),
            ));
        }
        self.armed = true;
        let result = self.counter.start().and_then(|_| self.pulse.start());
        if result.is_err() {
            self.release();
        }
        result
    }

    /// Wait for the gate to close, read the count and stop both tasks
    pub fn finish(&mut self) -> Result<u32, ScanError> {
        if !self.armed {
            return Err(ScanError::InvalidState(
                "Counter finished without being started".to_string(),
            ));
        }
        let timeout = self.timeout;
        let result = self
            .pulse
            .wait_until_done(timeout)
            .and_then(|_| self.counter.read_scalar(timeout));

        match result {
            Ok(count) => {
                self.pulse.stop()?;
                self.counter.stop()?;
                self.armed = false;
                Ok(count)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Synchronous start + finish
    pub fn count(&mut self) -> Result<u32, ScanError> {
        self.start()?;
        self.finish()
    }

    /// Synchronous count converted to counts per second
    pub fn count_rate(&mut self) -> Result<f64, ScanError> {
        let count = self.count()?;
        Ok(count_rate(count, self.dwell))
    }

    /// Stop both tasks, ignoring "not running" errors. Safe to call repeatedly.
    pub fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = self.counter.stop() {
            debug!("No need to stop counter: {e}");
        } else {
            debug!("Stopped counter");
        }
        if let Err(e) = self.pulse.stop() {
            debug!("No need to stop gate pulse: {e}");
        } else {
            debug!("Stopped gate pulse");
        }
    }
}

impl Drop for CounterHandle {
    fn drop(&mut self) {
        if self.armed {
            warn!("Releasing counter with a gate still in flight");
        }
        self.release();
    }
}

/// Sample-clocked counter plus burst trigger, for whole-frame acquisition
pub struct BufferedHandle {
    pulse: Box<dyn PulseTask>,
    counter: Box<dyn CountTask>,
    samples: usize,
    timeout: Duration,
    armed: bool,
}

impl BufferedHandle {
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one burst and return the raw (accumulating) counter samples
    pub fn acquire(&mut self) -> Result<Vec<u32>, ScanError> {
        if self.armed {
            return Err(ScanError::InvalidState(
                "Buffered counter already armed".to_string(),
            ));
        }
        self.armed = true;
        match self.run_burst() {
            Ok(data) => Ok(data),
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn run_burst(&mut self) -> Result<Vec<u32>, ScanError> {
        self.counter.start()?;
        self.pulse.start()?;
        self.counter.wait_until_done(self.timeout)?;
        let data = self.counter.read_buffer(self.samples, FINISH_TIMEOUT)?;
        self.counter.stop()?;
        self.pulse.stop()?;
        self.armed = false;

        if data.len() != self.samples {
            return Err(ScanError::HardwareFault(format!(
                "Buffered read returned {} of {} samples",
                data.len(),
                self.samples
            )));
        }
        Ok(data)
    }

    /// Stop both tasks, ignoring "not running" errors. Safe to call repeatedly.
    pub fn release(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = self.counter.stop() {
            debug!("No need to stop buffered counter: {e}");
        }
        if let Err(e) = self.pulse.stop() {
            debug!("No need to stop trigger pulse: {e}");
        }
    }
}

impl Drop for BufferedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

//! In-memory stand-ins for the DAQ card and the AFGs
//!
//! Backs the CLI when no vendor driver is linked, and the test suite. Every task
//! operation is recorded so tests can check ordering (arm before fire,
//! finish after start) and resource release.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::afg::{decode_block, encode_block};
use super::interface::{
    AnalogOutput, CountTask, DaqDriver, EdgeCounterConfig, PulseTask, PulseTiming, VisaBus,
};
use crate::error::ScanError;

/// Photon counts produced for a given gate (or buffered sample) index
pub type CountFn = Box<dyn FnMut(usize) -> u32 + Send>;

/// One recorded hardware operation
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOp {
    AnalogWrite { channel: String, value: i16 },
    PulseCreated { channel: String, timing: PulseTiming },
    CounterCreated { channel: String, config: EdgeCounterConfig },
    CounterStart { channel: String },
    PulseStart { channel: String, gate: usize },
    PulseWait { channel: String, gate: usize },
    CounterRead { channel: String, gate: usize, count: u32 },
    BufferRead { channel: String, samples: usize },
    PulseStop { channel: String },
    CounterStop { channel: String },
}

struct SimState {
    ops: Vec<TaskOp>,
    counts: CountFn,
    gates_fired: usize,
    buffered_offset: usize,
    analog_writes: usize,
    fail_analog_after: Option<usize>,
    fail_count_gate: Option<usize>,
    timeout_gate: Option<usize>,
    pace: Option<Duration>,
}

/// Simulated DAQ card
///
/// Cloning shares the underlying state, so a test can keep one clone for
/// inspection while the scan owns another.
#[derive(Clone)]
pub struct SimulatedDaq {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDaq {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDaq {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                ops: Vec::new(),
                counts: Box::new(pseudo_random_counts),
                gates_fired: 0,
                buffered_offset: 0,
                analog_writes: 0,
                fail_analog_after: None,
                fail_count_gate: None,
                timeout_gate: None,
                pace: None,
            })),
        }
    }

    /// Replace the count source; `f` receives the 0-based gate index
    pub fn with_counts<F>(self, f: F) -> Self
    where
        F: FnMut(usize) -> u32 + Send + 'static,
    {
        self.state.lock().counts = Box::new(f);
        self
    }

    /// Report a partial write for every analog write after the first `n`
    pub fn fail_analog_write_after(self, n: usize) -> Self {
        self.state.lock().fail_analog_after = Some(n);
        self
    }

    /// Fail the counter readback of gate `gate` with a driver error
    pub fn fail_count_at_gate(self, gate: usize) -> Self {
        self.state.lock().fail_count_gate = Some(gate);
        self
    }

    /// Make the pulse of gate `gate` never report done
    pub fn timeout_at_gate(self, gate: usize) -> Self {
        self.state.lock().timeout_gate = Some(gate);
        self
    }

    /// Sleep this long in every pulse wait, standing in for the dwell time
    pub fn with_pace(self, pace: Duration) -> Self {
        self.state.lock().pace = Some(pace);
        self
    }

    pub fn operations(&self) -> Vec<TaskOp> {
        self.state.lock().ops.clone()
    }

    pub fn gates_fired(&self) -> usize {
        self.state.lock().gates_fired
    }

    fn record(&self, op: TaskOp) {
        self.state.lock().ops.push(op);
    }
}

fn pseudo_random_counts(index: usize) -> u32 {
    let mut h = (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 29;
    (h % 2000) as u32 + 200
}

impl DaqDriver for SimulatedDaq {
    fn create_analog_output(&mut self, channel: &str) -> Result<Box<dyn AnalogOutput>, ScanError> {
        Ok(Box::new(SimAnalogOutput {
            channel: channel.to_string(),
            daq: self.clone(),
        }))
    }

    fn create_pulse(
        &mut self,
        channel: &str,
        timing: PulseTiming,
    ) -> Result<Box<dyn PulseTask>, ScanError> {
        self.record(TaskOp::PulseCreated {
            channel: channel.to_string(),
            timing,
        });
        Ok(Box::new(SimPulse {
            channel: channel.to_string(),
            daq: self.clone(),
            running: false,
            gate: None,
        }))
    }

    fn create_edge_counter(
        &mut self,
        channel: &str,
        config: EdgeCounterConfig,
    ) -> Result<Box<dyn CountTask>, ScanError> {
        self.record(TaskOp::CounterCreated {
            channel: channel.to_string(),
            config: config.clone(),
        });
        Ok(Box::new(SimCounter {
            channel: channel.to_string(),
            daq: self.clone(),
            running: false,
            buffered: config.sample_clock.is_some(),
        }))
    }
}

struct SimAnalogOutput {
    channel: String,
    daq: SimulatedDaq,
}

impl AnalogOutput for SimAnalogOutput {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn write_raw(&mut self, sample: i16) -> Result<usize, ScanError> {
        let mut state = self.daq.state.lock();
        state.analog_writes += 1;
        if let Some(limit) = state.fail_analog_after {
            if state.analog_writes > limit {
                return Ok(0);
            }
        }
        state.ops.push(TaskOp::AnalogWrite {
            channel: self.channel.clone(),
            value: sample,
        });
        Ok(1)
    }
}

struct SimPulse {
    channel: String,
    daq: SimulatedDaq,
    running: bool,
    gate: Option<usize>,
}

impl PulseTask for SimPulse {
    fn start(&mut self) -> Result<(), ScanError> {
        if self.running {
            return Err(ScanError::HardwareFault(format!(
                "Pulse task {} already running",
                self.channel
            )));
        }
        let mut state = self.daq.state.lock();
        let gate = state.gates_fired;
        state.gates_fired += 1;
        state.ops.push(TaskOp::PulseStart {
            channel: self.channel.clone(),
            gate,
        });
        self.running = true;
        self.gate = Some(gate);
        Ok(())
    }

    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), ScanError> {
        let gate = self.gate.ok_or_else(|| {
            ScanError::HardwareFault(format!("Pulse task {} was never started", self.channel))
        })?;
        let (pace, hang) = {
            let mut state = self.daq.state.lock();
            state.ops.push(TaskOp::PulseWait {
                channel: self.channel.clone(),
                gate,
            });
            (state.pace, state.timeout_gate == Some(gate))
        };
        if let Some(pace) = pace {
            std::thread::sleep(pace);
        }
        if hang {
            return Err(ScanError::Timeout {
                operation: format!("pulse on {}", self.channel),
                after: timeout,
            });
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ScanError> {
        if !self.running {
            return Err(ScanError::HardwareFault(format!(
                "Pulse task {} is not running",
                self.channel
            )));
        }
        self.running = false;
        self.daq.record(TaskOp::PulseStop {
            channel: self.channel.clone(),
        });
        Ok(())
    }
}

struct SimCounter {
    channel: String,
    daq: SimulatedDaq,
    running: bool,
    buffered: bool,
}

impl CountTask for SimCounter {
    fn start(&mut self) -> Result<(), ScanError> {
        if self.running {
            return Err(ScanError::HardwareFault(format!(
                "Counter task {} already running",
                self.channel
            )));
        }
        self.running = true;
        self.daq.record(TaskOp::CounterStart {
            channel: self.channel.clone(),
        });
        Ok(())
    }

    fn read_scalar(&mut self, _timeout: Duration) -> Result<u32, ScanError> {
        let mut state = self.daq.state.lock();
        let gate = state.gates_fired.checked_sub(1).ok_or_else(|| {
            ScanError::HardwareFault(format!("Counter {} read before any gate", self.channel))
        })?;
        if state.fail_count_gate == Some(gate) {
            return Err(ScanError::HardwareFault(format!(
                "Simulated driver error reading {} at gate {gate}",
                self.channel
            )));
        }
        let count = (state.counts)(gate);
        state.ops.push(TaskOp::CounterRead {
            channel: self.channel.clone(),
            gate,
            count,
        });
        Ok(count)
    }

    fn read_buffer(&mut self, samples: usize, _timeout: Duration) -> Result<Vec<u32>, ScanError> {
        if !self.buffered {
            return Err(ScanError::HardwareFault(format!(
                "Counter {} has no sample clock",
                self.channel
            )));
        }
        let mut state = self.daq.state.lock();
        let offset = state.buffered_offset;
        state.buffered_offset += samples;

        // Free-running counter: every latched sample is the running total
        let mut total = 0u32;
        let mut data = Vec::with_capacity(samples);
        for i in 0..samples {
            total = total.wrapping_add((state.counts)(offset + i));
            data.push(total);
        }
        state.ops.push(TaskOp::BufferRead {
            channel: self.channel.clone(),
            samples,
        });
        debug!("Simulated burst of {samples} samples from {}", self.channel);
        Ok(data)
    }

    fn wait_until_done(&mut self, _timeout: Duration) -> Result<(), ScanError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ScanError> {
        if !self.running {
            return Err(ScanError::HardwareFault(format!(
                "Counter task {} is not running",
                self.channel
            )));
        }
        self.running = false;
        self.daq.record(TaskOp::CounterStop {
            channel: self.channel.clone(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct AfgState {
    emem: Vec<u16>,
    registers: HashMap<String, Vec<u16>>,
    modes: HashMap<String, String>,
    freqs: HashMap<String, f64>,
    pending_read: Option<Vec<u8>>,
}

/// Simulated arbitrary function generator with an in-memory edit memory
pub struct SimulatedAfg {
    commands: Arc<Mutex<Vec<String>>>,
    state: AfgState,
}

impl Default for SimulatedAfg {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAfg {
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            state: AfgState::default(),
        }
    }

    /// Shared log of every command written, including raw writes (payload elided)
    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.commands.clone()
    }

    fn log(&self, command: &str) {
        self.commands.lock().push(command.to_string());
    }

    fn emem_index(&self, index: &str) -> Result<usize, ScanError> {
        let index: usize = parse_arg(index)?;
        if index == 0 || index > self.state.emem.len() {
            return Err(ScanError::Protocol(format!(
                "Point {index} outside edit memory of {} points",
                self.state.emem.len()
            )));
        }
        Ok(index - 1)
    }
}

fn parse_arg<T: std::str::FromStr>(arg: &str) -> Result<T, ScanError> {
    arg.trim()
        .parse::<T>()
        .map_err(|_| ScanError::Protocol(format!("Invalid argument '{arg}'")))
}

/// Split `source2:freq 10` into (`source2`, `freq 10`)
fn split_prefix(command: &str) -> (String, String) {
    let command = command.trim().to_lowercase();
    if command.starts_with("source") {
        if let Some((prefix, rest)) = command.split_once(':') {
            return (prefix.to_string(), rest.to_string());
        }
    }
    (String::new(), command)
}

impl VisaBus for SimulatedAfg {
    fn ask(&mut self, command: &str) -> Result<String, ScanError> {
        self.log(command);
        let (prefix, body) = split_prefix(command);
        match body.as_str() {
            "func?" => Ok(self
                .state
                .modes
                .get(&prefix)
                .cloned()
                .unwrap_or_else(|| "SIN".to_string())),
            "freq?" => Ok(self.state.freqs.get(&prefix).copied().unwrap_or(1000.0).to_string()),
            "data:points? emem" => Ok(self.state.emem.len().to_string()),
            _ => {
                if let Some(index) = body.strip_prefix("data:value? emem,") {
                    let i = self.emem_index(index)?;
                    Ok(self.state.emem[i].to_string())
                } else {
                    Err(ScanError::Protocol(format!("Unknown query '{command}'")))
                }
            }
        }
    }

    fn write(&mut self, command: &str) -> Result<(), ScanError> {
        self.log(command);
        let (prefix, body) = split_prefix(command);

        if let Some(mode) = body.strip_prefix("func ") {
            self.state.modes.insert(prefix, mode.trim().to_uppercase());
        } else if let Some(freq) = body.strip_prefix("freq ") {
            self.state.freqs.insert(prefix, parse_arg(freq)?);
        } else if let Some(npts) = body.strip_prefix("data:define emem,") {
            self.state.emem = vec![8191; parse_arg(npts)?];
        } else if let Some(npts) = body.strip_prefix("data:points emem,") {
            self.state.emem.resize(parse_arg(npts)?, 8191);
        } else if let Some(args) = body.strip_prefix("data:line emem,") {
            let parts: Vec<&str> = args.split(',').collect();
            if parts.len() != 4 {
                return Err(ScanError::Protocol(format!("Malformed line '{command}'")));
            }
            let x0 = self.emem_index(parts[0])?;
            let y0: f64 = parse_arg(parts[1])?;
            let x1 = self.emem_index(parts[2])?;
            let y1: f64 = parse_arg(parts[3])?;
            for x in x0..=x1 {
                let frac = if x1 == x0 {
                    0.0
                } else {
                    (x - x0) as f64 / (x1 - x0) as f64
                };
                self.state.emem[x] = (y0 + frac * (y1 - y0)).round() as u16;
            }
        } else if let Some(args) = body.strip_prefix("data:value emem,") {
            let (index, value) = args
                .split_once(',')
                .ok_or_else(|| ScanError::Protocol(format!("Malformed value '{command}'")))?;
            let i = self.emem_index(index)?;
            self.state.emem[i] = parse_arg(value)?;
        } else if let Some(args) = body.strip_prefix("data:copy ") {
            let (to, from) = args
                .split_once(',')
                .ok_or_else(|| ScanError::Protocol(format!("Malformed copy '{command}'")))?;
            let (to, from) = (to.trim(), from.trim());
            if from == "emem" {
                self.state
                    .registers
                    .insert(to.to_string(), self.state.emem.clone());
            } else if to == "emem" {
                self.state.emem = self
                    .state
                    .registers
                    .get(from)
                    .cloned()
                    .ok_or_else(|| ScanError::Protocol(format!("Empty register '{from}'")))?;
            } else {
                return Err(ScanError::Protocol(format!("Unsupported copy '{command}'")));
            }
        } else if body == "data:data? emem" {
            self.state.pending_read = Some(encode_block(&self.state.emem)?);
        } else {
            return Err(ScanError::Protocol(format!("Unknown command '{command}'")));
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), ScanError> {
        const HEADER: &[u8] = b"data:data emem,";
        let block = data
            .strip_prefix(HEADER)
            .ok_or_else(|| ScanError::Protocol("Unknown raw write".to_string()))?;
        self.log(&format!("data:data emem,<{} bytes>", block.len()));
        self.state.emem = decode_block(block)?;
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, ScanError> {
        self.state
            .pending_read
            .take()
            .ok_or_else(|| ScanError::Protocol("Nothing to read".to_string()))
    }
}

//! Background acquisition thread
//!
//! The worker drains a fallible stream on its own thread and posts one event
//! per item, so the caller's thread stays free to redraw. Abort is
//! cooperative: the flag is checked before every pull, never in the middle of
//! one, so a pulled value is always delivered.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::ScanError;
use crate::hardware::SharedPositioner;
use crate::types::ScanState;

/// Scan state shared between the worker thread and its controllers
pub type SharedState = Arc<Mutex<ScanState>>;

/// How a scan ended
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed,
    Aborted,
    Faulted(String),
}

/// Notification posted by the worker
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent<T> {
    /// A new item, or `None` acknowledging an abort
    Result { data: Option<T> },
    /// Posted exactly once per scan, after the stream has been dropped
    Finished { elapsed: Duration, outcome: ScanOutcome },
}

impl<T> ScanEvent<T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, ScanEvent::Finished { .. })
    }
}

/// Runs one scan at a time on a dedicated thread
pub struct AcquisitionWorker {
    state: SharedState,
    abort_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Default for AcquisitionWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionWorker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScanState::Idle)),
            abort_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    /// Start draining `stream` in the background
    ///
    /// Fails with `InvalidState` while a previous scan is still running or
    /// aborting.
    pub fn start<T, S>(&mut self, stream: S) -> Result<Receiver<ScanEvent<T>>, ScanError>
    where
        T: Send + 'static,
        S: Iterator<Item = Result<T, ScanError>> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if !state.can_start() {
                return Err(ScanError::InvalidState(format!(
                    "Cannot start a scan while {:?}",
                    *state
                )));
            }
            *state = ScanState::Running;
        }
        // The previous thread has already posted Finished; reap it
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        self.abort_flag.store(false, Ordering::SeqCst);
        let (tx, rx) = unbounded();
        let state = self.state.clone();
        let abort_flag = self.abort_flag.clone();

        let spawned = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || run(stream, tx, abort_flag, state));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(rx)
            }
            Err(source) => {
                *self.state.lock() = ScanState::Idle;
                Err(ScanError::Io {
                    source,
                    context: "Failed to spawn acquisition thread".to_string(),
                })
            }
        }
    }

    /// Ask the running scan to stop before its next step. Safe to call at any time.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        if *state == ScanState::Running {
            info!("Abort requested");
            *state = ScanState::Aborting;
            self.abort_flag.store(true, Ordering::SeqCst);
        }
    }

    /// Block until the worker thread has stopped
    pub fn join(&mut self) -> Result<(), ScanError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if handle.join().is_err() {
            *self.state.lock() = ScanState::Finished;
            return Err(ScanError::InvalidState(
                "Acquisition thread panicked".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.abort();
        if let Err(e) = self.join() {
            warn!("Worker stopped uncleanly: {e}");
        }
    }
}

fn run<T, S>(mut stream: S, tx: Sender<ScanEvent<T>>, abort_flag: Arc<AtomicBool>, state: SharedState)
where
    S: Iterator<Item = Result<T, ScanError>>,
{
    let start = Instant::now();
    let mut delivered = 0usize;

    // A panicking driver must still end the scan with a Finished event
    let drained = panic::catch_unwind(AssertUnwindSafe(|| {
        drain(&mut stream, &tx, &abort_flag, &mut delivered)
    }));
    let outcome = drained.unwrap_or_else(|payload| {
        let msg = panic_message(payload.as_ref());
        error!("Scan panicked after {delivered} updates: {msg}");
        ScanOutcome::Faulted(format!("Acquisition panicked: {msg}"))
    });

    // Release hardware before announcing the end
    if panic::catch_unwind(AssertUnwindSafe(move || drop(stream))).is_err() {
        error!("Releasing scan hardware panicked");
    }
    let elapsed = start.elapsed();
    *state.lock() = ScanState::Finished;
    info!("Scan finished ({outcome:?}) after {elapsed:.2?}, {delivered} updates");
    let _ = tx.send(ScanEvent::Finished { elapsed, outcome });
}

fn drain<T, S>(
    stream: &mut S,
    tx: &Sender<ScanEvent<T>>,
    abort_flag: &AtomicBool,
    delivered: &mut usize,
) -> ScanOutcome
where
    S: Iterator<Item = Result<T, ScanError>>,
{
    loop {
        if abort_flag.load(Ordering::SeqCst) {
            let _ = tx.send(ScanEvent::Result { data: None });
            return ScanOutcome::Aborted;
        }
        match stream.next() {
            Some(Ok(data)) => {
                *delivered += 1;
                // A dropped receiver just means nobody is watching
                let _ = tx.send(ScanEvent::Result { data: Some(data) });
            }
            Some(Err(e)) => {
                error!("Scan faulted after {delivered} updates: {e}");
                return ScanOutcome::Faulted(e.to_string());
            }
            None => return ScanOutcome::Completed,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Manual galvo control that refuses to move while a scan owns the galvos
#[derive(Clone)]
pub struct ManualPositioner {
    positioner: SharedPositioner,
    state: SharedState,
}

impl ManualPositioner {
    pub fn new(positioner: SharedPositioner, state: SharedState) -> Self {
        Self { positioner, state }
    }

    /// Move the galvo unless a scan is active
    ///
    /// The state lock is held through the move so a scan cannot start halfway
    /// through it. Lock order is state, then positioner.
    pub fn set_value(&self, value: i64) -> Result<(), ScanError> {
        let state = self.state.lock();
        if state.is_active() {
            return Err(ScanError::InvalidState(format!(
                "Cannot move galvo manually while scan is {:?}",
                *state
            )));
        }
        self.positioner.lock().set_value(value)
    }

    pub fn value(&self) -> Option<i64> {
        self.positioner.lock().value()
    }
}

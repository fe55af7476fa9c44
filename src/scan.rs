//! Ties hardware, streams and the worker together into one scan session

use crossbeam_channel::Receiver;
use log::{info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::counter::GatedCounter;
use crate::error::ScanError;
use crate::fast::FastSetup;
use crate::frame::{Chunked, Frame, FrameAssembler, FrameUpdate, Measurement, SharedFrame};
use crate::hardware::galvo::shared;
use crate::hardware::{DaqDriver, GalvoPixel, SharedBus, SharedPositioner};
use crate::monitor::{RateMonitor, RateSample};
use crate::pixel_stream::PixelStream;
use crate::source::RasterPositions;
use crate::types::{ScanPlan, ScanState};
use crate::worker::{AcquisitionWorker, ManualPositioner, ScanEvent};

type UpdateStream = Box<dyn Iterator<Item = Result<FrameUpdate, ScanError>> + Send>;

/// How a scan is acquired and how often the UI hears about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Galvo stepping, one notification per pixel
    Point,
    /// Galvo stepping, one notification per row
    PointRows,
    /// AFG waveforms, one notification per frame
    Burst { repeat: bool },
    /// AFG waveforms reloaded per line, one notification per row
    BurstRows,
}

/// Owns the DAQ driver, both galvos and the acquisition worker
pub struct ScanSession {
    driver: Box<dyn DaqDriver>,
    xgalvo: SharedPositioner,
    ygalvo: SharedPositioner,
    counting: GatedCounter,
    fast: Option<FastSetup>,
    worker: AcquisitionWorker,
    home: Option<(Option<i64>, Option<i64>)>,
    dropped: Option<Arc<AtomicUsize>>,
}

impl ScanSession {
    pub fn new(
        driver: Box<dyn DaqDriver>,
        xgalvo: SharedPositioner,
        ygalvo: SharedPositioner,
        counting: GatedCounter,
    ) -> Self {
        Self {
            driver,
            xgalvo,
            ygalvo,
            counting,
            fast: None,
            worker: AcquisitionWorker::new(),
            home: None,
            dropped: None,
        }
    }

    pub fn with_fast(mut self, fast: FastSetup) -> Self {
        self.fast = Some(fast);
        self
    }

    /// Build a session from configuration, creating both galvo outputs on `driver`
    ///
    /// The AFG buses enable burst scans; pass `None` for point scans only.
    pub fn from_config(
        config: &AppConfig,
        mut driver: Box<dyn DaqDriver>,
        afgs: Option<(SharedBus, SharedBus)>,
    ) -> Result<Self, ScanError> {
        let bits = config.galvos.bits;
        let x = driver.create_analog_output(&config.galvos.xgalvo)?;
        let y = driver.create_analog_output(&config.galvos.ygalvo)?;
        let counting = GatedCounter::new(&config.counting.pulsechan, &config.counting.countchan);

        let mut session = Self::new(
            driver,
            shared(GalvoPixel::new(x, bits, false)?),
            shared(GalvoPixel::new(y, bits, false)?),
            counting,
        );
        if let Some((det_bus, rf_bus)) = afgs {
            session = session.with_fast(FastSetup {
                counter: GatedCounter::new(&config.fast.pulsechan, &config.fast.countchan),
                sample_clock: config.fast.sampleclk.clone(),
                det_bus,
                rf_bus,
            });
        }
        Ok(session)
    }

    pub fn state(&self) -> ScanState {
        self.worker.state()
    }

    pub fn manual_x(&self) -> ManualPositioner {
        ManualPositioner::new(self.xgalvo.clone(), self.worker.shared_state())
    }

    pub fn manual_y(&self) -> ManualPositioner {
        ManualPositioner::new(self.ygalvo.clone(), self.worker.shared_state())
    }

    /// Notifications swallowed by the last row-chunked scan's incomplete final group
    pub fn dropped_notifications(&self) -> usize {
        self.dropped
            .as_ref()
            .map_or(0, |d| d.load(Ordering::Relaxed))
    }

    fn ensure_idle(&self) -> Result<(), ScanError> {
        let state = self.worker.state();
        if state.can_start() {
            Ok(())
        } else {
            Err(ScanError::InvalidState(format!(
                "A scan is already {state:?}"
            )))
        }
    }

    /// Configure hardware for `plan` and start acquiring in the background
    ///
    /// Returns the frame being filled (all NaN at first) and the event channel.
    pub fn start_scan(
        &mut self,
        plan: &ScanPlan,
        mode: ScanMode,
    ) -> Result<(SharedFrame, Receiver<ScanEvent<FrameUpdate>>), ScanError> {
        let frame = Frame::for_plan(plan).shared();
        let rx = self.start_scan_into(plan, mode, frame.clone())?;
        Ok((frame, rx))
    }

    /// Like [`start_scan`](Self::start_scan), but fills a frame the caller already holds
    ///
    /// The frame must have the plan's shape; it is reset to NaN before any
    /// hardware is touched.
    pub fn start_scan_into(
        &mut self,
        plan: &ScanPlan,
        mode: ScanMode,
        frame: SharedFrame,
    ) -> Result<Receiver<ScanEvent<FrameUpdate>>, ScanError> {
        self.ensure_idle()?;
        {
            let mut buffer = frame.write();
            if buffer.shape() != plan.shape() {
                return Err(ScanError::InvalidState(format!(
                    "Frame of shape {:?} cannot hold a {:?} scan",
                    buffer.shape(),
                    plan.shape()
                )));
            }
            buffer.clear();
        }
        self.dropped = None;

        let stream: UpdateStream = match mode {
            ScanMode::Point | ScanMode::PointRows => {
                self.home = Some((self.xgalvo.lock().value(), self.ygalvo.lock().value()));
                let counter = self.counting.configure(self.driver.as_mut(), plan.dwell)?;
                let positions =
                    RasterPositions::new(plan, self.xgalvo.clone(), self.ygalvo.clone());
                let pixels =
                    PixelStream::new(positions, counter).map(|r| r.map(Measurement::Pixel));
                let assembler = FrameAssembler::points(pixels, frame, plan.zigzag);
                if mode == ScanMode::PointRows {
                    let chunked = Chunked::new(assembler, plan.x.len());
                    self.dropped = Some(chunked.dropped());
                    Box::new(chunked)
                } else {
                    Box::new(assembler)
                }
            }
            ScanMode::Burst { repeat } => {
                let fast = self.fast.as_ref().ok_or_else(no_afgs)?;
                let bursts = fast
                    .prepare(self.driver.as_mut(), plan, repeat)?
                    .map(|r| r.map(Measurement::Frame));
                Box::new(FrameAssembler::frames(bursts, frame))
            }
            ScanMode::BurstRows => {
                let fast = self.fast.as_ref().ok_or_else(no_afgs)?;
                let rows = fast
                    .prepare_rows(self.driver.as_mut(), plan)?
                    .map(|r| r.map(Measurement::Row));
                Box::new(FrameAssembler::rows(rows, frame, plan.zigzag))
            }
        };

        info!("Starting {mode:?} scan: {}", plan.summary());
        self.worker.start(stream)
    }

    /// Start a free-running count-rate monitor in the background
    pub fn start_monitor(
        &mut self,
        dwell: Duration,
    ) -> Result<Receiver<ScanEvent<RateSample>>, ScanError> {
        self.ensure_idle()?;
        let counter = self.counting.configure(self.driver.as_mut(), dwell)?;
        info!("Starting rate monitor with {dwell:?} gates");
        self.worker.start(RateMonitor::new(counter))
    }

    pub fn abort(&self) {
        self.worker.abort();
    }

    /// Wait for the worker to stop, then move the galvos back to where they were before the scan
    pub fn join(&mut self) -> Result<(), ScanError> {
        self.worker.join()?;
        if let Some((x, y)) = self.home.take() {
            if let Some(x) = x {
                self.manual_x().set_value(x)?;
            }
            if let Some(y) = y {
                self.manual_y().set_value(y)?;
            }
        }
        let dropped = self.dropped_notifications();
        if dropped > 0 {
            warn!("Last {dropped} pixels were written without a notification");
        }
        Ok(())
    }
}

fn no_afgs() -> ScanError {
    ScanError::InvalidState("No AFGs configured for burst scans".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::afg::shared_bus;
    use crate::hardware::{SimulatedAfg, SimulatedDaq};
    use crate::types::ScanAxis;
    use crate::worker::ScanOutcome;

    fn plan(nx: i64, ny: i64) -> ScanPlan {
        ScanPlan::new(
            ScanAxis::new((0..nx).collect()).unwrap(),
            ScanAxis::new((0..ny).map(|v| v + 100).collect()).unwrap(),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    fn session(daq: &SimulatedDaq) -> ScanSession {
        let afgs = (shared_bus(SimulatedAfg::new()), shared_bus(SimulatedAfg::new()));
        ScanSession::from_config(&AppConfig::default(), Box::new(daq.clone()), Some(afgs)).unwrap()
    }

    fn drain<T>(rx: &Receiver<ScanEvent<T>>) -> Vec<ScanEvent<T>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            let finished = event.is_finished();
            events.push(event);
            if finished {
                break;
            }
        }
        events
    }

    #[test]
    fn test_row_mode_notifies_once_per_row() {
        let daq = SimulatedDaq::new();
        let mut session = session(&daq);
        let (frame, rx) = session.start_scan(&plan(4, 3), ScanMode::PointRows).unwrap();
        let events = drain(&rx);
        session.join().unwrap();

        assert_eq!(events.len(), 4);
        assert!(frame.read().is_complete());
        assert_eq!(session.dropped_notifications(), 0);
    }

    #[test]
    fn test_galvos_restored_after_scan() {
        let daq = SimulatedDaq::new();
        let mut session = session(&daq);
        session.manual_x().set_value(7).unwrap();
        session.manual_y().set_value(9).unwrap();

        let (_frame, rx) = session.start_scan(&plan(2, 2), ScanMode::Point).unwrap();
        drain(&rx);
        session.join().unwrap();

        assert_eq!(session.manual_x().value(), Some(7));
        assert_eq!(session.manual_y().value(), Some(9));
    }

    #[test]
    fn test_burst_scan_single_frame() {
        let daq = SimulatedDaq::new().with_counts(|_| 5);
        let mut session = session(&daq);
        let (frame, rx) = session
            .start_scan(&plan(3, 2), ScanMode::Burst { repeat: false })
            .unwrap();
        let events = drain(&rx);
        session.join().unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ScanEvent::Result { data: Some(FrameUpdate::FrameWritten { index: 0 }) }
        );
        assert!(frame.read().data().iter().all(|&v| (v - 500.0).abs() < 1e-9));
    }

    #[test]
    fn test_burst_without_afgs_rejected() {
        let daq = SimulatedDaq::new();
        let mut session =
            ScanSession::from_config(&AppConfig::default(), Box::new(daq), None).unwrap();
        assert!(matches!(
            session.start_scan(&plan(2, 2), ScanMode::Burst { repeat: false }),
            Err(ScanError::InvalidState(_))
        ));
        assert_eq!(session.state(), ScanState::Idle);
    }

    #[test]
    fn test_monitor_runs_until_aborted() {
        let daq = SimulatedDaq::new().with_pace(Duration::from_millis(2));
        let mut session = session(&daq);
        let rx = session.start_monitor(Duration::from_millis(2)).unwrap();
        for _ in 0..3 {
            assert!(matches!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                ScanEvent::Result { data: Some(_) }
            ));
        }
        session.abort();
        session.join().unwrap();
        let rest = drain(&rx);
        assert!(matches!(
            rest.last(),
            Some(ScanEvent::Finished { outcome: ScanOutcome::Aborted, .. })
        ));
    }

    #[test]
    fn test_row_burst_places_zigzag_rows() {
        let daq = SimulatedDaq::new().with_counts(|i| i as u32 + 1);
        let mut session = session(&daq);
        let plan = plan(3, 2).with_zigzag(true);
        let (frame, rx) = session.start_scan(&plan, ScanMode::BurstRows).unwrap();
        let events = drain(&rx);
        session.join().unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1],
            ScanEvent::Result { data: Some(FrameUpdate::RowWritten { row: 1 }) }
        );
        assert!(matches!(
            events[2],
            ScanEvent::Finished { outcome: ScanOutcome::Completed, .. }
        ));
        let frame = frame.read();
        assert_eq!(frame.data().row(0).to_vec(), vec![100., 200., 300.]);
        assert_eq!(frame.data().row(1).to_vec(), vec![600., 500., 400.]);
    }

    #[test]
    fn test_caller_frame_is_reused() {
        let daq = SimulatedDaq::new().with_counts(|_| 5);
        let mut session = session(&daq);
        let frame = Frame::new(2, 3).shared();
        frame.write().set(0, 0, -1.0).unwrap();

        let rx = session
            .start_scan_into(&plan(3, 2), ScanMode::Point, frame.clone())
            .unwrap();
        drain(&rx);
        session.join().unwrap();
        assert!(frame.read().data().iter().all(|&v| (v - 500.0).abs() < 1e-9));
    }

    #[test]
    fn test_mismatched_frame_rejected_before_hardware() {
        let daq = SimulatedDaq::new();
        let mut session = session(&daq);
        let before = daq.operations().len();
        // 3 rows x 2 columns cannot hold 2 rows x 3 columns
        let frame = Frame::new(3, 2).shared();

        assert!(matches!(
            session.start_scan_into(&plan(3, 2), ScanMode::Point, frame),
            Err(ScanError::InvalidState(_))
        ));
        assert_eq!(session.state(), ScanState::Idle);
        assert_eq!(daq.operations().len(), before);
    }

    #[test]
    fn test_unsupported_dac_width_rejected() {
        let values: std::collections::HashMap<_, _> =
            [("galvos.bits".to_string(), "64".to_string())].into_iter().collect();
        let config = crate::config::from_flat_map(&values).unwrap();
        assert!(matches!(
            ScanSession::from_config(&config, Box::new(SimulatedDaq::new()), None),
            Err(ScanError::InvalidState(_))
        ));
    }
}

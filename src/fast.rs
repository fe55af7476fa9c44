//! Fast (waveform) scanning
//!
//! Instead of stepping the galvos from software, the whole raster is written
//! into the edit memory of two AFGs as X and Y waveforms, with a square sync
//! wave clocking a buffered counter. One trigger pulse starts the burst; the
//! counter latches its running total once per pixel and the image is the
//! successive difference of those totals.

use log::{debug, info};
use ndarray::Array2;
use std::time::Duration;

use crate::counter::{BufferedHandle, GatedCounter, BURST_TIMEOUT_MARGIN};
use crate::error::ScanError;
use crate::hardware::afg::{ARB_MAX_POINTS, ARB_YMAX};
use crate::hardware::{AfgChannel, Arb, DaqDriver, SharedBus};
use crate::types::ScanPlan;

/// User register holding the sync wave on the detector AFG
pub const SYNC_REGISTER: &str = "user3";

/// Flattened X, Y and sync waveforms, two points per pixel
#[derive(Debug, Clone, PartialEq)]
pub struct Waveforms {
    pub x: Vec<u16>,
    pub y: Vec<u16>,
    pub sync: Vec<u16>,
}

impl Waveforms {
    /// Number of waveform points
    pub fn npts(&self) -> usize {
        self.sync.len()
    }

    /// Number of acquisitions (pixels)
    pub fn naqs(&self) -> usize {
        self.npts() / 2
    }
}

/// Square wave `0, amp, 0, amp, ...`
pub fn sync_wave(len: usize, amp: u16) -> Vec<u16> {
    (0..len).map(|i| if i % 2 == 1 { amp } else { 0 }).collect()
}

/// Every value twice in a row
pub fn pairify(values: &[u16]) -> Vec<u16> {
    values.iter().flat_map(|&v| [v, v]).collect()
}

fn to_levels(axis: &[i64], name: &str) -> Result<Vec<u16>, ScanError> {
    axis.iter()
        .map(|&v| {
            u16::try_from(v)
                .ok()
                .filter(|level| *level <= ARB_YMAX)
                .ok_or_else(|| {
                    ScanError::InvalidState(format!(
                        "{name} position {v} outside AFG range 0..={ARB_YMAX}"
                    ))
                })
        })
        .collect()
}

/// Build the raster waveforms for the given axes
pub fn make_waveforms(x: &[i64], y: &[i64], zigzag: bool) -> Result<Waveforms, ScanError> {
    let row = pairify(&to_levels(x, "X")?);
    let ys = to_levels(y, "Y")?;

    let npts = row.len() * ys.len();
    if npts > ARB_MAX_POINTS {
        return Err(ScanError::InvalidState(format!(
            "Scan needs {npts} waveform points, edit memory holds {ARB_MAX_POINTS}"
        )));
    }

    let mut xs = Vec::with_capacity(npts);
    let mut yw = Vec::with_capacity(npts);
    for (r, &level) in ys.iter().enumerate() {
        if zigzag && r % 2 == 1 {
            xs.extend(row.iter().rev());
        } else {
            xs.extend_from_slice(&row);
        }
        yw.extend(std::iter::repeat_n(level, row.len()));
    }

    Ok(Waveforms {
        x: xs,
        y: yw,
        sync: sync_wave(npts, ARB_YMAX),
    })
}

/// Waveforms for a single scan line at level `y`, X running backwards when `reversed`
pub fn row_waveforms(xs: &[u16], y: u16, reversed: bool) -> Waveforms {
    let mut x = pairify(xs);
    if reversed {
        x.reverse();
    }
    let npts = x.len();
    Waveforms {
        x,
        y: vec![y; npts],
        sync: sync_wave(npts, ARB_YMAX),
    }
}

/// Time allowed for a burst of `naqs` pixels
fn burst_timeout(dwell: Duration, naqs: usize) -> Duration {
    u32::try_from(naqs)
        .ok()
        .and_then(|n| dwell.checked_mul(n))
        .and_then(|d| d.checked_add(BURST_TIMEOUT_MARGIN))
        .unwrap_or(Duration::MAX)
}

/// Upload waveforms to both AFGs and set every channel to one raster per period
///
/// The detector AFG carries the sync wave on channel 1 (from a user register)
/// and Y on channel 2; the RF AFG carries X. Returns the number of pixels.
pub fn load_waveforms(
    waveforms: &Waveforms,
    dwell: Duration,
    det_bus: &SharedBus,
    rf_bus: &SharedBus,
) -> Result<usize, ScanError> {
    let det_arb = Arb::new(det_bus.clone());
    let rf_arb = Arb::new(rf_bus.clone());

    let s_ch = AfgChannel::new(det_bus.clone(), Some(1));
    let y_ch = AfgChannel::new(det_bus.clone(), Some(2));
    let x_ch = AfgChannel::new(rf_bus.clone(), None);

    let npts = waveforms.npts();
    let naqs = waveforms.naqs();

    det_arb.set_npts(npts)?;
    det_arb.set_data(&waveforms.sync)?;
    det_arb.copy_to(SYNC_REGISTER)?;
    det_arb.set_data(&waveforms.y)?;
    rf_arb.set_npts(npts)?;
    rf_arb.set_data(&waveforms.x)?;

    s_ch.set_mode(SYNC_REGISTER)?;
    y_ch.set_mode("emem")?;
    x_ch.set_mode("emem")?;

    let freq = 1.0 / (naqs as f64 * dwell.as_secs_f64());
    for ch in [&x_ch, &y_ch, &s_ch] {
        ch.set_freq(freq)?;
    }
    info!("Loaded {naqs}-pixel raster into AFGs at {freq:.4} Hz");
    Ok(naqs)
}

/// Turn a burst of running counter totals into per-pixel counts
///
/// The counter wraps at `u32::MAX`, so differences use wrapping arithmetic.
pub fn decode_image(
    raw: &[u32],
    shape: (usize, usize),
    zigzag: bool,
) -> Result<Array2<f64>, ScanError> {
    let (rows, cols) = shape;
    if raw.len() != rows * cols {
        return Err(ScanError::InvalidState(format!(
            "{} samples cannot fill a {rows}x{cols} image",
            raw.len()
        )));
    }

    let mut previous = 0u32;
    let mut counts: Vec<f64> = raw
        .iter()
        .map(|&total| {
            let count = total.wrapping_sub(previous);
            previous = total;
            count as f64
        })
        .collect();

    if zigzag && cols > 0 {
        for row in counts.chunks_mut(cols).skip(1).step_by(2) {
            row.reverse();
        }
    }
    Array2::from_shape_vec((rows, cols), counts).map_err(|e| ScanError::InvalidState(e.to_string()))
}

/// Channels and instruments for fast scanning
pub struct FastSetup {
    pub counter: GatedCounter,
    pub sample_clock: String,
    pub det_bus: SharedBus,
    pub rf_bus: SharedBus,
}

impl FastSetup {
    /// Load the waveforms for `plan` and configure a buffered counter for it
    pub fn prepare(
        &self,
        driver: &mut dyn DaqDriver,
        plan: &ScanPlan,
        repeat: bool,
    ) -> Result<FrameBurstStream, ScanError> {
        let waveforms = make_waveforms(plan.x.positions(), plan.y.positions(), plan.zigzag)?;
        let naqs = load_waveforms(&waveforms, plan.dwell, &self.det_bus, &self.rf_bus)?;
        let timeout = burst_timeout(plan.dwell, naqs);
        let handle =
            self.counter
                .configure_buffered(driver, naqs, &self.sample_clock, None, timeout)?;
        Ok(FrameBurstStream::new(handle, plan, repeat))
    }

    /// Configure a buffered counter for one scan line; each row is loaded into
    /// the AFGs just before its burst
    pub fn prepare_rows(
        &self,
        driver: &mut dyn DaqDriver,
        plan: &ScanPlan,
    ) -> Result<RowBurstStream, ScanError> {
        let xs = to_levels(plan.x.positions(), "X")?;
        let ys = to_levels(plan.y.positions(), "Y")?;
        if xs.len() * 2 > ARB_MAX_POINTS {
            return Err(ScanError::InvalidState(format!(
                "Row needs {} waveform points, edit memory holds {ARB_MAX_POINTS}",
                xs.len() * 2
            )));
        }
        let timeout = burst_timeout(plan.dwell, xs.len());
        let handle =
            self.counter
                .configure_buffered(driver, xs.len(), &self.sample_clock, None, timeout)?;
        Ok(RowBurstStream {
            handle,
            det_bus: self.det_bus.clone(),
            rf_bus: self.rf_bus.clone(),
            xs,
            ys,
            zigzag: plan.zigzag,
            dwell: plan.dwell,
            row: 0,
            done: false,
        })
    }
}

/// One whole frame of count rates per burst
pub struct FrameBurstStream {
    handle: BufferedHandle,
    shape: (usize, usize),
    zigzag: bool,
    dwell: Duration,
    repeat: bool,
    frames: usize,
    done: bool,
}

impl FrameBurstStream {
    pub fn new(handle: BufferedHandle, plan: &ScanPlan, repeat: bool) -> Self {
        Self {
            handle,
            shape: plan.shape(),
            zigzag: plan.zigzag,
            dwell: plan.dwell,
            repeat,
            frames: 0,
            done: false,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl Iterator for FrameBurstStream {
    type Item = Result<Array2<f64>, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = self
            .handle
            .acquire()
            .and_then(|raw| decode_image(&raw, self.shape, self.zigzag));
        match frame {
            Ok(counts) => {
                self.frames += 1;
                if !self.repeat {
                    self.done = true;
                }
                debug!("Burst {} decoded", self.frames);
                let dwell = self.dwell.as_secs_f64();
                Some(Ok(counts.mapv(|c| c / dwell)))
            }
            Err(e) => {
                debug!("Burst acquisition failed after {} frames: {e}", self.frames);
                self.done = true;
                self.handle.release();
                Some(Err(e))
            }
        }
    }
}

/// One scan line of count rates per burst, `len(Y)` bursts in all
///
/// Rows come out in acquisition order, so odd rows of a zigzag scan are
/// right to left.
pub struct RowBurstStream {
    handle: BufferedHandle,
    det_bus: SharedBus,
    rf_bus: SharedBus,
    xs: Vec<u16>,
    ys: Vec<u16>,
    zigzag: bool,
    dwell: Duration,
    row: usize,
    done: bool,
}

impl RowBurstStream {
    /// Rows acquired so far
    pub fn rows(&self) -> usize {
        self.row
    }

    fn acquire_row(&mut self) -> Result<Vec<f64>, ScanError> {
        let reversed = self.zigzag && self.row % 2 == 1;
        let waveforms = row_waveforms(&self.xs, self.ys[self.row], reversed);
        load_waveforms(&waveforms, self.dwell, &self.det_bus, &self.rf_bus)?;
        let raw = self.handle.acquire()?;
        let counts = decode_image(&raw, (1, self.xs.len()), false)?;
        let dwell = self.dwell.as_secs_f64();
        Ok(counts.iter().map(|c| c / dwell).collect())
    }
}

impl Iterator for RowBurstStream {
    type Item = Result<Vec<f64>, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.row >= self.ys.len() {
            self.done = true;
            return None;
        }
        match self.acquire_row() {
            Ok(rates) => {
                self.row += 1;
                Some(Ok(rates))
            }
            Err(e) => {
                debug!("Row burst {} failed: {e}", self.row);
                self.done = true;
                self.handle.release();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::afg::shared_bus;
    use crate::hardware::{SimulatedAfg, SimulatedDaq};
    use crate::types::ScanAxis;
    use ndarray::array;

    #[test]
    fn test_make_waveforms_layout() {
        let w = make_waveforms(&[1, 2], &[5, 6], false).unwrap();
        assert_eq!(w.x, vec![1, 1, 2, 2, 1, 1, 2, 2]);
        assert_eq!(w.y, vec![5, 5, 5, 5, 6, 6, 6, 6]);
        assert_eq!(w.sync, vec![0, 16382, 0, 16382, 0, 16382, 0, 16382]);
        assert_eq!(w.naqs(), 4);

        let z = make_waveforms(&[1, 2], &[5, 6], true).unwrap();
        assert_eq!(z.x, vec![1, 1, 2, 2, 2, 2, 1, 1]);
    }

    #[test]
    fn test_make_waveforms_limits() {
        let x: Vec<i64> = (0..300).collect();
        assert!(matches!(
            make_waveforms(&x, &x, false),
            Err(ScanError::InvalidState(_))
        ));
        assert!(make_waveforms(&[-1], &[0], false).is_err());
        assert!(make_waveforms(&[0], &[16383], false).is_err());
    }

    #[test]
    fn test_decode_image() {
        let im = decode_image(&[1, 3, 6, 10], (2, 2), false).unwrap();
        assert_eq!(im, array![[1., 2.], [3., 4.]]);

        let im = decode_image(&[1, 3, 6, 10], (2, 2), true).unwrap();
        assert_eq!(im, array![[1., 2.], [4., 3.]]);

        // Counter rollover
        let im = decode_image(&[u32::MAX - 1, 1], (1, 2), false).unwrap();
        assert_eq!(im, array![[(u32::MAX - 1) as f64, 3.]]);

        assert!(decode_image(&[1, 2, 3], (2, 2), false).is_err());
    }

    #[test]
    fn test_load_waveforms() {
        let det = SimulatedAfg::new();
        let det_log = det.command_log();
        let det_bus = shared_bus(det);
        let rf_bus = shared_bus(SimulatedAfg::new());

        let w = make_waveforms(&[1, 2], &[5, 6], false).unwrap();
        let naqs = load_waveforms(&w, Duration::from_millis(10), &det_bus, &rf_bus).unwrap();
        assert_eq!(naqs, 4);

        assert_eq!(Arb::new(det_bus.clone()).data().unwrap(), w.y);
        assert_eq!(Arb::new(rf_bus.clone()).data().unwrap(), w.x);

        let s_ch = AfgChannel::new(det_bus.clone(), Some(1));
        assert_eq!(s_ch.mode().unwrap(), "USER3");
        assert_eq!(s_ch.freq().unwrap(), 25.0);
        assert_eq!(AfgChannel::new(rf_bus, None).freq().unwrap(), 25.0);

        // Sync wave is stored before Y overwrites the edit memory
        let log = det_log.lock().clone();
        let copy = log.iter().position(|c| c == "data:copy user3,emem").unwrap();
        let uploads: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with("data:data emem,"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(uploads.len(), 2);
        assert!(uploads[0] < copy && copy < uploads[1]);
    }

    fn plan() -> ScanPlan {
        ScanPlan::new(
            ScanAxis::new(vec![1, 2]).unwrap(),
            ScanAxis::new(vec![5, 6]).unwrap(),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    fn setup() -> FastSetup {
        FastSetup {
            counter: GatedCounter::new("Dev1/ctr2", "Dev1/ctr0"),
            sample_clock: "PFI34".to_string(),
            det_bus: shared_bus(SimulatedAfg::new()),
            rf_bus: shared_bus(SimulatedAfg::new()),
        }
    }

    #[test]
    fn test_single_burst() {
        let mut daq = SimulatedDaq::new().with_counts(|i| i as u32 + 1);
        let frames: Vec<Array2<f64>> = setup()
            .prepare(&mut daq, &plan(), false)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], array![[100., 200.], [300., 400.]]);
    }

    #[test]
    fn test_repeat_keeps_bursting() {
        let mut daq = SimulatedDaq::new();
        let mut stream = setup().prepare(&mut daq, &plan(), true).unwrap();
        for _ in 0..3 {
            let frame = stream.next().unwrap().unwrap();
            assert_eq!(frame.dim(), (2, 2));
        }
        assert_eq!(stream.frames(), 3);
    }

    #[test]
    fn test_row_waveforms_reverse_pairs() {
        let w = row_waveforms(&[1, 2, 3], 9, true);
        assert_eq!(w.x, vec![3, 3, 2, 2, 1, 1]);
        assert_eq!(w.y, vec![9; 6]);
        assert_eq!(w.naqs(), 3);
    }

    #[test]
    fn test_row_bursts_one_per_line() {
        let mut daq = SimulatedDaq::new().with_counts(|i| i as u32 + 1);
        let setup = setup();
        let rf_bus = setup.rf_bus.clone();
        let plan = plan().with_zigzag(true);
        let mut stream = setup.prepare_rows(&mut daq, &plan).unwrap();

        assert_eq!(stream.next().unwrap().unwrap(), vec![100., 200.]);
        assert_eq!(Arb::new(rf_bus.clone()).data().unwrap(), vec![1, 1, 2, 2]);
        assert_eq!(stream.next().unwrap().unwrap(), vec![300., 400.]);
        // Second line runs X backwards on the AFG
        assert_eq!(Arb::new(rf_bus).data().unwrap(), vec![2, 2, 1, 1]);
        assert!(stream.next().is_none());
        assert_eq!(stream.rows(), 2);
    }

    #[test]
    fn test_row_burst_rejects_out_of_range_y() {
        let mut daq = SimulatedDaq::new();
        let plan = ScanPlan::new(
            ScanAxis::new(vec![1, 2]).unwrap(),
            ScanAxis::new(vec![5, 20_000]).unwrap(),
            Duration::from_millis(10),
        )
        .unwrap();
        assert!(matches!(
            setup().prepare_rows(&mut daq, &plan),
            Err(ScanError::InvalidState(_))
        ));
        assert!(daq.operations().is_empty());
    }
}

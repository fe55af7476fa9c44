//! Result buffer and the adapters that fill it from a measurement stream

use log::{debug, warn};
use ndarray::Array2;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::ScanError;
use crate::types::ScanPlan;

/// Frame readable by the UI while the worker writes it
pub type SharedFrame = Arc<RwLock<Frame>>;

/// Row-major grid of count rates, NaN where nothing has been measured yet
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    data: Array2<f64>,
}

impl Frame {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), f64::NAN),
        }
    }

    pub fn for_plan(plan: &ScanPlan) -> Self {
        let (rows, cols) = plan.shape();
        Self::new(rows, cols)
    }

    pub fn from_data(data: Array2<f64>) -> Self {
        Self { data }
    }

    pub fn shared(self) -> SharedFrame {
        Arc::new(RwLock::new(self))
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.data.get((row, col)).copied()
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), ScanError> {
        let shape = self.shape();
        let cell = self.data.get_mut((row, col)).ok_or_else(|| {
            ScanError::InvalidState(format!("Cell ({row}, {col}) outside frame of shape {shape:?}"))
        })?;
        *cell = value;
        Ok(())
    }

    /// Write a whole row; `reversed` stores the values right to left
    pub fn set_row(&mut self, row: usize, values: &[f64], reversed: bool) -> Result<(), ScanError> {
        let (rows, cols) = self.shape();
        if row >= rows {
            return Err(ScanError::InvalidState(format!(
                "Row {row} outside frame with {rows} rows"
            )));
        }
        if values.len() != cols {
            return Err(ScanError::InvalidState(format!(
                "Row of {} values does not fit frame width {cols}",
                values.len()
            )));
        }
        let mut target = self.data.row_mut(row);
        for (i, &value) in values.iter().enumerate() {
            let col = if reversed { cols - 1 - i } else { i };
            target[col] = value;
        }
        Ok(())
    }

    /// Replace every cell at once
    pub fn replace(&mut self, data: Array2<f64>) -> Result<(), ScanError> {
        if data.dim() != self.shape() {
            return Err(ScanError::InvalidState(format!(
                "Frame of shape {:?} does not match buffer shape {:?}",
                data.dim(),
                self.shape()
            )));
        }
        self.data = data;
        Ok(())
    }

    /// Reset every cell to NaN
    pub fn clear(&mut self) {
        self.data.fill(f64::NAN);
    }

    /// Number of cells that hold a measurement
    pub fn filled_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.data.iter().all(|v| !v.is_nan())
    }

    /// Cells in acquisition order
    pub fn raster_values(&self, zigzag: bool) -> Vec<f64> {
        let (_, cols) = self.shape();
        (0..self.capacity())
            .map(|i| {
                let (row, col) = cell_for_index(i, cols, zigzag);
                self.data[(row, col)]
            })
            .collect()
    }

    /// Largest measured value, ignoring NaN
    pub fn max_value(&self) -> Option<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }
}

/// Cell visited at acquisition `index` for a frame `cols` wide
pub fn cell_for_index(index: usize, cols: usize, zigzag: bool) -> (usize, usize) {
    let row = index / cols;
    let col = index % cols;
    if zigzag && row % 2 == 1 {
        (row, cols - 1 - col)
    } else {
        (row, col)
    }
}

/// One item of a measurement stream
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// Counts per second at one pixel
    Pixel(f64),
    /// One scan line in acquisition order
    Row(Vec<f64>),
    /// A complete image
    Frame(Array2<f64>),
}

/// Notification that part of the shared frame changed
#[derive(Debug, Clone, PartialEq)]
pub enum FrameUpdate {
    CellWritten { row: usize, col: usize, value: f64 },
    RowWritten { row: usize },
    FrameWritten { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    Points,
    Rows,
    Frames,
}

/// Writes measurements into a shared frame and reports each write
///
/// Pixels and rows fill the frame in raster order (odd rows reversed when
/// zigzag) and the assembler stops once the frame is full. Frames replace the
/// whole buffer and never exhaust it.
pub struct FrameAssembler<S> {
    stream: S,
    frame: SharedFrame,
    mode: AssemblyMode,
    zigzag: bool,
    cursor: usize,
    frames_written: usize,
    done: bool,
}

impl<S> FrameAssembler<S>
where
    S: Iterator<Item = Result<Measurement, ScanError>>,
{
    pub fn new(stream: S, frame: SharedFrame, mode: AssemblyMode, zigzag: bool) -> Self {
        Self {
            stream,
            frame,
            mode,
            zigzag,
            cursor: 0,
            frames_written: 0,
            done: false,
        }
    }

    pub fn points(stream: S, frame: SharedFrame, zigzag: bool) -> Self {
        Self::new(stream, frame, AssemblyMode::Points, zigzag)
    }

    pub fn rows(stream: S, frame: SharedFrame, zigzag: bool) -> Self {
        Self::new(stream, frame, AssemblyMode::Rows, zigzag)
    }

    pub fn frames(stream: S, frame: SharedFrame) -> Self {
        Self::new(stream, frame, AssemblyMode::Frames, false)
    }

    pub fn frame(&self) -> SharedFrame {
        self.frame.clone()
    }

    fn is_full(&self) -> bool {
        self.mode != AssemblyMode::Frames && self.cursor >= self.frame.read().capacity()
    }

    fn write(&mut self, measurement: Measurement) -> Result<FrameUpdate, ScanError> {
        let mut frame = self.frame.write();
        let (_, cols) = frame.shape();
        match (self.mode, measurement) {
            (AssemblyMode::Points, Measurement::Pixel(value)) => {
                let (row, col) = cell_for_index(self.cursor, cols, self.zigzag);
                frame.set(row, col, value)?;
                self.cursor += 1;
                Ok(FrameUpdate::CellWritten { row, col, value })
            }
            (AssemblyMode::Rows, Measurement::Row(values)) => {
                let row = self.cursor / cols;
                let reversed = self.zigzag && row % 2 == 1;
                frame.set_row(row, &values, reversed)?;
                self.cursor += cols;
                Ok(FrameUpdate::RowWritten { row })
            }
            (AssemblyMode::Frames, Measurement::Frame(data)) => {
                frame.replace(data)?;
                let index = self.frames_written;
                self.frames_written += 1;
                Ok(FrameUpdate::FrameWritten { index })
            }
            (mode, measurement) => Err(ScanError::InvalidState(format!(
                "{} measurement in {mode:?} assembly",
                measurement_kind(&measurement)
            ))),
        }
    }
}

fn measurement_kind(measurement: &Measurement) -> &'static str {
    match measurement {
        Measurement::Pixel(_) => "Pixel",
        Measurement::Row(_) => "Row",
        Measurement::Frame(_) => "Frame",
    }
}

impl<S> Iterator for FrameAssembler<S>
where
    S: Iterator<Item = Result<Measurement, ScanError>>,
{
    type Item = Result<FrameUpdate, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.is_full() {
            debug!("Frame full after {} cells", self.cursor);
            self.done = true;
            return None;
        }
        match self.stream.next() {
            Some(Ok(measurement)) => {
                let update = self.write(measurement);
                if update.is_err() {
                    self.done = true;
                }
                Some(update)
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Passes on every `n`th notification, swallowing the others
///
/// Used to redraw once per row while filling point by point. Errors pass
/// through at once. When `n` does not divide the number of items the last
/// partial group produces no notification; its size is recorded in
/// [`Chunked::dropped`] and logged.
pub struct Chunked<I> {
    inner: I,
    n: usize,
    dropped: Arc<AtomicUsize>,
    done: bool,
}

impl<I> Chunked<I> {
    /// `n` of 0 is treated as 1
    pub fn new(inner: I, n: usize) -> Self {
        Self {
            inner,
            n: n.max(1),
            dropped: Arc::new(AtomicUsize::new(0)),
            done: false,
        }
    }

    /// Counter of notifications swallowed by an incomplete final group
    pub fn dropped(&self) -> Arc<AtomicUsize> {
        self.dropped.clone()
    }
}

impl<I, T> Iterator for Chunked<I>
where
    I: Iterator<Item = Result<T, ScanError>>,
{
    type Item = Result<T, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for taken in 0..self.n {
            match self.inner.next() {
                Some(Ok(item)) if taken + 1 == self.n => return Some(Ok(item)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.done = true;
                    if taken > 0 {
                        self.dropped.fetch_add(taken, Ordering::Relaxed);
                        warn!("Dropped notification for {taken} trailing items (group size {})", self.n);
                    }
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn pixels(values: &[f64]) -> impl Iterator<Item = Result<Measurement, ScanError>> + use<> {
        values
            .to_vec()
            .into_iter()
            .map(|v| Ok(Measurement::Pixel(v)))
    }

    #[test]
    fn test_new_frame_is_empty() {
        let frame = Frame::new(2, 3);
        assert_eq!(frame.shape(), (2, 3));
        assert_eq!(frame.filled_count(), 0);
        assert!(!frame.is_complete());
        assert!(frame.get(1, 2).unwrap().is_nan());
        assert_eq!(frame.get(2, 0), None);
    }

    #[test]
    fn test_clear_keeps_shape() {
        let mut frame = Frame::from_data(array![[1., 2.], [3., 4.]]);
        frame.clear();
        assert_eq!(frame.shape(), (2, 2));
        assert_eq!(frame.filled_count(), 0);
    }

    #[test]
    fn test_points_fill_in_raster_order() {
        let frame = Frame::new(2, 3).shared();
        let updates: Vec<FrameUpdate> =
            FrameAssembler::points(pixels(&[10., 20., 30., 40., 50., 60.]), frame.clone(), false)
                .collect::<Result<_, _>>()
                .unwrap();

        assert_eq!(updates.len(), 6);
        assert_eq!(
            updates[3],
            FrameUpdate::CellWritten { row: 1, col: 0, value: 40. }
        );
        assert_eq!(
            frame.read().data(),
            &array![[10., 20., 30.], [40., 50., 60.]]
        );
    }

    #[test]
    fn test_points_zigzag() {
        let frame = Frame::new(2, 3).shared();
        let n = FrameAssembler::points(pixels(&[10., 20., 30., 40., 50., 60.]), frame.clone(), true)
            .count();
        assert_eq!(n, 6);

        let frame = frame.read();
        assert_eq!(frame.data(), &array![[10., 20., 30.], [60., 50., 40.]]);
        assert_eq!(frame.raster_values(true), vec![10., 20., 30., 40., 50., 60.]);
    }

    #[test]
    fn test_excess_values_are_not_written() {
        let frame = Frame::new(1, 2).shared();
        let mut source = pixels(&[1., 2., 3.]);
        let n = FrameAssembler::points(source.by_ref(), frame.clone(), false).count();
        assert_eq!(n, 2);
        // The extra value is never pulled
        assert_eq!(source.count(), 1);
        assert!(frame.read().is_complete());
    }

    #[test]
    fn test_partial_stream_leaves_nan() {
        let frame = Frame::new(2, 2).shared();
        FrameAssembler::points(pixels(&[5., 6., 7.]), frame.clone(), false).for_each(drop);
        let frame = frame.read();
        assert_eq!(frame.filled_count(), 3);
        assert!(frame.get(1, 1).unwrap().is_nan());
    }

    #[test]
    fn test_rows_and_shape_mismatch() {
        let frame = Frame::new(2, 2).shared();
        let rows = vec![
            Ok(Measurement::Row(vec![1., 2.])),
            Ok(Measurement::Row(vec![3., 4.])),
        ];
        let updates: Vec<FrameUpdate> = FrameAssembler::rows(rows.into_iter(), frame.clone(), true)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            updates,
            vec![FrameUpdate::RowWritten { row: 0 }, FrameUpdate::RowWritten { row: 1 }]
        );
        assert_eq!(frame.read().data(), &array![[1., 2.], [4., 3.]]);

        let frame = Frame::new(2, 2).shared();
        let bad = vec![Ok(Measurement::Row(vec![1., 2., 3.]))];
        let mut assembler = FrameAssembler::rows(bad.into_iter(), frame, false);
        assert!(matches!(assembler.next(), Some(Err(ScanError::InvalidState(_)))));
        assert!(assembler.next().is_none());
    }

    #[test]
    fn test_frames_replace_buffer() {
        let frame = Frame::new(1, 2).shared();
        let frames = vec![
            Ok(Measurement::Frame(array![[1., 2.]])),
            Ok(Measurement::Frame(array![[3., 4.]])),
            Ok(Measurement::Frame(array![[1., 2., 3.]])),
        ];
        let results: Vec<_> = FrameAssembler::frames(frames.into_iter(), frame.clone()).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[1].as_ref().unwrap(),
            &FrameUpdate::FrameWritten { index: 1 }
        );
        assert!(matches!(results[2], Err(ScanError::InvalidState(_))));
        assert_eq!(frame.read().data(), &array![[3., 4.]]);
    }

    #[test]
    fn test_wrong_measurement_kind() {
        let frame = Frame::new(1, 2).shared();
        let items = vec![Ok(Measurement::Row(vec![1., 2.]))];
        let mut assembler = FrameAssembler::points(items.into_iter(), frame, false);
        assert!(matches!(assembler.next(), Some(Err(ScanError::InvalidState(_)))));
    }

    #[test]
    fn test_chunked_groups_and_records_truncation() {
        let items: Vec<Result<usize, ScanError>> = (0..7).map(Ok).collect();
        let chunked = Chunked::new(items.into_iter(), 3);
        let dropped = chunked.dropped();
        let out: Vec<usize> = chunked.map(|r| r.unwrap()).collect();

        assert_eq!(out, vec![2, 5]);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_chunked_exact_multiple_drops_nothing() {
        let items: Vec<Result<usize, ScanError>> = (0..6).map(Ok).collect();
        let chunked = Chunked::new(items.into_iter(), 3);
        let dropped = chunked.dropped();
        assert_eq!(chunked.count(), 2);
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_chunked_passes_errors_through() {
        let items: Vec<Result<usize, ScanError>> = vec![
            Ok(0),
            Err(ScanError::HardwareFault("gone".to_string())),
        ];
        let mut chunked = Chunked::new(items.into_iter(), 3);
        assert!(matches!(chunked.next(), Some(Err(ScanError::HardwareFault(_)))));
        assert!(chunked.next().is_none());
    }

    #[test]
    fn test_max_value_ignores_nan() {
        let mut frame = Frame::new(1, 3);
        assert_eq!(frame.max_value(), None);
        frame.set(0, 1, 7.5).unwrap();
        frame.set(0, 2, 2.0).unwrap();
        assert_eq!(frame.max_value(), Some(7.5));
    }
}

use log::debug;

use crate::error::ScanError;
use crate::hardware::SharedPositioner;
use crate::types::{Position, ScanPlan};

/// Lazy raster over two galvos
///
/// Each pull moves the hardware: Y is written once at the start of a row, X
/// once per column. In zigzag mode odd rows run X backwards. The sequence is
/// finite and cannot be rewound; build a new one for the next scan.
pub struct RasterPositions {
    xs: Vec<i64>,
    ys: Vec<i64>,
    xgalvo: SharedPositioner,
    ygalvo: SharedPositioner,
    zigzag: bool,
    next_index: usize,
    done: bool,
}

impl RasterPositions {
    pub fn new(plan: &ScanPlan, xgalvo: SharedPositioner, ygalvo: SharedPositioner) -> Self {
        Self {
            xs: plan.x.positions().to_vec(),
            ys: plan.y.positions().to_vec(),
            xgalvo,
            ygalvo,
            zigzag: plan.zigzag,
            next_index: 0,
            done: false,
        }
    }

    /// Total number of positions this sequence produces
    pub fn len(&self) -> usize {
        self.xs.len() * self.ys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions already pulled (and moved to)
    pub fn pulled(&self) -> usize {
        self.next_index
    }

    fn move_to(&mut self, index: usize) -> Result<Position, ScanError> {
        let cols = self.xs.len();
        let row = index / cols;
        let mut col = index % cols;
        if self.zigzag && row % 2 == 1 {
            col = cols - 1 - col;
        }
        let position = Position::new(self.xs[col], self.ys[row]);

        if index % cols == 0 {
            self.ygalvo.lock().set_value(position.y)?;
        }
        self.xgalvo.lock().set_value(position.x)?;
        Ok(position)
    }
}

impl Iterator for RasterPositions {
    type Item = Result<Position, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next_index >= self.len() {
            self.done = true;
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        match self.move_to(index) {
            Ok(position) => Some(Ok(position)),
            Err(e) => {
                debug!("Galvo move to pixel {index} failed: {e}");
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let remaining = self.len() - self.next_index;
        (0, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::galvo::shared;
    use crate::hardware::{DaqDriver, GalvoPixel, SimulatedDaq, TaskOp};
    use crate::types::ScanAxis;
    use std::time::Duration;

    fn plan(zigzag: bool) -> ScanPlan {
        ScanPlan::new(
            ScanAxis::new(vec![0, 1, 2]).unwrap(),
            ScanAxis::new(vec![10, 20]).unwrap(),
            Duration::from_millis(1),
        )
        .unwrap()
        .with_zigzag(zigzag)
    }

    fn galvos(daq: &mut SimulatedDaq) -> (SharedPositioner, SharedPositioner) {
        let x = GalvoPixel::new(daq.create_analog_output("Dev2/ao0").unwrap(), 12, false).unwrap();
        let y = GalvoPixel::new(daq.create_analog_output("Dev2/ao1").unwrap(), 12, false).unwrap();
        (shared(x), shared(y))
    }

    #[test]
    fn test_raster_order_and_write_cadence() {
        let mut daq = SimulatedDaq::new();
        let (x, y) = galvos(&mut daq);
        let positions: Vec<Position> = RasterPositions::new(&plan(false), x, y)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            positions,
            vec![
                Position::new(0, 10),
                Position::new(1, 10),
                Position::new(2, 10),
                Position::new(0, 20),
                Position::new(1, 20),
                Position::new(2, 20),
            ]
        );

        let writes: Vec<(String, i16)> = daq
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                TaskOp::AnalogWrite { channel, value } => Some((channel, value)),
                _ => None,
            })
            .collect();
        let y_writes = writes.iter().filter(|(c, _)| c == "Dev2/ao1").count();
        let x_writes = writes.iter().filter(|(c, _)| c == "Dev2/ao0").count();
        assert_eq!(y_writes, 2);
        assert_eq!(x_writes, 6);
        // Y is set before the first X of its row
        assert_eq!(writes[0], ("Dev2/ao1".to_string(), 10));
        assert_eq!(writes[4], ("Dev2/ao1".to_string(), 20));
    }

    #[test]
    fn test_zigzag_reverses_odd_rows() {
        let mut daq = SimulatedDaq::new();
        let (x, y) = galvos(&mut daq);
        let xs: Vec<i64> = RasterPositions::new(&plan(true), x, y)
            .map(|p| p.unwrap().x)
            .collect();
        assert_eq!(xs, vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn test_fault_ends_sequence() {
        let mut daq = SimulatedDaq::new().fail_analog_write_after(3);
        let (x, y) = galvos(&mut daq);
        let mut positions = RasterPositions::new(&plan(false), x, y);

        assert!(positions.next().unwrap().is_ok()); // y + x
        assert!(positions.next().unwrap().is_ok()); // x
        assert!(matches!(
            positions.next(),
            Some(Err(ScanError::HardwareFault(_)))
        ));
        assert!(positions.next().is_none());
        assert_eq!(positions.pulled(), 3);
    }
}

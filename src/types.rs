use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ScanError;

/// Galvo position in device units (DAC counts or AFG edit-memory levels)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl From<(i64, i64)> for Position {
    fn from((x, y): (i64, i64)) -> Self {
        Position { x, y }
    }
}

/// Ordered positions for one scan dimension
///
/// Never empty. Positions are visited in the order given; the raster scan
/// nests the X axis inside the Y axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAxis(Vec<i64>);

impl ScanAxis {
    pub fn new(positions: Vec<i64>) -> Result<Self, ScanError> {
        if positions.is_empty() {
            return Err(ScanError::InvalidState(
                "Scan axis needs at least one position".to_string(),
            ));
        }
        Ok(Self(positions))
    }

    /// Half-open range `[min, max)` with the given step, like the scan panel's arange
    pub fn range(min: i64, max: i64, step: i64) -> Result<Self, ScanError> {
        if step <= 0 {
            return Err(ScanError::InvalidState(format!(
                "Scan step must be positive, got {step}"
            )));
        }
        let positions: Vec<i64> = (min..max).step_by(step as usize).collect();
        Self::new(positions)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    // Non-empty by construction
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn positions(&self) -> &[i64] {
        &self.0
    }

    pub fn first(&self) -> i64 {
        self.0[0]
    }

    pub fn last(&self) -> i64 {
        self.0[self.0.len() - 1]
    }

    /// Spacing between the first two positions, 1 for a single-point axis
    pub fn spacing(&self) -> i64 {
        if self.0.len() >= 2 {
            self.0[1] - self.0[0]
        } else {
            1
        }
    }
}

/// Immutable description of one 2D raster scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub x: ScanAxis,
    pub y: ScanAxis,
    pub dwell: Duration,
    pub zigzag: bool,
}

impl ScanPlan {
    pub fn new(x: ScanAxis, y: ScanAxis, dwell: Duration) -> Result<Self, ScanError> {
        if dwell.is_zero() {
            return Err(ScanError::InvalidState(
                "Dwell time must be positive".to_string(),
            ));
        }
        Ok(Self {
            x,
            y,
            dwell,
            zigzag: false,
        })
    }

    pub fn with_zigzag(mut self, zigzag: bool) -> Self {
        self.zigzag = zigzag;
        self
    }

    /// Number of acquisitions (pixels) in the scan
    pub fn naqs(&self) -> usize {
        self.x.len() * self.y.len()
    }

    /// Frame shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.y.len(), self.x.len())
    }

    pub fn dwell_secs(&self) -> f64 {
        self.dwell.as_secs_f64()
    }

    pub fn estimated_duration(&self) -> Duration {
        let nanos = self.dwell.as_nanos().saturating_mul(self.naqs() as u128);
        let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
        Duration::new(secs, (nanos % 1_000_000_000) as u32)
    }

    /// Short label like `3x2, 0:00:00`
    pub fn summary(&self) -> String {
        format!(
            "{}x{}, {}",
            self.x.len(),
            self.y.len(),
            format_hms(self.estimated_duration())
        )
    }
}

/// Lifecycle of the acquisition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    Idle,
    Running,
    Aborting,
    Finished,
}

impl ScanState {
    /// Whether a new scan may be started from this state
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Idle | ScanState::Finished)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ScanState::Running | ScanState::Aborting)
    }
}

/// Format whole seconds as `H:MM:SS`
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_range_is_half_open() {
        let axis = ScanAxis::range(0, 30, 10).unwrap();
        assert_eq!(axis.positions(), &[0, 10, 20]);
        assert_eq!(axis.spacing(), 10);
        assert_eq!(axis.last(), 20);
    }

    #[test]
    fn test_empty_axis_rejected() {
        assert!(ScanAxis::new(vec![]).is_err());
        assert!(ScanAxis::range(5, 5, 1).is_err());
        assert!(ScanAxis::range(0, 10, 0).is_err());
    }

    #[test]
    fn test_plan_shape_and_summary() {
        let plan = ScanPlan::new(
            ScanAxis::new(vec![0, 1, 2]).unwrap(),
            ScanAxis::new(vec![0, 1]).unwrap(),
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(plan.naqs(), 6);
        assert_eq!(plan.shape(), (2, 3));
        assert_eq!(plan.summary(), "3x2, 0:00:00");
        assert!(!plan.zigzag);
    }

    #[test]
    fn test_estimated_duration_large_scan() {
        let axis = ScanAxis::range(0, 70_000, 1).unwrap();
        let plan = ScanPlan::new(axis.clone(), axis, Duration::from_millis(1)).unwrap();
        assert_eq!(plan.naqs(), 4_900_000_000);
        assert_eq!(plan.estimated_duration().as_secs(), 4_900_000);
        assert_eq!(format_hms(plan.estimated_duration()), "1361:06:40");
    }

    #[test]
    fn test_zero_dwell_rejected() {
        let axis = ScanAxis::new(vec![0]).unwrap();
        assert!(ScanPlan::new(axis.clone(), axis, Duration::ZERO).is_err());
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn test_state_transitions_allowed() {
        assert!(ScanState::Idle.can_start());
        assert!(ScanState::Finished.can_start());
        assert!(!ScanState::Running.can_start());
        assert!(!ScanState::Aborting.can_start());
    }
}

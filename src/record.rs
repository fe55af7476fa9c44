//! Saving and loading acquired frames
//!
//! A record is a JSON document holding the image, both axes and the dwell
//! time, so a saved scan can be reopened and repeated with the same
//! parameters. Unmeasured cells are stored as `null`.

use chrono::{DateTime, Utc};
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ScanError;
use crate::frame::Frame;
use crate::types::{ScanAxis, ScanPlan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Rows of count rates, `None` where nothing was measured
    pub image: Vec<Vec<Option<f64>>>,
    pub x: Vec<i64>,
    pub y: Vec<i64>,
    /// Dwell time in seconds
    pub t: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl FrameRecord {
    pub fn new(frame: &Frame, x: Vec<i64>, y: Vec<i64>, t: Option<f64>) -> Self {
        let image = frame
            .data()
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|&v| if v.is_nan() { None } else { Some(v) })
                    .collect()
            })
            .collect();
        Self {
            image,
            x,
            y,
            t,
            timestamp: Utc::now(),
        }
    }

    pub fn from_plan(frame: &Frame, plan: &ScanPlan) -> Self {
        Self::new(
            frame,
            plan.x.positions().to_vec(),
            plan.y.positions().to_vec(),
            Some(plan.dwell_secs()),
        )
    }

    /// Rebuild the frame, checking that the image matches both axes
    pub fn to_frame(&self) -> Result<Frame, ScanError> {
        let rows = self.y.len();
        let cols = self.x.len();
        if self.image.len() != rows || self.image.iter().any(|r| r.len() != cols) {
            return Err(ScanError::InvalidState(format!(
                "Stored image does not match {rows}x{cols} axes"
            )));
        }
        let values: Vec<f64> = self
            .image
            .iter()
            .flatten()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        let data = Array2::from_shape_vec((rows, cols), values)
            .map_err(|e| ScanError::InvalidState(e.to_string()))?;
        Ok(Frame::from_data(data))
    }

    /// Scan plan that would repeat this acquisition
    pub fn plan(&self) -> Result<ScanPlan, ScanError> {
        let t = self.t.ok_or_else(|| {
            ScanError::InvalidState("Record has no dwell time".to_string())
        })?;
        let dwell = Duration::try_from_secs_f64(t)
            .map_err(|e| ScanError::InvalidState(format!("Invalid dwell time {t}: {e}")))?;
        ScanPlan::new(ScanAxis::new(self.x.clone())?, ScanAxis::new(self.y.clone())?, dwell)
    }

    pub fn save(&self, path: &Path) -> Result<(), ScanError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not write frame record to {path:?}"),
        })?;
        info!("Saved frame record to {path:?}");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not read frame record at {path:?}"),
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// First `{prefix}NNN.{ext}` in `dir` that does not exist yet, counting from 1
pub fn next_filename(dir: &Path, prefix: &str, ext: &str) -> PathBuf {
    (1usize..)
        .map(|i| dir.join(format!("{prefix}{i:03}.{ext}")))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(format!("{prefix}.{ext}")))
}

/// Write the frame as a 16-bit grayscale PNG, scaled so the brightest pixel is white
pub fn save_png(frame: &Frame, path: &Path) -> Result<(), ScanError> {
    let (rows, cols) = frame.shape();
    let max = frame.max_value().filter(|m| *m > 0.0);
    let pixels: Vec<u16> = frame
        .data()
        .iter()
        .map(|&v| match max {
            Some(max) if !v.is_nan() && v > 0.0 => ((v / max) * u16::MAX as f64).round() as u16,
            _ => 0,
        })
        .collect();

    let img = image::ImageBuffer::<image::Luma<u16>, _>::from_raw(cols as u32, rows as u32, pixels)
        .ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;
    img.save_with_format(path, image::ImageFormat::Png)?;
    info!("Saved {cols}x{rows} PNG to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn partial_frame() -> Frame {
        let mut frame = Frame::new(2, 2);
        frame.set(0, 0, 10.0).unwrap();
        frame.set(0, 1, 20.0).unwrap();
        frame.set(1, 0, 40.0).unwrap();
        frame
    }

    #[test]
    fn test_record_keeps_missing_cells() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.json");

        let record = FrameRecord::new(&partial_frame(), vec![0, 5], vec![100, 110], Some(0.01));
        record.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("null"));

        let loaded = FrameRecord::load(&path).unwrap();
        assert_eq!(loaded, record);

        let frame = loaded.to_frame().unwrap();
        assert_eq!(frame.filled_count(), 3);
        assert!(frame.get(1, 1).unwrap().is_nan());

        let plan = loaded.plan().unwrap();
        assert_eq!(plan.shape(), (2, 2));
        assert_eq!(plan.dwell, Duration::from_millis(10));
    }

    #[test]
    fn test_mismatched_record_rejected() {
        let mut record = FrameRecord::new(&partial_frame(), vec![0, 5], vec![100, 110], None);
        record.x.push(10);
        assert!(matches!(record.to_frame(), Err(ScanError::InvalidState(_))));
        assert!(record.plan().is_err());
    }

    #[test]
    fn test_next_filename_skips_existing() {
        let dir = tempdir().unwrap();
        assert_eq!(
            next_filename(dir.path(), "image", "json"),
            dir.path().join("image001.json")
        );
        std::fs::write(dir.path().join("image001.json"), "{}").unwrap();
        std::fs::write(dir.path().join("image002.json"), "{}").unwrap();
        assert_eq!(
            next_filename(dir.path(), "image", "json"),
            dir.path().join("image003.json")
        );
    }

    #[test]
    fn test_png_scaling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.png");
        save_png(&partial_frame(), &path).unwrap();

        let img = image::open(&path).unwrap().into_luma16();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(0, 1)[0], u16::MAX);
        assert_eq!(img.get_pixel(1, 1)[0], 0);
        assert_eq!(img.get_pixel(0, 0)[0], (u16::MAX as f64 / 4.0).round() as u16);
    }
}

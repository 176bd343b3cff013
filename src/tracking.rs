//! Tracking-port streams stored as `.npy` triplets.

use ndarray::{Array1, Axis};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{OpenEphysError, Result};
use crate::npy::read_npy;
use crate::types::TrackingData;

/// Values per tracking sample: x, y, width, height
pub const TRACKING_FIELDS: usize = 4;

/// Files making up one tracking source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingSource {
    pub data_array: PathBuf,
    pub timestamps: PathBuf,
    pub channels: PathBuf,
}

impl TrackingSource {
    /// Source laid out with the standard file names inside `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            data_array: dir.join("data_array.npy"),
            timestamps: dir.join("timestamps.npy"),
            channels: dir.join("channels.npy"),
        }
    }
}

/// Decodes one tracking source, converting timestamps to seconds.
pub fn read_tracking(source: &TrackingSource, sample_rate: f64) -> Result<TrackingData> {
    let rows = read_npy(&source.data_array)?.f32_rows(TRACKING_FIELDS)?;
    let timestamps = read_npy(&source.timestamps)?.to_f64_vec()?;
    let channels = read_npy(&source.channels)?.to_i64_vec()?;

    if timestamps.len() != rows.nrows() || channels.len() != rows.nrows() {
        return Err(OpenEphysError::format(format!(
            "tracking source {} has {} samples, {} timestamps and {} channels",
            source.data_array.display(),
            rows.nrows(),
            timestamps.len(),
            channels.len()
        )));
    }

    let field = |i: usize| -> Array1<f64> { rows.index_axis(Axis(1), i).mapv(f64::from) };
    let data = TrackingData {
        times: timestamps.into_iter().map(|t| t / sample_rate).collect(),
        x: field(0),
        y: field(1),
        width: field(2),
        height: field(3),
        channels: Array1::from(channels),
    };

    info!(
        path = %source.data_array.display(),
        samples = data.len(),
        "decoded tracking source"
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::npy::npy_bytes;
    use std::fs;
    use tempfile::TempDir;

    fn write_source(dir: &Path, floats: &[f32], ts: &[i64], chans: &[i64]) -> TrackingSource {
        let payload: Vec<u8> = floats.iter().flat_map(|v| v.to_le_bytes()).collect();
        let ts_bytes: Vec<u8> = ts.iter().flat_map(|v| v.to_le_bytes()).collect();
        let ch_bytes: Vec<u8> = chans.iter().flat_map(|v| v.to_le_bytes()).collect();

        let n = floats.len() / TRACKING_FIELDS;
        fs::write(dir.join("data_array.npy"), npy_bytes("|u1", &[n, 16], &payload)).unwrap();
        fs::write(dir.join("timestamps.npy"), npy_bytes("<i8", &[ts.len()], &ts_bytes)).unwrap();
        fs::write(dir.join("channels.npy"), npy_bytes("<i8", &[chans.len()], &ch_bytes)).unwrap();
        TrackingSource::in_dir(dir)
    }

    #[test]
    fn test_read_tracking_fields() {
        let dir = TempDir::new().unwrap();
        let source = write_source(
            dir.path(),
            &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8],
            &[30000, 60000],
            &[1, 1],
        );
        let data = read_tracking(&source, 30000.0).unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(data.times.to_vec(), vec![1.0, 2.0]);
        assert_eq!(data.x[1], f64::from(0.5f32));
        assert_eq!(data.height[0], f64::from(0.4f32));
        assert_eq!(data.channels.to_vec(), vec![1, 1]);
    }

    #[test]
    fn test_length_disagreement_is_format_error() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), &[0.0; 8], &[1], &[0, 0]);
        assert!(matches!(
            read_tracking(&source, 30000.0),
            Err(OpenEphysError::Format(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let source = TrackingSource::in_dir(dir.path());
        assert!(matches!(
            read_tracking(&source, 30000.0),
            Err(OpenEphysError::Io(_))
        ));
    }
}

//! Run-folder layout and CSV persistence.
//!
//! Every `start()` creates one folder `<output_prefix>RunData__YYYY_MM_DD__HH_MM_SS/`.
//! Each step that reaches its snapshot point writes
//! `<stem>_<method_id>_step_<step_id>_rep_<rep>.csv` into it, and the acquisition raw
//! trail is moved next to that file as `<csv_path>_raw_data.csv`.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::acquisition::AcquisitionSnapshot;
use crate::error::{AppResult, DaqError};

/// Column order of the per-step CSV.
pub const CSV_HEADER: [&str; 6] = ["time", "rfu", "kV", "uA", "avg", "raw"];

/// Folder name for a run started at `now`.
pub fn run_folder_name(now: DateTime<Local>) -> String {
    format!("RunData__{}", now.format("%Y_%m_%d__%H_%M_%S"))
}

/// Create the run folder under `output_prefix`.
///
/// The prefix is prepended verbatim, so `data/` nests the folder in `data` while
/// `data/exp1_` yields `data/exp1_RunData__...`.
pub fn create_run_folder(output_prefix: &str, now: DateTime<Local>) -> AppResult<PathBuf> {
    let path = PathBuf::from(format!("{output_prefix}{}", run_folder_name(now)));
    fs::create_dir_all(&path)?;
    info!(path = %path.display(), "created run folder");
    Ok(path)
}

/// File-name stem taken from the output prefix: its last path component with trailing
/// underscores trimmed, or `run` when that leaves nothing.
pub fn file_stem(output_prefix: &str) -> String {
    let name = Path::new(output_prefix)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|_| !output_prefix.ends_with(['/', '\\']))
        .unwrap_or("");
    let trimmed = name.trim_end_matches('_');
    if trimmed.is_empty() {
        "run".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Base name shared by a step's CSV and its camera buffer.
pub fn step_name(stem: &str, method_id: &str, step_id: usize, rep: u32) -> String {
    format!("{stem}_{method_id}_step_{step_id}_rep_{rep}")
}

/// Per-step CSV path inside `folder`.
pub fn step_file(folder: &Path, stem: &str, method_id: &str, step_id: usize, rep: u32) -> PathBuf {
    folder.join(format!("{}.csv", step_name(stem, method_id, step_id, rep)))
}

/// Sidecar path for the raw trail that belongs to `csv_path`.
pub fn raw_trail_path(csv_path: &Path) -> PathBuf {
    let mut name = csv_path.as_os_str().to_owned();
    name.push("_raw_data.csv");
    PathBuf::from(name)
}

/// Move `from` to `to`, copying when a rename cannot cross filesystems.
pub fn relocate(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Write a snapshot as CSV at its realized sample rate.
///
/// Rows run to the longest column; shorter columns leave their cell empty.
#[cfg(feature = "storage_csv")]
pub fn write_snapshot_csv(path: &Path, snapshot: &AcquisitionSnapshot) -> AppResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(CSV_HEADER)?;

    let rows = snapshot.len();
    let cell = |column: &[f64], i: usize| column.get(i).map(f64::to_string).unwrap_or_default();
    for i in 0..rows {
        let time = if snapshot.sample_rate_hz > 0.0 {
            i as f64 / snapshot.sample_rate_hz
        } else {
            0.0
        };
        writer.write_record([
            time.to_string(),
            cell(&snapshot.rfu, i),
            cell(&snapshot.voltage, i),
            cell(&snapshot.current, i),
            cell(&snapshot.avg, i),
            cell(&snapshot.raw, i),
        ])?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows, "wrote snapshot");
    Ok(())
}

/// Write a snapshot as CSV (requires the `storage_csv` feature).
#[cfg(not(feature = "storage_csv"))]
pub fn write_snapshot_csv(_path: &Path, _snapshot: &AcquisitionSnapshot) -> AppResult<()> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

/// Fail unless `path` has a parent folder that exists.
pub fn ensure_parent(path: &Path) -> AppResult<()> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => Ok(()),
        Some(parent) => Err(DaqError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("folder {} does not exist", parent.display()),
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn folder_name_uses_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(run_folder_name(now), "RunData__2024_03_07__09_05_02");
    }

    #[test]
    fn stem_from_prefix() {
        assert_eq!(file_stem("data/"), "run");
        assert_eq!(file_stem("data/exp1_"), "exp1");
        assert_eq!(file_stem(""), "run");
        assert_eq!(file_stem("out/sample"), "sample");
    }

    #[test]
    fn step_and_trail_names() {
        let csv = step_file(Path::new("/tmp/f"), "run", "m0", 2, 1);
        assert_eq!(csv, PathBuf::from("/tmp/f/run_m0_step_2_rep_1.csv"));
        assert_eq!(
            raw_trail_path(&csv),
            PathBuf::from("/tmp/f/run_m0_step_2_rep_1.csv_raw_data.csv")
        );
    }

    #[test]
    fn run_folder_is_created_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/", dir.path().display());
        let now = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let folder = create_run_folder(&prefix, now).unwrap();
        assert!(folder.is_dir());
        assert!(folder.ends_with("RunData__2024_01_02__03_04_05"));
    }

    #[test]
    fn relocate_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.csv");
        let to = dir.path().join("b.csv");
        fs::write(&from, "x").unwrap();
        relocate(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(to).unwrap(), "x");
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn snapshot_csv_has_header_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.csv");
        let snapshot = AcquisitionSnapshot {
            rfu: vec![1.0, 2.0],
            voltage: vec![5.0, 5.0],
            current: vec![10.0, 10.0],
            raw: vec![1.5, 2.5],
            avg: vec![1.2, 2.2],
            sample_rate_hz: 2.0,
        };
        write_snapshot_csv(&path, &snapshot).unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "time,rfu,kV,uA,avg,raw");
        assert_eq!(lines[2], "0.5,2,5,10,2.2,2.5");
        assert_eq!(lines.len(), 3);
    }
}

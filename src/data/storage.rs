//! Test run persistence.
//!
//! Two formats carry the same [`TestRun`]:
//!
//! - **JSON**: `{"test_params": {...}, "test_results": [...]}`, pretty printed.
//! - **CSV**: the parameter block as `# `-prefixed JSON comment lines, then a header and one
//!   row per result. Absent position/displacement are empty cells.
//!
//! Writers never overwrite: an existing destination is renamed with [`next_free_path`] and the
//! path actually written is returned.

use crate::config::StorageFormat;
use crate::error::{AppResult, FdmError};
use crate::experiment::results::TestRun;
#[cfg(feature = "storage_csv")]
use crate::experiment::results::{TestParams, TestResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// First path that does not exist yet, starting with `path` itself.
///
/// A taken `name-NN.ext` becomes `name-(NN+1).ext` (keeping at least the digit count); any
/// other taken name gets `-01` appended to its stem.
pub fn next_free_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while candidate.exists() {
        candidate = bump_suffix(&candidate);
    }
    candidate
}

fn bump_suffix(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let next_stem = match stem.rsplit_once('-') {
        Some((base, digits))
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) =>
        {
            let n: u64 = digits.parse().unwrap_or(0);
            format!("{}-{:0width$}", base, n + 1, width = digits.len().max(2))
        }
        _ => format!("{}-01", stem),
    };

    let file_name = match path.extension() {
        Some(ext) => format!("{}.{}", next_stem, ext.to_string_lossy()),
        None => next_stem,
    };
    path.with_file_name(file_name)
}

/// Write `run` at (a free variant of) `path` in the given format.
pub fn write_run(run: &TestRun, path: &Path, format: StorageFormat) -> AppResult<PathBuf> {
    match format {
        StorageFormat::Json => write_json(run, path),
        StorageFormat::Csv => write_csv(run, path),
    }
}

/// Load a run written by [`write_run`].
pub fn read_run(path: &Path, format: StorageFormat) -> AppResult<TestRun> {
    match format {
        StorageFormat::Json => read_json(path),
        StorageFormat::Csv => read_csv(path),
    }
}

fn prepare(path: &Path) -> AppResult<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(next_free_path(path))
}

/// Write `run` as pretty JSON. Returns the path written.
pub fn write_json(run: &TestRun, path: &Path) -> AppResult<PathBuf> {
    let path = prepare(path)?;
    let json = serde_json::to_string_pretty(run)?;
    std::fs::write(&path, json)?;
    info!(
        "Wrote {} rows to '{}'",
        run.test_results.len(),
        path.display()
    );
    Ok(path)
}

/// Load a run written by [`write_json`].
pub fn read_json(path: &Path) -> AppResult<TestRun> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Write `run` as commented CSV. Returns the path written.
#[cfg(feature = "storage_csv")]
pub fn write_csv(run: &TestRun, path: &Path) -> AppResult<PathBuf> {
    use std::io::Write;

    let path = prepare(path)?;
    let mut file = std::fs::File::create(&path)?;

    let params = serde_json::to_string_pretty(&run.test_params)?;
    for line in params.lines() {
        writeln!(file, "# {}", line)?;
    }

    let mut writer = csv::Writer::from_writer(file);
    for row in &run.test_results {
        writer.serialize(row)?;
    }
    writer.flush()?;

    info!(
        "Wrote {} rows to '{}'",
        run.test_results.len(),
        path.display()
    );
    Ok(path)
}

/// Load a run written by [`write_csv`].
#[cfg(feature = "storage_csv")]
pub fn read_csv(path: &Path) -> AppResult<TestRun> {
    let text = std::fs::read_to_string(path)?;

    let params_json: String = text
        .lines()
        .take_while(|line| line.starts_with('#'))
        .map(|line| line.strip_prefix("# ").unwrap_or(&line[1..]))
        .collect::<Vec<_>>()
        .join("\n");
    if params_json.is_empty() {
        return Err(FdmError::Configuration(format!(
            "'{}' has no parameter block",
            path.display()
        )));
    }
    let test_params: TestParams = serde_json::from_str(&params_json)?;

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_reader(text.as_bytes());
    let test_results = reader
        .deserialize::<TestResult>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TestRun::new(test_params, test_results))
}

/// CSV output needs the `storage_csv` feature.
#[cfg(not(feature = "storage_csv"))]
pub fn write_csv(_run: &TestRun, _path: &Path) -> AppResult<PathBuf> {
    Err(FdmError::Configuration(
        "CSV output requires the storage_csv feature".to_string(),
    ))
}

/// CSV input needs the `storage_csv` feature.
#[cfg(not(feature = "storage_csv"))]
pub fn read_csv(_path: &Path) -> AppResult<TestRun> {
    Err(FdmError::Configuration(
        "CSV input requires the storage_csv feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::{Down, Up};
    use crate::experiment::results::{TestParams, TestResult, TestType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_run() -> TestRun {
        let params = TestParams {
            test_type: TestType::Smooth,
            test_direction: Down,
            feedrate: 180.0,
            test_loops: 0,
            test_num: 1,
            return_to_zero_after_test: true,
            smooth_displacement: Some(4.5),
            n_samples: None,
            careful_inc: None,
            stop_after: None,
            max_down: None,
            max_up: None,
        };
        let row = |force, displacement| TestResult {
            timestamp: Utc::now(),
            direction: Down,
            force,
            test_type: TestType::Smooth,
            position: displacement,
            displacement,
            test_no: 1,
        };
        TestRun::new(
            params,
            vec![row(-0.01, Some(0.0)), row(-0.733, None), row(0.0, Some(-4.5))],
        )
    }

    #[test]
    fn free_path_suffixes() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("run.json");
        assert_eq!(next_free_path(&plain), plain);

        std::fs::write(&plain, "").unwrap();
        let first = next_free_path(&plain);
        assert_eq!(first, dir.path().join("run-01.json"));

        std::fs::write(&first, "").unwrap();
        assert_eq!(next_free_path(&plain), dir.path().join("run-02.json"));

        let numbered = dir.path().join("dome-09.csv");
        std::fs::write(&numbered, "").unwrap();
        assert_eq!(next_free_path(&numbered), dir.path().join("dome-10.csv"));
    }

    #[test]
    fn json_round_trip_never_overwrites() {
        let dir = tempdir().unwrap();
        let run = sample_run();
        let target = dir.path().join("out").join("test.json");

        let first = write_json(&run, &target).unwrap();
        let second = write_json(&run, &target).unwrap();
        assert_eq!(first, target);
        assert_ne!(first, second);

        assert_eq!(read_json(&first).unwrap(), run);
        assert_eq!(read_json(&second).unwrap(), run);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_round_trip_keeps_params_and_empty_cells() {
        let dir = tempdir().unwrap();
        let mut run = sample_run();
        run.test_results[1].direction = Up;

        let path = write_csv(&run, &dir.path().join("test.csv")).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# {"));
        assert!(text.contains("timestamp,direction,force,test_type,position,displacement,test_no"));

        assert_eq!(read_csv(&path).unwrap(), run);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_without_params_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bare.csv");
        std::fs::write(&path, "timestamp,direction\n").unwrap();
        assert!(matches!(read_csv(&path), Err(FdmError::Configuration(_))));
    }
}

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Write serializable rows to a CSV file via a temp file in the same
/// directory, then rename over the target. A failed write leaves the
/// previous file authoritative.
pub fn write_csv_atomic<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);

    let mut writer = csv::Writer::from_path(&tmp)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    drop(writer);

    fs::rename(&tmp, path)?;
    debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Same swap discipline for loosely-typed tables (explicit header + rows).
pub fn write_raw_csv_atomic(path: &Path, columns: &[String], rows: &[Vec<String>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);

    let mut writer = csv::Writer::from_path(&tmp)?;
    // A table with no reachable source has no columns; leave the file empty.
    if !columns.is_empty() {
        writer.write_record(columns)?;
        for row in rows {
            writer.write_record(row)?;
        }
    }
    writer.flush()?;
    drop(writer);

    fs::rename(&tmp, path)?;
    debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Like `read_csv`, but a missing file is an empty table. Used for stored
/// state that does not exist yet on the first run.
pub fn read_csv_or_empty<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        debug!("{} does not exist yet; treating as empty", path.display());
        return Ok(Vec::new());
    }
    read_csv(path)
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out.csv".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

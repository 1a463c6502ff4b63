//! Snapshot persistence across restarts.
//!
//! One JSON file per location under a directory. Writes go to a temp file
//! that is renamed into place, so a crash never leaves a torn snapshot.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use common::{Error, ForecastSnapshot};
use tracing::debug;

/// File stem for a location: anything outside `[A-Za-z0-9_-]` becomes `_`.
/// Distinct locations must have distinct keys.
pub fn storage_key(location_id: &str) -> String {
    location_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{dir}/{storage_key}.json`.
pub fn snapshot_path(dir: &Path, location_id: &str) -> PathBuf {
    dir.join(format!("{}.json", storage_key(location_id)))
}

pub fn save_snapshot(dir: &Path, snapshot: &ForecastSnapshot) -> common::Result<PathBuf> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::Persist(format!("failed to create {}: {e}", dir.display())))?;

    let path = snapshot_path(dir, snapshot.location_id());
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;

    fs::write(&tmp, json)
        .map_err(|e| Error::Persist(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, &path)
        .map_err(|e| Error::Persist(format!("failed to move {} into place: {e}", path.display())))?;

    debug!(
        "Saved snapshot {} for {} to {}",
        snapshot.sequence(),
        snapshot.location_id(),
        path.display()
    );
    Ok(path)
}

/// `Ok(None)` when nothing has been saved for the location yet.
pub fn load_snapshot(dir: &Path, location_id: &str) -> common::Result<Option<ForecastSnapshot>> {
    let path = snapshot_path(dir, location_id);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Persist(format!("failed to read {}: {e}", path.display())));
        }
    };

    let snapshot: ForecastSnapshot = serde_json::from_slice(&raw)?;
    if snapshot.location_id() != location_id {
        return Err(Error::Persist(format!(
            "{} holds a snapshot for {:?}, expected {:?}",
            path.display(),
            snapshot.location_id(),
            location_id
        )));
    }
    Ok(Some(snapshot))
}

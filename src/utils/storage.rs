//! Output location and free-space checks

use crate::utils::error::ConfigError;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Directory under the platform videos folder recordings go to
pub const RECORDINGS_DIR_NAME: &str = "ScreenRecords";

/// Free-space query for the volume holding a path
pub trait StorageProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64, ConfigError>;
}

/// Probe backed by the system disk list
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl StorageProbe for DiskSpaceProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64, ConfigError> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();

        // The disk whose mount point is the longest prefix of the path
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                ConfigError::SourceUnavailable(format!("no disk found for {:?}", path))
            })
    }
}

/// Fail with `InsufficientStorage` when less than `min_free_bytes` remain
pub fn ensure_free_space(
    probe: &dyn StorageProbe,
    path: &Path,
    min_free_bytes: u64,
) -> Result<u64, ConfigError> {
    let available = probe.available_bytes(path)?;
    if available < min_free_bytes {
        tracing::warn!(
            "Free space at {:?} is {} bytes, below the {} byte floor",
            path,
            available,
            min_free_bytes
        );
        return Err(ConfigError::InsufficientStorage {
            available,
            required: min_free_bytes,
        });
    }
    Ok(available)
}

/// `ScreenRecord-YYYY-MM-DD-HH-MM-SS.mp4`
pub fn recording_file_name(at: DateTime<Local>) -> String {
    format!("ScreenRecord-{}.mp4", at.format("%Y-%m-%d-%H-%M-%S"))
}

/// Platform videos directory (or `~/Movies`) plus `ScreenRecords`
pub fn default_output_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Movies")))
        .unwrap_or_else(std::env::temp_dir)
        .join(RECORDINGS_DIR_NAME)
}

/// A name in `dir` not taken by an existing file
pub fn unique_output_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    let name = recording_file_name(at);
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name.trim_end_matches(".mp4");
    (1..)
        .map(|n| dir.join(format!("{}-{}.mp4", stem, n)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

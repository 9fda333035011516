use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

const RECORDING_SUFFIX: &str = "_record";
const RECORDING_EXTENSION: &str = "mp4";

/// Where recordings are written: `<dir>/<yyyyMMdd_HHmmss>_record.mp4`.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Picks a fresh output path for a recording started at `now`, creating
    /// the directory if needed.
    pub fn next_path(&self, now: DateTime<Local>) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| anyhow::anyhow!("create {}: {}", self.dir.display(), e))?;
        let stem = format!("{}{}", now.format("%Y%m%d_%H%M%S"), RECORDING_SUFFIX);
        let mut path = self.dir.join(format!("{}.{}", stem, RECORDING_EXTENSION));
        let mut n = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{}_{}.{}", stem, n, RECORDING_EXTENSION));
            n += 1;
        }
        Ok(path)
    }

    /// The most recently modified recording, if any.
    pub fn latest_recording(&self) -> anyhow::Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORDING_EXTENSION) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if latest.as_ref().is_none_or(|(t, _)| modified >= *t) {
                latest = Some((modified, path));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::report::TopologyReport;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to create history directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read history directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write snapshot {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read snapshot {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {} is not a valid report: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize report {scan_id}: {source}")]
    Encode {
        scan_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk store of past runs, one `<scan_id>.json` per report.
///
/// Scan ids embed a UTC timestamp, so lexicographic filename order is
/// chronological order.
pub struct HistoryStore {
    dir: PathBuf,
    retain: usize,
}

impl HistoryStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain,
        }
    }

    /// Persist a report and prune anything beyond the retention window.
    pub fn save(&self, report: &TopologyReport) -> Result<PathBuf, HistoryError> {
        fs::create_dir_all(&self.dir).map_err(|source| HistoryError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(format!("{}.json", report.scan_id));
        let body = serde_json::to_vec_pretty(report).map_err(|source| HistoryError::Encode {
            scan_id: report.scan_id.clone(),
            source,
        })?;
        fs::write(&path, body).map_err(|source| HistoryError::Write {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "snapshot saved");
        self.prune()?;
        Ok(path)
    }

    /// Snapshot paths, oldest first.
    pub fn snapshots(&self) -> Result<Vec<PathBuf>, HistoryError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| HistoryError::ReadDir {
            path: self.dir.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Most recent report, if any run was persisted before.
    pub fn latest(&self) -> Result<Option<TopologyReport>, HistoryError> {
        match self.snapshots()?.last() {
            Some(path) => load_report(path).map(Some),
            None => Ok(None),
        }
    }

    /// Delete everything but the newest `retain` snapshots. Returns the
    /// number removed.
    pub fn prune(&self) -> Result<usize, HistoryError> {
        let paths = self.snapshots()?;
        if self.retain == 0 || paths.len() <= self.retain {
            return Ok(0);
        }
        let excess = paths.len() - self.retain;
        for path in &paths[..excess] {
            debug!(path = %path.display(), "pruning old snapshot");
            fs::remove_file(path).map_err(|source| HistoryError::Write {
                path: path.clone(),
                source,
            })?;
        }
        Ok(excess)
    }
}

fn load_report(path: &Path) -> Result<TopologyReport, HistoryError> {
    let body = fs::read(path).map_err(|source| HistoryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&body).map_err(|source| HistoryError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

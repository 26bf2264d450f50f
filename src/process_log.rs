//! Plain-text record of basin progress, used to resume interrupted runs.
//!
//! Each line is `<basin>: <status>`; a basin is done once a `finished` line
//! has been written for it.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const LOG_FILE_NAME: &str = "processing_log.txt";

#[derive(Debug, Clone)]
pub struct ProcessLog {
    path: PathBuf,
}

impl ProcessLog {
    /// Opens (and creates, if needed) `{dir}/processing_log.txt`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(LOG_FILE_NAME);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> Result<Vec<(String, String)>> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| match line.split_once(':') {
                Some((basin, status)) => (basin.trim().to_string(), status.trim().to_string()),
                None => (line.trim().to_string(), String::new()),
            })
            .collect())
    }

    /// Basins with a `finished` entry.
    pub fn finished(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, status)| status == "finished")
            .map(|(basin, _)| basin)
            .collect())
    }

    /// Number of distinct basins mentioned, whatever their status.
    pub fn count_unique(&self) -> Result<usize> {
        let basins: BTreeSet<String> = self.entries()?.into_iter().map(|(b, _)| b).collect();
        Ok(basins.len())
    }

    fn append(&self, basin: &str, status: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        writeln!(file, "{basin}: {status}")?;
        debug!(basin, status, "Process log updated");
        Ok(())
    }

    pub fn mark_processing(&self, basin: &str) -> Result<()> {
        self.append(basin, "processing")
    }

    pub fn mark_finished(&self, basin: &str) -> Result<()> {
        self.append(basin, "finished")
    }

    /// Marks every basin with a `{basin}_coverage.parquet` in `dir` as
    /// finished, unless it already is. Returns the basins added.
    pub fn backfill_from_coverage(&self, dir: &Path) -> Result<Vec<String>> {
        let done = self.finished()?;
        let mut added = Vec::new();
        for basin in coverage_basins(dir)? {
            if !done.contains(&basin) {
                self.mark_finished(&basin)?;
                added.push(basin);
            }
        }
        info!(added = added.len(), log = %self.path.display(), "Backfilled process log");
        Ok(added)
    }
}

/// Basin names of the `*_coverage.parquet` files directly in `dir`, sorted.
pub fn coverage_basins(dir: &Path) -> Result<Vec<String>> {
    let mut basins = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(basin) = name.strip_suffix("_coverage.parquet") {
            basins.push(basin.to_string());
        }
    }
    basins.sort();
    Ok(basins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_finished_basins_are_done() {
        let dir = tempfile::tempdir().unwrap();
        let log = ProcessLog::open(dir.path()).unwrap();
        log.mark_processing("01022500").unwrap();
        log.mark_finished("01022500").unwrap();
        log.mark_processing("01031500").unwrap();

        let done = log.finished().unwrap();
        assert!(done.contains("01022500"));
        assert!(!done.contains("01031500"));
        assert_eq!(log.count_unique().unwrap(), 2);
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        ProcessLog::open(dir.path()).unwrap().mark_finished("a").unwrap();
        let log = ProcessLog::open(dir.path()).unwrap();
        assert_eq!(log.finished().unwrap().len(), 1);
    }

    #[test]
    fn test_backfill_from_coverage() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["01022500_coverage.parquet", "01031500_coverage.parquet", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let log = ProcessLog::open(dir.path()).unwrap();
        log.mark_finished("01022500").unwrap();

        let added = log.backfill_from_coverage(dir.path()).unwrap();
        assert_eq!(added, vec!["01031500"]);
        assert_eq!(log.finished().unwrap().len(), 2);
        // second pass is a no-op
        assert!(log.backfill_from_coverage(dir.path()).unwrap().is_empty());
    }
}

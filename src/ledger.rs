use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::catalog::FileRecord;
use crate::error::RelocateError;
use crate::volume::DriveLetter;

/// One drive-letter reassignment that was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelabelRecord {
    pub from: DriveLetter,
    pub to: DriveLetter,
}

/// Durable undo record for one migration run.
///
/// Grows as the run progresses and is never rewritten afterwards except by
/// the rollback procedure, which archives it once replayed. Field additions
/// must carry `#[serde(default)]` so older ledgers still load.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RollbackLedger {
    pub run_timestamp: String,

    /// Services to restart after a rollback
    #[serde(default)]
    pub services: Vec<String>,

    /// File layout of each database as it was before any mutation
    #[serde(default)]
    pub per_database_original_files: BTreeMap<String, Vec<FileRecord>>,

    /// Databases verified reattached and back in MULTI_USER, in completion order
    #[serde(default)]
    pub successfully_moved_databases: Vec<String>,

    #[serde(default)]
    pub original_default_data_path: Option<String>,

    #[serde(default)]
    pub original_default_log_path: Option<String>,

    /// Informational only; letter rotations are not replayed by rollback
    #[serde(default)]
    pub volume_relabels: Vec<RelabelRecord>,
}

impl RollbackLedger {
    pub fn new(run_timestamp: &str, services: &[String]) -> Self {
        RollbackLedger {
            run_timestamp: run_timestamp.to_owned(),
            services: services.to_vec(),
            ..Default::default()
        }
    }

    /// True until something worth undoing has been recorded
    pub fn is_empty(&self) -> bool {
        self.per_database_original_files.is_empty()
            && self.successfully_moved_databases.is_empty()
            && self.original_default_data_path.is_none()
            && self.original_default_log_path.is_none()
            && self.volume_relabels.is_empty()
    }

    /// Snapshot a database's files before it is touched. The first snapshot
    /// wins: a later call for the same database would capture moved paths.
    pub fn record_original_files(&mut self, database: &str, files: &[FileRecord]) {
        self.per_database_original_files
            .entry(database.to_owned())
            .or_insert_with(|| files.to_vec());
    }

    pub fn record_moved(&mut self, database: &str) {
        if !self.successfully_moved_databases.iter().any(|d| d == database) {
            self.successfully_moved_databases.push(database.to_owned());
        }
    }

    pub fn record_default_paths(&mut self, data_path: Option<String>, log_path: Option<String>) {
        self.original_default_data_path = data_path;
        self.original_default_log_path = log_path;
    }

    pub fn record_relabels(&mut self, relabels: &[RelabelRecord]) {
        self.volume_relabels.extend_from_slice(relabels);
    }

    pub fn original_files(&self, database: &str) -> Option<&[FileRecord]> {
        self.per_database_original_files
            .get(database)
            .map(Vec::as_slice)
    }

    /// Databases that were snapshotted but never completed; these need a
    /// human to look at them
    pub fn incomplete_databases(&self) -> Vec<&str> {
        self.per_database_original_files
            .keys()
            .filter(|db| !self.successfully_moved_databases.contains(db))
            .map(String::as_str)
            .collect()
    }
}

/// A ledger bound to its file on disk
#[derive(Debug)]
pub struct LedgerFile {
    ledger: RollbackLedger,
    path: PathBuf,
}

impl LedgerFile {
    /// Start a new, empty ledger for a run. Nothing is written until the
    /// ledger holds something.
    pub fn create(ledger_dir: &Path, run_timestamp: &str, services: &[String]) -> Self {
        LedgerFile {
            ledger: RollbackLedger::new(run_timestamp, services),
            path: ledger_dir.join(format!("rollback_{}.json", run_timestamp)),
        }
    }

    pub fn open(path: &Path) -> Result<Self, RelocateError> {
        let json = fs::read_to_string(path)?;
        let ledger = serde_json::from_str(&json)?;
        Ok(LedgerFile {
            ledger,
            path: path.to_path_buf(),
        })
    }

    pub fn ledger(&self) -> &RollbackLedger {
        &self.ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn update(&mut self, f: impl FnOnce(&mut RollbackLedger)) {
        f(&mut self.ledger);
    }

    /// Write the ledger if it holds anything. The write goes to a sibling
    /// temp file which is then renamed over the ledger, so a crash leaves
    /// either the previous or the new snapshot, never a torn one.
    pub fn persist(&self) -> Result<(), RelocateError> {
        if self.ledger.is_empty() {
            debug!("Ledger is empty - not writing {}", self.path.display());
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.ledger)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!("Ledger written to {}", self.path.display());
        Ok(())
    }

    /// Rename the ledger file so it cannot be replayed again
    pub fn archive(self) -> Result<PathBuf, RelocateError> {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rollback".to_owned());
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let archived = self
            .path
            .with_file_name(format!("{}.applied_{}.json", stem, stamp));

        fs::rename(&self.path, &archived)?;
        info!("Ledger archived to {}", archived.display());
        Ok(archived)
    }
}

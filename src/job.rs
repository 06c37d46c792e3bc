use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Toml},
    Figment,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::RelocateError;
use crate::volume::{DriveLetter, VolumeManager};

const DEFAULT_INSTANCE: &str = ".";
const DEFAULT_SAFETY_MARGIN_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_TEMPDB_DIR: &str = "TempDB";

// ---- On-disk shape of a job description ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    instance: Option<String>,
    #[serde(default)]
    disks: Vec<DiskEntry>,
    tempdb: Option<TempDbEntry>,
    databases: Option<DatabasesEntry>,
    #[serde(default)]
    services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskEntry {
    #[serde(alias = "sourceVolume")]
    source_volume: String,
    #[serde(alias = "destinationVolume")]
    destination_volume: String,
    #[serde(alias = "temporaryVolume")]
    temporary_volume: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TempDbEntry {
    #[serde(alias = "destinationVolume")]
    destination_volume: String,
    #[serde(alias = "safetyMarginBytes", default = "default_safety_margin")]
    safety_margin_bytes: u64,
    destination_dir: Option<PathBuf>,
}

fn default_safety_margin() -> u64 {
    DEFAULT_SAFETY_MARGIN_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatabasesEntry {
    data_dir: PathBuf,
    log_dir: PathBuf,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    update_default_paths: bool,
}

// ---- Validated job ----

/// One old-disk -> new-disk relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumePair {
    pub source: DriveLetter,
    pub destination: DriveLetter,
    pub temporary: DriveLetter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempDbTarget {
    pub volume: DriveLetter,
    pub safety_margin_bytes: u64,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseTarget {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Empty means every user database
    pub names: Vec<String>,
    pub update_default_paths: bool,
}

/// Ordered, duplicate-free set of services quiesced for the run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceSet(Vec<String>);

impl ServiceSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let names = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_owned())
            .filter(|n| !n.is_empty())
            .filter(|n| seen.insert(n.to_ascii_lowercase()))
            .collect();
        ServiceSet(names)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A validated, immutable migration plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    pub instance: String,
    pub pairs: Vec<VolumePair>,
    pub tempdb: Option<TempDbTarget>,
    pub databases: Option<DatabaseTarget>,
    pub services: ServiceSet,
}

fn invalid(message: impl Into<String>) -> RelocateError {
    RelocateError::PartitionMissingOrConfigInvalid(message.into())
}

impl MigrationJob {
    /// Load and validate a TOML job description. `default_temporary` fills
    /// in pairs that do not name their own temporary volume.
    pub fn load(path: &Path, default_temporary: DriveLetter) -> Result<Self, RelocateError> {
        if !path.is_file() {
            return Err(invalid(format!(
                "job description '{}' does not exist",
                path.display()
            )));
        }
        let job = Self::from_figment(Figment::from(Toml::file(path)), default_temporary)?;
        info!(
            "Loaded job '{}': {} volume pair(s), tempdb {}, databases {}",
            path.display(),
            job.pairs.len(),
            if job.tempdb.is_some() { "yes" } else { "no" },
            if job.databases.is_some() { "yes" } else { "no" },
        );
        Ok(job)
    }

    pub fn from_toml_str(text: &str, default_temporary: DriveLetter) -> Result<Self, RelocateError> {
        Self::from_figment(Figment::from(Toml::string(text)), default_temporary)
    }

    fn from_figment(figment: Figment, default_temporary: DriveLetter) -> Result<Self, RelocateError> {
        let file: JobFile = figment.extract().map_err(|e| invalid(e.to_string()))?;
        Self::validate(file, default_temporary)
    }

    fn validate(file: JobFile, default_temporary: DriveLetter) -> Result<Self, RelocateError> {
        let mut used: HashSet<DriveLetter> = HashSet::new();
        let mut pairs = Vec::with_capacity(file.disks.len());

        for (index, disk) in file.disks.iter().enumerate() {
            let source: DriveLetter = disk.source_volume.parse()?;
            let destination: DriveLetter = disk.destination_volume.parse()?;
            let temporary = match &disk.temporary_volume {
                Some(t) => t.parse()?,
                None => default_temporary,
            };

            if source == destination {
                return Err(invalid(format!(
                    "disk {}: source and destination are both {}",
                    index + 1,
                    source
                )));
            }
            if temporary == source || temporary == destination {
                return Err(invalid(format!(
                    "disk {}: temporary volume {} must differ from source and destination",
                    index + 1,
                    temporary
                )));
            }
            // Pairs run concurrently, so no letter may appear in two pairs
            for letter in [source, destination, temporary] {
                if !used.insert(letter) {
                    return Err(invalid(format!(
                        "disk {}: volume {} is already used by another disk entry",
                        index + 1,
                        letter
                    )));
                }
            }

            pairs.push(VolumePair {
                source,
                destination,
                temporary,
            });
        }

        let tempdb = match file.tempdb {
            Some(entry) => {
                let volume: DriveLetter = entry.destination_volume.parse()?;
                let directory = entry
                    .destination_dir
                    .unwrap_or_else(|| volume.root().join(DEFAULT_TEMPDB_DIR));
                Some(TempDbTarget {
                    volume,
                    safety_margin_bytes: entry.safety_margin_bytes,
                    directory,
                })
            }
            None => None,
        };

        let databases = match file.databases {
            Some(entry) => {
                if entry.data_dir.as_os_str().is_empty() || entry.log_dir.as_os_str().is_empty() {
                    return Err(invalid("databases: data_dir and log_dir are required"));
                }
                Some(DatabaseTarget {
                    data_dir: entry.data_dir,
                    log_dir: entry.log_dir,
                    names: entry
                        .names
                        .iter()
                        .map(|n| n.trim().to_owned())
                        .filter(|n| !n.is_empty())
                        .collect(),
                    update_default_paths: entry.update_default_paths,
                })
            }
            None => None,
        };

        let services = ServiceSet::new(&file.services);

        if pairs.is_empty() && tempdb.is_none() && databases.is_none() {
            return Err(invalid("job has no disks, tempdb or databases section"));
        }
        if (!pairs.is_empty() || tempdb.is_some()) && services.is_empty() {
            return Err(invalid(
                "services must name at least one service when disks or tempdb are relocated",
            ));
        }

        let instance = file
            .instance
            .map(|i| i.trim().to_owned())
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| DEFAULT_INSTANCE.to_owned());

        Ok(MigrationJob {
            instance,
            pairs,
            tempdb,
            databases,
            services,
        })
    }

    /// Whether the run needs a service stop/start cycle
    pub fn cycles_services(&self) -> bool {
        !self.pairs.is_empty() || self.tempdb.is_some()
    }

    /// Check the plan against the live volume table without changing
    /// anything: every source and destination must exist, every temporary
    /// letter must be free, and the tempdb volume must exist.
    pub fn verify_volumes(&self, volumes: &dyn VolumeManager) -> Result<(), RelocateError> {
        for pair in &self.pairs {
            for letter in [pair.source, pair.destination] {
                if volumes.resolve_partition(letter)?.is_none() {
                    return Err(invalid(format!("volume {} does not exist", letter)));
                }
            }
            if volumes.resolve_partition(pair.temporary)?.is_some() {
                return Err(invalid(format!(
                    "temporary volume {} is already in use",
                    pair.temporary
                )));
            }
        }
        if let Some(tempdb) = &self.tempdb {
            if volumes.resolve_partition(tempdb.volume)?.is_none() {
                return Err(invalid(format!(
                    "tempdb volume {} does not exist",
                    tempdb.volume
                )));
            }
        }
        Ok(())
    }
}

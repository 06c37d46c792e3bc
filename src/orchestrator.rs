// Migration run states
//  Idle               - job validated; preflight and tempdb redeclaration run here
//  ServicesStopped    - every service in the ServiceSet is stopped
//  VolumesMigrating   - one worker per volume pair: mirror, then letter rotation
//  VolumesMigrated    - all workers joined; removal candidates resolved
//  ServicesRestoring  - services restarted (best-effort, exactly once)
//  DatabasesMigrating - sequential detach/move/attach with the engine running
//  Done
//  Failed             - reachable from any middle state; a Failed run that had
//                       stopped services still passes through ServicesRestoring

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::unbounded;
use log::{error, info, warn, Level};
use logging_timer::timer;
use serde::{Deserialize, Serialize};
use strum::Display;
use threadpool::ThreadPool;

use crate::best_effort::BestEffort;
use crate::context::RunContext;
use crate::db_relocation::{relocate_databases, relocate_default_paths, DatabaseSummary};
use crate::error::RelocateError;
use crate::job::MigrationJob;
use crate::ledger::{RelabelRecord, RollbackLedger};
use crate::quiesce::ServiceGuard;
use crate::tempdb::relocate_tempdb;
use crate::volume::DriveLetter;
use crate::volume_relocation::{relocate_volume, VolumeRelocationResult};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    ServicesStopped,
    VolumesMigrating,
    VolumesMigrated,
    ServicesRestoring,
    DatabasesMigrating,
    Done,
    Failed,
}

/// A disk that no longer carries live data after a successful pair,
/// identified by where it physically sits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalCandidate {
    pub source_volume: DriveLetter,
    pub destination_volume: DriveLetter,
    /// Letter the old disk answers to after rotation
    pub retired_letter: DriveLetter,
    pub disk_number: u32,
    pub location: String,
}

/// Everything a run produced, for the caller to print and for tests
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub states: Vec<MigrationState>,
    pub volume_results: Vec<VolumeRelocationResult>,
    pub removal_candidates: Vec<RemovalCandidate>,
    pub databases: Option<DatabaseSummary>,
    pub restore_failures: Vec<String>,
    pub error: Option<RelocateError>,
    pub ledger: RollbackLedger,
    pub ledger_path: Option<PathBuf>,
}

impl RunReport {
    /// `Failed` if the run failed anywhere, even though it then passed
    /// through `ServicesRestoring`
    pub fn final_state(&self) -> MigrationState {
        if self.states.contains(&MigrationState::Failed) {
            MigrationState::Failed
        } else {
            self.states.last().copied().unwrap_or(MigrationState::Idle)
        }
    }

    /// True only if every phase completed and every service came back
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
            && self.restore_failures.is_empty()
            && self.final_state() == MigrationState::Done
    }
}

pub struct Orchestrator {
    job: MigrationJob,
    ctx: RunContext,
    states: Vec<MigrationState>,
    volume_results: Vec<VolumeRelocationResult>,
    removal_candidates: Vec<RemovalCandidate>,
    databases: Option<DatabaseSummary>,
    restore_failures: Vec<String>,
}

impl Orchestrator {
    pub fn new(job: MigrationJob, ctx: RunContext) -> Self {
        Orchestrator {
            job,
            ctx,
            states: vec![MigrationState::Idle],
            volume_results: Vec::new(),
            removal_candidates: Vec::new(),
            databases: None,
            restore_failures: Vec::new(),
        }
    }

    fn state(&self) -> MigrationState {
        self.states.last().copied().unwrap_or(MigrationState::Idle)
    }

    fn transition(&mut self, next: MigrationState) {
        info!("[{}] State: {} -> {}", self.ctx.run_id(), self.state(), next);
        self.states.push(next);
    }

    /// Run every phase. Never returns early with services stopped; failures
    /// are reported in the `RunReport`.
    pub fn run(mut self) -> RunReport {
        let _tmr = timer!(Level::Info; "migration_run");
        info!("[{}] Migration run starting", self.ctx.run_id());

        let result = self.run_phases();

        if let Err(e) = &result {
            error!("[{}] Migration run failed: {}", self.ctx.run_id(), e);
            // A failure inside the service window was already recorded
            if !self.states.contains(&MigrationState::Failed) {
                self.transition(MigrationState::Failed);
            }
        } else {
            self.transition(MigrationState::Done);
        }

        let mut cleanup = BestEffort::new();
        cleanup.attempt("persist ledger", self.ctx.persist_ledger());

        let ledger_path = self.ctx.ledger_file().path().to_path_buf();
        let ledger_path = ledger_path.exists().then_some(ledger_path);
        if let Some(path) = &ledger_path {
            info!("Rollback ledger: {}", path.display());
        }

        RunReport {
            run_id: self.ctx.run_id().to_owned(),
            states: self.states,
            volume_results: self.volume_results,
            removal_candidates: self.removal_candidates,
            databases: self.databases,
            restore_failures: self.restore_failures,
            error: result.err(),
            ledger: self.ctx.ledger().clone(),
            ledger_path,
        }
    }

    fn run_phases(&mut self) -> Result<(), RelocateError> {
        // Nothing below this line changes state until preflight passes
        self.job
            .verify_volumes(self.ctx.collaborators().volumes.as_ref())?;

        if let Some(tempdb) = &self.job.tempdb {
            info!("Redeclaring tempdb files on {}", tempdb.volume);
            relocate_tempdb(&self.ctx, tempdb)?;
        }

        if self.job.cycles_services() {
            self.service_window()?;
        }

        if let Some(target) = self.job.databases.clone() {
            self.transition(MigrationState::DatabasesMigrating);
            if target.update_default_paths {
                relocate_default_paths(&mut self.ctx, &target)?;
            }
            self.databases = Some(relocate_databases(&mut self.ctx, &target)?);
        }

        Ok(())
    }

    /// Stop services, migrate every volume pair, restart services
    fn service_window(&mut self) -> Result<(), RelocateError> {
        let controller = Arc::clone(&self.ctx.collaborators().services);
        let guard = match ServiceGuard::acquire(controller, &self.job.services) {
            Ok(guard) => guard,
            Err(e) => {
                // acquire already restarted whatever it had stopped
                self.transition(MigrationState::Failed);
                self.transition(MigrationState::ServicesRestoring);
                return Err(e);
            }
        };
        self.transition(MigrationState::ServicesStopped);

        self.migrate_volumes();

        let failed: Vec<String> = self
            .volume_results
            .iter()
            .filter(|r| !r.succeeded)
            .map(|r| {
                format!(
                    "{} -> {}: {}",
                    r.pair.source,
                    r.pair.destination,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if !failed.is_empty() {
            self.transition(MigrationState::Failed);
        }

        self.transition(MigrationState::ServicesRestoring);
        let restored = guard.release();
        self.restore_failures = restored.failures().to_vec();

        if failed.is_empty() {
            Ok(())
        } else {
            for failure in &failed {
                error!("Volume pair failed: {}", failure);
            }
            Err(RelocateError::PhaseFailed(format!(
                "{} of {} volume pair(s) failed",
                failed.len(),
                self.volume_results.len()
            )))
        }
    }

    /// Fan out one worker per pair and wait for all of them
    fn migrate_volumes(&mut self) {
        self.transition(MigrationState::VolumesMigrating);
        let pairs = self.job.pairs.clone();

        if !pairs.is_empty() {
            let _tmr = timer!(Level::Info; "volume_phase", "{} pair(s)", pairs.len());
            let pool = ThreadPool::new(pairs.len());
            let (sender, receiver) = unbounded::<(usize, VolumeRelocationResult)>();

            for (index, pair) in pairs.iter().copied().enumerate() {
                let sender = sender.clone();
                let copier = Arc::clone(&self.ctx.collaborators().copier);
                let volumes = Arc::clone(&self.ctx.collaborators().volumes);
                let run_id = self.ctx.run_id().to_owned();

                pool.execute(move || {
                    let result = relocate_volume(&run_id, pair, copier.as_ref(), volumes.as_ref());
                    // The receiver outlives the pool, so send cannot fail
                    let _ = sender.send((index, result));
                });
            }

            // Drop our sender so the receiver sees only worker results
            drop(sender);
            pool.join();

            let mut slots: Vec<Option<VolumeRelocationResult>> = vec![None; pairs.len()];
            for (index, result) in receiver.try_iter() {
                slots[index] = Some(result);
            }

            // A worker that panicked never sent; report it rather than drop it
            self.volume_results = slots
                .into_iter()
                .zip(pairs.iter())
                .map(|(slot, pair)| {
                    slot.unwrap_or_else(|| {
                        VolumeRelocationResult::failed(
                            *pair,
                            "worker terminated without reporting a result".to_owned(),
                        )
                    })
                })
                .collect();
        }

        let relabels: Vec<RelabelRecord> = self
            .volume_results
            .iter()
            .flat_map(|r| r.relabels.iter().copied())
            .collect();
        if !relabels.is_empty() {
            self.ctx.update_ledger(|ledger| ledger.record_relabels(&relabels));
            let mut cleanup = BestEffort::new();
            cleanup.attempt("persist ledger", self.ctx.persist_ledger());
        }

        self.transition(MigrationState::VolumesMigrated);
        self.resolve_removal_candidates();
    }

    /// Informational: locate each retired disk. Failures are logged only.
    fn resolve_removal_candidates(&mut self) {
        let volumes = Arc::clone(&self.ctx.collaborators().volumes);
        let mut lookups = BestEffort::new();

        for result in self.volume_results.iter().filter(|r| r.succeeded) {
            let pair = result.pair;
            let retired_letter = pair.destination;
            let located = volumes
                .resolve_partition(retired_letter)
                .and_then(|partition| {
                    partition.ok_or_else(|| RelocateError::VolumeNotFound(retired_letter.to_string()))
                })
                .and_then(|partition| volumes.resolve_disk(partition.disk_number));

            if let Some(disk) = lookups.attempt(&format!("locate disk at {}", retired_letter), located) {
                info!(
                    "Removal candidate: old {} disk, now {} - disk {} at {}",
                    pair.source, retired_letter, disk.disk_number, disk.location
                );
                self.removal_candidates.push(RemovalCandidate {
                    source_volume: pair.source,
                    destination_volume: pair.destination,
                    retired_letter,
                    disk_number: disk.disk_number,
                    location: disk.location,
                });
            }
        }

        if !self.removal_candidates.is_empty() {
            let path = self
                .ctx
                .output_dir()
                .join(format!("removal_candidates_{}.json", self.ctx.run_id()));
            let written = write_candidates(&path, &self.removal_candidates);
            if lookups.attempt("write removal candidates", written).is_some() {
                info!("Removal candidates written to {}", path.display());
            }
        }

        if !lookups.is_clean() {
            warn!("Some removal candidates could not be resolved; see above");
        }
    }
}

fn write_candidates(path: &Path, candidates: &[RemovalCandidate]) -> Result<(), RelocateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(candidates)?;
    fs::write(path, json)?;
    Ok(())
}

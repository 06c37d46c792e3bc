use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn, Level};
use logging_timer::timer;

use crate::best_effort::BestEffort;
use crate::catalog::{Catalog, FileRecord};
use crate::context::RunContext;
use crate::error::RelocateError;
use crate::job::ServiceSet;
use crate::quiesce::ServiceGuard;
use crate::utils::Utils;

#[derive(Debug)]
pub struct RollbackReport {
    pub restored: Vec<String>,
    pub restart_failures: Vec<String>,
    pub archived_to: PathBuf,
}

/// Put one database back where the ledger says it was
fn restore_database(
    catalog: &Catalog,
    database: &str,
    original: &[FileRecord],
) -> Result<(), RelocateError> {
    let current = catalog.database_files(database)?;
    if current.is_empty() {
        return Err(RelocateError::DatabaseNotFound(database.to_owned()));
    }

    let mut moves = Vec::with_capacity(original.len());
    for record in original {
        let now_at = current
            .iter()
            .find(|f| f.logical_name == record.logical_name)
            .ok_or_else(|| {
                RelocateError::Error(format!(
                    "'{}' has no file named '{}' to move back",
                    database, record.logical_name
                ))
            })?;
        moves.push((now_at.physical_path.clone(), record.physical_path.clone()));
    }

    catalog.set_single_user(database)?;
    catalog.detach(database)?;

    for (from, to) in &moves {
        Utils::move_file(from, to)?;
    }

    let paths: Vec<PathBuf> = moves.into_iter().map(|(_, to)| to).collect();
    if let Err(e) = catalog.attach(database, &paths) {
        error!(
            "'{}' is DETACHED: attach from original paths {:?} failed",
            database, paths
        );
        return Err(e);
    }

    catalog.set_multi_user(database)
}

/// Replay the ledger held by `ctx`, newest state back to the original.
/// The ledger is archived only if every step succeeds.
pub fn rollback(ctx: RunContext) -> Result<RollbackReport, RelocateError> {
    let _tmr = timer!(Level::Info; "rollback", "{}", ctx.ledger_file().path().display());
    let ledger = ctx.ledger().clone();

    let incomplete = ledger.incomplete_databases();
    if !incomplete.is_empty() {
        warn!(
            "Databases snapshotted but never completed (check by hand): {:?}",
            incomplete
        );
    }
    if !ledger.volume_relabels.is_empty() {
        warn!(
            "Drive letters are not reverted by rollback; recorded relabels: {}",
            ledger
                .volume_relabels
                .iter()
                .map(|r| format!("{} -> {}", r.from, r.to))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let query = ctx.query();
    let catalog = Catalog::new(query.as_ref());
    let mut restored = Vec::new();

    for database in &ledger.successfully_moved_databases {
        let Some(original) = ledger.original_files(database) else {
            warn!("No original file list for '{}' - skipping", database);
            continue;
        };

        info!("Rolling back '{}'", database);
        if let Err(e) = restore_database(&catalog, database, original) {
            error!("Rollback of '{}' failed: {}", database, e);
            let mut cleanup = BestEffort::new();
            cleanup.attempt("restore MULTI_USER", catalog.set_multi_user(database));
            error!(
                "Rollback stopped; ledger left at {}",
                ctx.ledger_file().path().display()
            );
            return Err(e);
        }
        restored.push(database.clone());
    }

    if let Some(data_path) = &ledger.original_default_data_path {
        catalog.set_default_data_path(data_path)?;
        info!("Default data path restored to '{}'", data_path);
    }
    if let Some(log_path) = &ledger.original_default_log_path {
        catalog.set_default_log_path(log_path)?;
        info!("Default log path restored to '{}'", log_path);
    }

    let services = ServiceSet::new(&ledger.services);
    let mut restart_failures = Vec::new();
    if !services.is_empty() {
        info!("Cycling services {:?}", services.names());
        let controller = Arc::clone(&ctx.collaborators().services);
        let guard = ServiceGuard::acquire(controller, &services)?;
        restart_failures = guard.release().failures().to_vec();
    }

    let archived_to = ctx.into_ledger().archive()?;
    Ok(RollbackReport {
        restored,
        restart_failures,
        archived_to,
    })
}

// Database relocation, one database at a time:
//  1. Skip system databases
//  2. Read the file list (empty -> DatabaseNotFound)
//  3. Snapshot the file list into the ledger and persist it
//  4. SINGLE_USER WITH ROLLBACK IMMEDIATE (open transactions are discarded)
//  5. Detach
//  6. Move each file: DATA -> data_dir, LOG -> log_dir, same file name
//  7. Attach from the new locations (failure leaves the database detached)
//  8. MULTI_USER
//  9. Record success and persist the ledger
//
// The loop over databases is sequential: a detach briefly removes the
// database from the catalog that the "all user databases" query reads.

use std::path::{Path, PathBuf};

use log::{error, info, warn, Level};
use logging_timer::timer;

use crate::best_effort::BestEffort;
use crate::catalog::{is_system_database, Catalog, FileKind, FileRecord};
use crate::context::RunContext;
use crate::error::RelocateError;
use crate::job::DatabaseTarget;
use crate::utils::Utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseOutcome {
    Moved,
    SkippedSystem,
}

/// Per-run tally of the database phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseSummary {
    pub moved: Vec<String>,
    pub not_found: Vec<String>,
    pub skipped_system: Vec<String>,
}

/// Where a file of `kind` belongs under `target`
pub fn destination_dir(target: &DatabaseTarget, kind: FileKind) -> &Path {
    match kind {
        FileKind::Data => &target.data_dir,
        FileKind::Log => &target.log_dir,
    }
}

/// New physical path for every file, in file order
fn plan_moves(
    files: &[FileRecord],
    target: &DatabaseTarget,
) -> Result<Vec<(FileRecord, PathBuf)>, RelocateError> {
    files
        .iter()
        .map(|f| Ok((f.clone(), f.relocated_to(destination_dir(target, f.kind))?)))
        .collect()
}

/// Relocate one database. On failure the ledger is persisted and a
/// best-effort MULTI_USER restore is attempted before the error is returned.
pub fn relocate_database(
    ctx: &mut RunContext,
    database: &str,
    target: &DatabaseTarget,
) -> Result<DatabaseOutcome, RelocateError> {
    if is_system_database(database) {
        info!("Skipping system database '{}'", database);
        return Ok(DatabaseOutcome::SkippedSystem);
    }

    let _tmr = timer!(Level::Info; "relocate_database", "{}", database);
    let query = ctx.query();
    let catalog = Catalog::new(query.as_ref());

    let files = catalog.database_files(database)?;
    if files.is_empty() {
        return Err(RelocateError::DatabaseNotFound(database.to_owned()));
    }

    // The snapshot must reach disk before anything changes
    ctx.update_ledger(|ledger| ledger.record_original_files(database, &files));
    ctx.persist_ledger()?;

    match move_and_reattach(&catalog, database, &files, target) {
        Ok(()) => {
            ctx.update_ledger(|ledger| ledger.record_moved(database));
            ctx.persist_ledger()?;
            info!("Database '{}' relocated", database);
            Ok(DatabaseOutcome::Moved)
        }
        Err(e) => {
            error!("Relocation of '{}' failed: {}", database, e);
            let mut cleanup = BestEffort::new();
            cleanup.attempt("restore MULTI_USER", catalog.set_multi_user(database));
            cleanup.attempt("persist ledger", ctx.persist_ledger());
            Err(e)
        }
    }
}

fn move_and_reattach(
    catalog: &Catalog,
    database: &str,
    files: &[FileRecord],
    target: &DatabaseTarget,
) -> Result<(), RelocateError> {
    let moves = plan_moves(files, target)?;

    info!("Setting '{}' to SINGLE_USER", database);
    catalog.set_single_user(database)?;

    info!("Detaching '{}'", database);
    catalog.detach(database)?;

    for (record, new_path) in &moves {
        Utils::move_file(&record.physical_path, new_path)?;
    }

    let new_paths: Vec<PathBuf> = moves.iter().map(|(_, p)| p.clone()).collect();
    info!("Attaching '{}' from new locations", database);
    if let Err(e) = catalog.attach(database, &new_paths) {
        error!(
            "'{}' is DETACHED: attach from {:?} failed. Attach manually or run rollback.",
            database, new_paths
        );
        return Err(e);
    }

    verify_attached(catalog, database, &moves)?;

    info!("Setting '{}' to MULTI_USER", database);
    catalog.set_multi_user(database)
}

/// Confirm the engine reports every file at its planned location
fn verify_attached(
    catalog: &Catalog,
    database: &str,
    moves: &[(FileRecord, PathBuf)],
) -> Result<(), RelocateError> {
    let attached = catalog.database_files(database)?;
    for (record, expected) in moves {
        let actual = attached
            .iter()
            .find(|f| f.logical_name == record.logical_name)
            .map(|f| &f.physical_path);
        if actual != Some(expected) {
            return Err(RelocateError::Error(format!(
                "'{}' file '{}' expected at '{}', engine reports {:?}",
                database,
                record.logical_name,
                expected.display(),
                actual
            )));
        }
    }
    Ok(())
}

/// Relocate every database named by `target` (or every user database),
/// stopping at the first failure other than a missing database
pub fn relocate_databases(
    ctx: &mut RunContext,
    target: &DatabaseTarget,
) -> Result<DatabaseSummary, RelocateError> {
    let _tmr = timer!(Level::Info; "relocate_databases");

    let names = if target.names.is_empty() {
        ctx.catalog().user_databases()?
    } else {
        target.names.clone()
    };
    info!("Relocating {} database(s): {:?}", names.len(), names);

    let mut summary = DatabaseSummary::default();
    for name in &names {
        match relocate_database(ctx, name, target) {
            Ok(DatabaseOutcome::Moved) => summary.moved.push(name.clone()),
            Ok(DatabaseOutcome::SkippedSystem) => summary.skipped_system.push(name.clone()),
            Err(RelocateError::DatabaseNotFound(_)) => {
                warn!("Database '{}' not found - skipping", name);
                summary.not_found.push(name.clone());
            }
            Err(e) => {
                let remaining = names.len()
                    - summary.moved.len()
                    - summary.not_found.len()
                    - summary.skipped_system.len()
                    - 1;
                error!(
                    "Aborting database phase at '{}'; {} database(s) not attempted",
                    name, remaining
                );
                return Err(e);
            }
        }
    }

    Ok(summary)
}

/// Point the instance default data/log paths at the new directories,
/// recording the old values first
pub fn relocate_default_paths(
    ctx: &mut RunContext,
    target: &DatabaseTarget,
) -> Result<(), RelocateError> {
    let (data_path, log_path) = ctx.catalog().default_paths()?;
    info!(
        "Current default paths: data {:?}, log {:?}",
        data_path, log_path
    );

    ctx.update_ledger(|ledger| ledger.record_default_paths(data_path, log_path));
    ctx.persist_ledger()?;

    let catalog = ctx.catalog();
    catalog.set_default_data_path(&target.data_dir.to_string_lossy())?;
    catalog.set_default_log_path(&target.log_dir.to_string_lossy())?;
    info!(
        "Default paths set to data '{}', log '{}'",
        target.data_dir.display(),
        target.log_dir.display()
    );
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bulk_copy::{BulkCopier, RobocopyCopier};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::RelocateError;
use crate::job::ServiceSet;
use crate::ledger::{LedgerFile, RollbackLedger};
use crate::query::{QueryExecutor, SqlCmdExecutor};
use crate::services::{ScServiceController, ServiceController};
use crate::volume::{PowerShellVolumeManager, VolumeManager};

/// The external systems a run drives
#[derive(Clone)]
pub struct Collaborators {
    pub query: Arc<dyn QueryExecutor>,
    pub services: Arc<dyn ServiceController>,
    pub copier: Arc<dyn BulkCopier>,
    pub volumes: Arc<dyn VolumeManager>,
}

impl Collaborators {
    /// The Windows tool-backed implementations
    pub fn production(config: &Config, instance: &str) -> Self {
        Collaborators {
            query: Arc::new(SqlCmdExecutor::new(&config.tools.sqlcmd, instance)),
            services: Arc::new(ScServiceController::new()),
            copier: Arc::new(RobocopyCopier::new(
                &config.tools,
                Some(config.paths.log_dir.clone()),
            )),
            volumes: Arc::new(PowerShellVolumeManager::new(&config.tools.powershell)),
        }
    }
}

/// Timestamp identifying one run; names the ledger and log files
pub fn new_run_id() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Everything scoped to one run, passed explicitly to every step
pub struct RunContext {
    run_id: String,
    collaborators: Collaborators,
    ledger: LedgerFile,
    output_dir: PathBuf,
}

impl RunContext {
    pub fn new(
        run_id: &str,
        collaborators: Collaborators,
        output_dir: &Path,
        services: &ServiceSet,
    ) -> Self {
        RunContext {
            run_id: run_id.to_owned(),
            collaborators,
            ledger: LedgerFile::create(output_dir, run_id, services.names()),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Context for replaying an existing ledger
    pub fn for_ledger(run_id: &str, collaborators: Collaborators, ledger: LedgerFile) -> Self {
        let output_dir = ledger
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        RunContext {
            run_id: run_id.to_owned(),
            collaborators,
            ledger,
            output_dir,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Shared handle to the query executor, for building a `Catalog` that
    /// does not borrow the context
    pub fn query(&self) -> Arc<dyn QueryExecutor> {
        Arc::clone(&self.collaborators.query)
    }

    pub fn catalog(&self) -> Catalog<'_> {
        Catalog::new(self.collaborators.query.as_ref())
    }

    pub fn ledger(&self) -> &RollbackLedger {
        self.ledger.ledger()
    }

    pub fn ledger_file(&self) -> &LedgerFile {
        &self.ledger
    }

    pub fn update_ledger(&mut self, f: impl FnOnce(&mut RollbackLedger)) {
        self.ledger.update(f);
    }

    pub fn persist_ledger(&self) -> Result<(), RelocateError> {
        self.ledger.persist()
    }

    pub fn into_ledger(self) -> LedgerFile {
        self.ledger
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

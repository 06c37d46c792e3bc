use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use crate::config::Config;
use crate::context::{new_run_id, Collaborators, RunContext};
use crate::error::RelocateError;
use crate::job::{MigrationJob, ServiceSet, VolumePair};
use crate::ledger::LedgerFile;
use crate::orchestrator::Orchestrator;
use crate::rollback::rollback;
use crate::volume::DriveLetter;
use crate::volume_relocation::relocate_volume_standalone;

#[derive(Parser)]
#[command(
    name = "sqlrelocate",
    version,
    about = "Move SQL Server databases, tempdb and whole volumes onto new disks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a migration job
    Run {
        /// Job description (TOML)
        #[arg(long)]
        job: PathBuf,
    },

    /// Load, validate and preflight a job without changing anything
    Check {
        /// Job description (TOML)
        #[arg(long)]
        job: PathBuf,
    },

    /// Replay a rollback ledger
    Rollback {
        /// Ledger written by an earlier run
        #[arg(long)]
        ledger: PathBuf,

        /// Instance to connect to
        #[arg(long, default_value = ".")]
        instance: String,
    },

    /// Move one volume onto a new disk with its own service window
    #[command(name = "relocate-volume")]
    RelocateVolume {
        /// Volume being retired, e.g. E:
        #[arg(long)]
        source: DriveLetter,

        /// New volume, e.g. F:
        #[arg(long)]
        destination: DriveLetter,

        /// Free letter used during the swap (default from config)
        #[arg(long)]
        temporary: Option<DriveLetter>,

        /// Service to stop for the copy; repeat for several
        #[arg(long = "service")]
        services: Vec<String>,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), RelocateError> {
        let args = Cli::parse();
        let run_id = new_run_id();

        match args.command {
            Command::Run { job } => Self::run_job(&run_id, &job),
            Command::Check { job } => Self::check_job(&job),
            Command::Rollback { ledger, instance } => {
                Self::rollback_ledger(&run_id, &ledger, &instance)
            }
            Command::RelocateVolume {
                source,
                destination,
                temporary,
                services,
            } => Self::relocate_one_volume(&run_id, source, destination, temporary, services),
        }
    }

    fn load_job(path: &Path) -> Result<MigrationJob, RelocateError> {
        let config = Config::get();
        MigrationJob::load(path, config.volumes.default_temporary_letter())
    }

    fn run_job(run_id: &str, path: &Path) -> Result<(), RelocateError> {
        let config = Config::get();
        let job = Self::load_job(path)?;
        let path = dunce::canonicalize(path)?;
        info!("Run {} for job {}", run_id, path.display());

        let collaborators = Collaborators::production(config, &job.instance);
        let ctx = RunContext::new(
            run_id,
            collaborators,
            &config.paths.ledger_dir,
            &job.services,
        );
        let report = Orchestrator::new(job, ctx).run();

        for result in &report.volume_results {
            match &result.error {
                None => println!(
                    "{} -> {}: ok",
                    result.pair.source, result.pair.destination
                ),
                Some(e) => println!(
                    "{} -> {}: FAILED ({})",
                    result.pair.source, result.pair.destination, e
                ),
            }
        }
        for candidate in &report.removal_candidates {
            println!(
                "Remove disk {} ({}), now at {}",
                candidate.disk_number, candidate.location, candidate.retired_letter
            );
        }
        if let Some(summary) = &report.databases {
            println!(
                "Databases moved: {}, not found: {}",
                summary.moved.len(),
                summary.not_found.len()
            );
        }
        if let Some(path) = &report.ledger_path {
            println!("Rollback ledger: {}", path.display());
        }
        for failure in &report.restore_failures {
            eprintln!("Service restart failed: {}", failure);
        }

        match report.error {
            Some(e) => Err(e),
            None if !report.restore_failures.is_empty() => Err(RelocateError::PhaseFailed(
                "one or more services did not restart".to_owned(),
            )),
            None => Ok(()),
        }
    }

    fn check_job(path: &Path) -> Result<(), RelocateError> {
        let config = Config::get();
        let job = Self::load_job(path)?;
        let collaborators = Collaborators::production(config, &job.instance);
        job.verify_volumes(collaborators.volumes.as_ref())?;

        println!("Job {} is valid", path.display());
        for pair in &job.pairs {
            println!(
                "  volume {} -> {} (via {})",
                pair.source, pair.destination, pair.temporary
            );
        }
        if let Some(tempdb) = &job.tempdb {
            println!("  tempdb -> {}", tempdb.directory.display());
        }
        if let Some(databases) = &job.databases {
            println!(
                "  databases -> data {}, log {}",
                databases.data_dir.display(),
                databases.log_dir.display()
            );
        }
        Ok(())
    }

    fn rollback_ledger(run_id: &str, path: &Path, instance: &str) -> Result<(), RelocateError> {
        let config = Config::get();
        // Plain drive paths, so the archived name sits next to the original
        let path = dunce::canonicalize(path)?;
        let ledger = LedgerFile::open(&path)?;
        let collaborators = Collaborators::production(config, instance);
        let ctx = RunContext::for_ledger(run_id, collaborators, ledger);

        let report = rollback(ctx)?;
        println!(
            "Rolled back {} database(s); ledger archived to {}",
            report.restored.len(),
            report.archived_to.display()
        );
        if !report.restart_failures.is_empty() {
            for failure in &report.restart_failures {
                eprintln!("Service restart failed: {}", failure);
            }
            return Err(RelocateError::PhaseFailed(
                "one or more services did not restart".to_owned(),
            ));
        }
        Ok(())
    }

    fn relocate_one_volume(
        run_id: &str,
        source: DriveLetter,
        destination: DriveLetter,
        temporary: Option<DriveLetter>,
        services: Vec<String>,
    ) -> Result<(), RelocateError> {
        let config = Config::get();
        let pair = VolumePair {
            source,
            destination,
            temporary: temporary.unwrap_or_else(|| config.volumes.default_temporary_letter()),
        };
        if pair.source == pair.destination
            || pair.temporary == pair.source
            || pair.temporary == pair.destination
        {
            return Err(RelocateError::PartitionMissingOrConfigInvalid(format!(
                "source, destination and temporary must differ ({}, {}, {})",
                pair.source, pair.destination, pair.temporary
            )));
        }

        let services = ServiceSet::new(services);
        if services.is_empty() {
            warn!("No services given - copying with everything running");
        }

        let collaborators = Collaborators::production(config, ".");
        let result = relocate_volume_standalone(run_id, pair, &collaborators, &services)?;
        match result.error {
            None => {
                println!("{} -> {}: ok", pair.source, pair.destination);
                Ok(())
            }
            Some(e) => {
                error!("Volume relocation failed: {}", e);
                Err(RelocateError::PhaseFailed(e))
            }
        }
    }
}

mod best_effort;
mod bulk_copy;
mod catalog;
mod cli;
mod config;
mod context;
mod db_relocation;
mod error;
mod job;
mod ledger;
mod orchestrator;
mod query;
mod quiesce;
mod rollback;
mod services;
mod tempdb;
#[cfg(test)]
mod testing;
mod tools;
mod utils;
mod volume;
mod volume_relocation;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use error::RelocateError;
use flexi_logger::{detailed_format, Duplicate, FileSpec, Logger, LoggerHandle};
use log::{debug, error};

fn start_logging(config: &Config) -> Result<LoggerHandle, RelocateError> {
    let log_spec = format!("sqlrelocate={}", config.logging.sqlrelocate);
    Logger::try_with_str(&log_spec)
        .and_then(|logger| {
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(&config.paths.log_dir)
                        .basename("sqlrelocate"),
                )
                .format_for_files(detailed_format)
                .duplicate_to_stderr(Duplicate::Info)
                .start()
        })
        .map_err(|e| RelocateError::Error(format!("Failed to start logging: {}", e)))
}

fn main() {
    let project_dirs = match ProjectDirs::from("", "", "sqlrelocate") {
        Some(dirs) => dirs,
        None => {
            eprintln!("Could not determine the application data directory");
            std::process::exit(1);
        }
    };

    let config = Config::load_config(&project_dirs);
    if CONFIG.set(config).is_err() {
        eprintln!("Configuration was already initialized");
        std::process::exit(1);
    }

    // The file name carries the start timestamp, one log per run
    let logger = match start_logging(Config::get()) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    debug!(
        "Command-line args: {:?}",
        std::env::args_os().collect::<Vec<_>>()
    );

    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        logger.flush();
        std::process::exit(1);
    }
}

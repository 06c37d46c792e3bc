use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::config::ToolsConfig;
use crate::error::RelocateError;
use crate::tools::run_tool;

/// Directories on a volume root that belong to the OS, not the data
const EXCLUDED_DIRS: [&str; 2] = ["System Volume Information", "$RECYCLE.BIN"];

/// Exit status of a mirror copy, classified.
///
/// The mirror tool reports a bit mask: 1 files copied, 2 extra files,
/// 4 mismatches. Anything with bit 8 or above set is a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// 0-1: nothing to do, or files copied
    Success(i32),
    /// 2-7: extra or mismatched entries, the destination is still a mirror
    Warning(i32),
    /// 8 and above, or killed without an exit code
    Failed(Option<i32>),
}

impl CopyOutcome {
    pub fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(code @ 0..=1) => CopyOutcome::Success(code),
            Some(code @ 2..=7) => CopyOutcome::Warning(code),
            other => CopyOutcome::Failed(other),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, CopyOutcome::Failed(_))
    }

    /// Exit code for reporting; -1 when the process had none
    pub fn exit_code(&self) -> i32 {
        match self {
            CopyOutcome::Success(code) | CopyOutcome::Warning(code) => *code,
            CopyOutcome::Failed(code) => code.unwrap_or(-1),
        }
    }
}

/// Mirrors one directory tree onto another, deleting extraneous
/// destination entries
pub trait BulkCopier: Send + Sync {
    /// Returns the raw exit status; launching failures are errors
    fn mirror(&self, source_dir: &Path, destination_dir: &Path) -> Result<Option<i32>, RelocateError>;
}

/// Mirror `source_dir` onto `destination_dir` and classify the result,
/// mapping a hard failure (including a copier that never ran) to `CopyFailed`
pub fn mirror_checked(
    copier: &dyn BulkCopier,
    source_dir: &Path,
    destination_dir: &Path,
) -> Result<CopyOutcome, RelocateError> {
    let exit_code = match copier.mirror(source_dir, destination_dir) {
        Ok(exit_code) => exit_code,
        Err(e) => {
            error!(
                "Mirror {} -> {} could not run: {}",
                source_dir.display(),
                destination_dir.display(),
                e
            );
            None
        }
    };

    let outcome = CopyOutcome::from_exit_code(exit_code);
    if !outcome.is_success() {
        return Err(RelocateError::CopyFailed {
            source_root: source_dir.display().to_string(),
            destination_root: destination_dir.display().to_string(),
            exit_code: outcome.exit_code(),
        });
    }

    match outcome {
        CopyOutcome::Warning(code) => warn!(
            "Mirror {} -> {} completed with warnings (exit code {})",
            source_dir.display(),
            destination_dir.display(),
            code
        ),
        _ => info!(
            "Mirror {} -> {} completed (exit code {})",
            source_dir.display(),
            destination_dir.display(),
            outcome.exit_code()
        ),
    }
    Ok(outcome)
}

/// `BulkCopier` backed by robocopy
pub struct RobocopyCopier {
    program: String,
    retries: u32,
    wait_secs: u32,
    threads: u32,
    log_dir: Option<PathBuf>,
}

impl RobocopyCopier {
    pub fn new(tools: &ToolsConfig, log_dir: Option<PathBuf>) -> Self {
        RobocopyCopier {
            program: tools.robocopy.clone(),
            retries: tools.copy_retries,
            wait_secs: tools.copy_wait_secs,
            threads: tools.copy_threads,
            log_dir,
        }
    }

    fn build_args(&self, source_dir: &Path, destination_dir: &Path) -> Vec<String> {
        let mut args = vec![
            source_dir.display().to_string(),
            destination_dir.display().to_string(),
            "/MIR".to_owned(),
            "/COPYALL".to_owned(),
            "/DCOPY:T".to_owned(),
            format!("/R:{}", self.retries),
            format!("/W:{}", self.wait_secs),
            format!("/MT:{}", self.threads),
            "/XD".to_owned(),
        ];
        args.extend(EXCLUDED_DIRS.iter().map(|d| d.to_string()));
        args.extend(["/NP", "/NFL", "/NDL"].iter().map(|s| s.to_string()));

        if let Some(log_dir) = &self.log_dir {
            let log_file = log_dir.join(format!(
                "robocopy_{}_to_{}.log",
                Self::log_tag(source_dir),
                Self::log_tag(destination_dir)
            ));
            args.push(format!("/LOG+:{}", log_file.display()));
        }

        args
    }

    /// File-name-safe tag for a root like `E:\`
    fn log_tag(dir: &Path) -> String {
        dir.display()
            .to_string()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect()
    }
}

impl BulkCopier for RobocopyCopier {
    fn mirror(&self, source_dir: &Path, destination_dir: &Path) -> Result<Option<i32>, RelocateError> {
        let args = self.build_args(source_dir, destination_dir);
        info!("Running {} {}", self.program, args.join(" "));
        let output = run_tool(&self.program, &args)?;
        Ok(output.exit_code)
    }
}

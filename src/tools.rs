use std::ffi::OsStr;
use std::io;
use std::process::Command;

use log::trace;

/// Captured result of one external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// None when the process was terminated without an exit code
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined, trimmed, for error messages
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_owned();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Run `program` to completion and capture its output. Only a failure to
/// launch the process is an error; a non-zero exit is reported in the output.
pub fn run_tool<I, S>(program: &str, args: I) -> io::Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    trace!("Running: {:?}", command);

    let output = command.output()?;

    Ok(ToolOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

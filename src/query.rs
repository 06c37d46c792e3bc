use log::debug;

use crate::error::RelocateError;
use crate::tools::run_tool;

/// One result row, columns in select order
pub type Row = Vec<String>;

/// Runs statements against the database engine.
///
/// No implementation retries: administrative statements such as mode changes
/// are not safe to repeat blindly.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, statement: &str) -> Result<Vec<Row>, RelocateError>;
}

/// Column separator passed to sqlcmd. Pipe cannot appear in the values we
/// select (names, paths, sizes).
const COLUMN_SEPARATOR: char = '|';

/// Markers sqlcmd prints when it never got a session with the instance
const UNREACHABLE_MARKERS: [&str; 5] = [
    "Login failed",
    "Login timeout expired",
    "network-related",
    "Named Pipes Provider",
    "TCP Provider",
];

/// `QueryExecutor` backed by the `sqlcmd` command-line client using
/// Windows authentication
pub struct SqlCmdExecutor {
    program: String,
    instance: String,
}

impl SqlCmdExecutor {
    pub fn new(program: &str, instance: &str) -> Self {
        SqlCmdExecutor {
            program: program.to_owned(),
            instance: instance.to_owned(),
        }
    }

    fn parse_rows(stdout: &str) -> Vec<Row> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split(COLUMN_SEPARATOR)
                    .map(|col| col.trim().to_owned())
                    .collect()
            })
            .collect()
    }

    fn is_unreachable(text: &str) -> bool {
        UNREACHABLE_MARKERS.iter().any(|marker| text.contains(marker))
    }
}

impl QueryExecutor for SqlCmdExecutor {
    fn execute(&self, statement: &str) -> Result<Vec<Row>, RelocateError> {
        debug!("[{}] {}", self.instance, statement);

        let query = format!("SET NOCOUNT ON; {}", statement);
        let separator = COLUMN_SEPARATOR.to_string();
        let args = [
            "-S",
            self.instance.as_str(),
            "-E",
            "-b",
            "-h",
            "-1",
            "-W",
            "-s",
            separator.as_str(),
            "-Q",
            query.as_str(),
        ];

        let output = run_tool(&self.program, args).map_err(|e| {
            RelocateError::EngineUnreachable(format!("could not launch {}: {}", self.program, e))
        })?;

        if output.success() {
            return Ok(Self::parse_rows(&output.stdout));
        }

        let message = output.combined();
        if Self::is_unreachable(&message) {
            Err(RelocateError::EngineUnreachable(format!(
                "{}: {}",
                self.instance, message
            )))
        } else {
            Err(RelocateError::statement_failed(statement, message))
        }
    }
}

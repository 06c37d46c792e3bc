use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::RelocateError;
use crate::query::{QueryExecutor, Row};

/// Databases that are never detached or moved
pub const SYSTEM_DATABASES: [&str; 4] = ["master", "model", "msdb", "tempdb"];

const PAGE_SIZE_BYTES: u64 = 8192;

const INSTANCE_REGISTRY_KEY: &str = r"Software\Microsoft\MSSQLServer\MSSQLServer";

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES
        .iter()
        .any(|system| system.eq_ignore_ascii_case(name))
}

#[derive(
    AsRefStr, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileKind {
    #[strum(serialize = "DATA")]
    Data,
    #[strum(serialize = "LOG")]
    Log,
}

impl FileKind {
    /// Map `sys.master_files.type_desc`. Everything other than LOG (ROWS,
    /// FILESTREAM, FULLTEXT) lives with the data files.
    pub fn from_type_desc(type_desc: &str) -> Self {
        if type_desc.eq_ignore_ascii_case("LOG") {
            FileKind::Log
        } else {
            FileKind::Data
        }
    }
}

/// One database file as the engine's catalog knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub logical_name: String,
    pub kind: FileKind,
    pub physical_path: PathBuf,
}

impl FileRecord {
    pub fn new(logical_name: &str, kind: FileKind, physical_path: impl Into<PathBuf>) -> Self {
        FileRecord {
            logical_name: logical_name.to_owned(),
            kind,
            physical_path: physical_path.into(),
        }
    }

    /// The same file name placed in `dir`
    pub fn relocated_to(&self, dir: &Path) -> Result<PathBuf, RelocateError> {
        let file_name = self.physical_path.file_name().ok_or_else(|| {
            RelocateError::Error(format!(
                "File '{}' of '{}' has no file name",
                self.physical_path.display(),
                self.logical_name
            ))
        })?;
        Ok(dir.join(file_name))
    }
}

/// `[name]` with embedded `]` doubled
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `N'text'` with embedded `'` doubled
pub fn quote_literal(text: &str) -> String {
    format!("N'{}'", text.replace('\'', "''"))
}

fn path_literal(path: &Path) -> String {
    quote_literal(&path.to_string_lossy())
}

/// Typed catalog reads and administrative statements over a `QueryExecutor`
pub struct Catalog<'a> {
    executor: &'a dyn QueryExecutor,
}

impl<'a> Catalog<'a> {
    pub fn new(executor: &'a dyn QueryExecutor) -> Self {
        Catalog { executor }
    }

    fn run(&self, statement: &str) -> Result<Vec<Row>, RelocateError> {
        self.executor.execute(statement)
    }

    /// All files of `database`, in file id order. Empty when the database
    /// does not exist.
    pub fn database_files(&self, database: &str) -> Result<Vec<FileRecord>, RelocateError> {
        let statement = format!(
            "SELECT name, type_desc, physical_name FROM sys.master_files \
             WHERE database_id = DB_ID({}) ORDER BY file_id",
            quote_literal(database)
        );
        self.run(&statement)?
            .into_iter()
            .map(|row| match row.as_slice() {
                [name, type_desc, physical_name] => Ok(FileRecord::new(
                    name,
                    FileKind::from_type_desc(type_desc),
                    physical_name,
                )),
                _ => Err(RelocateError::statement_failed(
                    &statement,
                    format!("unexpected row shape: {:?}", row),
                )),
            })
            .collect()
    }

    /// Names of all non-system databases, sorted
    pub fn user_databases(&self) -> Result<Vec<String>, RelocateError> {
        let rows = self.run("SELECT name FROM sys.databases WHERE database_id > 4 ORDER BY name")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter(|name| !is_system_database(name))
            .collect())
    }

    pub fn set_single_user(&self, database: &str) -> Result<(), RelocateError> {
        self.run(&format!(
            "ALTER DATABASE {} SET SINGLE_USER WITH ROLLBACK IMMEDIATE",
            quote_ident(database)
        ))
        .map(drop)
    }

    pub fn set_multi_user(&self, database: &str) -> Result<(), RelocateError> {
        self.run(&format!(
            "ALTER DATABASE {} SET MULTI_USER",
            quote_ident(database)
        ))
        .map(drop)
    }

    pub fn detach(&self, database: &str) -> Result<(), RelocateError> {
        self.run(&format!(
            "EXEC master.dbo.sp_detach_db @dbname = {}",
            quote_literal(database)
        ))
        .map(drop)
    }

    /// Reattach `database` from `files` in a single statement
    pub fn attach(&self, database: &str, files: &[PathBuf]) -> Result<(), RelocateError> {
        if files.is_empty() {
            return Err(RelocateError::Error(format!(
                "Cannot attach '{}' without files",
                database
            )));
        }
        let file_list = files
            .iter()
            .map(|path| format!("(FILENAME = {})", path_literal(path)))
            .collect::<Vec<_>>()
            .join(", ");
        self.run(&format!(
            "CREATE DATABASE {} ON {} FOR ATTACH",
            quote_ident(database),
            file_list
        ))
        .map(drop)
    }

    pub fn tempdb_files(&self) -> Result<Vec<FileRecord>, RelocateError> {
        self.database_files("tempdb")
    }

    /// Current allocated size of all tempdb files
    pub fn tempdb_size_bytes(&self) -> Result<u64, RelocateError> {
        let statement = "SELECT SUM(CAST(size AS bigint)) FROM tempdb.sys.database_files";
        let rows = self.run(statement)?;
        let pages = rows
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| RelocateError::statement_failed(statement, "no rows returned"))?;
        let pages: u64 = pages.parse().map_err(|_| {
            RelocateError::statement_failed(statement, format!("invalid page count '{}'", pages))
        })?;
        Ok(pages * PAGE_SIZE_BYTES)
    }

    /// Point a tempdb file at `new_path`; effective at next engine start
    pub fn modify_tempdb_file(&self, logical_name: &str, new_path: &Path) -> Result<(), RelocateError> {
        self.run(&format!(
            "ALTER DATABASE tempdb MODIFY FILE (NAME = {}, FILENAME = {})",
            quote_ident(logical_name),
            path_literal(new_path)
        ))
        .map(drop)
    }

    /// The instance default data and log directories, if set
    pub fn default_paths(&self) -> Result<(Option<String>, Option<String>), RelocateError> {
        let rows = self.run(
            "SELECT CAST(SERVERPROPERTY('InstanceDefaultDataPath') AS nvarchar(4000)), \
             CAST(SERVERPROPERTY('InstanceDefaultLogPath') AS nvarchar(4000))",
        )?;
        let present = |value: Option<&String>| {
            value
                .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("NULL"))
                .cloned()
        };
        match rows.first() {
            Some(row) => Ok((present(row.first()), present(row.get(1)))),
            None => Ok((None, None)),
        }
    }

    pub fn set_default_data_path(&self, path: &str) -> Result<(), RelocateError> {
        self.write_instance_value("DefaultData", path)
    }

    pub fn set_default_log_path(&self, path: &str) -> Result<(), RelocateError> {
        self.write_instance_value("DefaultLog", path)
    }

    fn write_instance_value(&self, value_name: &str, value: &str) -> Result<(), RelocateError> {
        self.run(&format!(
            "EXEC master.dbo.xp_instance_regwrite N'HKEY_LOCAL_MACHINE', {}, {}, REG_SZ, {}",
            quote_literal(INSTANCE_REGISTRY_KEY),
            quote_literal(value_name),
            quote_literal(value)
        ))
        .map(drop)
    }
}

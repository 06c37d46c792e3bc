//! In-memory stand-ins for the engine, the service manager, the volume
//! table and the bulk copier, shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::bulk_copy::BulkCopier;
use crate::catalog::{FileKind, FileRecord};
use crate::context::{Collaborators, RunContext};
use crate::error::RelocateError;
use crate::job::{DatabaseTarget, ServiceSet};
use crate::query::{QueryExecutor, Row};
use crate::services::ServiceController;
use crate::volume::{DiskLocation, DriveLetter, Partition, VolumeManager};

/// Ordered record of side effects across several fakes
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Engine

#[derive(Debug, Clone)]
struct FakeDatabase {
    files: Vec<FileRecord>,
    attached: bool,
    multi_user: bool,
}

#[derive(Default)]
struct EngineState {
    databases: BTreeMap<String, FakeDatabase>,
    statements: Vec<String>,
    fail_on: Vec<String>,
    tempdb_pages: u64,
    default_data: Option<String>,
    default_log: Option<String>,
}

/// Understands exactly the statements `Catalog` issues
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

/// Every `N'...'` literal in `statement`, unescaped, in order
fn literals(statement: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = statement;
    while let Some(start) = rest.find("N'") {
        let mut chars = rest[start + 2..].char_indices().peekable();
        let mut value = String::new();
        let mut end = rest.len();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    chars.next();
                    value.push('\'');
                    continue;
                }
                end = start + 2 + i + 1;
                break;
            }
            value.push(c);
        }
        found.push(value);
        rest = &rest[end..];
    }
    found
}

/// The first `[...]` identifier in `statement`, unescaped
fn identifier(statement: &str) -> Option<String> {
    let start = statement.find('[')?;
    let mut chars = statement[start + 1..].chars().peekable();
    let mut name = String::new();
    while let Some(c) = chars.next() {
        if c == ']' {
            if chars.peek() == Some(&']') {
                chars.next();
                name.push(']');
                continue;
            }
            return Some(name);
        }
        name.push(c);
    }
    None
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&self, name: &str, files: Vec<FileRecord>) {
        self.state.lock().unwrap().databases.insert(
            name.to_owned(),
            FakeDatabase {
                files,
                attached: true,
                multi_user: true,
            },
        );
    }

    pub fn files_of(&self, name: &str) -> Vec<FileRecord> {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(name)
            .map(|db| db.files.clone())
            .unwrap_or_default()
    }

    pub fn is_attached(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(name)
            .is_some_and(|db| db.attached)
    }

    pub fn is_multi_user(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(name)
            .is_some_and(|db| db.multi_user)
    }

    /// Fail every statement containing `fragment`
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().unwrap().fail_on.push(fragment.to_owned());
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn set_tempdb_pages(&self, pages: u64) {
        self.state.lock().unwrap().tempdb_pages = pages;
    }

    pub fn set_default_paths(&self, data: Option<&str>, log: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.default_data = data.map(str::to_owned);
        state.default_log = log.map(str::to_owned);
    }

    fn failed(statement: &str, message: &str) -> RelocateError {
        RelocateError::statement_failed(statement, message)
    }

    fn attached_mut<'s>(
        state: &'s mut EngineState,
        statement: &str,
        name: &str,
    ) -> Result<&'s mut FakeDatabase, RelocateError> {
        state
            .databases
            .get_mut(name)
            .filter(|db| db.attached)
            .ok_or_else(|| Self::failed(statement, &format!("Database '{}' does not exist", name)))
    }

    fn attach(state: &mut EngineState, statement: &str) -> Result<(), RelocateError> {
        let name = identifier(statement).ok_or_else(|| Self::failed(statement, "no name"))?;
        let paths: Vec<PathBuf> = literals(statement).into_iter().map(PathBuf::from).collect();

        match state.databases.get_mut(&name) {
            Some(db) if db.attached => Err(Self::failed(statement, "database already exists")),
            Some(db) => {
                for path in &paths {
                    if !path.exists() {
                        return Err(Self::failed(
                            statement,
                            &format!("cannot open '{}'", path.display()),
                        ));
                    }
                }
                for file in db.files.iter_mut() {
                    let wanted = file_name_of(&file.physical_path);
                    if let Some(path) = paths.iter().find(|p| file_name_of(p) == wanted) {
                        file.physical_path = path.clone();
                    }
                }
                db.attached = true;
                db.multi_user = true;
                Ok(())
            }
            None => {
                let files = paths
                    .iter()
                    .map(|path| {
                        let stem = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let kind = match path.extension().and_then(|e| e.to_str()) {
                            Some("ldf") => FileKind::Log,
                            _ => FileKind::Data,
                        };
                        FileRecord::new(&stem, kind, path)
                    })
                    .collect();
                state.databases.insert(
                    name,
                    FakeDatabase {
                        files,
                        attached: true,
                        multi_user: true,
                    },
                );
                Ok(())
            }
        }
    }

    fn dispatch(state: &mut EngineState, statement: &str) -> Result<Vec<Row>, RelocateError> {
        if statement.starts_with("SELECT name, type_desc, physical_name FROM sys.master_files") {
            let name = literals(statement).into_iter().next().unwrap_or_default();
            let rows = state
                .databases
                .get(&name)
                .filter(|db| db.attached)
                .map(|db| {
                    db.files
                        .iter()
                        .map(|f| {
                            let type_desc = match f.kind {
                                FileKind::Data => "ROWS",
                                FileKind::Log => "LOG",
                            };
                            vec![
                                f.logical_name.clone(),
                                type_desc.to_owned(),
                                f.physical_path.to_string_lossy().into_owned(),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            return Ok(rows);
        }
        if statement.starts_with("SELECT name FROM sys.databases") {
            return Ok(state
                .databases
                .iter()
                .filter(|(_, db)| db.attached)
                .map(|(name, _)| vec![name.clone()])
                .collect());
        }
        if statement.starts_with("SELECT SUM(CAST(size AS bigint))") {
            return Ok(vec![vec![state.tempdb_pages.to_string()]]);
        }
        if statement.starts_with("SELECT CAST(SERVERPROPERTY(") {
            let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "NULL".to_owned());
            return Ok(vec![vec![show(&state.default_data), show(&state.default_log)]]);
        }
        if statement.starts_with("ALTER DATABASE tempdb MODIFY FILE") {
            let logical = identifier(statement).unwrap_or_default();
            let path = literals(statement).into_iter().next().unwrap_or_default();
            let tempdb = Self::attached_mut(state, statement, "tempdb")?;
            let file = tempdb
                .files
                .iter_mut()
                .find(|f| f.logical_name == logical)
                .ok_or_else(|| Self::failed(statement, "no such file"))?;
            file.physical_path = PathBuf::from(path);
            return Ok(Vec::new());
        }
        if statement.starts_with("ALTER DATABASE [") {
            let name = identifier(statement).unwrap_or_default();
            let db = Self::attached_mut(state, statement, &name)?;
            db.multi_user = statement.contains("SET MULTI_USER");
            return Ok(Vec::new());
        }
        if statement.starts_with("EXEC master.dbo.sp_detach_db") {
            let name = literals(statement).into_iter().next().unwrap_or_default();
            let db = Self::attached_mut(state, statement, &name)?;
            db.attached = false;
            return Ok(Vec::new());
        }
        if statement.starts_with("CREATE DATABASE [") && statement.ends_with("FOR ATTACH") {
            Self::attach(state, statement)?;
            return Ok(Vec::new());
        }
        if statement.starts_with("EXEC master.dbo.xp_instance_regwrite") {
            let args = literals(statement);
            match args.get(2).map(String::as_str) {
                Some("DefaultData") => state.default_data = args.get(3).cloned(),
                Some("DefaultLog") => state.default_log = args.get(3).cloned(),
                _ => return Err(Self::failed(statement, "unknown registry value")),
            }
            return Ok(Vec::new());
        }
        Err(Self::failed(statement, "statement not understood by the fake engine"))
    }
}

impl QueryExecutor for FakeEngine {
    fn execute(&self, statement: &str) -> Result<Vec<Row>, RelocateError> {
        let mut state = self.state.lock().unwrap();
        state.statements.push(statement.to_owned());
        if state.fail_on.iter().any(|f| statement.contains(f.as_str())) {
            return Err(Self::failed(statement, "injected failure"));
        }
        Self::dispatch(&mut state, statement)
    }
}

// ---------------------------------------------------------------------------
// Services

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Stop(String),
    Start(String),
}

#[derive(Default)]
struct ServicesState {
    running: HashMap<String, bool>,
    dependents: HashMap<String, Vec<String>>,
    events: Vec<ServiceEvent>,
    fail_stop: HashSet<String>,
    fail_start: HashSet<String>,
}

/// Installed services start out running; unknown names are absent
#[derive(Default)]
pub struct FakeServices {
    state: Mutex<ServicesState>,
    journal: Journal,
}

impl FakeServices {
    pub fn new(installed: &[&str]) -> Self {
        Self::with_journal(installed, Journal::default())
    }

    fn with_journal(installed: &[&str], journal: Journal) -> Self {
        let services = FakeServices {
            state: Mutex::new(ServicesState::default()),
            journal,
        };
        for name in installed {
            services.add(name);
        }
        services
    }

    pub fn add(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .running
            .insert(name.to_owned(), true);
    }

    /// Install `dependent` (running) so that stopping `service` stops it too
    pub fn add_dependent(&self, service: &str, dependent: &str) {
        let mut state = self.state.lock().unwrap();
        state.running.insert(dependent.to_owned(), true);
        state
            .dependents
            .entry(service.to_owned())
            .or_default()
            .push(dependent.to_owned());
    }

    pub fn events(&self) -> Vec<ServiceEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ServiceEvent::Start(n) if n == name))
            .count()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .running
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    pub fn fail_stop(&self, name: &str) {
        self.state.lock().unwrap().fail_stop.insert(name.to_owned());
    }

    pub fn fail_start(&self, name: &str) {
        self.state.lock().unwrap().fail_start.insert(name.to_owned());
    }
}

impl ServiceController for FakeServices {
    fn stop(&self, name: &str) -> Result<Vec<String>, RelocateError> {
        let mut state = self.state.lock().unwrap();
        if !state.running.get(name).copied().unwrap_or(false) {
            return Ok(Vec::new());
        }
        if state.fail_stop.contains(name) {
            return Err(RelocateError::Error(format!("Service '{}' did not stop", name)));
        }

        let mut stopped: Vec<String> = state
            .dependents
            .get(name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|d| state.running.get(d).copied().unwrap_or(false))
            .collect();
        stopped.push(name.to_owned());

        for service in &stopped {
            state.running.insert(service.clone(), false);
            state.events.push(ServiceEvent::Stop(service.clone()));
            self.journal.push(format!("stop {}", service));
        }
        Ok(stopped)
    }

    fn start(&self, name: &str) -> Result<(), RelocateError> {
        let mut state = self.state.lock().unwrap();
        if !state.running.contains_key(name) {
            return Ok(());
        }
        state.events.push(ServiceEvent::Start(name.to_owned()));
        self.journal.push(format!("start {}", name));
        if state.fail_start.contains(name) {
            return Err(RelocateError::Error(format!("Service '{}' did not start", name)));
        }
        state.running.insert(name.to_owned(), true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Volumes

struct VolumesState {
    letters: BTreeMap<char, u32>,
    free_space: HashMap<char, u64>,
    locations: HashMap<u32, String>,
    relabel_log: Vec<(char, char)>,
    fail_from: HashSet<char>,
    collisions: usize,
}

/// Letter -> disk number table that refuses to hand out a letter in use
pub struct FakeVolumes {
    state: Mutex<VolumesState>,
}

impl FakeVolumes {
    pub fn new(volumes: &[(char, u32)]) -> Self {
        FakeVolumes {
            state: Mutex::new(VolumesState {
                letters: volumes.iter().copied().collect(),
                free_space: HashMap::new(),
                locations: HashMap::new(),
                relabel_log: Vec::new(),
                fail_from: HashSet::new(),
                collisions: 0,
            }),
        }
    }

    pub fn disk_at(&self, letter: char) -> Option<u32> {
        self.state.lock().unwrap().letters.get(&letter).copied()
    }

    pub fn relabel_log(&self) -> Vec<(char, char)> {
        self.state.lock().unwrap().relabel_log.clone()
    }

    pub fn fail_relabel_from(&self, letter: char) {
        self.state.lock().unwrap().fail_from.insert(letter);
    }

    /// Relabels attempted onto a letter that was already assigned
    pub fn collisions(&self) -> usize {
        self.state.lock().unwrap().collisions
    }

    pub fn set_free_space(&self, letter: char, bytes: u64) {
        self.state.lock().unwrap().free_space.insert(letter, bytes);
    }

    pub fn set_location(&self, disk_number: u32, location: &str) {
        self.state
            .lock()
            .unwrap()
            .locations
            .insert(disk_number, location.to_owned());
    }
}

impl VolumeManager for FakeVolumes {
    fn resolve_partition(&self, letter: DriveLetter) -> Result<Option<Partition>, RelocateError> {
        Ok(self
            .disk_at(letter.as_char())
            .map(|disk_number| Partition { disk_number }))
    }

    fn resolve_disk(&self, disk_number: u32) -> Result<DiskLocation, RelocateError> {
        let state = self.state.lock().unwrap();
        if !state.letters.values().any(|n| *n == disk_number) {
            return Err(RelocateError::VolumeNotFound(format!("disk {}", disk_number)));
        }
        let location = state
            .locations
            .get(&disk_number)
            .cloned()
            .unwrap_or_else(|| format!("Bay {}", disk_number));
        Ok(DiskLocation {
            disk_number,
            location,
        })
    }

    fn relabel(&self, from: DriveLetter, to: DriveLetter) -> Result<(), RelocateError> {
        let mut state = self.state.lock().unwrap();
        let (from, to) = (from.as_char(), to.as_char());
        let relabel_failed = |message: &str| RelocateError::RelabelFailed {
            from: format!("{}:", from),
            to: format!("{}:", to),
            message: message.to_owned(),
        };

        if state.fail_from.contains(&from) {
            return Err(relabel_failed("injected failure"));
        }
        if state.letters.contains_key(&to) {
            state.collisions += 1;
            return Err(relabel_failed("letter in use"));
        }
        let disk = state
            .letters
            .remove(&from)
            .ok_or_else(|| RelocateError::VolumeNotFound(format!("{}:", from)))?;
        state.letters.insert(to, disk);
        state.relabel_log.push((from, to));
        Ok(())
    }

    fn free_space(&self, letter: DriveLetter) -> Result<u64, RelocateError> {
        let state = self.state.lock().unwrap();
        if !state.letters.contains_key(&letter.as_char()) {
            return Err(RelocateError::VolumeNotFound(letter.to_string()));
        }
        Ok(state
            .free_space
            .get(&letter.as_char())
            .copied()
            .unwrap_or(1 << 40))
    }
}

// ---------------------------------------------------------------------------
// Copier

#[derive(Default)]
struct CopierState {
    calls: Vec<(String, String)>,
    exit_codes: HashMap<String, Option<i32>>,
    delays: HashMap<String, u64>,
    panics: HashSet<String>,
}

/// Returns a scripted exit code per source root without copying anything
pub struct ScriptedCopier {
    default_code: Option<i32>,
    state: Mutex<CopierState>,
    journal: Journal,
}

impl ScriptedCopier {
    pub fn with_default(code: Option<i32>) -> Self {
        Self::with_journal(code, Journal::default())
    }

    fn with_journal(code: Option<i32>, journal: Journal) -> Self {
        ScriptedCopier {
            default_code: code,
            state: Mutex::new(CopierState::default()),
            journal,
        }
    }

    pub fn set_exit_code(&self, source_root: &str, code: Option<i32>) {
        self.state
            .lock()
            .unwrap()
            .exit_codes
            .insert(source_root.to_owned(), code);
    }

    pub fn set_delay_ms(&self, source_root: &str, millis: u64) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(source_root.to_owned(), millis);
    }

    /// Make the copy of `source_root` panic, as a crashed worker would
    pub fn panic_on(&self, source_root: &str) {
        self.state
            .lock()
            .unwrap()
            .panics
            .insert(source_root.to_owned());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl BulkCopier for ScriptedCopier {
    fn mirror(&self, source_dir: &Path, destination_dir: &Path) -> Result<Option<i32>, RelocateError> {
        let source = source_dir.to_string_lossy().into_owned();
        let destination = destination_dir.to_string_lossy().into_owned();
        let (code, delay, panics) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((source.clone(), destination.clone()));
            (
                state
                    .exit_codes
                    .get(&source)
                    .copied()
                    .unwrap_or(self.default_code),
                state.delays.get(&source).copied(),
                state.panics.contains(&source),
            )
        };
        // The lock is released first so the panic does not poison it
        if panics {
            panic!("copier crashed while mirroring {}", source);
        }
        if let Some(millis) = delay {
            thread::sleep(Duration::from_millis(millis));
        }
        self.journal.push(format!("copy {} -> {}", source, destination));
        Ok(code)
    }
}

// ---------------------------------------------------------------------------
// Fixtures

/// A scratch directory standing in for the disks
pub struct TestDisk {
    dir: TempDir,
}

impl TestDisk {
    pub fn new() -> Self {
        TestDisk {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Create a small file (and its parents) at `relative`
    pub fn create_file(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, relative.as_bytes()).expect("write file");
        path
    }

    /// Every user database, data under new/data, logs under new/log
    pub fn target(&self) -> DatabaseTarget {
        DatabaseTarget {
            data_dir: self.path("new/data"),
            log_dir: self.path("new/log"),
            names: Vec::new(),
            update_default_paths: false,
        }
    }
}

/// One of each fake, wired together, with ENGINE installed and running
pub struct TestRig {
    pub engine: Arc<FakeEngine>,
    pub volumes: Arc<FakeVolumes>,
    pub services: Arc<FakeServices>,
    pub copier: Arc<ScriptedCopier>,
    pub disk: TestDisk,
    journal: Journal,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_volumes(&[])
    }

    pub fn with_volumes(volumes: &[(char, u32)]) -> Self {
        let journal = Journal::default();
        TestRig {
            engine: Arc::new(FakeEngine::new()),
            volumes: Arc::new(FakeVolumes::new(volumes)),
            services: Arc::new(FakeServices::with_journal(&["ENGINE"], journal.clone())),
            copier: Arc::new(ScriptedCopier::with_journal(Some(1), journal.clone())),
            disk: TestDisk::new(),
            journal,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            query: self.engine.clone(),
            services: self.services.clone(),
            copier: self.copier.clone(),
            volumes: self.volumes.clone(),
        }
    }

    /// A fresh run whose ledger and reports land in the rig's scratch dir
    pub fn context(&self) -> RunContext {
        RunContext::new(
            "20260101_120000",
            self.collaborators(),
            self.disk.root(),
            &ServiceSet::new(["ENGINE"]),
        )
    }

    /// Service and copy calls across all fakes, in the order they happened
    pub fn journal(&self) -> Vec<String> {
        self.journal.entries()
    }
}

#[test]
fn test_literal_and_identifier_parsing() {
    assert_eq!(
        literals("EXEC x N'a''b', N'c'"),
        vec!["a'b".to_owned(), "c".to_owned()]
    );
    assert_eq!(identifier("ALTER DATABASE [odd]]name] SET"), Some("odd]name".to_owned()));
    assert!(DriveLetter::new('E').is_some());
}

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::volume::DriveLetter;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const ENV_PREFIX: &str = "SQLRELOCATE_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub sqlrelocate: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const SQLRELOCATE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            sqlrelocate: Self::SQLRELOCATE_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.sqlrelocate.clone();
        self.sqlrelocate = self.sqlrelocate.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.sqlrelocate.as_str()) {
            eprintln!(
                "Config error: sqlrelocate log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::SQLRELOCATE_LEVEL
            );
            self.sqlrelocate = Self::SQLRELOCATE_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PathsConfig {
    pub ledger_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl PathsConfig {
    fn default_in(data_dir: &Path) -> Self {
        PathsConfig {
            ledger_dir: data_dir.join("ledgers"),
            log_dir: data_dir.join("logs"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolsConfig {
    pub sqlcmd: String,
    pub robocopy: String,
    pub powershell: String,
    pub copy_retries: u32,
    pub copy_wait_secs: u32,
    pub copy_threads: u32,
}

impl ToolsConfig {
    // robocopy accepts /MT:1 through /MT:128
    const MAX_COPY_THREADS: u32 = 128;
    const COPY_THREADS: u32 = 8;

    fn default() -> Self {
        ToolsConfig {
            sqlcmd: "sqlcmd".to_owned(),
            robocopy: "robocopy".to_owned(),
            powershell: "powershell".to_owned(),
            copy_retries: 1,
            copy_wait_secs: 1,
            copy_threads: Self::COPY_THREADS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.copy_threads == 0 || self.copy_threads > Self::MAX_COPY_THREADS {
            eprintln!(
                "Config error: copy_threads of '{}' is invalid - using default of '{}'",
                self.copy_threads,
                Self::COPY_THREADS
            );
            self.copy_threads = Self::COPY_THREADS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VolumesConfig {
    pub default_temporary_volume: String,
}

impl VolumesConfig {
    const DEFAULT_TEMPORARY_VOLUME: &str = "T:";

    fn default() -> Self {
        VolumesConfig {
            default_temporary_volume: Self::DEFAULT_TEMPORARY_VOLUME.to_owned(),
        }
    }

    pub fn default_temporary_letter(&self) -> DriveLetter {
        // ensure_valid guarantees this parses; the fallback only guards
        // against a Config built by hand
        self.default_temporary_volume
            .parse()
            .unwrap_or(DriveLetter::DEFAULT_TEMPORARY)
    }

    fn ensure_valid(&mut self) {
        match self.default_temporary_volume.parse::<DriveLetter>() {
            Ok(letter) => self.default_temporary_volume = letter.to_string(),
            Err(_) => {
                eprintln!(
                    "Config error: default_temporary_volume of '{}' is invalid - using default of '{}'",
                    self.default_temporary_volume,
                    Self::DEFAULT_TEMPORARY_VOLUME
                );
                self.default_temporary_volume = Self::DEFAULT_TEMPORARY_VOLUME.to_owned();
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub tools: ToolsConfig,
    pub volumes: VolumesConfig,
}

impl Config {
    /// Defaults with all state directories rooted at `data_dir`
    pub fn default_in(data_dir: &Path) -> Self {
        Config {
            logging: LoggingConfig::default(),
            paths: PathsConfig::default_in(data_dir),
            tools: ToolsConfig::default(),
            volumes: VolumesConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data directory.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    /// Environment variables prefixed with `SQLRELOCATE_` override both
    /// (nested keys use `__`, e.g. `SQLRELOCATE_TOOLS__COPY_THREADS=16`).
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let data_dir = project_dirs.data_local_dir();
        let config_path = data_dir.join("config.toml");
        let default_config = Config::default_in(data_dir);

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        Self::from_sources(default_config, &config_path)
    }

    /// Merge defaults, the TOML file at `config_path` and the environment
    fn from_sources(default_config: Config, config_path: &Path) -> Self {
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    /// The process-wide configuration. Falls back to defaults rooted in the
    /// working directory if `CONFIG` was never initialized (tests, `check`).
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| Config::default_in(Path::new(".sqlrelocate")))
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.tools.ensure_valid();
        self.volumes.ensure_valid();
    }
}

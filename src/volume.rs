use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::RelocateError;
use crate::tools::run_tool;

/// A validated volume identifier (`A`..=`Z`), displayed as `E:`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriveLetter(char);

impl DriveLetter {
    pub const DEFAULT_TEMPORARY: DriveLetter = DriveLetter('T');

    pub fn new(letter: char) -> Option<Self> {
        let upper = letter.to_ascii_uppercase();
        upper.is_ascii_uppercase().then_some(DriveLetter(upper))
    }

    pub fn as_char(&self) -> char {
        self.0
    }

    /// Root directory of the volume, e.g. `E:\`
    pub fn root(&self) -> PathBuf {
        PathBuf::from(format!("{}:\\", self.0))
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

impl FromStr for DriveLetter {
    type Err = RelocateError;

    /// Accepts `E`, `E:`, `E:\` and `E:/`, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            || RelocateError::PartitionMissingOrConfigInvalid(format!("invalid volume '{}'", s));

        let text = s.trim();
        let text = text
            .strip_suffix('\\')
            .or_else(|| text.strip_suffix('/'))
            .unwrap_or(text);
        let text = text.strip_suffix(':').unwrap_or(text);

        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => DriveLetter::new(c).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for DriveLetter {
    type Error = RelocateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DriveLetter> for String {
    fn from(letter: DriveLetter) -> Self {
        letter.to_string()
    }
}

/// The partition currently holding a drive letter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub disk_number: u32,
}

/// Where a physical disk sits, as reported by the storage stack
/// (e.g. "PCIROOT(0)#PCI(0100)#SCSI(P00T01L00)")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLocation {
    pub disk_number: u32,
    pub location: String,
}

/// Drive-letter and disk queries against the OS volume manager
pub trait VolumeManager: Send + Sync {
    /// The partition holding `letter`, or None if no partition has it
    fn resolve_partition(&self, letter: DriveLetter) -> Result<Option<Partition>, RelocateError>;

    fn resolve_disk(&self, disk_number: u32) -> Result<DiskLocation, RelocateError>;

    /// Move the partition at `from` to the unused letter `to`
    fn relabel(&self, from: DriveLetter, to: DriveLetter) -> Result<(), RelocateError>;

    /// Bytes free on the volume at `letter`
    fn free_space(&self, letter: DriveLetter) -> Result<u64, RelocateError>;
}

/// `VolumeManager` backed by the Windows storage cmdlets
pub struct PowerShellVolumeManager {
    program: String,
}

impl PowerShellVolumeManager {
    pub fn new(program: &str) -> Self {
        PowerShellVolumeManager {
            program: program.to_owned(),
        }
    }

    /// Run `script`, returning trimmed stdout on success and the combined
    /// output as the error text otherwise
    fn run_script(&self, script: &str) -> Result<Result<String, String>, RelocateError> {
        debug!("PowerShell: {}", script);
        let output = run_tool(
            &self.program,
            ["-NoProfile", "-NonInteractive", "-Command", script],
        )?;
        if output.success() {
            Ok(Ok(output.stdout.trim().to_owned()))
        } else {
            Ok(Err(output.combined()))
        }
    }

    fn parse_number<T: FromStr>(script: &str, text: &str) -> Result<T, RelocateError> {
        text.parse().map_err(|_| {
            RelocateError::Error(format!(
                "Unexpected output '{}' from PowerShell command '{}'",
                text, script
            ))
        })
    }
}

impl VolumeManager for PowerShellVolumeManager {
    fn resolve_partition(&self, letter: DriveLetter) -> Result<Option<Partition>, RelocateError> {
        let script = format!(
            "Get-Partition -DriveLetter {} -ErrorAction SilentlyContinue | Select-Object -First 1 -ExpandProperty DiskNumber",
            letter.as_char()
        );
        match self.run_script(&script)? {
            Ok(text) if text.is_empty() => Ok(None),
            Ok(text) => Ok(Some(Partition {
                disk_number: Self::parse_number(&script, &text)?,
            })),
            Err(message) => Err(RelocateError::Error(format!(
                "Could not query partition for {}: {}",
                letter, message
            ))),
        }
    }

    fn resolve_disk(&self, disk_number: u32) -> Result<DiskLocation, RelocateError> {
        let script = format!("(Get-Disk -Number {} -ErrorAction Stop).Location", disk_number);
        match self.run_script(&script)? {
            Ok(location) => Ok(DiskLocation {
                disk_number,
                location,
            }),
            Err(message) => Err(RelocateError::Error(format!(
                "Could not query disk {}: {}",
                disk_number, message
            ))),
        }
    }

    fn relabel(&self, from: DriveLetter, to: DriveLetter) -> Result<(), RelocateError> {
        let script = format!(
            "Set-Partition -DriveLetter {} -NewDriveLetter {} -ErrorAction Stop",
            from.as_char(),
            to.as_char()
        );
        match self.run_script(&script)? {
            Ok(_) => Ok(()),
            Err(message) => Err(RelocateError::RelabelFailed {
                from: from.to_string(),
                to: to.to_string(),
                message,
            }),
        }
    }

    fn free_space(&self, letter: DriveLetter) -> Result<u64, RelocateError> {
        let script = format!(
            "(Get-Volume -DriveLetter {} -ErrorAction Stop).SizeRemaining",
            letter.as_char()
        );
        match self.run_script(&script)? {
            Ok(text) => Self::parse_number(&script, &text),
            Err(_) => Err(RelocateError::VolumeNotFound(letter.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_accepted_forms() {
        for text in ["E", "e", "E:", "e:", "E:\\", "E:/", " E: "] {
            let letter: DriveLetter = text.parse().unwrap();
            assert_eq!(letter.as_char(), 'E', "parsing {:?}", text);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in ["", ":", "EF", "EF:", "1:", "E::", "C:\\data"] {
            assert!(text.parse::<DriveLetter>().is_err(), "parsing {:?}", text);
        }
    }

    #[test]
    fn test_display_and_root() {
        let letter = DriveLetter::new('f').unwrap();
        assert_eq!(letter.to_string(), "F:");
        assert_eq!(letter.root(), PathBuf::from("F:\\"));
    }

    #[test]
    fn test_serde_as_string() {
        let letter = DriveLetter::new('E').unwrap();
        assert_eq!(serde_json::to_string(&letter).unwrap(), "\"E:\"");
        let back: DriveLetter = serde_json::from_str("\"e\"").unwrap();
        assert_eq!(back, letter);
        assert!(serde_json::from_str::<DriveLetter>("\"bad\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(c in proptest::char::range('A', 'Z')) {
            let letter = DriveLetter::new(c).unwrap();
            prop_assert_eq!(letter.to_string().parse::<DriveLetter>().unwrap(), letter);
        }
    }
}

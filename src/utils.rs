use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info};

pub struct Utils {}

impl Utils {
    /// Move one file, creating the destination directory as needed.
    ///
    /// Tries a rename first and falls back to copy-then-delete when the
    /// destination is on another volume. A file already at `to` is never
    /// overwritten; moving a file onto itself is a no-op.
    pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
        if from == to {
            debug!("'{}' is already in place", from.display());
            return Ok(());
        }

        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }

        if to.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("destination '{}' already exists", to.display()),
            ));
        }

        match fs::rename(from, to) {
            Ok(()) => {}
            Err(rename_err) => {
                debug!(
                    "Rename '{}' -> '{}' failed ({}); copying instead",
                    from.display(),
                    to.display(),
                    rename_err
                );
                if let Err(copy_err) = fs::copy(from, to) {
                    // Don't leave a partial copy behind
                    let _ = fs::remove_file(to);
                    return Err(copy_err);
                }
                fs::remove_file(from)?;
            }
        }

        info!("Moved '{}' -> '{}'", from.display(), to.display());
        Ok(())
    }

    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} {}", bytes, UNITS[0])
        } else {
            format!("{:.1} {}", value, UNITS[unit])
        }
    }
}

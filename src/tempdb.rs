use std::fs;

use log::info;

use crate::context::RunContext;
use crate::error::RelocateError;
use crate::job::TempDbTarget;
use crate::utils::Utils;

/// Redirect tempdb to `target`.
///
/// tempdb cannot be detached; each file is redeclared at the new location
/// and the engine creates it there on its next start. Nothing is issued
/// unless the destination can hold the current tempdb plus the margin.
pub fn relocate_tempdb(ctx: &RunContext, target: &TempDbTarget) -> Result<(), RelocateError> {
    let volumes = &ctx.collaborators().volumes;
    if volumes.resolve_partition(target.volume)?.is_none() {
        return Err(RelocateError::VolumeNotFound(target.volume.to_string()));
    }

    let catalog = ctx.catalog();
    let current = catalog.tempdb_size_bytes()?;
    let required = current.saturating_add(target.safety_margin_bytes);
    let available = volumes.free_space(target.volume)?;

    info!(
        "tempdb needs {} ({} current + {} margin); {} free on {}",
        Utils::format_bytes(required),
        Utils::format_bytes(current),
        Utils::format_bytes(target.safety_margin_bytes),
        Utils::format_bytes(available),
        target.volume
    );

    if required > available {
        return Err(RelocateError::InsufficientSpace {
            volume: target.volume.to_string(),
            required,
            available,
        });
    }

    let files = catalog.tempdb_files()?;
    if files.is_empty() {
        return Err(RelocateError::DatabaseNotFound("tempdb".to_owned()));
    }

    fs::create_dir_all(&target.directory)?;

    for file in &files {
        let new_path = file.relocated_to(&target.directory)?;
        info!(
            "tempdb file '{}': '{}' -> '{}' (effective at next start)",
            file.logical_name,
            file.physical_path.display(),
            new_path.display()
        );
        catalog.modify_tempdb_file(&file.logical_name, &new_path)?;
    }

    Ok(())
}

// Volume relocation for one old-disk -> new-disk pair:
//  1. Mirror the source root onto the destination root (exit >= 8 aborts)
//  2. Rotate letters through the temporary letter so no two volumes ever
//     hold the same letter:
//        source      -> temporary
//        destination -> source's letter
//        temporary   -> destination's letter
//  Afterwards the new disk answers to the old letter and the old disk holds
//  the new disk's former letter, ready to be pulled.
//
// Under the orchestrator the unit never touches services; the standalone
// variant wraps steps 1-2 in its own stop/start window.

use std::sync::Arc;

use log::{error, info, Level};
use logging_timer::timer;

use crate::bulk_copy::{mirror_checked, BulkCopier, CopyOutcome};
use crate::context::Collaborators;
use crate::error::RelocateError;
use crate::job::{ServiceSet, VolumePair};
use crate::ledger::RelabelRecord;
use crate::quiesce::ServiceGuard;
use crate::volume::VolumeManager;

/// What one unit did. Only produced once the unit has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRelocationResult {
    pub pair: VolumePair,
    pub succeeded: bool,
    pub error: Option<String>,
    pub copy_outcome: Option<CopyOutcome>,
    /// Reassignments actually performed, in order
    pub relabels: Vec<RelabelRecord>,
}

impl VolumeRelocationResult {
    pub fn failed(pair: VolumePair, error: String) -> Self {
        VolumeRelocationResult {
            pair,
            succeeded: false,
            error: Some(error),
            copy_outcome: None,
            relabels: Vec::new(),
        }
    }
}

/// The three reassignments, in the only order that never has two volumes
/// claiming one letter
pub fn rotation_plan(pair: &VolumePair) -> [RelabelRecord; 3] {
    [
        RelabelRecord {
            from: pair.source,
            to: pair.temporary,
        },
        RelabelRecord {
            from: pair.destination,
            to: pair.source,
        },
        RelabelRecord {
            from: pair.temporary,
            to: pair.destination,
        },
    ]
}

fn rotate(
    run_id: &str,
    pair: &VolumePair,
    volumes: &dyn VolumeManager,
    done: &mut Vec<RelabelRecord>,
) -> Result<(), RelocateError> {
    for step in rotation_plan(pair) {
        if volumes.resolve_partition(step.from)?.is_none() {
            return Err(RelocateError::VolumeNotFound(step.from.to_string()));
        }
        if volumes.resolve_partition(step.to)?.is_some() {
            return Err(RelocateError::RelabelFailed {
                from: step.from.to_string(),
                to: step.to.to_string(),
                message: format!("{} is already assigned", step.to),
            });
        }
        info!("[{}] Relabel {} -> {}", run_id, step.from, step.to);
        volumes.relabel(step.from, step.to)?;
        done.push(step);
    }
    Ok(())
}

/// Copy then rotate one pair. Never returns `Err`: the outcome, including
/// any failure, is in the result so sibling units are unaffected.
pub fn relocate_volume(
    run_id: &str,
    pair: VolumePair,
    copier: &dyn BulkCopier,
    volumes: &dyn VolumeManager,
) -> VolumeRelocationResult {
    let _tmr = timer!(Level::Info; "relocate_volume", "{} -> {}", pair.source, pair.destination);
    let mut result = VolumeRelocationResult {
        pair,
        succeeded: false,
        error: None,
        copy_outcome: None,
        relabels: Vec::new(),
    };

    info!(
        "[{}] Mirroring {} -> {}",
        run_id, pair.source, pair.destination
    );
    let copied = mirror_checked(copier, &pair.source.root(), &pair.destination.root());
    let outcome = match copied {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("[{}] {}", run_id, e);
            result.error = Some(e.to_string());
            return result;
        }
    };
    result.copy_outcome = Some(outcome);

    match rotate(run_id, &pair, volumes, &mut result.relabels) {
        Ok(()) => {
            info!(
                "[{}] {} now served by the new disk; old disk is at {}",
                run_id, pair.source, pair.destination
            );
            result.succeeded = true;
        }
        Err(e) => {
            error!(
                "[{}] Rotation for {} -> {} stopped after {} step(s): {}",
                run_id,
                pair.source,
                pair.destination,
                result.relabels.len(),
                e
            );
            result.error = Some(e.to_string());
        }
    }

    result
}

/// Standalone variant: owns its own services-stopped window around the copy
/// and rotation
pub fn relocate_volume_standalone(
    run_id: &str,
    pair: VolumePair,
    collaborators: &Collaborators,
    services: &ServiceSet,
) -> Result<VolumeRelocationResult, RelocateError> {
    let guard = ServiceGuard::acquire(Arc::clone(&collaborators.services), services)?;
    let result = relocate_volume(
        run_id,
        pair,
        collaborators.copier.as_ref(),
        collaborators.volumes.as_ref(),
    );
    guard.release();
    Ok(result)
}

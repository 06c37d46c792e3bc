use log::warn;

use crate::error::RelocateError;

/// Record of secondary failures from cleanup paths.
///
/// Cleanup (restoring MULTI_USER after a failed move, restarting services on
/// the way out) must never mask the primary failure, so its errors are
/// collected here and logged rather than returned as `Err`.
#[derive(Debug, Default)]
pub struct BestEffort {
    failures: Vec<String>,
}

impl BestEffort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `result`, recording (and logging) the error if there is one
    pub fn attempt<T>(&mut self, what: &str, result: Result<T, RelocateError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Best-effort step '{}' failed: {}", what, e);
                self.failures.push(format!("{}: {}", what, e));
                None
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_records_only_failures() {
        let mut best_effort = BestEffort::new();

        assert_eq!(best_effort.attempt("ok", Ok::<_, RelocateError>(5)), Some(5));
        assert!(best_effort.is_clean());

        let failed: Result<(), RelocateError> = Err(RelocateError::Error("boom".into()));
        assert_eq!(best_effort.attempt("restart ENGINE", failed), None);
        assert!(!best_effort.is_clean());
        assert_eq!(best_effort.failures(), ["restart ENGINE: Error: boom"]);
    }
}

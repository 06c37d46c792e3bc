use std::sync::Arc;

use log::{error, info};

use crate::best_effort::BestEffort;
use crate::error::RelocateError;
use crate::job::ServiceSet;
use crate::services::ServiceController;

/// Scoped "services stopped" window.
///
/// `acquire` stops every service in order and fails on the first service
/// that will not stop. Running dependents taken down with a service are
/// tracked too. From the moment `acquire` is entered, the guard owns the
/// restart: it runs exactly once, either through `release` or on drop,
/// including when `acquire` itself fails partway through. Restart runs in
/// reverse stop order, so dependents come back after what they depend on.
pub struct ServiceGuard {
    controller: Arc<dyn ServiceController>,
    services: ServiceSet,
    /// Actually stopped, in stop order
    stopped: Vec<String>,
    armed: bool,
}

impl ServiceGuard {
    pub fn acquire(
        controller: Arc<dyn ServiceController>,
        services: &ServiceSet,
    ) -> Result<Self, RelocateError> {
        let mut guard = ServiceGuard {
            controller,
            services: services.clone(),
            stopped: Vec::new(),
            armed: true,
        };

        for name in services.names() {
            info!("Stopping service '{}'", name);
            // On error the guard drops here and restarts everything
            let stopped = guard.controller.stop(name).map_err(|e| {
                error!("Could not stop service '{}': {}", name, e);
                e
            })?;
            guard.record_stopped(stopped);
        }

        info!("All {} service(s) stopped", guard.services.names().len());
        Ok(guard)
    }

    fn record_stopped(&mut self, names: Vec<String>) {
        for name in names {
            if !contains_name(&self.stopped, &name) {
                self.stopped.push(name);
            }
        }
    }

    /// Reverse stop order, then any configured service never seen stopping
    fn restart_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self.stopped.iter().rev().cloned().collect();
        for name in self.services.names() {
            if !contains_name(&order, name) {
                order.push(name.clone());
            }
        }
        order
    }

    /// Restart every service now, returning any start failures
    pub fn release(mut self) -> BestEffort {
        self.restart()
    }

    fn restart(&mut self) -> BestEffort {
        let mut outcome = BestEffort::new();
        if !self.armed {
            return outcome;
        }
        self.armed = false;

        let order = self.restart_order();
        for name in &order {
            info!("Starting service '{}'", name);
            outcome.attempt(&format!("start {}", name), self.controller.start(name));
        }

        if outcome.is_clean() {
            info!("All {} service(s) restarted", order.len());
        } else {
            error!(
                "{} service(s) failed to restart - start them manually",
                outcome.failures().len()
            );
        }
        outcome
    }
}

fn contains_name(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(name))
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        self.restart();
    }
}

use log::{info, warn};

use crate::error::RelocateError;
use crate::tools::run_tool;

/// `sc query` exit code for a service that is not installed
const SC_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// Start/stop lifecycle of named OS services.
///
/// Both operations succeed without doing anything when the service is not
/// installed, so a job can list optional components (agent, full-text
/// launcher) unconditionally.
pub trait ServiceController: Send + Sync {
    /// Returns every service this call stopped, running dependents first
    /// and `name` last. Empty when nothing was running.
    fn stop(&self, name: &str) -> Result<Vec<String>, RelocateError>;
    fn start(&self, name: &str) -> Result<(), RelocateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Absent,
    Stopped,
    Running,
    /// Pending or paused
    Transitioning,
}

/// `ServiceController` backed by `sc.exe` (state) and `net.exe` (control,
/// which waits for the transition to finish)
pub struct ScServiceController;

impl ScServiceController {
    pub fn new() -> Self {
        ScServiceController
    }

    pub fn query(&self, name: &str) -> Result<ServiceState, RelocateError> {
        let output = run_tool("sc", ["query", name])?;
        match output.exit_code {
            Some(0) => Ok(Self::parse_state(&output.stdout)),
            Some(SC_SERVICE_DOES_NOT_EXIST) => Ok(ServiceState::Absent),
            _ => Err(RelocateError::Error(format!(
                "Could not query service '{}': {}",
                name,
                output.combined()
            ))),
        }
    }

    /// Services that depend on `name`, from `sc enumdepend`
    pub fn dependents(&self, name: &str) -> Result<Vec<String>, RelocateError> {
        let output = run_tool("sc", ["enumdepend", name])?;
        match output.exit_code {
            Some(0) => Ok(Self::parse_dependents(&output.stdout)),
            Some(SC_SERVICE_DOES_NOT_EXIST) => Ok(Vec::new()),
            _ => Err(RelocateError::Error(format!(
                "Could not list dependents of service '{}': {}",
                name,
                output.combined()
            ))),
        }
    }

    fn parse_dependents(stdout: &str) -> Vec<String> {
        stdout
            .lines()
            .filter_map(|line| line.trim_start().strip_prefix("SERVICE_NAME:"))
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .collect()
    }

    /// Pull the state out of the `STATE : 4  RUNNING` line
    fn parse_state(stdout: &str) -> ServiceState {
        let state_line = stdout
            .lines()
            .find(|line| line.trim_start().starts_with("STATE"));
        match state_line {
            Some(line) if line.contains("RUNNING") => ServiceState::Running,
            Some(line) if line.contains("STOPPED") && !line.contains("PENDING") => {
                ServiceState::Stopped
            }
            _ => ServiceState::Transitioning,
        }
    }

    fn control(&self, verb: &str, name: &str) -> Result<(), RelocateError> {
        // /y answers the "stop dependent services too?" prompt
        let mut args = vec![verb, name];
        if verb == "stop" {
            args.push("/y");
        }
        let output = run_tool("net", args)?;
        if output.success() {
            Ok(())
        } else {
            Err(RelocateError::Error(format!(
                "net {} {} failed: {}",
                verb,
                name,
                output.combined()
            )))
        }
    }
}

impl Default for ScServiceController {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceController for ScServiceController {
    fn stop(&self, name: &str) -> Result<Vec<String>, RelocateError> {
        match self.query(name)? {
            ServiceState::Absent => {
                info!("Service '{}' is not installed - nothing to stop", name);
                Ok(Vec::new())
            }
            ServiceState::Stopped => {
                info!("Service '{}' is already stopped", name);
                Ok(Vec::new())
            }
            _ => {
                // net stop /y takes these down too, so they must come back
                let mut stopped = Vec::new();
                for dependent in self.dependents(name)? {
                    if self.query(&dependent)? == ServiceState::Running {
                        warn!(
                            "Service '{}' depends on '{}' and will be stopped and restarted with it",
                            dependent, name
                        );
                        stopped.push(dependent);
                    }
                }

                info!("Stopping service '{}'", name);
                self.control("stop", name)?;
                stopped.push(name.to_owned());
                match self.query(name)? {
                    ServiceState::Stopped | ServiceState::Absent => Ok(stopped),
                    state => Err(RelocateError::Error(format!(
                        "Service '{}' did not stop (state {:?})",
                        name, state
                    ))),
                }
            }
        }
    }

    fn start(&self, name: &str) -> Result<(), RelocateError> {
        match self.query(name)? {
            ServiceState::Absent => {
                info!("Service '{}' is not installed - nothing to start", name);
                Ok(())
            }
            ServiceState::Running => {
                info!("Service '{}' is already running", name);
                Ok(())
            }
            state => {
                if state == ServiceState::Transitioning {
                    warn!("Service '{}' is mid-transition; issuing start anyway", name);
                }
                info!("Starting service '{}'", name);
                self.control("start", name)
            }
        }
    }
}

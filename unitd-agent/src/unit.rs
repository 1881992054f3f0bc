//! The unit data model: one declared systemd unit, its validation rules and
//! derived predicates. Pure data, no I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{AgentError, Result};
use crate::systemd::UnitStatus;

pub const SERVICE_SUFFIX: &str = ".service";
pub const TIMER_SUFFIX: &str = ".timer";

/// What a persistent unit should be doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredAction {
    Start,
    Stop,
}

/// One declared systemd unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Unit name, including its `.service`/`.timer` suffix
    pub name: String,
    /// Desired active state; meaningful only for persistent services
    #[serde(default)]
    pub on: bool,
    /// One-shot unit that must never be left continuously active
    #[serde(default)]
    pub job: bool,
}

impl Unit {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AgentError::EmptyUnitName);
        }

        if self.job && !self.name.ends_with(SERVICE_SUFFIX) {
            return Err(AgentError::JobIsNotService {
                name: self.name.clone(),
            });
        }

        if self.job && self.on {
            return Err(AgentError::JobIsFlaggedOn {
                name: self.name.clone(),
            });
        }

        Ok(())
    }

    /// False exactly for job-flagged services; plain services and timers are
    /// expected to be continuously running or stopped per their flag.
    pub fn is_persistent_service(&self) -> bool {
        !(self.name.ends_with(SERVICE_SUFFIX) && self.job)
    }

    pub fn desired_action(&self) -> Option<DesiredAction> {
        if !self.is_persistent_service() {
            return None;
        }

        if self.on {
            Some(DesiredAction::Start)
        } else {
            Some(DesiredAction::Stop)
        }
    }
}

/// The full declared configuration: unit name -> unit.
pub type DesiredState = HashMap<String, Unit>;

/// Units absent from desired state count as persistent: an unknown unit file
/// that is running keeps getting restarted on content updates.
pub fn is_persistent_service(name: &str, units: &DesiredState) -> bool {
    units
        .get(name)
        .map(Unit::is_persistent_service)
        .unwrap_or(true)
}

/// Whether the init system currently considers the named unit active.
pub fn is_running(name: &str, status: &HashMap<String, UnitStatus>) -> bool {
    status
        .get(name)
        .map(|s| s.active_state != "inactive" && s.active_state != "deactivating")
        .unwrap_or(false)
}

/// Whether a filename is one of the two unit-file kinds the agent manages.
pub fn has_supported_extension(name: &str) -> bool {
    name.ends_with(SERVICE_SUFFIX) || name.ends_with(TIMER_SUFFIX)
}

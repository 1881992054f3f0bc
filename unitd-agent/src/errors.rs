use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    // Contract errors: caller-supplied data broke a validation rule.
    // Resending the same diff will fail the same way.
    #[error("Unit name was empty")]
    EmptyUnitName,

    #[error("Unit {name} of type other than .service was flagged as a job")]
    JobIsNotService { name: String },

    #[error("Job {name} was flagged as on")]
    JobIsFlaggedOn { name: String },

    #[error("Job flag was changed for unit {name}")]
    JobFlagChanged { name: String },

    #[error(transparent)]
    Assembly(#[from] unitd_protocol::protocol::AssemblyError),

    // Internal errors: the host failed to apply a well-formed diff, or the
    // process failed to come up.
    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Units manifest '{path}' is corrupt: {source}")]
    ManifestCorrupt {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to decode units manifest from diff: {0}")]
    ManifestDecode(#[source] serde_yaml::Error),

    #[error("Failed to encode units manifest: {0}")]
    ManifestEncode(#[source] serde_yaml::Error),

    #[error("Failed to write '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    FileRemove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("systemd {operation} failed for {unit}: {message}")]
    Systemd {
        operation: &'static str,
        unit: String,
        message: String,
    },

    #[error("systemd daemon-reload failed: {0}")]
    DaemonReload(String),

    #[error("Failed to query unit status: {0}")]
    ListUnits(String),
}

impl AgentError {
    /// Whether this failure was caused by the pushed data violating the
    /// diff/unit contract (as opposed to the host failing to apply it).
    /// Contract errors map to the "invalid argument" protocol category.
    pub fn is_contract_error(&self) -> bool {
        matches!(
            self,
            AgentError::EmptyUnitName
                | AgentError::JobIsNotService { .. }
                | AgentError::JobIsFlaggedOn { .. }
                | AgentError::JobFlagChanged { .. }
                | AgentError::Assembly(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_errors_are_classified_as_such() {
        assert!(AgentError::EmptyUnitName.is_contract_error());
        assert!(AgentError::JobIsFlaggedOn { name: "x.service".into() }.is_contract_error());
        assert!(AgentError::JobIsNotService { name: "x.timer".into() }.is_contract_error());
        assert!(AgentError::JobFlagChanged { name: "x.service".into() }.is_contract_error());
    }

    #[test]
    fn operational_errors_are_internal() {
        assert!(!AgentError::DaemonReload("dbus timeout".into()).is_contract_error());
        assert!(!AgentError::ManifestDecode(
            serde_yaml::from_str::<crate::unit::DesiredState>("[1,2")
                .unwrap_err()
        )
        .is_contract_error());
    }
}

//! Init-system collaborator.
//!
//! The engine depends only on this capability surface; [`Systemctl`] is the
//! production implementation and shells out to `systemctl`, whose start/
//! stop/restart calls block until systemd reports job completion, which is
//! the completion signal the reconciliation ordering relies on.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{AgentError, Result};
use crate::unit::has_supported_extension;

/// Runtime status snapshot entry for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub active_state: String,
}

impl UnitStatus {
    pub fn new(active_state: impl Into<String>) -> Self {
        Self {
            active_state: active_state.into(),
        }
    }
}

/// Capability surface of the init system. Each mutating call returns once
/// the init system has confirmed completion (or failure) of the operation.
#[async_trait]
pub trait InitSystem: Send + Sync {
    /// Snapshot of active-state per unit, filtered to services and timers.
    async fn list_units(&self) -> Result<HashMap<String, UnitStatus>>;

    /// Reload the init system's unit-file cache.
    async fn daemon_reload(&self) -> Result<()>;

    async fn start_unit(&self, name: &str) -> Result<()>;
    async fn stop_unit(&self, name: &str) -> Result<()>;
    async fn restart_unit(&self, name: &str) -> Result<()>;
    async fn enable_unit(&self, name: &str) -> Result<()>;
    async fn disable_unit(&self, name: &str) -> Result<()>;
}

/// Production [`InitSystem`] backed by the `systemctl` binary.
#[derive(Debug, Default)]
pub struct Systemctl;

impl Systemctl {
    async fn run(&self, operation: &'static str, unit: &str) -> Result<()> {
        debug!("systemctl {} {}", operation, unit);
        let output = Command::new("systemctl")
            .arg(operation)
            .arg(unit)
            .output()
            .await
            .map_err(|e| AgentError::Systemd {
                operation,
                unit: unit.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(AgentError::Systemd {
                operation,
                unit: unit.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InitSystem for Systemctl {
    async fn list_units(&self) -> Result<HashMap<String, UnitStatus>> {
        let output = Command::new("systemctl")
            .args([
                "list-units",
                "--type=service",
                "--type=timer",
                "--all",
                "--plain",
                "--no-pager",
                "--no-legend",
            ])
            .output()
            .await
            .map_err(|e| AgentError::ListUnits(e.to_string()))?;

        if !output.status.success() {
            return Err(AgentError::ListUnits(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(parse_list_units(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn daemon_reload(&self) -> Result<()> {
        debug!("systemctl daemon-reload");
        let output = Command::new("systemctl")
            .arg("daemon-reload")
            .output()
            .await
            .map_err(|e| AgentError::DaemonReload(e.to_string()))?;

        if !output.status.success() {
            return Err(AgentError::DaemonReload(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn start_unit(&self, name: &str) -> Result<()> {
        self.run("start", name).await
    }

    async fn stop_unit(&self, name: &str) -> Result<()> {
        self.run("stop", name).await
    }

    async fn restart_unit(&self, name: &str) -> Result<()> {
        self.run("restart", name).await
    }

    async fn enable_unit(&self, name: &str) -> Result<()> {
        self.run("enable", name).await
    }

    async fn disable_unit(&self, name: &str) -> Result<()> {
        self.run("disable", name).await
    }
}

/// Parse `systemctl list-units --plain --no-legend` output.
/// Line format: `unit load active sub description...`
fn parse_list_units(stdout: &str) -> HashMap<String, UnitStatus> {
    let mut result = HashMap::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(name), Some(_load), Some(active)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if has_supported_extension(name) {
            result.insert(name.to_string(), UnitStatus::new(active));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_units_keeps_services_and_timers() {
        let out = "\
web.service        loaded active   running Web frontend
backup.timer       loaded active   waiting Nightly backup
dev-sda1.device    loaded active   plugged /dev/sda1
broken.service     loaded inactive dead    Broken thing
";
        let parsed = parse_list_units(out);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["web.service"].active_state, "active");
        assert_eq!(parsed["backup.timer"].active_state, "active");
        assert_eq!(parsed["broken.service"].active_state, "inactive");
        assert!(!parsed.contains_key("dev-sda1.device"));
    }

    #[test]
    fn parse_list_units_skips_short_lines() {
        let parsed = parse_list_units("odd.service loaded\n\n");
        assert!(parsed.is_empty());
    }
}

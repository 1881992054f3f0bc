//! The reconciliation engine.
//!
//! One push = one pass through a fixed pipeline: extract the manifest entry,
//! write inserted files, write updated files, converge desired-state flags,
//! persist the manifest, apply deletions. The order is a correctness
//! requirement: unit files must be on disk and loaded before flags are
//! converged, and the manifest is persisted only after a fully-applied flag
//! pass so a crash can only leave the previous converged state on disk.
//!
//! Partial convergence is terminal: entries already converged when a later
//! entry fails are kept, not rolled back: they match live reality.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use unitd_protocol::protocol::KeyDiff;

use crate::errors::{AgentError, Result};
use crate::extract::extract_manifest;
use crate::store::UnitStore;
use crate::systemd::{InitSystem, UnitStatus};
use crate::unit::{
    has_supported_extension, is_persistent_service, is_running, DesiredAction, DesiredState, Unit,
};

/// Where systemd looks for administrator-managed unit files.
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// A single desired-state change, classified while diffing old against new.
/// `old` absent means insert, `new` absent means delete, both present means
/// update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitTransition {
    Insert { new: Unit },
    Update { old: Unit, new: Unit },
    Delete { old: Unit },
}

impl UnitTransition {
    fn unit_name(&self) -> &str {
        match self {
            UnitTransition::Insert { new } | UnitTransition::Update { new, .. } => &new.name,
            UnitTransition::Delete { old } => &old.name,
        }
    }

    /// What the init system should be told, before consulting runtime state.
    /// A deleted persistent unit must be stopped; a deleted job needs
    /// nothing.
    fn desired_action(&self) -> Option<DesiredAction> {
        match self {
            UnitTransition::Insert { new } | UnitTransition::Update { new, .. } => {
                new.desired_action()
            }
            UnitTransition::Delete { old } => old
                .is_persistent_service()
                .then_some(DesiredAction::Stop),
        }
    }
}

enum FileOp {
    Insert,
    Update,
}

pub struct Reconciler {
    store: UnitStore,
    unit_dir: PathBuf,
    init: Arc<dyn InitSystem>,
}

impl Reconciler {
    pub fn new(store: UnitStore, unit_dir: PathBuf, init: Arc<dyn InitSystem>) -> Self {
        Self {
            store,
            unit_dir,
            init,
        }
    }

    pub fn store(&self) -> &UnitStore {
        &self.store
    }

    /// Apply one key diff. Steps run in fixed order; the first failure
    /// aborts the remainder of the pass and is returned to the caller.
    pub async fn apply(&mut self, mut diff: KeyDiff) -> Result<()> {
        let new_desired = extract_manifest(&mut diff)?;

        self.write_unit_files(&diff.inserts, FileOp::Insert).await?;
        self.write_unit_files(&diff.updates, FileOp::Update).await?;

        if let Some(new_desired) = new_desired {
            self.converge_desired_state(new_desired).await?;
            self.store.persist()?;
        }

        self.delete_unit_files(&diff.deletions).await
    }

    /// Write a batch of unit files (insert and update are symmetric: the
    /// on-disk truth decides which one actually happens). Each write is
    /// followed by a daemon reload, and a running persistent service picks
    /// up its new file through a restart.
    async fn write_unit_files(
        &self,
        files: &HashMap<String, String>,
        op: FileOp,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let status = self.init.list_units().await?;

        for (name, content) in files {
            if !has_supported_extension(name) {
                warn!("Unit file {} has unsupported extension. Skipping it.", name);
                continue;
            }

            let path = self.unit_dir.join(name);
            let exists = path.exists();
            match op {
                FileOp::Insert if exists => {
                    warn!("Insert: unit file {} exists. Will update it instead.", name);
                }
                FileOp::Update if !exists => {
                    warn!("Update: unit file {} does not exist. Will create it instead.", name);
                }
                _ => {}
            }

            if exists {
                info!("Updating unit file {}.", name);
            } else {
                info!("Creating unit file {}.", name);
            }
            write_unit_file(&path, content)?;

            self.init.daemon_reload().await?;

            // Classification comes from the old desired state: the manifest
            // pass has not run yet at this point in the pipeline
            if is_persistent_service(name, self.store.units()) && is_running(name, &status) {
                info!("Restarting service {}.", name);
                self.init.restart_unit(name).await?;
            }
        }

        Ok(())
    }

    /// Converge desired-state flags against a pushed manifest.
    ///
    /// All transitions are validated before any init-system call is made, so
    /// a contract error never leaves the pass half-applied. Init-system
    /// failures mid-walk do: entries converged before the failure stay
    /// converged, in memory and in reality.
    async fn converge_desired_state(&mut self, new_desired: DesiredState) -> Result<()> {
        validate_desired_change(self.store.units(), &new_desired)?;

        let transitions = plan_transitions(self.store.units(), &new_desired);
        if transitions.is_empty() {
            return Ok(());
        }

        let status = self.init.list_units().await?;

        for transition in transitions {
            self.converge(&transition, &status).await?;
            match transition {
                UnitTransition::Insert { new } | UnitTransition::Update { new, .. } => {
                    self.store.units_mut().insert(new.name.clone(), new);
                }
                UnitTransition::Delete { old } => {
                    self.store.units_mut().remove(&old.name);
                }
            }
        }

        Ok(())
    }

    /// Issue the minimal init-system calls for one transition, judged
    /// against the runtime snapshot. Start and stop block until systemd
    /// reports the job complete.
    async fn converge(
        &self,
        transition: &UnitTransition,
        status: &HashMap<String, UnitStatus>,
    ) -> Result<()> {
        let name = transition.unit_name();

        match transition.desired_action() {
            Some(DesiredAction::Start) if !is_running(name, status) => {
                info!("Starting and enabling service {}.", name);
                self.init.enable_unit(name).await?;
                self.init.start_unit(name).await?;
            }
            Some(DesiredAction::Stop) if is_running(name, status) => {
                info!("Stopping and disabling service {}.", name);
                self.init.stop_unit(name).await?;
                self.init.disable_unit(name).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Remove a batch of unit files, stopping whatever is still running
    /// first. A name with no file behind it is logged and skipped.
    async fn delete_unit_files(&self, deletions: &[String]) -> Result<()> {
        if deletions.is_empty() {
            return Ok(());
        }

        let status = self.init.list_units().await?;

        for name in deletions {
            let path = self.unit_dir.join(name);
            if !path.exists() {
                warn!("Delete: unit file {} not found. Skipping deletion.", name);
                continue;
            }

            if is_running(name, &status) {
                info!("Stopping and disabling service {}.", name);
                self.init.stop_unit(name).await?;
                self.init.disable_unit(name).await?;
            }

            info!("Removing unit file {}.", name);
            std::fs::remove_file(&path).map_err(|e| AgentError::FileRemove {
                path: path.clone(),
                source: e,
            })?;

            self.init.daemon_reload().await?;
        }

        Ok(())
    }
}

/// Contract checks for a desired-state change, run before anything is
/// touched: every new unit must validate, and no existing unit may cross
/// the persistent/job boundary (start/stop semantics are undefined across
/// it, so the transition is rejected rather than guessed at).
fn validate_desired_change(old: &DesiredState, new: &DesiredState) -> Result<()> {
    let mut names: Vec<&String> = new.keys().collect();
    names.sort();

    for name in names {
        let unit = &new[name];
        unit.validate()?;

        if let Some(existing) = old.get(name) {
            if existing.is_persistent_service() != unit.is_persistent_service() {
                return Err(AgentError::JobFlagChanged {
                    name: unit.name.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Diff old against new desired state into explicit transitions:
/// updates and deletes first (old-side walk), then inserts, each side in
/// name order. Unchanged entries produce an `Update` whose converge is a
/// no-op against runtime state.
fn plan_transitions(old: &DesiredState, new: &DesiredState) -> Vec<UnitTransition> {
    let mut transitions = Vec::new();

    let mut old_names: Vec<&String> = old.keys().collect();
    old_names.sort();
    for name in old_names {
        let old_unit = old[name].clone();
        match new.get(name) {
            Some(new_unit) => transitions.push(UnitTransition::Update {
                old: old_unit,
                new: new_unit.clone(),
            }),
            None => transitions.push(UnitTransition::Delete { old: old_unit }),
        }
    }

    let mut new_names: Vec<&String> = new.keys().collect();
    new_names.sort();
    for name in new_names {
        if !old.contains_key(name) {
            transitions.push(UnitTransition::Insert {
                new: new[name].clone(),
            });
        }
    }

    transitions
}

fn write_unit_file(path: &std::path::Path, content: &str) -> Result<()> {
    let write_err = |e: std::io::Error| AgentError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    };

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o640)
            .open(path)
            .map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
    }
    #[cfg(not(unix))]
    std::fs::write(path, content).map_err(write_err)?;

    Ok(())
}

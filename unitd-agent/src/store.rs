//! On-disk desired-state store.
//!
//! The manifest is a single YAML file mapping unit name -> unit. It is read
//! once at startup (created empty if absent, so a fresh host always has one
//! on disk) and rewritten synchronously after each successful reconciliation
//! pass. The write is atomic (temp file + rename) so a crash mid-pass leaves
//! the manifest describing the previous converged state, which re-converges
//! on the next push rather than drifting silently.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{AgentError, Result};
use crate::unit::DesiredState;

pub struct UnitStore {
    path: PathBuf,
    units: DesiredState,
}

impl UnitStore {
    /// Load the manifest, creating an empty one if the file does not exist.
    /// The store is built by this constructor, so a "second load" cannot
    /// happen by construction.
    pub fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            info!("Units manifest {:?} not found. Creating it.", path);
            let store = Self {
                path,
                units: DesiredState::new(),
            };
            store.persist()?;
            return Ok(store);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| AgentError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let units: DesiredState =
            serde_yaml::from_str(&content).map_err(|e| AgentError::ManifestCorrupt {
                path: path.clone(),
                source: e,
            })?;

        debug!("Loaded {} unit(s) from manifest {:?}", units.len(), path);
        Ok(Self { path, units })
    }

    pub fn units(&self) -> &DesiredState {
        &self.units
    }

    pub fn units_mut(&mut self) -> &mut DesiredState {
        &mut self.units
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the full mapping and write it to the manifest path,
    /// creating parent directories as needed. Call only once the in-memory
    /// mapping reflects a fully-applied reconciliation pass.
    pub fn persist(&self) -> Result<()> {
        let content =
            serde_yaml::to_string(&self.units).map_err(AgentError::ManifestEncode)?;
        self.write_secure_file(content.as_bytes())?;
        debug!("Persisted {} unit(s) to manifest {:?}", self.units.len(), self.path);
        Ok(())
    }

    /// Write the manifest atomically with owner-only permissions.
    fn write_secure_file(&self, content: &[u8]) -> Result<()> {
        let write_err = |e: std::io::Error| AgentError::FileWrite {
            path: self.path.clone(),
            source: e,
        };

        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = parent {
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)
                    .map_err(write_err)?;
            }
            #[cfg(not(unix))]
            std::fs::create_dir_all(dir).map_err(write_err)?;
        }

        let dir = parent.unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(write_err)?;
        }

        tmp.write_all(content).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Unit;
    use tempfile::TempDir;

    fn unit(name: &str, on: bool, job: bool) -> Unit {
        Unit {
            name: name.to_string(),
            on,
            job,
        }
    }

    #[test]
    fn load_creates_empty_manifest_when_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/units.yml");

        let store = UnitStore::load(path.clone()).unwrap();
        assert!(store.units().is_empty());
        // A fresh host always ends up with a manifest on disk
        assert!(path.exists());
    }

    #[test]
    fn persist_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("units.yml");

        let mut store = UnitStore::load(path.clone()).unwrap();
        store
            .units_mut()
            .insert("web.service".to_string(), unit("web.service", true, false));
        store
            .units_mut()
            .insert("backup.timer".to_string(), unit("backup.timer", false, false));
        store.persist().unwrap();

        let reloaded = UnitStore::load(path).unwrap();
        assert_eq!(reloaded.units(), store.units());
    }

    #[test]
    fn load_rejects_corrupt_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("units.yml");
        std::fs::write(&path, "{not yaml: [").unwrap();

        assert!(matches!(
            UnitStore::load(path),
            Err(AgentError::ManifestCorrupt { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn manifest_is_owner_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("units.yml");
        UnitStore::load(path.clone()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

//! Manifest extraction: the reserved `units.yml` entry rides inside the
//! same key diff as the generic unit files and must be pulled out before
//! the generic passes run.

use unitd_protocol::protocol::KeyDiff;

use crate::errors::{AgentError, Result};
use crate::unit::DesiredState;

/// Reserved filename carrying the serialized desired state.
pub const MANIFEST_FILE_NAME: &str = "units.yml";

/// Isolate the manifest entry of `diff`, if any.
///
/// Returns the candidate new desired state (`None` when no diff category
/// references the reserved name) and scrubs the reserved name from all
/// three categories so downstream file passes never see it. An insert or
/// update carries serialized desired state; a deletion means the desired
/// state becomes empty. When several categories reference the reserved name
/// the first match wins, in insert, update, deletion order.
pub fn extract_manifest(diff: &mut KeyDiff) -> Result<Option<DesiredState>> {
    let inserted = diff.inserts.remove(MANIFEST_FILE_NAME);
    let updated = diff.updates.remove(MANIFEST_FILE_NAME);
    let deleted = diff.deletions.iter().any(|d| d == MANIFEST_FILE_NAME);
    diff.deletions.retain(|d| d != MANIFEST_FILE_NAME);

    if let Some(content) = inserted.or(updated) {
        let units = serde_yaml::from_str(&content).map_err(AgentError::ManifestDecode)?;
        return Ok(Some(units));
    }

    if deleted {
        return Ok(Some(DesiredState::new()));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn diff_with_insert(name: &str, content: &str) -> KeyDiff {
        KeyDiff {
            inserts: HashMap::from([(name.to_string(), content.to_string())]),
            ..Default::default()
        }
    }

    const MANIFEST: &str = "\
web.service:
  name: web.service
  on: true
cleanup.service:
  name: cleanup.service
  job: true
";

    #[test]
    fn absent_manifest_means_no_change() {
        let mut diff = diff_with_insert("foo.service", "[Unit]");
        let extracted = extract_manifest(&mut diff).unwrap();
        assert!(extracted.is_none());
        assert!(diff.inserts.contains_key("foo.service"));
    }

    #[test]
    fn insert_carries_new_desired_state() {
        let mut diff = diff_with_insert(MANIFEST_FILE_NAME, MANIFEST);
        let units = extract_manifest(&mut diff).unwrap().unwrap();

        assert_eq!(units.len(), 2);
        assert!(units["web.service"].on);
        assert!(units["cleanup.service"].job);
        // The reserved name never reaches the generic insert pass
        assert!(diff.inserts.is_empty());
    }

    #[test]
    fn update_carries_new_desired_state() {
        let mut diff = KeyDiff {
            updates: HashMap::from([(MANIFEST_FILE_NAME.to_string(), MANIFEST.to_string())]),
            ..Default::default()
        };
        let units = extract_manifest(&mut diff).unwrap().unwrap();
        assert_eq!(units.len(), 2);
        assert!(diff.updates.is_empty());
    }

    #[test]
    fn deletion_means_empty_desired_state() {
        let mut diff = KeyDiff {
            deletions: vec!["other.service".to_string(), MANIFEST_FILE_NAME.to_string()],
            ..Default::default()
        };
        let units = extract_manifest(&mut diff).unwrap().unwrap();
        assert!(units.is_empty());
        assert_eq!(diff.deletions, vec!["other.service".to_string()]);
    }

    #[test]
    fn undecodable_manifest_is_an_internal_error() {
        let mut diff = diff_with_insert(MANIFEST_FILE_NAME, "{broken: [");
        let err = extract_manifest(&mut diff).unwrap_err();
        assert!(matches!(err, AgentError::ManifestDecode(_)));
        assert!(!err.is_contract_error());
    }
}

//! Persisted state - what was actually applied on previous runs

use crate::applier::{ApplyOutcome, ApplyReport};
use crate::error::{Error, Result};
use crate::spec::{Attributes, ComponentId, ResourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Current version of the state document
pub const STATE_VERSION: u32 = 1;

// ============================================================================
// State Structures
// ============================================================================

/// Last applied state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: String,
    pub name: String,
    pub provider: String,
    /// Hash of the resolved inputs and provider binding that were applied
    pub spec_hash: String,
    /// Resolved inputs that were applied
    #[serde(default)]
    pub inputs: Attributes,
    /// Attributes the provider returned
    #[serde(default)]
    pub attributes: Attributes,
    /// State keys of the resources this one depended on
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ComponentId>,
    pub last_applied: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }
}

/// All resource records of one stack, keyed by `type::name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSnapshot {
    /// Empty state, as seen on a first run
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            stack: None,
            last_updated: None,
            resources: BTreeMap::new(),
        }
    }

    pub fn for_stack(stack: impl Into<String>) -> Self {
        Self {
            stack: Some(stack.into()),
            ..Self::new()
        }
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceRecord> {
        self.resources.get(&id.key())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Next snapshot, reflecting what `report` actually applied
    ///
    /// Created and updated resources get fresh records, deleted ones are
    /// dropped. Failed and skipped resources keep whatever was recorded
    /// before, so a later run retries them.
    pub fn reconcile(&self, report: &ApplyReport) -> Self {
        let mut next = self.clone();
        let now = Utc::now();

        for result in report.results() {
            let key = result.id.key();
            match &result.outcome {
                ApplyOutcome::Created | ApplyOutcome::Updated => {
                    next.resources.insert(
                        key,
                        ResourceRecord {
                            resource_type: result.id.resource_type.clone(),
                            name: result.id.name.clone(),
                            provider: result.provider.clone(),
                            spec_hash: result.spec_hash.clone().unwrap_or_default(),
                            inputs: result.inputs.clone().unwrap_or_default(),
                            attributes: result.attributes.clone().unwrap_or_default(),
                            dependencies: result.dependencies.clone(),
                            parent: result.parent.clone(),
                            last_applied: now,
                        },
                    );
                }
                ApplyOutcome::Unchanged => {
                    if let Some(record) = next.resources.get_mut(&key) {
                        record.dependencies = result.dependencies.clone();
                        record.parent = result.parent.clone();
                    }
                }
                ApplyOutcome::Deleted => {
                    next.resources.remove(&key);
                }
                ApplyOutcome::Failed { .. } | ApplyOutcome::Skipped { .. } => {}
            }
        }

        next.last_updated = Some(now);
        next
    }
}

// ============================================================================
// Stores
// ============================================================================

/// Where state snapshots live between runs
pub trait StateStore: Send + Sync {
    /// Prior state, or an empty snapshot on the first run
    fn load(&self) -> Result<StateSnapshot>;

    /// Persist a snapshot, all or nothing
    fn save(&self, snapshot: &StateSnapshot) -> Result<()>;
}

/// JSON document on disk, replaced atomically on save
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// One state file per stack, so equal resource names in different
    /// stacks never collide
    pub fn for_stack(dir: &Path, stack: &str) -> Self {
        Self::new(dir.join(format!("{stack}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupted(&self, message: impl Into<String>) -> Error {
        Error::StateCorruption {
            path: self.path.display().to_string(),
            message: message.into(),
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateSnapshot> {
        if !self.path.exists() {
            log::debug!("State file does not exist, using empty state");
            return Ok(StateSnapshot::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let snapshot: StateSnapshot =
            serde_json::from_str(&content).map_err(|e| self.corrupted(e.to_string()))?;

        if snapshot.version != STATE_VERSION {
            return Err(self.corrupted(format!(
                "unsupported state version {} (expected {STATE_VERSION})",
                snapshot.version
            )));
        }
        for (key, record) in &snapshot.resources {
            if *key != record.id().key() {
                return Err(self.corrupted(format!(
                    "record '{key}' describes {}",
                    record.id()
                )));
            }
        }

        log::debug!(
            "Loaded {} resources from {}",
            snapshot.len(),
            self.path.display()
        );
        Ok(snapshot)
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        // Rename is atomic, readers see the old or the new document.
        fs::rename(&tmp, &self.path)?;

        log::debug!(
            "Saved {} resources to {}",
            snapshot.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<StateSnapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateSnapshot> {
        Ok(self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{ApplyReport, NodeResult};
    use crate::planner::Action;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(resource_type: &str, name: &str) -> ResourceRecord {
        let mut attributes = Attributes::new();
        attributes.insert("id".into(), json!(format!("{name}-1")));
        ResourceRecord {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            provider: "default".to_string(),
            spec_hash: "abc".to_string(),
            inputs: Attributes::new(),
            attributes,
            dependencies: Vec::new(),
            parent: None,
            last_applied: Utc::now(),
        }
    }

    fn snapshot_with(records: Vec<ResourceRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::for_stack("mlplatform");
        for r in records {
            snapshot.resources.insert(r.id().key(), r);
        }
        snapshot
    }

    fn result(id: ResourceId, outcome: ApplyOutcome) -> NodeResult {
        let mut attributes = Attributes::new();
        attributes.insert("id".into(), json!("new"));
        NodeResult {
            id,
            action: Action::Update,
            outcome,
            inputs: Some(Attributes::new()),
            attributes: Some(attributes),
            spec_hash: Some("def".into()),
            provider: "default".into(),
            dependencies: vec!["t::dep".into()],
            parent: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::for_stack(dir.path(), "mlplatform");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::for_stack(&dir.path().join("nested"), "mlplatform");
        let snapshot = snapshot_with(vec![
            record("aws:s3/bucket:Bucket", "mlflow-bucket"),
            record("aws:s3/bucket:Bucket", "dvc-bucket"),
        ]);

        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!store.path().with_extension("json.tmp").exists());

        // Ordered mapping keeps the document diffable
        let keys: Vec<_> = loaded.resources.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                "aws:s3/bucket:Bucket::dvc-bucket",
                "aws:s3/bucket:Bucket::mlflow-bucket"
            ]
        );
    }

    #[test]
    fn test_corrupted_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::for_stack(dir.path(), "broken");
        fs::write(store.path(), "{ not json").unwrap();
        assert!(matches!(store.load(), Err(Error::StateCorruption { .. })));
    }

    #[test]
    fn test_unknown_version_is_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::for_stack(dir.path(), "future");
        fs::write(store.path(), r#"{"version": 99, "resources": {}}"#).unwrap();
        assert!(matches!(store.load(), Err(Error::StateCorruption { .. })));
    }

    #[test]
    fn test_mismatched_key_is_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::for_stack(dir.path(), "tampered");
        let mut snapshot = StateSnapshot::new();
        snapshot
            .resources
            .insert("wrong::key".into(), record("t", "right"));
        store.save(&snapshot).unwrap();
        assert!(matches!(store.load(), Err(Error::StateCorruption { .. })));
    }

    #[test]
    fn test_reconcile_records_only_what_was_applied() {
        let kept = record("t", "failed");
        let gone = record("t", "deleted");
        let same = record("t", "same");
        let prior = snapshot_with(vec![kept.clone(), gone.clone(), same.clone()]);

        let report = ApplyReport::new(vec![
            result(ResourceId::new("t", "created"), ApplyOutcome::Created),
            result(
                kept.id(),
                ApplyOutcome::Failed {
                    error: "boom".into(),
                },
            ),
            result(gone.id(), ApplyOutcome::Deleted),
            result(same.id(), ApplyOutcome::Unchanged),
            result(
                ResourceId::new("t", "skipped"),
                ApplyOutcome::Skipped {
                    reason: "fail-fast".into(),
                },
            ),
        ]);

        let next = prior.reconcile(&report);
        assert_eq!(next.len(), 3);
        assert_eq!(next.get(&ResourceId::new("t", "created")).unwrap().spec_hash, "def");
        assert_eq!(next.get(&kept.id()).unwrap(), &kept);
        assert!(next.get(&gone.id()).is_none());
        assert!(next.get(&ResourceId::new("t", "skipped")).is_none());

        let same_next = next.get(&same.id()).unwrap();
        assert_eq!(same_next.spec_hash, "abc");
        assert_eq!(same_next.dependencies, vec!["t::dep".to_string()]);
        assert!(next.last_updated.is_some());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load().unwrap().is_empty());
        let snapshot = snapshot_with(vec![record("t", "a")]);
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), snapshot);

        let seeded = MemoryStateStore::with_snapshot(snapshot.clone());
        assert_eq!(seeded.load().unwrap().len(), 1);
        seeded.save(&StateSnapshot::new()).unwrap();
        assert!(seeded.load().unwrap().is_empty());
    }
}

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::{FarmError, Result};
use crate::props::record::{PropDraft, StoredProp};

/// Named prop metadata with full-replace writes.
///
/// The registry never merges fields. Editors read a record, change it locally
/// and write the whole thing back; passing the revision they read turns the
/// write into a compare-and-swap so a concurrent edit is reported as
/// [`FarmError::Conflict`] instead of being overwritten.
#[derive(Debug)]
pub struct PropRegistry {
    props: DashMap<String, StoredProp>,
    clock: Arc<dyn Clock>,
}

impl PropRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            props: DashMap::new(),
            clock,
        }
    }

    pub fn get(&self, name: &str) -> Result<StoredProp> {
        self.props
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| FarmError::PropNotFound(name.to_string()))
    }

    /// All props, sorted by name.
    pub fn list(&self) -> Vec<StoredProp> {
        let mut props: Vec<StoredProp> = self.props.iter().map(|p| p.value().clone()).collect();
        props.sort_by(|a, b| a.record.name.cmp(&b.record.name));
        props
    }

    /// Validate and store `draft`, replacing any record of the same name.
    ///
    /// With `expected_revision`, the write only goes through if the stored
    /// revision still matches; `Some(0)` means the prop must not exist yet.
    /// Returns the stored record with its new revision.
    pub fn register(&self, draft: PropDraft, expected_revision: Option<u64>) -> Result<StoredProp> {
        let record = draft.validate()?;
        let now = self.clock.now();

        match self.props.entry(record.name.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().revision;
                if let Some(expected) = expected_revision.filter(|e| *e != current) {
                    tracing::info!(
                        prop = %record.name,
                        expected,
                        current,
                        "Prop register conflict"
                    );
                    return Err(FarmError::Conflict {
                        name: record.name,
                        expected,
                        actual: current,
                    });
                }
                let stored = StoredProp {
                    record,
                    revision: current + 1,
                    updated_at: now,
                };
                entry.insert(stored.clone());
                tracing::info!(prop = %stored.record.name, revision = stored.revision, "Prop updated");
                Ok(stored)
            }
            Entry::Vacant(entry) => {
                if let Some(expected) = expected_revision.filter(|e| *e != 0) {
                    return Err(FarmError::Conflict {
                        name: record.name,
                        expected,
                        actual: 0,
                    });
                }
                let stored = StoredProp {
                    record,
                    revision: 1,
                    updated_at: now,
                };
                entry.insert(stored.clone());
                tracing::info!(prop = %stored.record.name, "Prop registered");
                Ok(stored)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

use super::error::VisionError;
use super::label::Label;
use std::sync::{Arc, RwLock};

/// Read access to the caregiver's label catalog, plus the one write the
/// matcher is allowed: bumping `lastSeenAt`.
pub trait LabelRegistry: Send + Sync {
    fn labels(&self) -> Arc<[Label]>;

    fn touch_last_seen(&self, label_id: &str, at_ms: u64) -> Result<(), VisionError>;
}

/// Outcome of [`InMemoryLabelRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Updated, and the reference image differs from the stored one.
    ImageChanged,
}

pub struct InMemoryLabelRegistry {
    labels: RwLock<Arc<[Label]>>,
}

impl InMemoryLabelRegistry {
    pub fn new(labels: Vec<Label>) -> Self {
        Self {
            labels: RwLock::new(labels.into()),
        }
    }

    pub fn replace_all(&self, labels: Vec<Label>) {
        if let Ok(mut current) = self.labels.write() {
            *current = labels.into();
        }
    }

    /// Insert a new label at the end (registration order) or replace the one
    /// with the same id in place.
    pub fn upsert(&self, label: Label) -> Upsert {
        let mut current = match self.labels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next: Vec<Label> = current.to_vec();
        let outcome = match next.iter_mut().find(|l| l.id == label.id) {
            Some(existing) => {
                let changed = existing.reference_image != label.reference_image;
                *existing = label;
                if changed {
                    Upsert::ImageChanged
                } else {
                    Upsert::Updated
                }
            }
            None => {
                next.push(label);
                Upsert::Inserted
            }
        };
        *current = next.into();
        outcome
    }

    pub fn get(&self, label_id: &str) -> Option<Label> {
        self.labels().iter().find(|l| l.id == label_id).cloned()
    }
}

impl Default for InMemoryLabelRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LabelRegistry for InMemoryLabelRegistry {
    fn labels(&self) -> Arc<[Label]> {
        match self.labels.read() {
            Ok(labels) => Arc::clone(&labels),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn touch_last_seen(&self, label_id: &str, at_ms: u64) -> Result<(), VisionError> {
        let mut current = self
            .labels
            .write()
            .map_err(|_| VisionError::Config("label registry poisoned".to_string()))?;
        let mut next: Vec<Label> = current.to_vec();
        let label = next
            .iter_mut()
            .find(|l| l.id == label_id)
            .ok_or_else(|| VisionError::Config(format!("unknown label {}", label_id)))?;
        label.last_seen_at_ms = Some(at_ms);
        *current = next.into();
        Ok(())
    }
}

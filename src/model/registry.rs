use super::handle::{ModelHandle, Thresholds};
use super::kind::ModelKind;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

struct Published {
    handle: Arc<ModelHandle>,
    loaded_at: DateTime<Utc>,
}

/// Process-wide home of loaded models: at most one handle per kind.
///
/// Each slot goes from empty to populated exactly once. Concurrent loaders for
/// the same kind queue behind the first one instead of repeating its work.
pub struct ModelRegistry {
    slots: HashMap<ModelKind, OnceCell<Published>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            slots: ModelKind::ALL
                .iter()
                .map(|kind| (*kind, OnceCell::new()))
                .collect(),
        }
    }

    pub fn get(&self, kind: ModelKind) -> Option<Arc<ModelHandle>> {
        self.slots
            .get(&kind)
            .and_then(|slot| slot.get())
            .map(|published| Arc::clone(&published.handle))
    }

    pub fn is_loaded(&self, kind: ModelKind) -> bool {
        self.get(kind).is_some()
    }

    /// Returns the stored handle, running `init` only if the slot is empty.
    ///
    /// A failed `init` leaves the slot empty so a later call may try again.
    pub async fn get_or_try_publish<F, Fut>(&self, kind: ModelKind, init: F) -> Result<Arc<ModelHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ModelHandle>>,
    {
        let slot = self
            .slots
            .get(&kind)
            .ok_or_else(|| Error::KindNotConfigured(kind.to_string()))?;

        let published = slot
            .get_or_try_init(|| async {
                let handle = init().await?;
                Ok::<_, Error>(Published {
                    handle: Arc::new(handle),
                    loaded_at: Utc::now(),
                })
            })
            .await?;

        Ok(Arc::clone(&published.handle))
    }

    /// Builds a fresh readiness view from the current slots.
    pub fn snapshot(&self) -> ReadinessSnapshot {
        let kinds = self
            .slots
            .iter()
            .map(|(kind, slot)| {
                let status = match slot.get() {
                    Some(published) => KindStatus {
                        loaded: true,
                        origin: Some(published.handle.origin().to_string()),
                        loaded_at: Some(published.loaded_at),
                        stand_in: published.handle.is_stand_in(),
                        labels: published.handle.labels().to_vec(),
                        thresholds: published.handle.thresholds(),
                    },
                    None => KindStatus::default(),
                };
                (*kind, status)
            })
            .collect();

        ReadinessSnapshot {
            generated_at: Utc::now(),
            kinds,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindStatus {
    pub loaded: bool,
    pub origin: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub stand_in: bool,
    pub labels: Vec<String>,
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessSnapshot {
    pub generated_at: DateTime<Utc>,
    pub kinds: BTreeMap<ModelKind, KindStatus>,
}

impl ReadinessSnapshot {
    pub fn is_loaded(&self, kind: ModelKind) -> bool {
        self.kinds.get(&kind).is_some_and(|status| status.loaded)
    }

    pub fn all_loaded(&self) -> bool {
        self.kinds.values().all(|status| status.loaded)
    }
}

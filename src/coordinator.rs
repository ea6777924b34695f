//! Startup fan-out: one task per model kind, joined before serving.

use crate::model::{ModelKind, ModelLoader, ReadinessSnapshot};
use std::sync::Arc;

/// Loads every kind concurrently and reports what ended up in the registry.
///
/// A kind whose pipeline errors or panics is logged and reported as not
/// loaded; it never takes its siblings down with it.
pub async fn initialize_all(loader: Arc<ModelLoader>, kinds: &[ModelKind]) -> ReadinessSnapshot {
    tracing::info!("Initialising {} model kinds", kinds.len());

    let tasks: Vec<_> = kinds
        .iter()
        .map(|&kind| {
            let loader = Arc::clone(&loader);
            (kind, tokio::spawn(async move { loader.load(kind).await }))
        })
        .collect();

    for (kind, task) in tasks {
        match task.await {
            Ok(Ok(handle)) => {
                tracing::info!("{} model ready (via {})", kind, handle.origin());
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to initialise {} model: {}", kind, e);
            }
            Err(e) => {
                tracing::error!("Initialisation task for {} model aborted: {}", kind, e);
            }
        }
    }

    let snapshot = loader.registry().snapshot();
    let ready = snapshot.kinds.values().filter(|status| status.loaded).count();
    tracing::info!("Initialisation finished: {}/{} model kinds loaded", ready, snapshot.kinds.len());
    snapshot
}

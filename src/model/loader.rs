use super::handle::{ModelHandle, OperatingParams};
use super::kind::ModelKind;
use super::registry::ModelRegistry;
use super::strategies;
use crate::asset::AssetFetcher;
use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use candle_core::Device;
use std::collections::HashMap;
use std::sync::Arc;

/// One self-contained way of producing a handle for a kind.
#[async_trait]
pub trait LoadStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self) -> anyhow::Result<ModelHandle>;
}

/// Ordered strategies for one kind plus the parameters stamped on the winner.
pub struct KindPipeline {
    pub strategies: Vec<Box<dyn LoadStrategy>>,
    pub params: OperatingParams,
}

impl KindPipeline {
    pub fn new(strategies: Vec<Box<dyn LoadStrategy>>, params: OperatingParams) -> Self {
        Self { strategies, params }
    }
}

/// Runs strategies strictly in order and keeps the first success.
///
/// Failures of any sort are logged and skipped; only exhausting the whole
/// list is an error.
pub async fn first_success(kind: ModelKind, strategies: &[Box<dyn LoadStrategy>]) -> Result<ModelHandle> {
    let total = strategies.len();

    for (i, strategy) in strategies.iter().enumerate() {
        tracing::info!("Loading {} model: attempt {}/{} ({})", kind, i + 1, total, strategy.name());

        match strategy.attempt().await {
            Ok(handle) => {
                tracing::info!("{} model loaded by '{}' on attempt {}", kind, strategy.name(), i + 1);
                return Ok(handle.with_origin(strategy.name()));
            }
            Err(e) => {
                tracing::warn!("Strategy '{}' failed for {}: {:#}", strategy.name(), kind, e);
            }
        }
    }

    tracing::error!("All {} load strategies failed for {}", total, kind);
    Err(Error::StrategiesExhausted(kind.to_string()))
}

pub struct ModelLoader {
    registry: Arc<ModelRegistry>,
    pipelines: HashMap<ModelKind, KindPipeline>,
}

impl ModelLoader {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            pipelines: HashMap::new(),
        }
    }

    /// Wires up the standard pipelines for every kind.
    pub fn from_config(config: &Config, device: &Device, registry: Arc<ModelRegistry>) -> Result<Self> {
        let fetcher = Arc::new(AssetFetcher::new(config.policy.fetch.clone())?);

        Ok(ModelKind::ALL.iter().fold(Self::new(registry), |loader, &kind| {
            let pipeline = strategies::default_pipeline(kind, config, Arc::clone(&fetcher), device);
            loader.with_pipeline(kind, pipeline)
        }))
    }

    pub fn with_pipeline(mut self, kind: ModelKind, pipeline: KindPipeline) -> Self {
        self.pipelines.insert(kind, pipeline);
        self
    }

    pub fn kinds(&self) -> Vec<ModelKind> {
        let mut kinds: Vec<ModelKind> = self.pipelines.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Loads `kind` once for the lifetime of the registry.
    ///
    /// Later and concurrent calls get the already published handle.
    pub async fn load(&self, kind: ModelKind) -> Result<Arc<ModelHandle>> {
        if let Some(handle) = self.registry.get(kind) {
            tracing::debug!("{} model already loaded", kind);
            return Ok(handle);
        }

        let pipeline = self
            .pipelines
            .get(&kind)
            .ok_or_else(|| Error::KindNotConfigured(kind.to_string()))?;

        self.registry
            .get_or_try_publish(kind, || async {
                let handle = first_success(kind, &pipeline.strategies).await?;
                Ok(handle.normalize(&pipeline.params))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LoadStrategy for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn attempt(&self) -> anyhow::Result<ModelHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("artifact is corrupt")
        }
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LoadStrategy for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn attempt(&self) -> anyhow::Result<ModelHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(ModelHandle::empty_detector(vec!["object".to_string()], Device::Cpu))
        }
    }

    #[tokio::test]
    async fn later_strategies_are_skipped_after_success() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let strategies: Vec<Box<dyn LoadStrategy>> = vec![
            Box::new(Counting { calls: first.clone() }),
            Box::new(Counting { calls: second.clone() }),
        ];

        let handle = first_success(ModelKind::Detection, &strategies).await.unwrap();

        assert_eq!(handle.origin(), "counting");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_list_is_an_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let strategies: Vec<Box<dyn LoadStrategy>> = vec![
            Box::new(Failing { calls: calls.clone() }),
            Box::new(Failing { calls: calls.clone() }),
        ];

        let err = first_success(ModelKind::Classification, &strategies)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StrategiesExhausted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_loads_do_the_work_once() {
        let failing = Arc::new(AtomicUsize::new(0));
        let counting = Arc::new(AtomicUsize::new(0));
        let params = OperatingParams {
            confidence_threshold: 0.4,
            iou_threshold: 0.5,
        };
        let loader = ModelLoader::new(Arc::new(ModelRegistry::new())).with_pipeline(
            ModelKind::Detection,
            KindPipeline::new(
                vec![
                    Box::new(Failing { calls: failing.clone() }) as Box<dyn LoadStrategy>,
                    Box::new(Counting { calls: counting.clone() }),
                ],
                params,
            ),
        );

        let (a, b) = tokio::join!(loader.load(ModelKind::Detection), loader.load(ModelKind::Detection));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(counting.load(Ordering::SeqCst), 1);
        assert_eq!(a.thresholds().map(|t| t.confidence), Some(0.4));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let loader = ModelLoader::new(Arc::new(ModelRegistry::new()));
        let err = loader.load(ModelKind::Classification).await.unwrap_err();
        assert!(matches!(err, Error::KindNotConfigured(_)));
    }
}

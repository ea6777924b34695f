use super::classifier::{self, PooledLinear};
use super::coco;
use super::handle::ModelHandle;
use super::kind::ModelKind;
use super::loader::{KindPipeline, LoadStrategy};
use super::yolo::{Variant, YoloV8};
use crate::asset::{AssetFetcher, AssetSource};
use crate::config::Config;
use crate::error::Error;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const PRETRAINED_REPO: &str = "lmz/candle-yolo-v8";
pub const STAND_IN_DETECTOR_LABELS: [&str; 3] = ["object", "person", "vehicle"];
const GENERIC_DETECTOR_CLASSES: usize = 80;

/// Network a weights file is expected to contain.
#[derive(Debug, Clone)]
pub enum Architecture {
    ResNet18 { labels: Vec<String> },
    YoloV8 { variant: Variant, labels: Vec<String> },
}

impl Architecture {
    fn build(&self, vb: VarBuilder<'static>, device: &Device) -> candle_core::Result<ModelHandle> {
        match self {
            Architecture::ResNet18 { labels } => {
                let module = classifier::resnet18(labels.len(), vb)?;
                Ok(ModelHandle::classifier(labels.clone(), device.clone(), module))
            }
            Architecture::YoloV8 { variant, labels } => {
                let net = YoloV8::load(vb, *variant, labels.len())?;
                Ok(ModelHandle::detector(labels.clone(), device.clone(), net))
            }
        }
    }
}

/// Serialisation back-ends, tried in this order for a custom artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Safetensors,
    Pickle,
}

impl WeightFormat {
    pub const ORDER: [WeightFormat; 2] = [WeightFormat::Safetensors, WeightFormat::Pickle];

    fn var_builder(&self, path: &Path, device: &Device) -> candle_core::Result<VarBuilder<'static>> {
        match self {
            // SAFETY: the file is owned by this process and not modified while mapped.
            WeightFormat::Safetensors => unsafe {
                VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)
            },
            WeightFormat::Pickle => VarBuilder::from_pth(path, DType::F32, device),
        }
    }
}

fn parse_artifact(path: &Path, architecture: &Architecture, device: &Device) -> crate::Result<ModelHandle> {
    let mut failures = Vec::new();

    for format in WeightFormat::ORDER {
        match format
            .var_builder(path, device)
            .and_then(|vb| architecture.build(vb, device))
        {
            Ok(handle) => {
                tracing::info!("Parsed {:?} as {:?}", path, format);
                return Ok(handle);
            }
            Err(e) => {
                tracing::warn!("Could not parse {:?} as {:?}: {}", path, format, e);
                failures.push(format!("{:?}: {}", format, e));
            }
        }
    }

    Err(Error::ModelLoadFailed(format!(
        "no back-end could parse {:?} [{}]",
        path,
        failures.join("; ")
    )))
}

/// Acquire the configured artifact (if any) and parse it.
pub struct CustomArtifact {
    pub source: AssetSource,
    pub path: PathBuf,
    pub architecture: Architecture,
    pub fetcher: Arc<AssetFetcher>,
    pub device: Device,
}

#[async_trait]
impl LoadStrategy for CustomArtifact {
    fn name(&self) -> &str {
        "custom-artifact"
    }

    async fn attempt(&self) -> anyhow::Result<ModelHandle> {
        if self.source.is_configured() {
            self.fetcher
                .ensure(&self.source, &self.path)
                .await
                .with_context(|| format!("acquiring {}", self.source.description))?;
        } else if !self.path.exists() {
            bail!(
                "no source configured for {} and nothing at {:?}",
                self.source.description,
                self.path
            );
        }

        let path = self.path.clone();
        let architecture = self.architecture.clone();
        let device = self.device.clone();
        let handle = tokio::task::spawn_blocking(move || parse_artifact(&path, &architecture, &device))
            .await
            .context("artifact parser task failed")??;
        Ok(handle)
    }
}

/// Fails `what` once `limit` has elapsed instead of waiting on it forever.
pub async fn within<T, F>(limit: Duration, what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => bail!("{} timed out after {:?}", what, limit),
    }
}

/// A known-good YOLOv8 variant from the Hugging Face hub.
pub struct Pretrained {
    pub variant: Variant,
    pub device: Device,
    /// The hub client has no read timeout of its own.
    pub timeout: Duration,
    name: String,
}

impl Pretrained {
    pub fn new(variant: Variant, device: Device, timeout: Duration) -> Self {
        Self {
            variant,
            device,
            timeout,
            name: format!("pretrained-yolov8{}", variant.suffix()),
        }
    }
}

#[async_trait]
impl LoadStrategy for Pretrained {
    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self) -> anyhow::Result<ModelHandle> {
        let variant = self.variant;
        let device = self.device.clone();

        // On timeout the blocking fetch is detached, not cancelled.
        let task = tokio::task::spawn_blocking(move || -> anyhow::Result<ModelHandle> {
            let filename = format!("yolov8{}.safetensors", variant.suffix());
            tracing::info!("Fetching {} from {}", filename, PRETRAINED_REPO);

            let api = hf_hub::api::sync::Api::new().map_err(|e| anyhow!("hub client: {}", e))?;
            let weights = api
                .model(PRETRAINED_REPO.to_string())
                .get(&filename)
                .map_err(|e| anyhow!("fetching {}: {}", filename, e))?;

            let architecture = Architecture::YoloV8 {
                variant,
                labels: coco::names(),
            };
            // SAFETY: hub cache files are immutable once downloaded.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
            Ok(architecture.build(vb, &device)?)
        });

        within(self.timeout, &self.name, async {
            task.await.context("pretrained loader task failed")?
        })
        .await
    }
}

/// In-memory stand-in that never fails: no I/O, no trained weights.
pub struct StandIn {
    pub kind: ModelKind,
    pub labels: Vec<String>,
    pub device: Device,
}

impl StandIn {
    pub fn for_kind(kind: ModelKind, config: &Config, device: &Device) -> Self {
        let labels = match kind {
            ModelKind::Classification => config.classifier_labels.clone(),
            ModelKind::Detection => STAND_IN_DETECTOR_LABELS.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            kind,
            labels,
            device: device.clone(),
        }
    }
}

#[async_trait]
impl LoadStrategy for StandIn {
    fn name(&self) -> &str {
        "stand-in"
    }

    async fn attempt(&self) -> anyhow::Result<ModelHandle> {
        tracing::warn!("Using stand-in {} model", self.kind);

        match self.kind {
            ModelKind::Classification => {
                let module = PooledLinear::new(self.labels.len(), &self.device)?;
                let handle = ModelHandle::classifier(self.labels.clone(), self.device.clone(), Box::new(module));
                Ok(handle.as_stand_in())
            }
            ModelKind::Detection => Ok(ModelHandle::empty_detector(self.labels.clone(), self.device.clone())),
        }
    }
}

/// The standard fallback chain for `kind`, ending with a stand-in.
pub fn default_pipeline(kind: ModelKind, config: &Config, fetcher: Arc<AssetFetcher>, device: &Device) -> KindPipeline {
    let path = config.assets_dir.join(kind.filename());
    let hub_timeout = Duration::from_secs(config.policy.fetch.request_timeout_secs);

    let strategies: Vec<Box<dyn LoadStrategy>> = match kind {
        ModelKind::Classification => vec![
            Box::new(CustomArtifact {
                source: config.classifier_source.clone(),
                path,
                architecture: Architecture::ResNet18 {
                    labels: config.classifier_labels.clone(),
                },
                fetcher,
                device: device.clone(),
            }),
            Box::new(StandIn::for_kind(kind, config, device)),
        ],
        ModelKind::Detection => {
            let labels = if config.detector_labels.is_empty() {
                (0..GENERIC_DETECTOR_CLASSES).map(|i| format!("class_{i}")).collect()
            } else {
                config.detector_labels.clone()
            };
            vec![
                Box::new(CustomArtifact {
                    source: config.detector_source.clone(),
                    path,
                    architecture: Architecture::YoloV8 {
                        variant: config.detector_variant,
                        labels,
                    },
                    fetcher,
                    device: device.clone(),
                }),
                Box::new(Pretrained::new(Variant::S, device.clone(), hub_timeout)),
                Box::new(Pretrained::new(Variant::N, device.clone(), hub_timeout)),
                Box::new(StandIn::for_kind(kind, config, device)),
            ]
        }
    };

    KindPipeline::new(strategies, config.policy.operating)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::FetchPolicy;
    use crate::model::Inference;
    use candle_core::Tensor;

    fn config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_data_dir(dir.path().to_path_buf()).unwrap();
        (dir, config)
    }

    #[test]
    fn pipelines_end_with_a_stand_in() {
        let (_dir, config) = config();
        let fetcher = Arc::new(AssetFetcher::new(FetchPolicy::default()).unwrap());

        let classification = default_pipeline(ModelKind::Classification, &config, fetcher.clone(), &Device::Cpu);
        let names: Vec<&str> = classification.strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["custom-artifact", "stand-in"]);

        let detection = default_pipeline(ModelKind::Detection, &config, fetcher, &Device::Cpu);
        let names: Vec<&str> = detection.strategies.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            ["custom-artifact", "pretrained-yolov8s", "pretrained-yolov8n", "stand-in"]
        );
    }

    #[tokio::test]
    async fn custom_artifact_without_source_or_file_fails() {
        let (_dir, config) = config();
        let strategy = CustomArtifact {
            source: AssetSource::none("classification model"),
            path: config.assets_dir.join(ModelKind::Classification.filename()),
            architecture: Architecture::ResNet18 {
                labels: config.classifier_labels.clone(),
            },
            fetcher: Arc::new(AssetFetcher::new(FetchPolicy::default()).unwrap()),
            device: Device::Cpu,
        };

        assert!(strategy.attempt().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_artifact_fails_every_back_end() {
        let (_dir, config) = config();
        let path = config.assets_dir.join(ModelKind::Detection.filename());
        std::fs::write(&path, vec![7u8; 20_000]).unwrap();

        let strategy = CustomArtifact {
            source: AssetSource::none("detection model"),
            path,
            architecture: Architecture::YoloV8 {
                variant: Variant::N,
                labels: vec!["ulcer".to_string()],
            },
            fetcher: Arc::new(AssetFetcher::new(FetchPolicy::default()).unwrap()),
            device: Device::Cpu,
        };

        let err = strategy.attempt().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ModelLoadFailed(_))));
        assert!(err.to_string().contains("no back-end could parse"));
    }

    #[tokio::test]
    async fn stalled_work_fails_once_the_limit_elapses() {
        let result = within(
            Duration::from_millis(50),
            "hub fetch",
            std::future::pending::<anyhow::Result<()>>(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("hub fetch timed out"));
    }

    #[tokio::test]
    async fn finished_work_is_passed_through() {
        let value = within(Duration::from_secs(5), "parse", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn pretrained_strategies_carry_the_request_timeout() {
        let strategy = Pretrained::new(Variant::S, Device::Cpu, Duration::from_secs(600));
        assert_eq!(strategy.timeout, Duration::from_secs(600));
        assert_eq!(strategy.name(), "pretrained-yolov8s");
    }

    #[tokio::test]
    async fn stand_in_detector_returns_empty_detections() {
        let (_dir, config) = config();
        let handle = StandIn::for_kind(ModelKind::Detection, &config, &Device::Cpu)
            .attempt()
            .await
            .unwrap();

        assert_eq!(handle.labels(), ["object", "person", "vehicle"]);
        let image = Tensor::rand(0f32, 1f32, (3, 37, 53), &Device::Cpu).unwrap();
        assert_eq!(handle.run(&image).unwrap(), Inference::Detections(Vec::new()));
    }
}

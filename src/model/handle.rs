use super::kind::ModelKind;
use super::yolo::{self, YoloV8};
use crate::error::{Error, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use serde::{Deserialize, Serialize};

/// Operating parameters stamped onto every detection handle at load time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatingParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for OperatingParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub confidence: f32,
    pub iou: f32,
}

impl From<OperatingParams> for Thresholds {
    fn from(params: OperatingParams) -> Self {
        Self {
            confidence: params.confidence_threshold,
            iou: params.iou_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Inference {
    /// One probability per label, in label order.
    Scores(Vec<f32>),
    Detections(Vec<Detection>),
}

enum Backend {
    Classifier(Box<dyn Module + Send + Sync>),
    Detector(Box<YoloV8>),
    /// Keeps the detection surface alive without a network behind it.
    EmptyDetector,
}

/// A loaded model, whatever strategy produced it.
///
/// Handles are fully built (thresholds included) before they are published to
/// the registry and are never mutated afterwards.
pub struct ModelHandle {
    kind: ModelKind,
    origin: String,
    labels: Vec<String>,
    thresholds: Option<Thresholds>,
    stand_in: bool,
    device: Device,
    backend: Backend,
}

impl ModelHandle {
    pub fn classifier(labels: Vec<String>, device: Device, module: Box<dyn Module + Send + Sync>) -> Self {
        Self::build(ModelKind::Classification, labels, device, Backend::Classifier(module), false)
    }

    pub fn detector(labels: Vec<String>, device: Device, net: YoloV8) -> Self {
        Self::build(ModelKind::Detection, labels, device, Backend::Detector(Box::new(net)), false)
    }

    pub fn empty_detector(labels: Vec<String>, device: Device) -> Self {
        Self::build(ModelKind::Detection, labels, device, Backend::EmptyDetector, true)
    }

    fn build(kind: ModelKind, labels: Vec<String>, device: Device, backend: Backend, stand_in: bool) -> Self {
        Self {
            kind,
            origin: String::new(),
            labels,
            thresholds: None,
            stand_in,
            device,
            backend,
        }
    }

    /// Marks a handle whose backend has no trained weights behind it.
    pub(crate) fn as_stand_in(mut self) -> Self {
        self.stand_in = true;
        self
    }

    pub(crate) fn with_origin(mut self, origin: &str) -> Self {
        self.origin = origin.to_string();
        self
    }

    pub(crate) fn normalize(mut self, params: &OperatingParams) -> Self {
        self.thresholds = self.kind.uses_thresholds().then(|| Thresholds::from(*params));
        self
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Name of the strategy that produced this handle.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn thresholds(&self) -> Option<Thresholds> {
        self.thresholds
    }

    pub fn is_stand_in(&self) -> bool {
        self.stand_in
    }

    /// Runs inference on a `(3, height, width)` image tensor scaled to `[0, 1]`.
    pub fn run(&self, image: &Tensor) -> Result<Inference> {
        let (channels, height, width) = image
            .dims3()
            .map_err(|e| Error::InvalidInput(format!("Expected a (3, H, W) image tensor: {}", e)))?;
        if channels != 3 {
            return Err(Error::InvalidInput(format!("Expected 3 channels, got {}", channels)));
        }

        match &self.backend {
            Backend::Classifier(module) => {
                let input = image.to_device(&self.device)?.to_dtype(DType::F32)?.unsqueeze(0)?;
                let logits = module.forward(&input)?;
                let probs = candle_nn::ops::softmax(&logits, D::Minus1)?
                    .squeeze(0)?
                    .to_device(&Device::Cpu)?
                    .to_vec1::<f32>()?;
                Ok(Inference::Scores(probs))
            }
            Backend::Detector(net) => {
                if height % 32 != 0 || width % 32 != 0 {
                    return Err(Error::InvalidInput(format!(
                        "Detection input must be a multiple of 32, got {}x{}",
                        width, height
                    )));
                }
                let input = image.to_device(&self.device)?.to_dtype(DType::F32)?.unsqueeze(0)?;
                let pred = net.forward(&input)?.squeeze(0)?;
                let thresholds = self
                    .thresholds
                    .unwrap_or_else(|| OperatingParams::default().into());
                let detections = yolo::detections(&pred, &self.labels, thresholds.confidence, thresholds.iou)?;
                Ok(Inference::Detections(detections))
            }
            Backend::EmptyDetector => Ok(Inference::Detections(Vec::new())),
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("labels", &self.labels.len())
            .field("thresholds", &self.thresholds)
            .field("stand_in", &self.stand_in)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_only_sets_thresholds_for_detection() {
        let params = OperatingParams {
            confidence_threshold: 0.3,
            iou_threshold: 0.6,
        };

        let detector = ModelHandle::empty_detector(labels(&["object"]), Device::Cpu).normalize(&params);
        assert_eq!(
            detector.thresholds(),
            Some(Thresholds {
                confidence: 0.3,
                iou: 0.6
            })
        );

        let module = candle_nn::Func::new(|xs: &Tensor| xs.mean((2, 3)));
        let classifier = ModelHandle::classifier(labels(&["a", "b", "c"]), Device::Cpu, Box::new(module))
            .normalize(&params);
        assert_eq!(classifier.thresholds(), None);
    }

    #[test]
    fn stand_in_flag_is_explicit() {
        let module = || Box::new(candle_nn::Func::new(|xs: &Tensor| xs.mean((2, 3))));

        let trained = ModelHandle::classifier(labels(&["a", "b", "c"]), Device::Cpu, module());
        assert!(!trained.is_stand_in());

        let placeholder = ModelHandle::classifier(labels(&["a", "b", "c"]), Device::Cpu, module()).as_stand_in();
        assert!(placeholder.is_stand_in());

        assert!(ModelHandle::empty_detector(labels(&["object"]), Device::Cpu).is_stand_in());
    }

    #[test]
    fn rejects_non_rgb_input() {
        let handle = ModelHandle::empty_detector(labels(&["object"]), Device::Cpu);
        let gray = Tensor::zeros((1, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(handle.run(&gray), Err(Error::InvalidInput(_))));
    }
}

pub mod classifier;
pub mod coco;
pub mod handle;
pub mod kind;
pub mod loader;
pub mod registry;
pub mod strategies;
pub mod yolo;

pub use handle::{Detection, Inference, ModelHandle, OperatingParams, Thresholds};
pub use kind::ModelKind;
pub use loader::{first_success, KindPipeline, LoadStrategy, ModelLoader};
pub use registry::{KindStatus, ModelRegistry, ReadinessSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The categories of model the service keeps in memory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Classification,
    Detection,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Classification, ModelKind::Detection];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Classification => "classification",
            ModelKind::Detection => "detection",
        }
    }

    /// File name of the custom artifact inside the asset directory.
    pub fn filename(&self) -> &'static str {
        match self {
            ModelKind::Classification => "classifier.weights",
            ModelKind::Detection => "detector.weights",
        }
    }

    /// Whether handles of this kind carry confidence/overlap thresholds.
    pub fn uses_thresholds(&self) -> bool {
        matches!(self, ModelKind::Detection)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

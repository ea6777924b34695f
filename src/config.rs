use crate::asset::{AssetSource, FetchPolicy};
use crate::error::{Error, Result};
use crate::model::yolo::Variant;
use crate::model::OperatingParams;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CLASSIFIER_LABELS: [&str; 4] = ["none", "infection", "ischaemia", "both"];

/// Tunable heuristics, read from `policy.toml` in the data directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
	pub fetch: FetchPolicy,
	pub operating: OperatingParams,
}

impl Policy {
	pub fn load(path: &Path) -> Result<Self> {
		if !path.exists() {
			return Ok(Self::default());
		}

		let content = std::fs::read_to_string(path)?;
		let policy: Policy = toml::from_str(&content)?;
		Ok(policy)
	}
}

#[derive(Debug, Clone)]
pub struct Config {
	pub data_dir: PathBuf,
	pub assets_dir: PathBuf,
	pub policy_path: PathBuf,
	pub classifier_source: AssetSource,
	pub detector_source: AssetSource,
	pub classifier_labels: Vec<String>,
	pub detector_labels: Vec<String>,
	pub detector_variant: Variant,
	pub policy: Policy,
}

impl Config {
	/// Builds a config rooted at `data_dir` with no remote sources and default labels.
	pub fn for_data_dir(data_dir: PathBuf) -> Result<Self> {
		let assets_dir = data_dir.join("models");
		let policy_path = data_dir.join("policy.toml");

		std::fs::create_dir_all(&data_dir)?;
		std::fs::create_dir_all(&assets_dir)?;

		let policy = Policy::load(&policy_path)?;

		Ok(Self {
			data_dir,
			assets_dir,
			policy_path,
			classifier_source: AssetSource::none("classification model"),
			detector_source: AssetSource::none("detection model"),
			classifier_labels: DEFAULT_CLASSIFIER_LABELS.iter().map(|s| s.to_string()).collect(),
			detector_labels: Vec::new(),
			detector_variant: Variant::S,
			policy,
		})
	}

	pub fn new() -> Result<Self> {
		let project_dirs = ProjectDirs::from("", "", "dfu-serve")
			.ok_or_else(|| Error::ConfigError("Could not determine data directory".to_string()))?;

		Self::for_data_dir(project_dirs.data_dir().to_path_buf())
	}

	pub fn from_env() -> Result<Self> {
		let mut config = match std::env::var("DFU_DATA_DIR") {
			Ok(dir) if !dir.trim().is_empty() => Self::for_data_dir(PathBuf::from(dir))?,
			_ => Self::new()?,
		};

		if let Some(url) = env_nonempty("CLASSIFIER_MODEL_URL") {
			config.classifier_source = AssetSource::new(url, "classification model");
		}
		if let Some(url) = env_nonempty("DETECTOR_MODEL_URL") {
			config.detector_source = AssetSource::new(url, "custom detection model");
		}
		if let Some(labels) = env_nonempty("CLASSIFIER_LABELS") {
			config.classifier_labels = split_labels(&labels);
			if config.classifier_labels.is_empty() {
				return Err(Error::ConfigError("CLASSIFIER_LABELS has no entries".to_string()));
			}
		}
		if let Some(labels) = env_nonempty("DETECTOR_LABELS") {
			config.detector_labels = split_labels(&labels);
		}
		if let Some(variant) = env_nonempty("DETECTOR_VARIANT") {
			config.detector_variant = variant.parse()?;
		}

		Ok(config)
	}
}

fn env_nonempty(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn split_labels(raw: &str) -> Vec<String> {
	raw.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(String::from)
		.collect()
}

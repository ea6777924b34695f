use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("No source configured for {0}")]
	SourceNotConfigured(String),

	#[error("Download failed: {0}")]
	DownloadFailed(String),

	#[error("Failed to load model: {0}")]
	ModelLoadFailed(String),

	#[error("Every load strategy failed for {0}")]
	StrategiesExhausted(String),

	#[error("Model kind not configured: {0}")]
	KindNotConfigured(String),

	#[error("Model not loaded: {0}")]
	ModelNotLoaded(String),

	#[error("Invalid input: {0}")]
	InvalidInput(String),

	#[error("Inference error: {0}")]
	InferenceError(String),

	#[error("Configuration error: {0}")]
	ConfigError(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Serialization error: {0}")]
	SerializationError(String),
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::SerializationError(err.to_string())
	}
}

impl From<toml::de::Error> for Error {
	fn from(err: toml::de::Error) -> Self {
		Error::SerializationError(err.to_string())
	}
}

impl From<candle_core::Error> for Error {
	fn from(err: candle_core::Error) -> Self {
		Error::InferenceError(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;

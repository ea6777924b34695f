use crate::model::ModelKind;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dfu-serve")]
#[command(version, about = "Inference service with resilient model acquisition", long_about = None)]
pub struct Cli {
	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Load every model kind, then start the HTTP API server
	Serve {
		/// Device to run on (e.g., "cpu" or "cuda:0")
		#[arg(long, default_value = "cpu")]
		device: String,

		/// Port to listen on
		#[arg(long, env = "PORT", default_value = "8000")]
		port: u16,

		/// Host to bind to
		#[arg(long, default_value = "0.0.0.0")]
		host: String,
	},

	/// Download the configured artifact for one model kind, if missing
	Fetch {
		/// Model kind whose artifact should be fetched
		#[arg(value_enum)]
		kind: ModelKind,
	},

	/// Load every model kind and print the readiness snapshot
	Status {
		/// Device to run on (e.g., "cpu" or "cuda:0")
		#[arg(long, default_value = "cpu")]
		device: String,
	},
}

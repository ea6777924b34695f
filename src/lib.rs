//! Model acquisition and lazy, fallback-driven model loading for an
//! inference service that has to start even when its artifacts do not.

pub mod asset;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod server;

pub use error::{Error, Result};

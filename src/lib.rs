//! Service Account Key Rotation Library
//!
//! Rotates a Google Cloud service account key and publishes the new
//! credential to GitHub Actions secrets and Google Secret Manager before the
//! old key is retired.

pub mod cli;
pub mod config;
pub mod error;
pub mod gcp_auth;
pub mod keystore;
pub mod rotation;
pub mod sinks;

pub use config::Config;
pub use error::{ProviderError, RotationError};
pub use keystore::KeyStore;
pub use rotation::{RetireOutcome, RotationEngine, RotationPlan, RotationReport};
pub use sinks::{Destination, SecretSink};

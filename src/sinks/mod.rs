//! Secret sink implementations
//!
//! This module provides the [`SecretSink`] abstraction and the destinations a
//! rotated key is published to:
//! - GitHub Actions repository secrets
//! - Google Cloud Secret Manager

mod github;
mod secret_manager;
mod secret_sink;

pub use github::{seal, GithubSecretSink, RepoPublicKey, RepoSecret};
pub use secret_manager::SecretManagerSink;
pub use secret_sink::{Destination, SecretSink};

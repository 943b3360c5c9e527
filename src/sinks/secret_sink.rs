use std::sync::Arc;

use crate::error::ProviderError;

/// A destination able to hold named secret values (GitHub Actions, Secret Manager, ...)
#[async_trait::async_trait]
pub trait SecretSink: Send + Sync {
    /// Best-effort existence probe; errors read as `false`
    async fn exists(&self, name: &str) -> bool;

    /// Create the secret if needed and store `value` as its current value
    async fn put(&self, name: &str, value: &[u8]) -> Result<(), ProviderError>;

    /// Human readable location of `name` in this sink, used in reports
    fn location(&self, name: &str) -> String;

    /// Get the sink type name for display purposes
    fn sink_type(&self) -> &'static str;
}

/// One secret written during publishing: a sink and the name to write under.
#[derive(Clone)]
pub struct Destination {
    pub sink: Arc<dyn SecretSink>,
    pub secret_name: String,
}

impl Destination {
    pub fn new(sink: Arc<dyn SecretSink>, secret_name: impl Into<String>) -> Self {
        Self {
            sink,
            secret_name: secret_name.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.sink.sink_type(), self.sink.location(&self.secret_name))
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

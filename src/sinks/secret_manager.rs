use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::secret_sink::SecretSink;
use crate::error::{check_response, ProviderError};

/// Google Cloud Secret Manager client for one project
pub struct SecretManagerSink {
    client: Client,
    endpoint: String,
    project_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretVersion {
    name: String,
}

impl SecretManagerSink {
    pub fn new(client: Client, endpoint: &str, project_id: &str, access_token: String) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            access_token,
        }
    }

    fn secrets_url(&self) -> String {
        format!("{}/v1/projects/{}/secrets", self.endpoint, self.project_id)
    }

    /// Create the secret container with automatic replication.
    ///
    /// Returns `false` when it already existed.
    async fn create_container(&self, name: &str) -> Result<bool, ProviderError> {
        let url = self.secrets_url();
        debug!("Creating secret {} at: {}", name, url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .query(&[("secretId", name)])
            .json(&json!({"replication": {"automatic": {}}}))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            debug!("Secret {} already exists", name);
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_response(status, &body));
        }

        info!("Created secret {} in project {}", name, self.project_id);
        Ok(true)
    }

    async fn add_version(&self, name: &str, value: &[u8]) -> Result<String, ProviderError> {
        let url = format!("{}/{}:addVersion", self.secrets_url(), name);
        debug!("Adding secret version at: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({"payload": {"data": STANDARD.encode(value)}}))
            .send()
            .await?;

        let version: SecretVersion = check_response(response).await?.json().await?;
        Ok(version.name)
    }
}

#[async_trait::async_trait]
impl SecretSink for SecretManagerSink {
    async fn exists(&self, name: &str) -> bool {
        let url = format!("{}/{}", self.secrets_url(), name);
        let result = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() && status != StatusCode::NOT_FOUND {
                    debug!("Existence probe for {} returned {}, assuming absent", name, status);
                }
                status.is_success()
            }
            Err(e) => {
                debug!("Existence probe for {} failed, assuming absent: {}", name, e);
                false
            }
        }
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), ProviderError> {
        if !self.exists(name).await {
            self.create_container(name).await?;
        }
        let version = self.add_version(name, value).await?;
        info!("Added {}", version);
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        format!("projects/{}/secrets/{}", self.project_id, name)
    }

    fn sink_type(&self) -> &'static str {
        "Secret Manager"
    }
}

//! Bearer tokens for the Google APIs.
//!
//! A token supplied through configuration is used as-is. Otherwise one is
//! requested from the GCE metadata server, which is what Cloud Run, GKE
//! workload identity and self-hosted runners on Compute Engine expose.

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ProviderError;

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Resolve the access token used for IAM and Secret Manager calls.
pub async fn resolve_access_token(
    client: &Client,
    configured: Option<&str>,
    metadata_endpoint: &str,
) -> Result<String, ProviderError> {
    if let Some(token) = configured.filter(|t| !t.trim().is_empty()) {
        debug!("Using configured GCP access token");
        return Ok(token.trim().to_string());
    }

    let url = format!("{}{}", metadata_endpoint.trim_end_matches('/'), METADATA_TOKEN_PATH);
    debug!("Requesting GCP access token from: {}", url);

    let response = client
        .get(&url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| {
            ProviderError::Auth(format!(
                "no GCP access token configured and the metadata server is unreachable: {}",
                e
            ))
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Auth(format!(
            "metadata server refused token request with status {}: {}",
            status,
            body.trim()
        )));
    }

    let token: MetadataToken = response.json().await?;
    info!(
        "Obtained GCP access token from metadata server (expires in {}s)",
        token.expires_in
    );
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_token_skips_metadata() {
        let client = Client::new();
        let token = resolve_access_token(&client, Some(" ya29.abc "), "http://127.0.0.1:1")
            .await
            .unwrap();
        assert_eq!(token, "ya29.abc");
    }

    #[tokio::test]
    async fn test_token_from_metadata_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", METADATA_TOKEN_PATH)
            .match_header("metadata-flavor", "Google")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.meta","expires_in":3599,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let token = resolve_access_token(&Client::new(), None, &server.url())
            .await
            .unwrap();
        assert_eq!(token, "ya29.meta");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_metadata_failure_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", METADATA_TOKEN_PATH)
            .with_status(404)
            .create_async()
            .await;

        let err = resolve_access_token(&Client::new(), Some("  "), &server.url())
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }
}

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use crypto_box::PublicKey;
use rand::rngs::OsRng;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::secret_sink::SecretSink;
use crate::error::{check_response, ProviderError};

const GITHUB_API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;

/// Repository public key used to encrypt Actions secrets
#[derive(Debug, Clone, Deserialize)]
pub struct RepoPublicKey {
    pub key_id: String,
    pub key: String,
}

/// Secret as listed by the API (values are never returned)
#[derive(Debug, Clone, Deserialize)]
pub struct RepoSecret {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RepoSecretsPage {
    total_count: usize,
    #[serde(default)]
    secrets: Vec<RepoSecret>,
}

#[derive(Debug, Serialize)]
struct EncryptedSecret {
    encrypted_value: String,
    key_id: String,
}

/// GitHub Actions repository secrets
pub struct GithubSecretSink {
    client: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
    public_key: RepoPublicKey,
}

/// Encrypt `value` for the repository key with a libsodium sealed box.
pub fn seal(public_key_b64: &str, value: &[u8]) -> Result<String, ProviderError> {
    let raw = STANDARD
        .decode(public_key_b64.trim())
        .map_err(|e| ProviderError::Encoding(format!("repository public key is not base64: {}", e)))?;
    let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
        ProviderError::Encoding(format!(
            "repository public key must be 32 bytes, got {}",
            raw.len()
        ))
    })?;

    let sealed = PublicKey::from(bytes)
        .seal(&mut OsRng, value)
        .map_err(|e| ProviderError::Encoding(format!("failed to seal secret: {}", e)))?;
    Ok(STANDARD.encode(sealed))
}

impl GithubSecretSink {
    /// Connect to a repository, fetching its public key.
    ///
    /// This is also the first authenticated call, so a bad token fails here
    /// before any service account key has been created.
    pub async fn connect(
        client: Client,
        api_url: &str,
        owner: &str,
        repo: &str,
        token: &str,
    ) -> Result<Self, ProviderError> {
        let mut sink = Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
            public_key: RepoPublicKey {
                key_id: String::new(),
                key: String::new(),
            },
        };

        let url = sink.repo_url("actions/secrets/public-key");
        debug!("Fetching repository public key from: {}", url);
        let response = sink.authorized(sink.client.get(&url)).send().await?;
        sink.public_key = check_response(response).await?.json().await?;

        info!(
            "Connected to {}/{} (public key {})",
            sink.owner, sink.repo, sink.public_key.key_id
        );
        Ok(sink)
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, self.owner, self.repo, path
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }

    /// List the repository's Actions secrets
    pub async fn list_secrets(&self) -> Result<Vec<RepoSecret>, ProviderError> {
        let url = self.repo_url("actions/secrets");
        let mut secrets = Vec::new();
        let mut page = 1;

        loop {
            debug!("Listing secrets at: {} (page {})", url, page);
            let response = self
                .authorized(self.client.get(&url))
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await?;
            let listed: RepoSecretsPage = check_response(response).await?.json().await?;

            let fetched = listed.secrets.len();
            secrets.extend(listed.secrets);
            if fetched < PAGE_SIZE || secrets.len() >= listed.total_count {
                break;
            }
            page += 1;
        }

        Ok(secrets)
    }
}

#[async_trait::async_trait]
impl SecretSink for GithubSecretSink {
    async fn exists(&self, name: &str) -> bool {
        let url = self.repo_url(&format!("actions/secrets/{}", name));
        match self.authorized(self.client.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Existence probe for {} failed, assuming absent: {}", name, e);
                false
            }
        }
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), ProviderError> {
        let url = self.repo_url(&format!("actions/secrets/{}", name));
        debug!("Writing secret to: {}", url);

        let body = EncryptedSecret {
            encrypted_value: seal(&self.public_key.key, value)?,
            key_id: self.public_key.key_id.clone(),
        };

        let response = self
            .authorized(self.client.put(&url))
            .json(&body)
            .send()
            .await?;
        let response = check_response(response).await?;

        if response.status() == StatusCode::CREATED {
            info!("Created secret {} in {}/{}", name, self.owner, self.repo);
        } else {
            info!("Updated secret {} in {}/{}", name, self.owner, self.repo);
        }
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        format!("{}/{}:{}", self.owner, self.repo, name)
    }

    fn sink_type(&self) -> &'static str {
        "GitHub Actions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::SecretKey;
    use mockito::Matcher;
    use serde_json::json;

    const PUBLIC_KEY_PATH: &str = "/repos/acme/infra/actions/secrets/public-key";

    fn keypair() -> (SecretKey, String) {
        let secret = SecretKey::generate(&mut OsRng);
        let public = STANDARD.encode(secret.public_key().as_bytes());
        (secret, public)
    }

    async fn connected(server: &mut mockito::Server, public_key: &str) -> GithubSecretSink {
        server
            .mock("GET", PUBLIC_KEY_PATH)
            .with_status(200)
            .with_body(json!({"key_id": "568250167242549743", "key": public_key}).to_string())
            .create_async()
            .await;
        GithubSecretSink::connect(Client::new(), &server.url(), "acme", "infra", "ghp_test")
            .await
            .unwrap()
    }

    #[test]
    fn test_seal_opens_with_repository_key() {
        let (secret, public) = keypair();
        let sealed = STANDARD.decode(seal(&public, b"{\"type\":\"service_account\"}").unwrap()).unwrap();

        let opened = secret.unseal(&sealed).unwrap();
        assert_eq!(opened, b"{\"type\":\"service_account\"}");
    }

    #[test]
    fn test_seal_rejects_bad_keys() {
        assert!(matches!(seal("%%%", b"x"), Err(ProviderError::Encoding(_))));
        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(seal(&short, b"x"), Err(ProviderError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_connect_bad_token_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PUBLIC_KEY_PATH)
            .with_status(401)
            .with_body(r#"{"message":"Bad credentials"}"#)
            .create_async()
            .await;

        let result =
            GithubSecretSink::connect(Client::new(), &server.url(), "acme", "infra", "bad").await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
    }

    #[tokio::test]
    async fn test_put_sends_encrypted_value() {
        let mut server = mockito::Server::new_async().await;
        let (_, public) = keypair();
        let sink = connected(&mut server, &public).await;

        let mock = server
            .mock("PUT", "/repos/acme/infra/actions/secrets/GCP_SA_KEY")
            .match_header("authorization", "Bearer ghp_test")
            .match_header("x-github-api-version", GITHUB_API_VERSION)
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({"key_id": "568250167242549743"})),
                Matcher::Regex(r#""encrypted_value":"[A-Za-z0-9+/=]{40,}""#.to_string()),
            ]))
            .with_status(201)
            .create_async()
            .await;

        sink.put("GCP_SA_KEY", b"{\"private_key_id\":\"k2\"}").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_twice_overwrites() {
        let mut server = mockito::Server::new_async().await;
        let (_, public) = keypair();
        let sink = connected(&mut server, &public).await;

        let created = server
            .mock("PUT", "/repos/acme/infra/actions/secrets/GCP_SA_KEY")
            .with_status(201)
            .expect(1)
            .create_async()
            .await;
        sink.put("GCP_SA_KEY", b"first").await.unwrap();
        created.assert_async().await;
        created.remove_async().await;

        let updated = server
            .mock("PUT", "/repos/acme/infra/actions/secrets/GCP_SA_KEY")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        sink.put("GCP_SA_KEY", b"second").await.unwrap();
        updated.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_forbidden() {
        let mut server = mockito::Server::new_async().await;
        let (_, public) = keypair();
        let sink = connected(&mut server, &public).await;

        server
            .mock("PUT", "/repos/acme/infra/actions/secrets/GCP_SA_KEY")
            .with_status(403)
            .with_body(r#"{"message":"Resource not accessible by integration"}"#)
            .create_async()
            .await;

        let err = sink.put("GCP_SA_KEY", b"x").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_exists() {
        let mut server = mockito::Server::new_async().await;
        let (_, public) = keypair();
        let sink = connected(&mut server, &public).await;

        server
            .mock("GET", "/repos/acme/infra/actions/secrets/PRESENT")
            .with_status(200)
            .with_body(r#"{"name":"PRESENT","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/acme/infra/actions/secrets/ABSENT")
            .with_status(404)
            .create_async()
            .await;

        assert!(sink.exists("PRESENT").await);
        assert!(!sink.exists("ABSENT").await);
    }

    #[tokio::test]
    async fn test_list_secrets_paginates() {
        let mut server = mockito::Server::new_async().await;
        let (_, public) = keypair();
        let sink = connected(&mut server, &public).await;

        let first: Vec<_> = (0..PAGE_SIZE)
            .map(|i| json!({"name": format!("S{}", i), "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-02-01T00:00:00Z"}))
            .collect();
        server
            .mock("GET", "/repos/acme/infra/actions/secrets")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_status(200)
            .with_body(json!({"total_count": PAGE_SIZE + 1, "secrets": first}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/repos/acme/infra/actions/secrets")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_body(
                json!({"total_count": PAGE_SIZE + 1, "secrets": [
                    {"name": "GCP_SA_KEY", "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-03-01T00:00:00Z"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let secrets = sink.list_secrets().await.unwrap();
        assert_eq!(secrets.len(), PAGE_SIZE + 1);
        assert_eq!(secrets.last().unwrap().name, "GCP_SA_KEY");
    }
}

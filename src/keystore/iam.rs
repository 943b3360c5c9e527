use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::key_store::{short_name, CreatedKey, Credential, KeyStore, KeyType, ServiceAccountKey};
use crate::error::{check_response, ProviderError};

/// IAM REST client bound to one service account
pub struct IamKeyStore {
    client: Client,
    endpoint: String,
    access_token: String,
    account: String,
}

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    keys: Vec<IamKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamKey {
    name: String,
    #[serde(default)]
    key_type: String,
    #[serde(default)]
    valid_after_time: String,
    #[serde(default)]
    valid_before_time: Option<String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyResponse {
    name: String,
    #[serde(default)]
    private_key_data: String,
}

impl IamKeyStore {
    /// Create a new IAM key store for `account` (a service account email)
    pub fn new(
        client: Client,
        endpoint: &str,
        access_token: String,
        account: String,
    ) -> anyhow::Result<Self> {
        if !account.contains('@') {
            anyhow::bail!("Service account must be an email address, got '{}'", account);
        }
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_token,
            account,
        })
    }

    fn keys_url(&self) -> String {
        format!(
            "{}/v1/projects/-/serviceAccounts/{}/keys",
            self.endpoint, self.account
        )
    }
}

fn parse_time(value: &str, field: &str, key: &str) -> Result<DateTime<Utc>, ProviderError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ProviderError::Encoding(format!("{} of key {} is invalid: {}", field, key, e)))
}

impl TryFrom<IamKey> for ServiceAccountKey {
    type Error = ProviderError;

    fn try_from(key: IamKey) -> Result<Self, Self::Error> {
        let key_type = key.key_type.parse::<KeyType>().map_err(ProviderError::Encoding)?;
        let created_on = parse_time(&key.valid_after_time, "validAfterTime", &key.name)?;
        let expires_on = key
            .valid_before_time
            .as_deref()
            .map(|t| parse_time(t, "validBeforeTime", &key.name))
            .transpose()?;

        Ok(ServiceAccountKey {
            name: short_name(&key.name).to_string(),
            full_name: key.name,
            key_type,
            created_on,
            expires_on,
            disabled: key.disabled,
        })
    }
}

/// Decode `privateKeyData` (base64 of a credentials JSON file).
fn decode_credential(private_key_data: &str) -> Result<Credential, ProviderError> {
    let decoded = Zeroizing::new(
        STANDARD
            .decode(private_key_data.trim())
            .map_err(|e| ProviderError::Encoding(format!("failed to decode key data: {}", e)))?,
    );
    serde_json::from_slice(&decoded)
        .map_err(|e| ProviderError::Encoding(format!("key data is not a credentials file: {}", e)))
}

#[async_trait::async_trait]
impl KeyStore for IamKeyStore {
    fn account(&self) -> &str {
        &self.account
    }

    async fn list_active_keys(&self) -> Result<Vec<ServiceAccountKey>, ProviderError> {
        let url = self.keys_url();
        debug!("Listing keys at: {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("keyTypes", "USER_MANAGED")])
            .send()
            .await?;
        let listed: ListKeysResponse = check_response(response).await?.json().await?;

        let keys = listed
            .keys
            .into_iter()
            .filter(|k| k.key_type == "USER_MANAGED")
            .map(ServiceAccountKey::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        debug!("{} has {} user-managed key(s)", self.account, keys.len());
        Ok(keys)
    }

    async fn create_key(&self) -> Result<CreatedKey, ProviderError> {
        let url = self.keys_url();
        debug!("Creating key at: {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&json!({
                "privateKeyType": "TYPE_GOOGLE_CREDENTIALS_FILE",
                "keyAlgorithm": "KEY_ALG_RSA_2048",
            }))
            .send()
            .await?;
        let created: CreateKeyResponse = check_response(response).await?.json().await?;
        let private_key_data = Zeroizing::new(created.private_key_data);

        let credential = decode_credential(&private_key_data)?;
        info!("Created key {}", short_name(&created.name));

        Ok(CreatedKey {
            full_name: created.name,
            credential,
        })
    }

    async fn delete_key(&self, full_name: &str) -> Result<(), ProviderError> {
        let url = format!("{}/v1/{}", self.endpoint, full_name);
        debug!("Deleting key at: {}", url);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        check_response(response).await?;

        info!("Deleted key {}", short_name(full_name));
        Ok(())
    }
}

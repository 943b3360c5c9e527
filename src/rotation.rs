//! Key rotation state machine
//!
//! Inspect → Create → Publish → Retire → Done. The old key is only deleted
//! after every destination holds the new one; any earlier failure leaves the
//! old key in place.

use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{ConfigError, RotationError};
use crate::keystore::{CreatedKey, KeyStore, ServiceAccountKey};
use crate::sinks::Destination;

/// Path chosen after inspecting the account's active keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationPlan {
    /// No user-managed key yet: create one, nothing to retire
    CreateOnly,
    /// Exactly one key: replace it
    CreateThenRetire { retiring: ServiceAccountKey },
}

/// What happened to the previous key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetireOutcome {
    NotNeeded,
    Retired { key: String },
    /// Deletion failed; the key is still active and must be removed manually
    Failed { key: String, error: String },
}

/// Result of a successful rotation.
#[derive(Debug, Clone)]
pub struct RotationReport {
    pub account: String,
    /// Short id of the new key
    pub created_key: String,
    /// Destinations holding the new key, in publish order
    pub published: Vec<String>,
    pub retire: RetireOutcome,
}

impl RotationReport {
    pub fn keys_created(&self) -> usize {
        1
    }

    pub fn keys_deleted(&self) -> usize {
        match self.retire {
            RetireOutcome::Retired { .. } => 1,
            _ => 0,
        }
    }

    pub fn retire_failed(&self) -> bool {
        matches!(self.retire, RetireOutcome::Failed { .. })
    }
}

/// Rotates the key of the service account its [`KeyStore`] is bound to.
pub struct RotationEngine {
    key_store: Box<dyn KeyStore>,
    destinations: Vec<Destination>,
}

impl RotationEngine {
    /// `destinations` are written in order and must not be empty.
    pub fn new(
        key_store: Box<dyn KeyStore>,
        destinations: Vec<Destination>,
    ) -> Result<Self, ConfigError> {
        if destinations.is_empty() {
            return Err(ConfigError(
                "at least one secret destination is required".to_string(),
            ));
        }
        Ok(Self {
            key_store,
            destinations,
        })
    }

    pub fn account(&self) -> &str {
        self.key_store.account()
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Inspect the account and decide the rotation path without mutating anything.
    pub async fn plan(&self) -> Result<RotationPlan, RotationError> {
        let account = self.account().to_string();
        let mut keys = self
            .key_store
            .list_active_keys()
            .await
            .map_err(|source| RotationError::Inspect {
                account: account.clone(),
                source,
            })?;

        match keys.len() {
            0 => Ok(RotationPlan::CreateOnly),
            1 => Ok(RotationPlan::CreateThenRetire {
                retiring: keys.remove(0),
            }),
            _ => Err(RotationError::ConflictingState {
                account,
                keys: keys.into_iter().map(|k| k.name).collect(),
            }),
        }
    }

    /// Run one rotation attempt.
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        let account = self.account().to_string();
        info!("Rotating key for {}", account);

        let plan = self.plan().await?;
        match &plan {
            RotationPlan::CreateOnly => info!("No user-managed key found, creating the first one"),
            RotationPlan::CreateThenRetire { retiring } => info!(
                "Replacing key {} (created {})",
                retiring.name,
                retiring.created_on.to_rfc3339()
            ),
        }

        let created = self
            .key_store
            .create_key()
            .await
            .map_err(|source| RotationError::Create {
                account: account.clone(),
                source,
            })?;
        info!("New key {} created", created.name());

        let published = self.publish(&created).await?;

        let retire = match plan {
            RotationPlan::CreateOnly => RetireOutcome::NotNeeded,
            RotationPlan::CreateThenRetire { retiring } => {
                match self.key_store.delete_key(&retiring.full_name).await {
                    Ok(()) => {
                        info!("Old key {} retired", retiring.name);
                        RetireOutcome::Retired { key: retiring.name }
                    }
                    Err(e) => {
                        warn!(
                            "Failed to retire old key {}: {}. Delete it manually; the next run will refuse to rotate while both keys exist",
                            retiring.name, e
                        );
                        RetireOutcome::Failed {
                            key: retiring.name,
                            error: e.to_string(),
                        }
                    }
                }
            }
        };

        info!("Rotation of {} complete", account);
        Ok(RotationReport {
            account,
            created_key: created.name().to_string(),
            published,
            retire,
        })
    }

    /// Write the new credential to every destination, stopping at the first failure.
    async fn publish(&self, created: &CreatedKey) -> Result<Vec<String>, RotationError> {
        let value = Zeroizing::new(serde_json::to_vec(&created.credential).map_err(|source| {
            RotationError::Serialize {
                key: created.name().to_string(),
                source,
            }
        })?);

        let mut published = Vec::with_capacity(self.destinations.len());
        for (i, destination) in self.destinations.iter().enumerate() {
            let label = destination.label();
            if let Err(source) = destination.sink.put(&destination.secret_name, &value).await {
                return Err(RotationError::PartialPublish {
                    new_key: created.name().to_string(),
                    published,
                    failed: label,
                    skipped: self.destinations[i + 1..].iter().map(Destination::label).collect(),
                    source,
                });
            }
            info!("Published key {} to {}", created.name(), label);
            published.push(label);
        }
        Ok(published)
    }
}

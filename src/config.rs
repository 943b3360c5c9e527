use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iam.googleapis.com";
pub const DEFAULT_SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com";
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service_account: ServiceAccountConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub gcp: GcpConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAccountConfig {
    /// Account id (`deployer`) or full email
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_id: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub secret_names: Vec<String>,
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    /// Secret Manager secret to publish to; the sink is skipped when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Bearer token for IAM and Secret Manager; the metadata server is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_iam_endpoint")]
    pub iam_endpoint: String,
    #[serde(default = "default_secret_manager_endpoint")]
    pub secret_manager_endpoint: String,
    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_github_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}

fn default_iam_endpoint() -> String {
    DEFAULT_IAM_ENDPOINT.to_string()
}

fn default_secret_manager_endpoint() -> String {
    DEFAULT_SECRET_MANAGER_ENDPOINT.to_string()
}

fn default_metadata_endpoint() -> String {
    DEFAULT_METADATA_ENDPOINT.to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            token: String::new(),
            secret_names: Vec::new(),
            api_url: default_github_api_url(),
        }
    }
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            secret_name: None,
            access_token: None,
            iam_endpoint: default_iam_endpoint(),
            secret_manager_endpoint: default_secret_manager_endpoint(),
            metadata_endpoint: default_metadata_endpoint(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl fmt::Debug for GithubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &"[REDACTED]")
            .field("secret_names", &self.secret_names)
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl fmt::Debug for GcpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpConfig")
            .field("secret_name", &self.secret_name)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("iam_endpoint", &self.iam_endpoint)
            .field("secret_manager_endpoint", &self.secret_manager_endpoint)
            .field("metadata_endpoint", &self.metadata_endpoint)
            .finish()
    }
}

impl ServiceAccountConfig {
    /// Full service account email; a configured name containing `@` is taken as-is.
    pub fn email(&self) -> String {
        if self.name.contains('@') {
            self.name.clone()
        } else {
            format!("{}@{}.iam.gserviceaccount.com", self.name, self.project_id)
        }
    }
}

/// Split a comma separated list, dropping blanks.
pub fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_github_secret_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !name.to_ascii_uppercase().starts_with("GITHUB_")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_secret_manager_id(name: &str) -> bool {
    (1..=255).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Overlay every variable that is set and non-empty.
    ///
    /// Variable names follow the GitHub Action input convention so the binary
    /// can run as an action step unchanged.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("INPUT_SERVICE_ACCOUNT_NAME") {
            self.service_account.name = v;
        }
        if let Some(v) = var("INPUT_PROJECT_ID") {
            self.service_account.project_id = v;
        }
        if let Some(v) = var("INPUT_OWNER") {
            self.github.owner = v;
        }
        if let Some(v) = var("INPUT_REPO") {
            self.github.repo = v;
        }
        if let Some(v) = var("INPUT_TOKEN") {
            self.github.token = v;
        }
        if let Some(v) = var("INPUT_GITHUB_SECRET_KEY_NAME") {
            self.github.secret_names = split_names(&v);
        }
        if let Some(v) = var("GITHUB_API_URL") {
            self.github.api_url = v;
        }
        if let Some(v) = var("INPUT_GCP_SECRET_KEY_NAME") {
            self.gcp.secret_name = Some(v);
        }
        if let Some(v) = var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            self.gcp.access_token = Some(v);
        }
        if let Some(v) = var("SAKR_HTTP_TIMEOUT_SECS") {
            self.http.timeout_seconds = v.trim().parse().map_err(|_| {
                ConfigError(format!(
                    "SAKR_HTTP_TIMEOUT_SECS must be a whole number of seconds, got {:?}",
                    v
                ))
            })?;
        }
        Ok(())
    }

    /// Check that every setting needed for a rotation is present.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.check(true, true)
    }

    /// Check only what listing keys needs.
    pub fn validate_service_account(&self) -> std::result::Result<(), ConfigError> {
        self.check(true, false)
    }

    /// Check only what talking to the repository needs.
    pub fn validate_github(&self) -> std::result::Result<(), ConfigError> {
        self.check(false, true)
    }

    fn check(&self, service_account: bool, github: bool) -> std::result::Result<(), ConfigError> {
        let mut missing = Vec::new();
        if service_account {
            if self.service_account.name.trim().is_empty() {
                missing.push("service_account.name (INPUT_SERVICE_ACCOUNT_NAME)");
            }
            if self.service_account.project_id.trim().is_empty() {
                missing.push("service_account.project_id (INPUT_PROJECT_ID)");
            }
        }
        if github {
            if self.github.owner.trim().is_empty() {
                missing.push("github.owner (INPUT_OWNER)");
            }
            if self.github.repo.trim().is_empty() {
                missing.push("github.repo (INPUT_REPO)");
            }
            if self.github.token.trim().is_empty() {
                missing.push("github.token (INPUT_TOKEN)");
            }
            if service_account && self.github.secret_names.is_empty() {
                missing.push("github.secret_names (INPUT_GITHUB_SECRET_KEY_NAME)");
            }
        }
        if !missing.is_empty() {
            return Err(ConfigError(format!("missing {}", missing.join(", "))));
        }

        if self.http.timeout_seconds == 0 {
            return Err(ConfigError("http.timeout_seconds must be positive".to_string()));
        }
        if github {
            if let Some(bad) = self.github.secret_names.iter().find(|n| !is_github_secret_name(n)) {
                return Err(ConfigError(format!(
                    "'{}' is not a valid GitHub secret name (letters, digits and underscores; not starting with a digit or GITHUB_)",
                    bad
                )));
            }
        }
        if let Some(ref name) = self.gcp.secret_name {
            if !is_secret_manager_id(name) {
                return Err(ConfigError(format!(
                    "'{}' is not a valid Secret Manager secret id (1-255 letters, digits, '-' or '_')",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let sample = Self {
            service_account: ServiceAccountConfig {
                name: "deployer".to_string(),
                project_id: "my-project".to_string(),
            },
            github: GithubConfig {
                owner: "my-org".to_string(),
                repo: "my-repo".to_string(),
                token: "your-github-token-here".to_string(),
                secret_names: vec!["GCP_SA_KEY".to_string()],
                api_url: default_github_api_url(),
            },
            gcp: GcpConfig {
                secret_name: Some("deployer-key".to_string()),
                ..GcpConfig::default()
            },
            http: HttpConfig::default(),
        };

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}

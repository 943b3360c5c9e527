//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing, builds the collaborators
//! from configuration and routes commands to the appropriate handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{split_names, Config};
use crate::error::{ConfigError, RetireFailedError};
use crate::gcp_auth;
use crate::keystore::{IamKeyStore, KeyStore};
use crate::rotation::{RetireOutcome, RotationEngine, RotationPlan, RotationReport};
use crate::sinks::{Destination, GithubSecretSink, SecretManagerSink, SecretSink};

#[derive(Parser)]
#[command(name = "sakr")]
#[command(about = "Rotate a GCP service account key and publish it to GitHub Actions and Secret Manager", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "SAKR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Service account name or email (overrides config and environment)
    #[arg(long)]
    pub service_account: Option<String>,

    /// GCP project id (overrides config and environment)
    #[arg(long)]
    pub project_id: Option<String>,

    /// GitHub repository owner (overrides config and environment)
    #[arg(long)]
    pub owner: Option<String>,

    /// GitHub repository name (overrides config and environment)
    #[arg(long)]
    pub repo: Option<String>,

    /// GitHub secret name(s) to publish to, comma separated
    #[arg(long)]
    pub github_secret: Option<String>,

    /// Secret Manager secret to publish to
    #[arg(long)]
    pub gcp_secret: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "sakr.toml")]
        output: PathBuf,
    },

    /// Rotate the service account key and publish the new one
    Rotate {
        /// Only inspect the account and show what would happen
        #[arg(long)]
        dry_run: bool,

        /// Exit non-zero when the old key could not be deleted
        #[arg(long)]
        fail_on_retire_error: bool,
    },

    /// List the service account's active user-managed keys
    Keys,

    /// List the repository's Actions secrets
    Secrets,
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    // Handle init command separately as it doesn't need configuration
    if let Commands::Init { output } = cli.command {
        Config::create_sample(&output)
            .with_context(|| format!("Failed to create sample config at {:?}", output))?;
        info!("Sample configuration created at {:?}", output);
        return Ok(());
    }

    let config = load_config(&cli)?;
    let client = create_http_client(&config)?;

    match cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above

        Commands::Rotate {
            dry_run,
            fail_on_retire_error,
        } => {
            config.validate()?;
            let gcp_token = resolve_gcp_token(&config, &client).await?;
            let key_store = create_key_store(&config, &client, gcp_token.clone())?;
            let destinations = create_destinations(&config, &client, &gcp_token).await?;
            let engine = RotationEngine::new(key_store, destinations)?;

            if dry_run {
                let plan = engine.plan().await?;
                print_plan(&engine, &plan);
                return Ok(());
            }

            let report = engine.rotate().await?;
            print_report(&report);

            if let RetireOutcome::Failed { key, error } = report.retire {
                if fail_on_retire_error {
                    return Err(RetireFailedError { key, error }.into());
                }
            }
        }

        Commands::Keys => {
            config.validate_service_account()?;
            let gcp_token = resolve_gcp_token(&config, &client).await?;
            let key_store = create_key_store(&config, &client, gcp_token)?;
            let keys = key_store
                .list_active_keys()
                .await
                .context("Failed to list keys")?;

            if keys.is_empty() {
                println!("No user-managed keys for {}", key_store.account());
            } else {
                println!("User-managed keys for {}:", key_store.account());
                for key in keys {
                    let expiry = key
                        .expires_on
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "  - {} (created {}, expires {}{})",
                        key.name,
                        key.created_on.to_rfc3339(),
                        expiry,
                        if key.disabled { ", disabled" } else { "" }
                    );
                }
            }
        }

        Commands::Secrets => {
            config.validate_github()?;
            let github = create_github_sink(&config, &client).await?;
            let secrets = github
                .list_secrets()
                .await
                .context("Failed to list repository secrets")?;

            if secrets.is_empty() {
                println!("No secrets in {}/{}", config.github.owner, config.github.repo);
            } else {
                println!("Secrets in {}/{}:", config.github.owner, config.github.repo);
                for secret in secrets {
                    println!(
                        "  - {} (updated {})",
                        secret.name,
                        secret.updated_at.to_rfc3339()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Merge file, environment and flags, later sources winning
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(config_path)
            .map_err(|e| ConfigError(format!("{:#}", e)))
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::default()
    };
    config.apply_env_with(|key| std::env::var(key).ok())?;

    // Override with CLI arguments if provided
    if let Some(ref name) = cli.service_account {
        config.service_account.name = name.clone();
    }
    if let Some(ref project_id) = cli.project_id {
        config.service_account.project_id = project_id.clone();
    }
    if let Some(ref owner) = cli.owner {
        config.github.owner = owner.clone();
    }
    if let Some(ref repo) = cli.repo {
        config.github.repo = repo.clone();
    }
    if let Some(ref names) = cli.github_secret {
        config.github.secret_names = split_names(names);
    }
    if let Some(ref name) = cli.gcp_secret {
        config.gcp.secret_name = Some(name.clone());
    }

    Ok(config)
}

fn create_http_client(config: &Config) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.http.timeout_seconds))
        .user_agent(concat!("sakr/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

/// Resolve the GCP bearer token once per run; IAM and Secret Manager share it
async fn resolve_gcp_token(config: &Config, client: &Client) -> Result<String> {
    gcp_auth::resolve_access_token(
        client,
        config.gcp.access_token.as_deref(),
        &config.gcp.metadata_endpoint,
    )
    .await
    .context("Failed to obtain GCP access token")
}

/// Create the IAM key store for the configured service account
fn create_key_store(config: &Config, client: &Client, token: String) -> Result<Box<dyn KeyStore>> {
    let store = IamKeyStore::new(
        client.clone(),
        &config.gcp.iam_endpoint,
        token,
        config.service_account.email(),
    )
    .context("Failed to create IAM key store")?;

    Ok(Box::new(store))
}

async fn create_github_sink(config: &Config, client: &Client) -> Result<GithubSecretSink> {
    GithubSecretSink::connect(
        client.clone(),
        &config.github.api_url,
        &config.github.owner,
        &config.github.repo,
        &config.github.token,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to connect to GitHub repository {}/{}",
            config.github.owner, config.github.repo
        )
    })
}

/// Build the ordered publish destinations: GitHub secrets first, then Secret Manager
async fn create_destinations(
    config: &Config,
    client: &Client,
    gcp_token: &str,
) -> Result<Vec<Destination>> {
    let github: Arc<dyn SecretSink> = Arc::new(create_github_sink(config, client).await?);
    let mut destinations: Vec<Destination> = config
        .github
        .secret_names
        .iter()
        .map(|name| Destination::new(github.clone(), name.clone()))
        .collect();

    if let Some(ref secret_name) = config.gcp.secret_name {
        let secret_manager = SecretManagerSink::new(
            client.clone(),
            &config.gcp.secret_manager_endpoint,
            &config.service_account.project_id,
            gcp_token.to_string(),
        );
        destinations.push(Destination::new(Arc::new(secret_manager), secret_name.clone()));
    } else {
        info!("No Secret Manager secret configured, skipping that destination");
    }

    Ok(destinations)
}

fn print_plan(engine: &RotationEngine, plan: &RotationPlan) {
    println!("[DRY RUN] Service account: {}", engine.account());
    match plan {
        RotationPlan::CreateOnly => {
            println!("[DRY RUN] No user-managed key exists; would create the first one")
        }
        RotationPlan::CreateThenRetire { retiring } => println!(
            "[DRY RUN] Would create a new key, then retire {} (created {})",
            retiring.name,
            retiring.created_on.to_rfc3339()
        ),
    }
    for destination in engine.destinations() {
        println!("[DRY RUN] Would publish to {}", destination.label());
    }
}

fn print_report(report: &RotationReport) {
    println!("Rotated key for {}", report.account);
    println!(
        "  Keys created: {}, deleted: {}",
        report.keys_created(),
        report.keys_deleted()
    );
    println!("  New key: {}", report.created_key);
    for destination in &report.published {
        println!("  ✓ Published to {}", destination);
    }
    match &report.retire {
        RetireOutcome::NotNeeded => println!("  No previous key to retire"),
        RetireOutcome::Retired { key } => println!("  ✓ Retired old key {}", key),
        RetireOutcome::Failed { key, error } => {
            eprintln!(
                "  ⚠ Old key {} is still active and must be deleted manually: {}",
                key, error
            );
            eprintln!("  ⚠ The next rotation will refuse to run until it is removed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotate_flags() {
        let cli = Cli::try_parse_from([
            "sakr",
            "--service-account",
            "deployer",
            "--github-secret",
            "A,B",
            "rotate",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.service_account.as_deref(), Some("deployer"));
        assert!(matches!(
            cli.command,
            Commands::Rotate {
                dry_run: true,
                fail_on_retire_error: false
            }
        ));
    }

    #[test]
    fn test_cli_overrides_win() {
        let cli = Cli::try_parse_from([
            "sakr",
            "--owner",
            "acme",
            "--repo",
            "infra",
            "--github-secret",
            "GCP_SA_KEY, GOOGLE_CREDENTIALS",
            "--gcp-secret",
            "deployer-key",
            "keys",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.github.owner, "acme");
        assert_eq!(config.github.repo, "infra");
        assert_eq!(
            config.github.secret_names,
            vec!["GCP_SA_KEY", "GOOGLE_CREDENTIALS"]
        );
        assert_eq!(config.gcp.secret_name.as_deref(), Some("deployer-key"));
    }

    #[tokio::test]
    async fn test_rotate_collaborators_share_one_gcp_token() {
        let mut server = mockito::Server::new_async().await;
        let metadata = server
            .mock("GET", "/computeMetadata/v1/instance/service-accounts/default/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.meta","expires_in":3599}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/acme/infra/actions/secrets/public-key")
            .with_status(200)
            .with_body(r#"{"key_id":"kid-1","key":"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/projects/my-project/secrets/sa-key")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let add_version = server
            .mock("POST", "/v1/projects/my-project/secrets/sa-key:addVersion")
            .match_header("authorization", "Bearer ya29.meta")
            .with_status(200)
            .with_body(r#"{"name":"projects/123/secrets/sa-key/versions/1"}"#)
            .create_async()
            .await;

        let mut config = Config::default();
        config.service_account.name = "deployer".to_string();
        config.service_account.project_id = "my-project".to_string();
        config.github.owner = "acme".to_string();
        config.github.repo = "infra".to_string();
        config.github.token = "ghp_x".to_string();
        config.github.secret_names = vec!["GCP_SA_KEY".to_string()];
        config.github.api_url = server.url();
        config.gcp.secret_name = Some("sa-key".to_string());
        config.gcp.access_token = None;
        config.gcp.metadata_endpoint = server.url();
        config.gcp.secret_manager_endpoint = server.url();
        config.gcp.iam_endpoint = server.url();

        let client = create_http_client(&config).unwrap();
        let gcp_token = resolve_gcp_token(&config, &client).await.unwrap();
        let key_store = create_key_store(&config, &client, gcp_token.clone()).unwrap();
        let destinations = create_destinations(&config, &client, &gcp_token).await.unwrap();

        assert_eq!(key_store.account(), "deployer@my-project.iam.gserviceaccount.com");
        assert_eq!(destinations.len(), 2);
        destinations[1].sink.put("sa-key", b"{}").await.unwrap();

        metadata.assert_async().await;
        add_version.assert_async().await;
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let cli = Cli::try_parse_from(["sakr", "--config", "/nonexistent/sakr.toml", "rotate"])
            .unwrap();
        let err = load_config(&cli).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), crate::error::exit_code::CONFIG);
    }
}

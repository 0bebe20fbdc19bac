//! vaultgate command line
//!
//! Drives the unlock flow against a data directory on this machine. Platform
//! keys live in the OS keyring; the "biometric" prompt is a terminal
//! confirmation. Key material is never printed, only fingerprints.

mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing::info;
use vaultgate_core::security::Argon2Params;
use vaultgate_core::storage::{StorageLayout, SystemClock, VaultTimeout};
use vaultgate_core::vault::UserFeedback;
use vaultgate_core::{AppState, UserSecrets, VaultError};
use vaultgate_keystore::{KeyCustodian, KeyringCustodian, DEFAULT_SERVICE_NAME};

use console::ConsoleVerifier;

/// Local vault unlock
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding credentials, policy and session files
    #[arg(long, default_value = ".vaultgate")]
    data_dir: PathBuf,

    /// Keyring service name for platform keys
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the account (replaces any existing one)
    Init {
        identity: String,
        #[arg(long)]
        password: Option<String>,
        /// Argon2 memory cost in KiB
        #[arg(long, default_value = "19456")]
        memory: u32,
        #[arg(long, default_value = "2")]
        iterations: u32,
        #[arg(long, default_value = "1")]
        parallelism: u32,
        /// Argon2 version (16 or 19)
        #[arg(long, default_value = "19")]
        argon2_version: u32,
    },
    /// Unlock with the password, or with the presence prompt
    Unlock {
        #[arg(long)]
        password: Option<String>,
        #[arg(long, conflicts_with = "password")]
        biometric: bool,
    },
    /// Show vault status and policy
    Status,
    /// Forget the session secrets
    Lock,
    /// Set the session timeout: "instant", "never" or a number of seconds
    Timeout { value: String },
    /// Turn biometric unlock on or off
    Biometric {
        #[command(subcommand)]
        action: BiometricAction,
    },
    /// Re-encrypt the vault key under a new password
    ChangePassword {
        #[arg(long)]
        old: Option<String>,
        #[arg(long)]
        new: Option<String>,
    },
    /// Remove the account and all session data
    Logout,
}

#[derive(Subcommand, Debug)]
enum BiometricAction {
    Enable {
        #[arg(long)]
        password: Option<String>,
    },
    Disable,
}

fn parse_timeout(value: &str) -> Result<VaultTimeout> {
    match value {
        "instant" => Ok(VaultTimeout::Instant),
        "never" => Ok(VaultTimeout::Never),
        seconds => {
            let seconds: u64 = seconds
                .parse()
                .with_context(|| format!("Invalid timeout: {}", value))?;
            Ok(VaultTimeout::seconds(seconds))
        }
    }
}

fn random_key_pair() -> UserSecrets {
    let mut private_key = [0u8; 32];
    let mut secret_key = [0u8; 32];
    rand::rng().fill_bytes(&mut private_key);
    rand::rng().fill_bytes(&mut secret_key);
    UserSecrets::from_bytes(&private_key, &secret_key)
}

/// Turn a gate error into what the user should see.
fn report(err: VaultError) -> anyhow::Error {
    match err.user_feedback() {
        UserFeedback::Message => anyhow::anyhow!("{}", err),
        UserFeedback::GenericRetry => {
            anyhow::anyhow!("Something went wrong, try again ({})", err.code())
        }
        UserFeedback::Silent => anyhow::anyhow!("Unlock did not complete ({})", err.code()),
    }
}

async fn unlock_with_password(app: &AppState, password: Option<String>) -> Result<String> {
    let password = console::password(password, "Password").await?;
    let gate = app.gate().await.map_err(report)?;
    match gate.unlock_with_password(&password).await.map_err(report)? {
        Some(outcome) => Ok(outcome.encryption_key.fingerprint()),
        None => bail!("Unlock did not complete"),
    }
}

async fn run(args: Args) -> Result<()> {
    let layout = StorageLayout::init(&args.data_dir)
        .await
        .with_context(|| format!("Failed to open data directory {:?}", args.data_dir))?;
    let custodian: Arc<dyn KeyCustodian> =
        Arc::new(KeyringCustodian::new(args.service.clone(), Arc::new(ConsoleVerifier)));

    let availability = custodian.check_availability().await?;
    if !availability.available {
        bail!(
            "Secure storage unavailable: {}",
            availability.unavailable_reason.unwrap_or_default()
        );
    }

    let app = AppState::initialize(layout, custodian, Arc::new(SystemClock))
        .await
        .context("Failed to initialize vault state")?;

    match args.command {
        Command::Init {
            identity,
            password,
            memory,
            iterations,
            parallelism,
            argon2_version,
        } => {
            let password = console::new_password(password, "New password").await?;
            let params = Argon2Params {
                memory,
                iterations,
                parallelism,
                version: argon2_version,
            };
            let key = app
                .provision(&identity, &password, params, Some(random_key_pair()))
                .await
                .map_err(report)?;
            println!("Provisioned {} (key {})", identity, key.fingerprint());
        }
        Command::Unlock {
            password,
            biometric,
        } => {
            let fingerprint = if biometric {
                let gate = app.gate().await.map_err(report)?;
                match gate.unlock_with_biometric().await.map_err(report)? {
                    Some(outcome) => outcome.encryption_key.fingerprint(),
                    None => bail!("Presence not confirmed"),
                }
            } else {
                unlock_with_password(&app, password).await?
            };
            println!("Unlocked (key {})", fingerprint);
        }
        Command::Status => {
            let status = app.vault_status().await.map_err(report)?;
            let policy = app.secrets.read_policy().await?;
            println!("status:    {}", status);
            println!("timeout:   {}", policy.timeout);
            if let VaultTimeout::Seconds(_) = policy.timeout {
                if let Some(at) = Utc.timestamp_millis_opt(policy.expires_at).single() {
                    println!("expires:   {}", at.to_rfc3339());
                }
            }
            if let Ok(gate) = app.gate().await {
                let credentials = gate.credentials().await;
                println!("identity:  {}", credentials.identity);
                println!(
                    "biometric: {}",
                    if credentials.biometric_material().is_some() {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
                println!("argon2:    {}", serde_json::to_string(&credentials.argon2)?);
            }
        }
        Command::Lock => {
            app.lock().await.map_err(report)?;
            println!("Locked");
        }
        Command::Timeout { value } => {
            let timeout = parse_timeout(&value)?;
            app.set_vault_timeout(timeout).await.map_err(report)?;
            println!("Timeout set to {}", timeout);
        }
        Command::Biometric { action } => match action {
            BiometricAction::Enable { password } => {
                let password = console::password(password, "Password").await?;
                let gate = app.gate().await.map_err(report)?;
                let outcome = gate
                    .unlock_with_password(&password)
                    .await
                    .map_err(report)?
                    .context("Unlock did not complete")?;
                gate.enable_biometric(&outcome.encryption_key)
                    .await
                    .map_err(report)?;
                println!("Biometric unlock enabled");
            }
            BiometricAction::Disable => {
                let gate = app.gate().await.map_err(report)?;
                gate.disable_biometric().await.map_err(report)?;
                println!("Biometric unlock disabled");
            }
        },
        Command::ChangePassword { old, new } => {
            let old = console::password(old, "Current password").await?;
            let new = console::new_password(new, "New password").await?;
            let gate = app.gate().await.map_err(report)?;
            let params = gate.credentials().await.argon2;
            gate.change_password(&old, &new, params)
                .await
                .map_err(report)?;
            println!("Password changed");
        }
        Command::Logout => {
            app.logout().await.map_err(report)?;
            println!("Logged out");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    vaultgate_core::init_tracing();

    let args = Args::parse();
    info!("Data directory: {:?}", args.data_dir);
    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("instant").unwrap(), VaultTimeout::Instant);
        assert_eq!(parse_timeout("never").unwrap(), VaultTimeout::Never);
        assert_eq!(parse_timeout("0").unwrap(), VaultTimeout::Instant);
        assert_eq!(parse_timeout("300").unwrap(), VaultTimeout::Seconds(300));
        assert!(parse_timeout("soon").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args =
            Args::parse_from(["vaultgate", "--data-dir", "/tmp/v", "unlock", "--biometric"]);
        assert_eq!(args.data_dir, PathBuf::from("/tmp/v"));
        assert!(matches!(
            args.command,
            Command::Unlock {
                biometric: true,
                password: None
            }
        ));
    }

    #[test]
    fn test_report_hides_details_except_invalid_credentials() {
        assert_eq!(
            report(VaultError::InvalidCredentials).to_string(),
            "Invalid credentials"
        );
        assert!(report(VaultError::KeyInvalidated)
            .to_string()
            .contains("KEY_INVALIDATED"));
    }
}

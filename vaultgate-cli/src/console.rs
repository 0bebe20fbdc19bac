//! Terminal stand-ins for the biometric prompt and password field.
//!
//! Passwords are read without echo; the presence question is a plain line.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use vaultgate_keystore::{PresenceResult, PresenceVerifier, Prompt, PromptPurpose};

/// Asks on the terminal whether the user is present.
pub struct ConsoleVerifier;

fn read_line(question: String) -> std::io::Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{}", question)?;
    stderr.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[async_trait]
impl PresenceVerifier for ConsoleVerifier {
    async fn verify(&self, prompt: &Prompt) -> PresenceResult {
        let action = match prompt.purpose {
            PromptPurpose::Unlock => "unlock the vault",
            PromptPurpose::Enroll => "enable biometric unlock",
        };
        let question = format!("Confirm presence to {} [y/N]: ", action);

        match tokio::task::spawn_blocking(move || read_line(question)).await {
            Ok(Ok(answer)) if answer.eq_ignore_ascii_case("y") => PresenceResult::Verified,
            Ok(Ok(answer)) if answer.is_empty() => PresenceResult::Cancelled,
            Ok(Ok(_)) => PresenceResult::Rejected,
            Ok(Err(e)) => PresenceResult::Unavailable(e.to_string()),
            Err(e) => PresenceResult::Unavailable(e.to_string()),
        }
    }
}

fn prompt_hidden(label: &str) -> std::io::Result<String> {
    rpassword::prompt_password(format!("{}: ", label))
}

async fn read_hidden(label: &str) -> Result<String> {
    let label = label.to_string();
    let password = tokio::task::spawn_blocking(move || prompt_hidden(&label))
        .await
        .context("Password prompt task failed")?
        .context("Failed to read password")?;
    Ok(password)
}

fn non_empty(password: String, label: &str) -> Result<String> {
    if password.is_empty() {
        bail!("{} must not be empty", label);
    }
    Ok(password)
}

fn confirmed(first: String, second: String, label: &str) -> Result<String> {
    if first != second {
        bail!("{} entries do not match", label);
    }
    non_empty(first, label)
}

/// Use `given` if present, otherwise ask for it on the terminal without echo.
pub async fn password(given: Option<String>, label: &str) -> Result<String> {
    if let Some(password) = given {
        return Ok(password);
    }
    non_empty(read_hidden(label).await?, label)
}

/// Like [`password`], but a typed password has to be entered twice.
pub async fn new_password(given: Option<String>, label: &str) -> Result<String> {
    if let Some(password) = given {
        return Ok(password);
    }
    let first = read_hidden(label).await?;
    let second = read_hidden(&format!("Confirm {}", label.to_lowercase())).await?;
    confirmed(first, second, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_given_password_skips_the_prompt() {
        assert_eq!(
            password(Some("hunter2".into()), "Password").await.unwrap(),
            "hunter2"
        );
        assert_eq!(
            new_password(Some("hunter2".into()), "New password")
                .await
                .unwrap(),
            "hunter2"
        );
    }

    #[test]
    fn test_confirmation_must_match() {
        assert_eq!(
            confirmed("abc".into(), "abc".into(), "New password").unwrap(),
            "abc"
        );
        assert!(confirmed("abc".into(), "abd".into(), "New password").is_err());
        assert!(confirmed(String::new(), String::new(), "New password").is_err());
    }
}

use serde::{Deserialize, Serialize};

use super::policy::{TimeoutSentinels, VaultTimeout};
use super::{read_optional, write_private, StorageLayout};
use crate::error::Result;

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Timeout used until the user picks one.
    pub default_timeout: VaultTimeout,
    pub timeout_sentinels: TimeoutSentinels,
    /// Start the biometric prompt as soon as the gate is shown.
    pub biometric_auto_trigger: bool,
    pub biometric_key_alias: String,
    /// Alias of the platform key protecting `secrets.enc.json`.
    pub storage_key_alias: String,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            default_timeout: VaultTimeout::Seconds(15 * 60),
            timeout_sentinels: TimeoutSentinels::default(),
            biometric_auto_trigger: true,
            biometric_key_alias: "vaultgate.encryption-key".to_string(),
            storage_key_alias: "vaultgate.datastore".to_string(),
        }
    }
}

pub async fn load_settings(layout: &StorageLayout) -> Result<GateSettings> {
    let settings = match read_optional(&layout.file(SETTINGS_FILE)).await? {
        Some(content) => serde_json::from_slice::<GateSettings>(&content)?,
        None => GateSettings::default(),
    };
    settings.timeout_sentinels.validate()?;
    Ok(settings)
}

pub async fn save_settings(layout: &StorageLayout, settings: &GateSettings) -> Result<()> {
    settings.timeout_sentinels.validate()?;
    let content = serde_json::to_vec_pretty(settings)?;
    write_private(&layout.file(SETTINGS_FILE), &content).await
}

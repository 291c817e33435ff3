use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One entry of the identity store. Passwords are kept as
/// `sha256(salt || password)` hex, never in the clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: String,
    pub password_salt: String,
    pub password_sha256: String,
    #[serde(default)]
    pub profile_image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailSettings {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub from_address: String,
    pub recipient: String,
    #[serde(default)]
    pub cc: Option<String>,
    #[serde(default = "default_attachment_name")]
    pub attachment_name: String,
}

/// Provider-facing style knobs. The candidate count is the "mode" switch:
/// one preview image or a four-up choice grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleSettings {
    pub model_id: String,
    #[serde(default = "default_preset_style")]
    pub preset_style: String,
    #[serde(default = "default_true")]
    pub photo_real: bool,
    #[serde(default = "default_photo_real_version")]
    pub photo_real_version: String,
    #[serde(default = "default_true")]
    pub alchemy: bool,
    #[serde(default = "default_true")]
    pub enhance_prompt: bool,
    #[serde(default = "default_candidate_count")]
    pub candidate_count: u8,
    #[serde(default = "default_reference_strength")]
    pub reference_strength: String,
}

impl Default for StyleSettings {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            preset_style: default_preset_style(),
            photo_real: true,
            photo_real_version: default_photo_real_version(),
            alchemy: true,
            enhance_prompt: true,
            candidate_count: default_candidate_count(),
            reference_strength: default_reference_strength(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationSettings {
    #[serde(default = "default_translation_model")]
    pub model: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            model: default_translation_model(),
            target_language: default_target_language(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            timeout_secs: default_poll_timeout_secs(),
        }
    }
}

/// Everything the application reads from its JSON settings file. API keys and
/// the SMTP password stay in the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub accounts: Vec<AccountRecord>,
    #[serde(default)]
    pub privileged_users: Vec<String>,
    pub mail: MailSettings,
    #[serde(default)]
    pub style: StyleSettings,
    #[serde(default)]
    pub translation: TranslationSettings,
    #[serde(default)]
    pub polling: PollSettings,
}

impl AppSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings ({})", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid settings JSON ({})", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("settings must define at least one account");
        }
        if !matches!(self.style.candidate_count, 1 | 4) {
            bail!(
                "style.candidate_count must be 1 or 4, got {}",
                self.style.candidate_count
            );
        }
        if self.polling.interval_secs > self.polling.timeout_secs {
            bail!(
                "polling.interval_secs ({}) exceeds polling.timeout_secs ({})",
                self.polling.interval_secs,
                self.polling.timeout_secs
            );
        }
        Ok(())
    }
}

/// Username-keyed view over the account list with credential verification.
#[derive(Debug, Clone)]
pub struct AccountStore {
    accounts: IndexMap<String, AccountRecord>,
}

impl AccountStore {
    pub fn new(accounts: Vec<AccountRecord>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|record| (record.username.clone(), record))
            .collect();
        Self { accounts }
    }

    pub fn get(&self, username: &str) -> Option<&AccountRecord> {
        self.accounts.get(username)
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let Some(record) = self.accounts.get(username) else {
            return false;
        };
        hash_password(&record.password_salt, password) == record.password_sha256
    }

    pub fn profile_image(&self, username: &str) -> Option<&Path> {
        self.accounts
            .get(username)
            .and_then(|record| record.profile_image.as_deref())
    }
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn default_smtp_port() -> u16 {
    587
}

fn default_attachment_name() -> String {
    "dream_image.png".to_string()
}

fn default_preset_style() -> String {
    "CINEMATIC".to_string()
}

fn default_photo_real_version() -> String {
    "v2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_candidate_count() -> u8 {
    4
}

fn default_reference_strength() -> String {
    "Mid".to_string()
}

fn default_translation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_target_language() -> String {
    "English".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    240
}

//! Server settings
//!
//! Resolution order: built-in defaults, then an optional TOML file, then CLI
//! flags / environment variables (`.env` is loaded before parsing).

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::market::payout::UnfulfilledPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub db_path: String,
    pub bind_addr: String,
    /// Skip SQLite and keep everything in process memory
    pub in_memory: bool,
    /// AP Coins credited when an account is opened
    pub welcome_bonus: i64,
    pub unfulfilled_policy: UnfulfilledPolicy,
    pub max_payout_concurrency: usize,
    /// Upper bound on transactions returned by one history call
    pub history_limit: usize,
    pub event_capacity: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            db_path: "apcoin_ledger.db".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            in_memory: false,
            welcome_bonus: 1000,
            unfulfilled_policy: UnfulfilledPolicy::Refund,
            max_payout_concurrency: 16,
            history_limit: 500,
            event_capacity: 1024,
        }
    }
}

impl LedgerSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).context("Invalid settings file")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.welcome_bonus < 0 {
            bail!("welcome_bonus must not be negative");
        }
        if self.max_payout_concurrency == 0 {
            bail!("max_payout_concurrency must be at least 1");
        }
        if self.history_limit == 0 {
            bail!("history_limit must be at least 1");
        }
        if !self.in_memory && self.db_path.trim().is_empty() {
            bail!("db_path is required unless in_memory is set");
        }
        Ok(())
    }
}

fn parse_policy(raw: &str) -> Result<UnfulfilledPolicy, String> {
    UnfulfilledPolicy::from_str(raw).ok_or_else(|| format!("unknown policy {raw:?} (refund|house)"))
}

#[derive(Parser, Debug)]
#[command(name = "apcoin-ledger")]
#[command(about = "AP Coins wallet ledger and settlement engine")]
pub struct Args {
    /// TOML settings file
    #[arg(long, env = "APCOIN_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "APCOIN_DB_PATH")]
    pub db_path: Option<String>,

    #[arg(long, env = "APCOIN_BIND_ADDR")]
    pub bind_addr: Option<String>,

    #[arg(long, env = "APCOIN_IN_MEMORY")]
    pub in_memory: bool,

    #[arg(long, env = "APCOIN_WELCOME_BONUS")]
    pub welcome_bonus: Option<i64>,

    /// What to do with the pool when nobody backed the winning side
    #[arg(long, env = "APCOIN_UNFULFILLED_POLICY", value_parser = parse_policy)]
    pub unfulfilled_policy: Option<UnfulfilledPolicy>,

    #[arg(long, env = "APCOIN_MAX_PAYOUT_CONCURRENCY")]
    pub max_payout_concurrency: Option<usize>,

    #[arg(long, env = "APCOIN_HISTORY_LIMIT")]
    pub history_limit: Option<usize>,
}

impl Args {
    pub fn into_settings(self) -> Result<LedgerSettings> {
        let mut settings = match &self.config {
            Some(path) => LedgerSettings::from_file(path)?,
            None => LedgerSettings::default(),
        };

        if let Some(db_path) = self.db_path {
            settings.db_path = db_path;
        }
        if let Some(bind_addr) = self.bind_addr {
            settings.bind_addr = bind_addr;
        }
        if self.in_memory {
            settings.in_memory = true;
        }
        if let Some(bonus) = self.welcome_bonus {
            settings.welcome_bonus = bonus;
        }
        if let Some(policy) = self.unfulfilled_policy {
            settings.unfulfilled_policy = policy;
        }
        if let Some(n) = self.max_payout_concurrency {
            settings.max_payout_concurrency = n;
        }
        if let Some(n) = self.history_limit {
            settings.history_limit = n;
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = LedgerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.welcome_bonus, 1000);
        assert_eq!(settings.unfulfilled_policy, UnfulfilledPolicy::Refund);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = LedgerSettings::from_toml_str(
            r#"
            welcome_bonus = 250
            unfulfilled_policy = "house"
            "#,
        )
        .unwrap();
        assert_eq!(settings.welcome_bonus, 250);
        assert_eq!(settings.unfulfilled_policy, UnfulfilledPolicy::HouseAbsorbs);
        assert_eq!(settings.history_limit, 500);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(LedgerSettings::from_toml_str("max_payout_concurrency = 0").is_err());
        assert!(LedgerSettings::from_toml_str("welcome_bonus = -5").is_err());
        assert!(LedgerSettings::from_toml_str("unfulfilled_policy = \"burn\"").is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "welcome_bonus = 10\nhistory_limit = 20").unwrap();

        let args = Args::try_parse_from([
            "apcoin-ledger",
            "--config",
            file.path().to_str().unwrap(),
            "--welcome-bonus",
            "99",
            "--unfulfilled-policy",
            "house",
            "--in-memory",
        ])
        .unwrap();
        let settings = args.into_settings().unwrap();

        assert_eq!(settings.welcome_bonus, 99);
        assert_eq!(settings.history_limit, 20);
        assert_eq!(settings.unfulfilled_policy, UnfulfilledPolicy::HouseAbsorbs);
        assert!(settings.in_memory);
    }
}

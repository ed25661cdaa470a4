//! deployment configuration
//!
//! loaded from toml, validated before anything else touches it.
//!
//! ```toml
//! threshold = 2
//! participant_count = 3
//! pbkdf_work_factor = 131072
//! round_timeout_ms = 2000
//! attestation_required = true
//!
//! [attestation]
//! max_clock_skew_secs = 30
//! replay_window_secs = 300
//!
//! [vault]
//! max_hash_attempts = 10
//! attempt_window_secs = 60
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kdf::{KdfParams, MIN_WORK_FACTOR};
use crate::{Error, Result};

const DEFAULT_WORK_FACTOR: u32 = 131_072;
const DEFAULT_ROUND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// round trips one signing ceremony makes to a domain: load, commit, sign, wipe
const CEREMONY_ROUNDS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// signers required per ceremony (T)
    pub threshold: u32,
    /// domains holding a share (N)
    pub participant_count: u32,
    /// argon2id memory KiB x passes
    #[serde(default = "default_work_factor")]
    pub pbkdf_work_factor: u32,
    /// hard ceiling for each protocol round
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,
    /// fail ceremonies that cannot produce verified attestations
    #[serde(default = "default_attestation_required")]
    pub attestation_required: bool,
    /// fresh ceremonies tried before giving up
    #[serde(default = "default_max_attempts")]
    pub max_ceremony_attempts: u32,
    #[serde(default)]
    pub attestation: AttestationConfig,
    #[serde(default)]
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationConfig {
    pub max_clock_skew_secs: u64,
    pub replay_window_secs: u64,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 30,
            replay_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// password hashes allowed per account per window
    pub max_hash_attempts: u32,
    pub attempt_window_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_hash_attempts: 10,
            attempt_window_secs: 60,
        }
    }
}

fn default_work_factor() -> u32 {
    DEFAULT_WORK_FACTOR
}

fn default_round_timeout_ms() -> u64 {
    DEFAULT_ROUND_TIMEOUT_MS
}

fn default_attestation_required() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 2,
            participant_count: 3,
            pbkdf_work_factor: DEFAULT_WORK_FACTOR,
            round_timeout_ms: DEFAULT_ROUND_TIMEOUT_MS,
            attestation_required: default_attestation_required(),
            max_ceremony_attempts: DEFAULT_MAX_ATTEMPTS,
            attestation: AttestationConfig::default(),
            vault: VaultConfig::default(),
        }
    }
}

impl Config {
    /// read and validate a toml config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(Error::Config("threshold must be at least 1".into()));
        }
        if self.threshold > self.participant_count {
            return Err(Error::Config(format!(
                "threshold {} exceeds participant count {}",
                self.threshold, self.participant_count
            )));
        }
        if self.pbkdf_work_factor < MIN_WORK_FACTOR {
            return Err(Error::Config(format!(
                "pbkdf_work_factor {} below floor {}",
                self.pbkdf_work_factor, MIN_WORK_FACTOR
            )));
        }
        if self.round_timeout_ms == 0 {
            return Err(Error::Config("round_timeout_ms must be positive".into()));
        }
        if self.max_ceremony_attempts == 0 {
            return Err(Error::Config("max_ceremony_attempts must be positive".into()));
        }
        if self.vault.max_hash_attempts == 0 || self.vault.attempt_window_secs == 0 {
            return Err(Error::Config("vault attempt limits must be positive".into()));
        }
        if self.attestation.replay_window_secs == 0 {
            return Err(Error::Config("replay_window_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// how long a domain keeps per-ceremony state nobody wiped
    pub fn session_ttl(&self) -> Duration {
        self.round_timeout() * CEREMONY_ROUNDS
    }

    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::from_work_factor(self.pbkdf_work_factor)
    }
}

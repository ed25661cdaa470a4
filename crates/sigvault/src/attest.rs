//! attestation of ceremony steps
//!
//! a domain signs (ceremony, time, identity, firmware) with an ed25519 key
//! that is never used for anything else. relying parties check it against
//! the key registered for that domain.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::ceremony::CeremonyId;
use crate::config::AttestationConfig;
use crate::{Error, Result};

const ATTESTATION_TAG: &[u8] = b"sigvault:attestation:v1";

/// who ran the step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainIdentity {
    pub serial: String,
}

impl DomainIdentity {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
        }
    }
}

impl core::fmt::Display for DomainIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.serial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub ceremony_id: CeremonyId,
    /// unix seconds
    pub timestamp: u64,
    pub domain: DomainIdentity,
    pub firmware_version: String,
    #[serde(with = "crate::hex_serde")]
    pub signature: [u8; 64],
}

impl Attestation {
    /// bytes covered by the signature
    pub fn signed_bytes(
        ceremony_id: &CeremonyId,
        timestamp: u64,
        domain: &DomainIdentity,
        firmware_version: &str,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            ATTESTATION_TAG.len() + 16 + 8 + 8 + domain.serial.len() + firmware_version.len(),
        );
        buf.extend_from_slice(ATTESTATION_TAG);
        buf.extend_from_slice(ceremony_id.as_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(&(domain.serial.len() as u32).to_le_bytes());
        buf.extend_from_slice(domain.serial.as_bytes());
        buf.extend_from_slice(&(firmware_version.len() as u32).to_le_bytes());
        buf.extend_from_slice(firmware_version.as_bytes());
        buf
    }

    /// signature check only, no freshness
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        let msg = Self::signed_bytes(
            &self.ceremony_id,
            self.timestamp,
            &self.domain,
            &self.firmware_version,
        );
        let sig = ed25519_dalek::Signature::from_bytes(&self.signature);
        key.verify(&msg, &sig)
            .map_err(|_| Error::AttestationRejected(format!("bad signature from {}", self.domain)))
    }
}

/// produces attestations for one domain
pub trait AttestationService: Send + Sync {
    fn attest(&self, ceremony_id: &CeremonyId, domain: &DomainIdentity) -> Result<Attestation>;

    fn verifying_key(&self) -> VerifyingKey;
}

/// software attestor, stands in for the hsm's attestation key
pub struct Ed25519Attestor {
    key: SigningKey,
    firmware_version: String,
}

impl Ed25519Attestor {
    pub fn generate(firmware_version: impl Into<String>) -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
            firmware_version: firmware_version.into(),
        }
    }

    pub fn attest_at(
        &self,
        ceremony_id: &CeremonyId,
        domain: &DomainIdentity,
        timestamp: u64,
    ) -> Attestation {
        let msg = Attestation::signed_bytes(ceremony_id, timestamp, domain, &self.firmware_version);
        Attestation {
            ceremony_id: *ceremony_id,
            timestamp,
            domain: domain.clone(),
            firmware_version: self.firmware_version.clone(),
            signature: self.key.sign(&msg).to_bytes(),
        }
    }
}

impl AttestationService for Ed25519Attestor {
    fn attest(&self, ceremony_id: &CeremonyId, domain: &DomainIdentity) -> Result<Attestation> {
        Ok(self.attest_at(ceremony_id, domain, unix_now()?))
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl core::fmt::Debug for Ed25519Attestor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ed25519Attestor")
            .field("verifying_key", &hex::encode(self.key.verifying_key().as_bytes()))
            .field("firmware_version", &self.firmware_version)
            .finish()
    }
}

pub fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| Error::AttestationRejected(format!("clock before epoch: {}", e)))
}

/// freshness rules for incoming attestations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationPolicy {
    /// how far ahead of our clock a timestamp may be
    pub max_clock_skew: Duration,
    /// how old a timestamp may be, and how long we remember it
    pub replay_window: Duration,
}

impl Default for AttestationPolicy {
    fn default() -> Self {
        Self::from(&AttestationConfig::default())
    }
}

impl From<&AttestationConfig> for AttestationPolicy {
    fn from(config: &AttestationConfig) -> Self {
        Self {
            max_clock_skew: Duration::from_secs(config.max_clock_skew_secs),
            replay_window: Duration::from_secs(config.replay_window_secs),
        }
    }
}

impl AttestationPolicy {
    pub fn check_freshness(&self, attestation: &Attestation, now: u64) -> Result<()> {
        if attestation.timestamp > now.saturating_add(self.max_clock_skew.as_secs()) {
            return Err(Error::AttestationRejected(format!(
                "timestamp from {} is {}s in the future",
                attestation.domain,
                attestation.timestamp - now
            )));
        }
        if now.saturating_sub(attestation.timestamp) > self.replay_window.as_secs() {
            return Err(Error::AttestationRejected(format!(
                "timestamp from {} is older than the replay window",
                attestation.domain
            )));
        }
        Ok(())
    }
}

/// remembers (ceremony, domain) pairs seen within the replay window
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: RwLock<HashMap<(CeremonyId, String), u64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// full check: signature, freshness, then first-use
    pub fn admit(
        &self,
        attestation: &Attestation,
        expected_ceremony: &CeremonyId,
        key: &VerifyingKey,
        policy: &AttestationPolicy,
        now: u64,
    ) -> Result<()> {
        if attestation.ceremony_id != *expected_ceremony {
            return Err(Error::AttestationRejected(format!(
                "{} attested ceremony {} instead of {}",
                attestation.domain, attestation.ceremony_id, expected_ceremony
            )));
        }
        attestation.verify_signature(key)?;
        policy.check_freshness(attestation, now)?;

        let mut seen = self.seen.write().map_err(|e| Error::Storage(e.to_string()))?;
        let window = policy.replay_window.as_secs();
        seen.retain(|_, ts| now.saturating_sub(*ts) <= window);

        let entry = (attestation.ceremony_id, attestation.domain.serial.clone());
        if seen.contains_key(&entry) {
            return Err(Error::AttestationRejected(format!(
                "replayed attestation from {}",
                attestation.domain
            )));
        }
        seen.insert(entry, attestation.timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Ed25519Attestor, DomainIdentity, CeremonyId) {
        (
            Ed25519Attestor::generate("sim-1.0"),
            DomainIdentity::new("hsm-1"),
            CeremonyId::random(),
        )
    }

    #[test]
    fn test_attest_and_verify() {
        let (attestor, domain, ceremony) = setup();
        let att = attestor.attest(&ceremony, &domain).unwrap();
        att.verify_signature(&attestor.verifying_key()).unwrap();

        let other = Ed25519Attestor::generate("sim-1.0");
        assert!(att.verify_signature(&other.verifying_key()).is_err());
    }

    #[test]
    fn test_tampered_fields_rejected() {
        let (attestor, domain, ceremony) = setup();
        let mut att = attestor.attest_at(&ceremony, &domain, 1_000);
        att.firmware_version = "sim-2.0".into();
        assert!(att.verify_signature(&attestor.verifying_key()).is_err());
    }

    #[test]
    fn test_freshness_window() {
        let (attestor, domain, ceremony) = setup();
        let policy = AttestationPolicy::default();
        let now = 1_000_000;

        let ok = attestor.attest_at(&ceremony, &domain, now - 10);
        policy.check_freshness(&ok, now).unwrap();
        let skewed = attestor.attest_at(&ceremony, &domain, now + 29);
        policy.check_freshness(&skewed, now).unwrap();

        let future = attestor.attest_at(&ceremony, &domain, now + 31);
        assert!(policy.check_freshness(&future, now).is_err());
        let stale = attestor.attest_at(&ceremony, &domain, now - 301);
        assert!(policy.check_freshness(&stale, now).is_err());
    }

    #[test]
    fn test_replay_rejected() {
        let (attestor, domain, ceremony) = setup();
        let policy = AttestationPolicy::default();
        let guard = ReplayGuard::new();
        let key = attestor.verifying_key();
        let now = 5_000;

        let att = attestor.attest_at(&ceremony, &domain, now);
        guard.admit(&att, &ceremony, &key, &policy, now).unwrap();
        assert!(matches!(
            guard.admit(&att, &ceremony, &key, &policy, now + 1),
            Err(Error::AttestationRejected(_))
        ));
        assert!(guard.admit(&att, &CeremonyId::random(), &key, &policy, now).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let (attestor, domain, ceremony) = setup();
        let att = attestor.attest_at(&ceremony, &domain, 42);
        let json = serde_json::to_string(&att).unwrap();
        let back: Attestation = serde_json::from_str(&json).unwrap();
        assert_eq!(att, back);
    }
}

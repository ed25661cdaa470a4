//! isolated execution domains
//!
//! a domain is the hsm boundary: it holds shares, runs its half of every
//! round, and only ever hands back public values (commitments, partial
//! signatures, public shares) or ciphertext sealed to another domain.
//!
//! domains enforce their own per-ceremony order. calling round 2 before
//! round 1, or round 2 twice, is a [`Error::ProtocolViolation`] no matter
//! what the coordinator does.
//!
//! implementations:
//! - software: in-process, keys in ram. tests and single-host setups

#[cfg(feature = "software")]
pub mod software;

use std::future::Future;

use curve25519_dalek::ristretto::RistrettoPoint;
use ed25519_dalek::VerifyingKey;

use crate::attest::{Attestation, DomainIdentity};
use crate::ceremony::{CeremonyId, KeyId};
use crate::frost::dkg::Round1Package;
use crate::frost::sealed::{SealedScalar, TransportKey};
use crate::frost::{GroupPublicKey, SignatureShare, SigningCommitments, SigningPackage};
use crate::store::{Capability, ShareId};
use crate::Result;

/// one dkg sub-share in transit, readable only by `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealtShare {
    pub from: u32,
    pub to: u32,
    pub sealed: SealedScalar,
}

/// what a domain reports after storing a new share
#[derive(Debug, Clone)]
pub struct ShareReceipt {
    pub index: u32,
    pub share_id: ShareId,
    pub capability: Capability,
    pub public_share: RistrettoPoint,
    pub group_key: GroupPublicKey,
    pub attestation: Option<Attestation>,
}

/// public view of a share leased for signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareHandle {
    pub index: u32,
    pub public_share: RistrettoPoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeConfirmation {
    pub domain: DomainIdentity,
    pub ceremony_id: CeremonyId,
    /// false if the domain could not vouch that everything is gone
    pub confirmed: bool,
}

/// aad for a share sealed from `from` to `to` within a ceremony
pub fn transport_aad(ceremony_id: &CeremonyId, from: u32, to: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 8);
    aad.extend_from_slice(ceremony_id.as_bytes());
    aad.extend_from_slice(&from.to_le_bytes());
    aad.extend_from_slice(&to.to_le_bytes());
    aad
}

/// dealer index used in [`transport_aad`] for imported shares
pub const DEALER_INDEX: u32 = 0;

/// the coordinator's view of one isolated domain
pub trait Domain: Send + Sync + 'static {
    fn identity(&self) -> &DomainIdentity;

    /// key other domains (and dealers) seal shares to
    fn transport_key(&self) -> TransportKey;

    /// key relying parties check attestations against
    fn attestation_key(&self) -> VerifyingKey;

    /// liveness check
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    // === key generation ===

    /// dkg round 1: commit to a fresh polynomial
    fn dkg_commit(
        &self,
        ceremony_id: CeremonyId,
        key_id: KeyId,
        index: u32,
        threshold: u32,
    ) -> impl Future<Output = Result<Round1Package>> + Send;

    /// dkg round 2: check everyone's round 1, seal sub-shares to recipients
    fn dkg_deal(
        &self,
        ceremony_id: CeremonyId,
        packages: Vec<Round1Package>,
        recipients: Vec<(u32, TransportKey)>,
    ) -> impl Future<Output = Result<Vec<DealtShare>>> + Send;

    /// dkg round 3: open incoming sub-shares, store the final share
    fn dkg_finalize(
        &self,
        ceremony_id: CeremonyId,
        inbox: Vec<DealtShare>,
    ) -> impl Future<Output = Result<ShareReceipt>> + Send;

    /// store a dealer-split share sealed to this domain
    fn import_share(
        &self,
        ceremony_id: CeremonyId,
        key_id: KeyId,
        index: u32,
        threshold: u32,
        group_key: GroupPublicKey,
        sealed: SealedScalar,
    ) -> impl Future<Output = Result<ShareReceipt>> + Send;

    // === signing ===

    /// lease the share for this ceremony
    fn load_share(
        &self,
        ceremony_id: CeremonyId,
        share_id: ShareId,
        capability: Capability,
    ) -> impl Future<Output = Result<ShareHandle>> + Send;

    /// round 1: fresh nonce pair, return its commitments
    fn sign_commit(
        &self,
        ceremony_id: CeremonyId,
    ) -> impl Future<Output = Result<SigningCommitments>> + Send;

    /// round 2: partial signature over the fixed package, consumes the nonces
    fn sign_share(
        &self,
        ceremony_id: CeremonyId,
        package: SigningPackage,
    ) -> impl Future<Output = Result<SignatureShare>> + Send;

    // === cleanup ===

    /// drop nonces, transient shares and leases for the ceremony. idempotent
    fn wipe(&self, ceremony_id: CeremonyId) -> impl Future<Output = Result<WipeConfirmation>> + Send;

    fn attest(&self, ceremony_id: CeremonyId) -> impl Future<Output = Result<Attestation>> + Send;

    /// remove a stored share for good (rotation, orphan cleanup)
    fn destroy_share(
        &self,
        share_id: ShareId,
        capability: Capability,
    ) -> impl Future<Output = Result<()>> + Send;
}

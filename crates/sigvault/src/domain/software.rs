//! software domain - in-process implementation
//!
//! keeps shares wrapped in a [`ShareStore`] and per-ceremony state in ram.
//! no hardware isolation, just the same api and the same ordering rules an
//! hsm enforces. useful for tests, demos and single-host setups.
//!
//! ceremony state that is never wiped (a lost wipe call, a crashed
//! coordinator) expires after the session ttl and is dropped on the next
//! call into the domain.
//!
//! faults can be injected to simulate dead, slow or misbehaving hardware.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use tokio::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroize;

use super::{
    transport_aad, DealtShare, Domain, ShareHandle, ShareReceipt, WipeConfirmation, DEALER_INDEX,
};
use crate::attest::{Attestation, AttestationService, DomainIdentity, Ed25519Attestor};
use crate::ceremony::keygen::dkg_context;
use crate::ceremony::{CeremonyId, KeyId};
use crate::frost::dkg::{self, Round1Package, Round1Secret};
use crate::frost::sealed::{open_scalar, seal_scalar, SealedScalar, TransportKey, TransportSecret};
use crate::frost::{
    GroupPublicKey, KeyPackage, SignatureShare, SigningCommitments, SigningNonces, SigningPackage,
};
use crate::store::{Capability, ShareId, ShareLease, ShareStore, WipeTarget};
use crate::{Error, Result};

const FIRMWARE_VERSION: &str = concat!("software-", env!("CARGO_PKG_VERSION"));

/// default lifetime of per-ceremony state; 4 rounds at the default timeout
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8);

/// steps a fault can be pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ping,
    DkgCommit,
    DkgDeal,
    DkgFinalize,
    Import,
    LoadShare,
    Commit,
    Sign,
    Wipe,
    Attest,
    Destroy,
}

/// simulated misbehaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// every call fails
    Offline,
    /// calls at this stage fail
    FailAt(Stage),
    /// calls at this stage never return
    StallAt(Stage),
    /// partial signatures are off by one
    CorruptShare,
    /// wipes run but are not confirmed
    UnconfirmedWipe,
    /// attestations are signed with a key nobody registered
    ForgedAttestation,
}

enum SignStage {
    Loaded,
    Committed(SigningNonces),
    Signed,
}

enum Session {
    Keygen {
        key_id: KeyId,
        own: Round1Package,
        threshold: u32,
        secret: Option<Round1Secret>,
        packages: Vec<Round1Package>,
    },
    Signing {
        lease: ShareLease,
        stage: SignStage,
    },
}

struct Live {
    session: Session,
    expires: Instant,
}

pub struct SoftwareDomain {
    identity: DomainIdentity,
    store: ShareStore,
    transport: TransportSecret,
    attestor: Ed25519Attestor,
    sessions: Mutex<HashMap<CeremonyId, Live>>,
    session_ttl: Duration,
    fault: Mutex<Option<Fault>>,
}

fn violation(msg: impl Into<String>) -> Error {
    Error::ProtocolViolation(msg.into())
}

impl SoftwareDomain {
    pub fn new(serial: impl Into<String>) -> Self {
        let identity = DomainIdentity::new(serial);
        Self {
            store: ShareStore::new(identity.serial.clone()),
            identity,
            transport: TransportSecret::generate(&mut OsRng),
            attestor: Ed25519Attestor::generate(FIRMWARE_VERSION),
            sessions: Mutex::new(HashMap::new()),
            session_ttl: DEFAULT_SESSION_TTL,
            fault: Mutex::new(None),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn set_fault(&self, fault: Option<Fault>) -> Result<()> {
        *self.fault.lock().map_err(|e| Error::Storage(e.to_string()))? = fault;
        Ok(())
    }

    /// power loss: ram is gone, persisted shares survive
    pub fn kill(&self) -> Result<()> {
        self.set_fault(Some(Fault::Offline))?;
        self.sessions
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?
            .clear();
        self.store.wipe(WipeTarget::AllTransient)?;
        warn!(domain = %self.identity, "domain killed");
        Ok(())
    }

    pub fn revive(&self) -> Result<()> {
        self.set_fault(None)
    }

    pub fn store(&self) -> &ShareStore {
        &self.store
    }

    /// ceremonies with live state (nonces, leases, dkg secrets)
    pub fn active_sessions(&self) -> Result<usize> {
        Ok(self
            .sessions
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?
            .len())
    }

    fn current_fault(&self) -> Result<Option<Fault>> {
        Ok(*self.fault.lock().map_err(|e| Error::Storage(e.to_string()))?)
    }

    fn live(&self, session: Session) -> Live {
        Live {
            session,
            expires: Instant::now() + self.session_ttl,
        }
    }

    /// drop sessions past their deadline
    fn sweep(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<(CeremonyId, Session)> = {
            let mut sessions = self.sessions.lock().map_err(|e| Error::Storage(e.to_string()))?;
            let ids: Vec<CeremonyId> = sessions
                .iter()
                .filter(|(_, l)| l.expires <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|l| (id, l.session)))
                .collect()
        };
        for (ceremony_id, session) in expired {
            warn!(domain = %self.identity, %ceremony_id, "ceremony state expired unwiped");
            self.retire(session)?;
        }
        Ok(())
    }

    /// fault gate every call passes first
    async fn enter(&self, stage: Stage) -> Result<Option<Fault>> {
        self.sweep()?;
        let fault = self.current_fault()?;
        match fault {
            Some(Fault::Offline) => Err(Error::DomainUnavailable(self.identity.serial.clone())),
            Some(Fault::FailAt(s)) if s == stage => {
                Err(Error::DomainUnavailable(format!("{} failed at {:?}", self.identity, stage)))
            }
            Some(Fault::StallAt(s)) if s == stage => std::future::pending().await,
            _ => Ok(fault),
        }
    }

    fn make_attestation(&self, ceremony_id: &CeremonyId, fault: Option<Fault>) -> Result<Attestation> {
        if fault == Some(Fault::ForgedAttestation) {
            return Ed25519Attestor::generate(FIRMWARE_VERSION).attest(ceremony_id, &self.identity);
        }
        self.attestor.attest(ceremony_id, &self.identity)
    }

    fn receipt(
        &self,
        key_id: KeyId,
        package: &KeyPackage,
        attestation: Option<Attestation>,
    ) -> Result<ShareReceipt> {
        let (share_id, capability) = self.store.store(key_id, package, attestation.clone())?;
        Ok(ShareReceipt {
            index: package.index(),
            share_id,
            capability,
            public_share: *package.public_share(),
            group_key: *package.group_key(),
            attestation,
        })
    }

    fn start_keygen(
        &self,
        ceremony_id: CeremonyId,
        key_id: KeyId,
        index: u32,
        threshold: u32,
    ) -> Result<Round1Package> {
        let mut sessions = self.sessions.lock().map_err(|e| Error::Storage(e.to_string()))?;
        if sessions.contains_key(&ceremony_id) {
            return Err(violation("ceremony already started on this domain"));
        }
        let context = dkg_context(&ceremony_id, &key_id);
        let (secret, package) = dkg::part1(index, threshold, &context, &mut OsRng)?;
        let session = Session::Keygen {
            key_id,
            own: package.clone(),
            threshold,
            secret: Some(secret),
            packages: Vec::new(),
        };
        sessions.insert(ceremony_id, self.live(session));
        Ok(package)
    }

    fn deal(
        &self,
        ceremony_id: CeremonyId,
        packages: Vec<Round1Package>,
        recipients: Vec<(u32, TransportKey)>,
    ) -> Result<Vec<DealtShare>> {
        let mut sessions = self.sessions.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let Some(Session::Keygen {
            key_id,
            own,
            threshold,
            secret: Some(secret),
            packages: stored,
        }) = sessions.get_mut(&ceremony_id).map(|l| &mut l.session)
        else {
            return Err(violation("dkg deal without a commitment"));
        };
        if !stored.is_empty() {
            return Err(violation("dkg deal repeated"));
        }

        let context = dkg_context(&ceremony_id, key_id);
        match packages.iter().find(|p| p.index == own.index) {
            Some(p) if p.commitment == own.commitment => {}
            _ => return Err(violation("own commitment missing or altered")),
        }
        for p in packages.iter().filter(|p| p.index != own.index) {
            p.verify(*threshold, &context)?;
        }

        let mut dealt = Vec::with_capacity(recipients.len());
        for (to, key) in recipients.iter().filter(|(to, _)| *to != own.index) {
            if !packages.iter().any(|p| p.index == *to) {
                return Err(violation(format!("recipient {} has no commitment", to)));
            }
            let mut value = secret.subshare_for(*to)?;
            let aad = transport_aad(&ceremony_id, own.index, *to);
            let sealed = seal_scalar(&value, key, &aad, &mut OsRng);
            value.zeroize();
            dealt.push(DealtShare {
                from: own.index,
                to: *to,
                sealed: sealed?,
            });
        }
        *stored = packages;
        Ok(dealt)
    }

    fn finalize(
        &self,
        ceremony_id: CeremonyId,
        inbox: Vec<DealtShare>,
        fault: Option<Fault>,
    ) -> Result<ShareReceipt> {
        let session = self
            .sessions
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?
            .remove(&ceremony_id)
            .map(|l| l.session);
        let Some(Session::Keygen {
            key_id,
            own,
            secret: Some(secret),
            packages,
            ..
        }) = session
        else {
            return Err(violation("dkg finalize out of order"));
        };
        if packages.is_empty() {
            return Err(violation("dkg finalize before deal"));
        }

        let mut received: Vec<(u32, Scalar)> = Vec::with_capacity(inbox.len());
        for d in inbox.iter().filter(|d| d.to == own.index) {
            let aad = transport_aad(&ceremony_id, d.from, own.index);
            let value = open_scalar(&d.sealed, &self.transport, &aad).map_err(|_| {
                violation(format!("sub-share from participant {} failed to open", d.from))
            })?;
            received.push((d.from, value));
        }
        let package = dkg::part3(secret, &packages, &received);
        for (_, v) in received.iter_mut() {
            v.zeroize();
        }
        let package = package?;

        let attestation = self.make_attestation(&ceremony_id, fault)?;
        let receipt = self.receipt(key_id, &package, Some(attestation))?;
        debug!(domain = %self.identity, %ceremony_id, share_id = %receipt.share_id, "dkg share stored");
        Ok(receipt)
    }

    fn load(
        &self,
        ceremony_id: CeremonyId,
        share_id: ShareId,
        capability: Capability,
    ) -> Result<ShareHandle> {
        let mut sessions = self.sessions.lock().map_err(|e| Error::Storage(e.to_string()))?;
        if sessions.contains_key(&ceremony_id) {
            return Err(violation("ceremony already started on this domain"));
        }
        let share = self.store.retrieve(&share_id, &capability)?;
        let lease = self.store.lease(&share_id, &capability)?;
        let session = Session::Signing {
            lease,
            stage: SignStage::Loaded,
        };
        sessions.insert(ceremony_id, self.live(session));
        Ok(ShareHandle {
            index: share.participant,
            public_share: share.public_key_contribution,
        })
    }

    fn commit(&self, ceremony_id: CeremonyId) -> Result<SigningCommitments> {
        let mut sessions = self.sessions.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let Some(Session::Signing { lease, stage }) =
            sessions.get_mut(&ceremony_id).map(|l| &mut l.session)
        else {
            return Err(violation("round 1 without a loaded share"));
        };
        if !matches!(stage, SignStage::Loaded) {
            return Err(violation("round 1 repeated"));
        }
        let nonces = self.store.with_transient(lease, |k| Ok(k.commit(&mut OsRng)))?;
        let commitments = nonces.commitments();
        *stage = SignStage::Committed(nonces);
        Ok(commitments)
    }

    fn partial(
        &self,
        ceremony_id: CeremonyId,
        package: SigningPackage,
        fault: Option<Fault>,
    ) -> Result<SignatureShare> {
        let mut sessions = self.sessions.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let Some(Session::Signing { lease, stage }) =
            sessions.get_mut(&ceremony_id).map(|l| &mut l.session)
        else {
            return Err(violation("round 2 without a loaded share"));
        };
        // nonces are consumed whether or not signing succeeds
        let nonces = match std::mem::replace(stage, SignStage::Signed) {
            SignStage::Committed(nonces) => nonces,
            SignStage::Loaded => return Err(violation("round 2 before round 1")),
            SignStage::Signed => return Err(violation("round 2 repeated")),
        };
        let mut share = self.store.with_transient(lease, |k| k.sign(&package, nonces))?;
        if fault == Some(Fault::CorruptShare) {
            share.z += Scalar::ONE;
        }
        Ok(share)
    }

    fn clear(&self, ceremony_id: &CeremonyId) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?
            .remove(ceremony_id);
        match session {
            Some(live) => self.retire(live.session),
            None => Ok(()),
        }
    }

    fn retire(&self, session: Session) -> Result<()> {
        if let Session::Signing { lease, .. } = &session {
            self.store.wipe(WipeTarget::Share(lease.share_id()))?;
        }
        // dropping the session zeroizes nonces and dkg secrets and releases the lease
        drop(session);
        Ok(())
    }
}

impl core::fmt::Debug for SoftwareDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftwareDomain")
            .field("identity", &self.identity)
            .field("store", &self.store)
            .finish()
    }
}

impl Domain for SoftwareDomain {
    fn identity(&self) -> &DomainIdentity {
        &self.identity
    }

    fn transport_key(&self) -> TransportKey {
        self.transport.public()
    }

    fn attestation_key(&self) -> VerifyingKey {
        self.attestor.verifying_key()
    }

    async fn ping(&self) -> Result<()> {
        self.enter(Stage::Ping).await?;
        Ok(())
    }

    async fn dkg_commit(
        &self,
        ceremony_id: CeremonyId,
        key_id: KeyId,
        index: u32,
        threshold: u32,
    ) -> Result<Round1Package> {
        self.enter(Stage::DkgCommit).await?;
        self.start_keygen(ceremony_id, key_id, index, threshold)
    }

    async fn dkg_deal(
        &self,
        ceremony_id: CeremonyId,
        packages: Vec<Round1Package>,
        recipients: Vec<(u32, TransportKey)>,
    ) -> Result<Vec<DealtShare>> {
        self.enter(Stage::DkgDeal).await?;
        self.deal(ceremony_id, packages, recipients)
    }

    async fn dkg_finalize(
        &self,
        ceremony_id: CeremonyId,
        inbox: Vec<DealtShare>,
    ) -> Result<ShareReceipt> {
        let fault = self.enter(Stage::DkgFinalize).await?;
        self.finalize(ceremony_id, inbox, fault)
    }

    async fn import_share(
        &self,
        ceremony_id: CeremonyId,
        key_id: KeyId,
        index: u32,
        threshold: u32,
        group_key: GroupPublicKey,
        sealed: SealedScalar,
    ) -> Result<ShareReceipt> {
        let fault = self.enter(Stage::Import).await?;
        let aad = transport_aad(&ceremony_id, DEALER_INDEX, index);
        let value = open_scalar(&sealed, &self.transport, &aad)?;
        let package = KeyPackage::new(index, threshold, value, group_key)?;
        let attestation = self.make_attestation(&ceremony_id, fault)?;
        let receipt = self.receipt(key_id, &package, Some(attestation))?;
        debug!(domain = %self.identity, %ceremony_id, share_id = %receipt.share_id, "imported share stored");
        Ok(receipt)
    }

    async fn load_share(
        &self,
        ceremony_id: CeremonyId,
        share_id: ShareId,
        capability: Capability,
    ) -> Result<ShareHandle> {
        self.enter(Stage::LoadShare).await?;
        self.load(ceremony_id, share_id, capability)
    }

    async fn sign_commit(&self, ceremony_id: CeremonyId) -> Result<SigningCommitments> {
        self.enter(Stage::Commit).await?;
        self.commit(ceremony_id)
    }

    async fn sign_share(
        &self,
        ceremony_id: CeremonyId,
        package: SigningPackage,
    ) -> Result<SignatureShare> {
        let fault = self.enter(Stage::Sign).await?;
        self.partial(ceremony_id, package, fault)
    }

    async fn wipe(&self, ceremony_id: CeremonyId) -> Result<WipeConfirmation> {
        let fault = self.enter(Stage::Wipe).await?;
        self.clear(&ceremony_id)?;
        Ok(WipeConfirmation {
            domain: self.identity.clone(),
            ceremony_id,
            confirmed: fault != Some(Fault::UnconfirmedWipe),
        })
    }

    async fn attest(&self, ceremony_id: CeremonyId) -> Result<Attestation> {
        let fault = self.enter(Stage::Attest).await?;
        self.make_attestation(&ceremony_id, fault)
    }

    async fn destroy_share(&self, share_id: ShareId, capability: Capability) -> Result<()> {
        self.enter(Stage::Destroy).await?;
        self.store.destroy(&share_id, &capability)
    }
}

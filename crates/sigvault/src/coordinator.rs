//! threshold coordinator
//!
//! drives keygen, import and signing ceremonies across the configured
//! domains. it sees commitments, partial signatures, public shares and
//! sealed sub-shares; never a raw share.
//!
//! every round is sent to all its participants at once and bounded by
//! `round_timeout_ms`. a failed round aborts the ceremony; a retry is a
//! fresh ceremony (new id, new nonces) without the participants blamed
//! last time. ceremonies over one key run one at a time.
//!
//! whatever happens, every domain that was contacted gets a wipe call,
//! including when the ceremony future is dropped halfway. a signing wipe
//! that is not confirmed is sent again before the next ceremony on that
//! key; until it is confirmed the domain sits out.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use curve25519_dalek::ristretto::RistrettoPoint;
use futures::future::join_all;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::attest::{unix_now, Attestation, AttestationPolicy, DomainIdentity, ReplayGuard};
use crate::audit::{AuditSink, CeremonyOutcome, CeremonyReport, TracingAudit};
use crate::ceremony::keygen::{self, verify_import, KeygenCeremony};
use crate::ceremony::signing::{self, SigningCeremony};
use crate::ceremony::{CeremonyFault, CeremonyId, CeremonyKind, CeremonyPhase, KeyId, Transition};
use crate::config::Config;
use crate::domain::{transport_aad, Domain, ShareReceipt, WipeConfirmation, DEALER_INDEX};
use crate::frost::dealer;
use crate::frost::dkg::Commitment;
use crate::frost::sealed::{seal_scalar, SealedScalar, TransportKey};
use crate::frost::{GroupPublicKey, SecretKey, Signature};
use crate::store::{Capability, ShareId};
use crate::{Error, Result};

/// where one share of a group key lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub index: u32,
    pub domain: DomainIdentity,
    pub share_id: ShareId,
    pub capability: Capability,
    pub public_share: RistrettoPoint,
}

/// everything needed to sign with a threshold key later. holds
/// capabilities, so treat it like a credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    pub key_id: KeyId,
    pub verifying_key: GroupPublicKey,
    pub threshold: u32,
    pub shares: Vec<ShareRecord>,
}

#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub message: Vec<u8>,
    /// who asked, for the audit trail only
    pub client: Option<String>,
}

impl SigningRequest {
    pub fn new(message: impl Into<Vec<u8>>) -> Self {
        Self {
            message: message.into(),
            client: None,
        }
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub key_id: KeyId,
    pub ceremony_id: CeremonyId,
    pub signature: Signature,
    pub participants: Vec<u32>,
    pub attestations: Vec<Attestation>,
}

/// a dealer-split key, sealed share by share to the domains' transport keys.
/// built on the client, so the coordinator never sees the key or a share
#[derive(Debug, Clone)]
pub struct ImportBundle {
    pub ceremony_id: CeremonyId,
    pub key_id: KeyId,
    pub threshold: u32,
    pub group_key: GroupPublicKey,
    pub commitment: Commitment,
    pub shares: Vec<(u32, SealedScalar)>,
}

impl ImportBundle {
    pub fn prepare<R: RngCore + CryptoRng>(
        key: &SecretKey,
        threshold: u32,
        transport_keys: &[(u32, TransportKey)],
        rng: &mut R,
    ) -> Result<Self> {
        let out = dealer::split(key, threshold, transport_keys.len() as u32, rng)?;
        let ceremony_id = CeremonyId::random();
        let mut shares = Vec::with_capacity(out.shares.len());
        for share in &out.shares {
            let (_, transport) = transport_keys
                .iter()
                .find(|(i, _)| *i == share.index())
                .ok_or_else(|| {
                    Error::InvalidInput(format!("no transport key for participant {}", share.index()))
                })?;
            let aad = transport_aad(&ceremony_id, DEALER_INDEX, share.index());
            shares.push((share.index(), seal_scalar(share.value(), transport, &aad, rng)?));
        }
        Ok(Self {
            ceremony_id,
            key_id: KeyId::random(),
            threshold,
            group_key: key.public_key(),
            commitment: out.commitment,
            shares,
        })
    }
}

/// per-attempt bookkeeping that ends up in the audit trail
struct AttemptLog {
    kind: CeremonyKind,
    key_id: KeyId,
    attempt: u32,
    started: Instant,
    ceremony_id: Option<CeremonyId>,
    phase: CeremonyPhase,
    participants: Vec<u32>,
    unconfirmed: Vec<String>,
}

impl AttemptLog {
    fn new(kind: CeremonyKind, key_id: KeyId, attempt: u32) -> Self {
        Self {
            kind,
            key_id,
            attempt,
            started: Instant::now(),
            ceremony_id: None,
            phase: CeremonyPhase::Idle,
            participants: Vec::new(),
            unconfirmed: Vec::new(),
        }
    }

    fn begin(&mut self, ceremony_id: CeremonyId, participants: &[u32]) {
        self.ceremony_id = Some(ceremony_id);
        self.participants = participants.to_vec();
    }
}

/// fires best-effort wipes if a ceremony is dropped before it cleaned up
struct WipeGuard<D: Domain> {
    ceremony_id: CeremonyId,
    domains: Vec<Arc<D>>,
    armed: bool,
}

impl<D: Domain> WipeGuard<D> {
    fn arm(ceremony_id: CeremonyId, domains: Vec<Arc<D>>) -> Self {
        Self {
            ceremony_id,
            domains,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<D: Domain> Drop for WipeGuard<D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(ceremony_id = %self.ceremony_id, "ceremony dropped outside a runtime, wipes skipped");
            return;
        };
        warn!(ceremony_id = %self.ceremony_id, "ceremony cancelled, wiping");
        let ceremony_id = self.ceremony_id;
        for domain in self.domains.drain(..) {
            handle.spawn(async move {
                if let Err(e) = domain.wipe(ceremony_id).await {
                    warn!(%ceremony_id, domain = %domain.identity(), error = %e, "cancel wipe failed");
                }
            });
        }
    }
}

/// split round results into successes and failures, keeping indices
fn partition<T>(results: Vec<(u32, Result<T>)>) -> (Vec<(u32, T)>, Vec<(u32, Error)>) {
    let mut ok = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (i, r) in results {
        match r {
            Ok(v) => ok.push((i, v)),
            Err(e) => failed.push((i, e)),
        }
    }
    (ok, failed)
}

/// blame every participant that failed a round
fn round_fault(failed: Vec<(u32, Error)>) -> CeremonyFault {
    let culprits = failed.iter().map(|(i, _)| *i).collect();
    let error = failed
        .into_iter()
        .next()
        .map(|(_, e)| e)
        .unwrap_or_else(|| Error::ProtocolViolation("round failed".into()));
    CeremonyFault::blame_all(error, culprits)
}

fn confirmed(result: &Result<WipeConfirmation>, ceremony_id: CeremonyId) -> bool {
    matches!(result, Ok(c) if c.confirmed && c.ceremony_id == ceremony_id)
}

fn values<T>(pairs: Vec<(u32, T)>) -> Vec<T> {
    pairs.into_iter().map(|(_, v)| v).collect()
}

pub struct Coordinator<D: Domain> {
    config: Config,
    /// participant i is `domains[i - 1]`
    domains: Vec<Arc<D>>,
    policy: AttestationPolicy,
    replay: ReplayGuard,
    audit: Arc<dyn AuditSink>,
    key_locks: Mutex<HashMap<KeyId, Arc<AsyncMutex<()>>>>,
    /// (participant, ceremony) signing wipes nobody confirmed yet, per key
    pending_wipes: Mutex<HashMap<KeyId, Vec<(u32, CeremonyId)>>>,
}

impl<D: Domain> Coordinator<D> {
    pub fn new(config: Config, domains: Vec<Arc<D>>) -> Result<Self> {
        config.validate()?;
        if domains.len() != config.participant_count as usize {
            return Err(Error::Config(format!(
                "{} domains configured for {} participants",
                domains.len(),
                config.participant_count
            )));
        }
        let mut serials = HashSet::new();
        for d in &domains {
            if !serials.insert(d.identity().serial.clone()) {
                return Err(Error::Config(format!("domain {} listed twice", d.identity())));
            }
        }
        Ok(Self {
            policy: AttestationPolicy::from(&config.attestation),
            config,
            domains,
            replay: ReplayGuard::new(),
            audit: Arc::new(TracingAudit),
            key_locks: Mutex::new(HashMap::new()),
            pending_wipes: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn domains(&self) -> &[Arc<D>] {
        &self.domains
    }

    fn domain(&self, index: u32) -> Result<&Arc<D>> {
        index
            .checked_sub(1)
            .and_then(|i| self.domains.get(i as usize))
            .ok_or_else(|| Error::InvalidInput(format!("no domain for participant {}", index)))
    }

    fn serials(&self, indices: &[u32]) -> Vec<String> {
        indices
            .iter()
            .map(|i| match self.domain(*i) {
                Ok(d) => d.identity().serial.clone(),
                Err(_) => format!("#{}", i),
            })
            .collect()
    }

    fn key_lock(&self, key_id: KeyId) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self.key_locks.lock().map_err(|e| Error::Storage(e.to_string()))?;
        // only keys with a ceremony running or queued keep an entry
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(key_id).or_default().clone())
    }

    /// (participant, transport key) for dealers preparing an import
    pub fn transport_keys(&self) -> Vec<(u32, TransportKey)> {
        (1u32..)
            .zip(&self.domains)
            .map(|(i, d)| (i, d.transport_key()))
            .collect()
    }

    /// one request per participant, all at once, each under the round timeout
    async fn round<T, F>(&self, name: &'static str, calls: Vec<(u32, F)>) -> Vec<(u32, Result<T>)>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.config.round_timeout();
        let results = join_all(calls.into_iter().map(|(i, call)| async move {
            let out = match timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout(limit)),
            };
            (i, out)
        }))
        .await;
        for (i, r) in &results {
            if let Err(e) = r {
                debug!(round = name, participant = i, error = %e, "round call failed");
            }
        }
        results
    }

    /// liveness of every domain, in participant order
    pub async fn health(&self) -> Vec<(DomainIdentity, bool)> {
        let calls = (1u32..).zip(&self.domains).map(|(i, d)| (i, d.ping())).collect();
        self.round("ping", calls)
            .await
            .into_iter()
            .zip(&self.domains)
            .map(|((_, r), d)| (d.identity().clone(), r.is_ok()))
            .collect()
    }

    /// wipe calls to `indices`; returns those that did not confirm
    async fn wipe_all(&self, ceremony_id: CeremonyId, indices: &[u32]) -> Vec<u32> {
        let mut calls = Vec::with_capacity(indices.len());
        for i in indices {
            if let Ok(d) = self.domain(*i) {
                calls.push((*i, d.wipe(ceremony_id)));
            }
        }
        let mut unconfirmed = Vec::new();
        for (i, r) in self.round("wipe", calls).await {
            if confirmed(&r, ceremony_id) {
                continue;
            }
            match r {
                Err(e) => warn!(%ceremony_id, participant = i, error = %e, "wipe failed"),
                Ok(_) => warn!(%ceremony_id, participant = i, "wipe not confirmed"),
            }
            unconfirmed.push(i);
        }
        unconfirmed
    }

    fn defer_wipes(&self, key_id: KeyId, ceremony_id: CeremonyId, indices: &[u32]) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let mut pending = self.pending_wipes.lock().map_err(|e| Error::Storage(e.to_string()))?;
        pending
            .entry(key_id)
            .or_default()
            .extend(indices.iter().map(|i| (*i, ceremony_id)));
        Ok(())
    }

    /// resend wipes still owed for `key_id`; returns participants that
    /// remain unconfirmed
    async fn settle_wipes(&self, key_id: KeyId) -> Result<Vec<u32>> {
        let owed = self
            .pending_wipes
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?
            .remove(&key_id)
            .unwrap_or_default();
        if owed.is_empty() {
            return Ok(Vec::new());
        }
        let mut calls = Vec::with_capacity(owed.len());
        for (i, ceremony_id) in &owed {
            calls.push((*i, self.domain(*i)?.wipe(*ceremony_id)));
        }
        let results = self.round("rewipe", calls).await;

        let mut still = Vec::new();
        for ((i, ceremony_id), (_, r)) in owed.into_iter().zip(results) {
            if confirmed(&r, ceremony_id) {
                info!(%key_id, %ceremony_id, participant = i, "late wipe confirmed");
            } else {
                still.push((i, ceremony_id));
            }
        }
        let mut stuck: Vec<u32> = still.iter().map(|(i, _)| *i).collect();
        stuck.sort_unstable();
        stuck.dedup();
        if !still.is_empty() {
            self.pending_wipes
                .lock()
                .map_err(|e| Error::Storage(e.to_string()))?
                .entry(key_id)
                .or_default()
                .extend(still);
        }
        Ok(stuck)
    }

    /// signature, freshness and replay checks. with attestation required,
    /// any reject fails the ceremony; otherwise rejects are only logged
    fn admit_attestations(
        &self,
        ceremony_id: &CeremonyId,
        attestations: Vec<(u32, Option<Attestation>)>,
    ) -> Transition<Vec<Attestation>> {
        let now = unix_now()?;
        let mut admitted = Vec::with_capacity(attestations.len());
        let mut rejected = Vec::new();
        let mut first = None;
        for (i, att) in attestations {
            let checked = match att {
                Some(a) => self
                    .domain(i)
                    .and_then(|d| {
                        self.replay
                            .admit(&a, ceremony_id, &d.attestation_key(), &self.policy, now)
                    })
                    .map(|_| a),
                None => Err(Error::AttestationRejected(format!(
                    "no attestation from participant {}",
                    i
                ))),
            };
            match checked {
                Ok(a) => admitted.push(a),
                Err(e) => {
                    warn!(%ceremony_id, participant = i, error = %e, "attestation rejected");
                    rejected.push(i);
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            Some(error) if self.config.attestation_required => {
                Err(CeremonyFault::blame_all(error, rejected))
            }
            _ => Ok(admitted),
        }
    }

    /// best-effort removal of shares from a ceremony that did not complete
    async fn discard(&self, receipts: &[ShareReceipt]) {
        let mut calls = Vec::with_capacity(receipts.len());
        for r in receipts {
            if let Ok(d) = self.domain(r.index) {
                calls.push((r.index, d.destroy_share(r.share_id, r.capability.clone())));
            }
        }
        for (i, r) in self.round("discard", calls).await {
            if let Err(e) = r {
                warn!(participant = i, error = %e, "orphaned share not destroyed");
            }
        }
    }

    fn report(&self, log: AttemptLog, client: Option<&str>, fault: Option<&CeremonyFault>) {
        let Some(ceremony_id) = log.ceremony_id else {
            return;
        };
        let report = CeremonyReport {
            ceremony_id,
            kind: log.kind,
            key_id: log.key_id,
            client: client.map(str::to_owned),
            attempt: log.attempt,
            phase_reached: log.phase,
            outcome: match fault {
                Some(f) => CeremonyOutcome::Failed(f.error.to_string()),
                None => CeremonyOutcome::Completed,
            },
            participants: log.participants,
            culprits: fault.map(|f| f.culprits.clone()).unwrap_or_default(),
            unconfirmed_wipes: log.unconfirmed,
            duration_ms: log.started.elapsed().as_millis() as u64,
        };
        self.audit.record(&report);
    }

    // ========================================================================
    // key generation and import
    // ========================================================================

    /// distributed keygen over all domains; nobody ever holds the full key
    pub async fn keygen(&self) -> Result<GroupKey> {
        let key_id = KeyId::random();
        let mut last = None;
        for attempt in 1..=self.config.max_ceremony_attempts {
            let mut log = AttemptLog::new(CeremonyKind::Keygen, key_id, attempt);
            let result = self.keygen_once(key_id, &mut log).await;
            self.report(log, None, result.as_ref().err());
            match result {
                Ok(key) => return Ok(key),
                Err(fault) if fault.error.is_retryable() => {
                    warn!(%key_id, attempt, error = %fault.error, culprits = ?fault.culprits, "keygen attempt failed");
                    last = Some(fault.error);
                }
                Err(fault) => return Err(fault.error),
            }
        }
        Err(last.unwrap_or_else(|| Error::ProtocolViolation("keygen never attempted".into())))
    }

    async fn keygen_once(&self, key_id: KeyId, log: &mut AttemptLog) -> Transition<GroupKey> {
        let participants: Vec<u32> = (1..=self.config.participant_count).collect();
        let ceremony = KeygenCeremony::new(key_id, self.config.threshold, participants.clone())?;
        let ceremony_id = ceremony.id();
        log.begin(ceremony_id, &participants);
        let guard = WipeGuard::arm(ceremony_id, self.domains.clone());

        let result = self.run_keygen(ceremony, log).await;

        let unconfirmed = self.wipe_all(ceremony_id, &participants).await;
        guard.disarm();
        log.unconfirmed = self.serials(&unconfirmed);
        let (group_key, receipts) = result?;
        self.accept_key(ceremony_id, key_id, group_key, receipts, &unconfirmed)
            .await
    }

    async fn run_keygen(
        &self,
        ceremony: KeygenCeremony<keygen::Idle>,
        log: &mut AttemptLog,
    ) -> Transition<(GroupPublicKey, Vec<ShareReceipt>)> {
        let id = ceremony.id();
        let key_id = ceremony.key_id();
        let threshold = ceremony.threshold();

        let mut calls = Vec::new();
        for i in ceremony.participants() {
            calls.push((*i, self.domain(*i)?.dkg_commit(id, key_id, *i, threshold)));
        }
        let (packages, failed) = partition(self.round("dkg commit", calls).await);
        if !failed.is_empty() {
            return Err(round_fault(failed));
        }
        let ceremony = ceremony.committed(values(packages))?;
        log.phase = ceremony.phase();

        let recipients = self.transport_keys();
        let mut calls = Vec::new();
        for i in ceremony.participants() {
            let packages = ceremony.packages().to_vec();
            calls.push((*i, self.domain(*i)?.dkg_deal(id, packages, recipients.clone())));
        }
        let (batches, failed) = partition(self.round("dkg deal", calls).await);
        if !failed.is_empty() {
            return Err(round_fault(failed));
        }
        let ceremony = ceremony.dealt(batches)?;
        log.phase = ceremony.phase();

        let mut calls = Vec::new();
        for i in ceremony.participants() {
            calls.push((*i, self.domain(*i)?.dkg_finalize(id, ceremony.inbox_for(*i))));
        }
        let (receipts, failed) = partition(self.round("dkg finalize", calls).await);
        let receipts = values(receipts);
        if !failed.is_empty() {
            self.discard(&receipts).await;
            return Err(round_fault(failed));
        }
        let ceremony = match ceremony.finalized(receipts.clone()) {
            Ok(c) => c,
            Err(fault) => {
                self.discard(&receipts).await;
                return Err(fault);
            }
        };
        log.phase = ceremony.phase();
        Ok(ceremony.into_receipts())
    }

    /// import a dealer-split key. one attempt: the bundle is bound to its
    /// ceremony id, so a retry needs a fresh bundle from the client
    pub async fn import(&self, bundle: ImportBundle) -> Result<GroupKey> {
        let mut log = AttemptLog::new(CeremonyKind::Import, bundle.key_id, 1);
        let result = self.import_once(&bundle, &mut log).await;
        self.report(log, None, result.as_ref().err());
        result.map_err(|fault| {
            warn!(key_id = %bundle.key_id, error = %fault.error, culprits = ?fault.culprits, "import failed");
            fault.error
        })
    }

    async fn import_once(&self, bundle: &ImportBundle, log: &mut AttemptLog) -> Transition<GroupKey> {
        let participants: Vec<u32> = (1..=self.config.participant_count).collect();
        if bundle.threshold != self.config.threshold {
            return Err(Error::InvalidInput(format!(
                "bundle threshold {} does not match configured {}",
                bundle.threshold, self.config.threshold
            ))
            .into());
        }
        let mut indices: Vec<u32> = bundle.shares.iter().map(|(i, _)| *i).collect();
        indices.sort_unstable();
        if indices != participants {
            return Err(Error::InvalidInput("bundle must carry one share per domain".into()).into());
        }
        if bundle.group_key != GroupPublicKey::from_point(bundle.commitment.constant_term()) {
            return Err(Error::InvalidInput("bundle group key does not match commitment".into()).into());
        }

        let id = bundle.ceremony_id;
        log.begin(id, &participants);
        let guard = WipeGuard::arm(id, self.domains.clone());

        let mut calls = Vec::with_capacity(bundle.shares.len());
        for (i, sealed) in &bundle.shares {
            let d = self.domain(*i)?;
            calls.push((
                *i,
                d.import_share(
                    id,
                    bundle.key_id,
                    *i,
                    bundle.threshold,
                    bundle.group_key,
                    sealed.clone(),
                ),
            ));
        }
        let (receipts, failed) = partition(self.round("import", calls).await);
        let receipts = values(receipts);
        let checked = if failed.is_empty() {
            verify_import(&bundle.commitment, bundle.threshold, &participants, &receipts)
        } else {
            Err(round_fault(failed))
        };
        let unconfirmed = self.wipe_all(id, &participants).await;
        guard.disarm();
        log.unconfirmed = self.serials(&unconfirmed);

        let group_key = match checked {
            Ok(k) => k,
            Err(fault) => {
                self.discard(&receipts).await;
                return Err(fault);
            }
        };
        log.phase = CeremonyPhase::Finalized;
        self.accept_key(id, bundle.key_id, group_key, receipts, &unconfirmed)
            .await
    }

    /// last checks before a new key is handed out: wipes, attestations
    async fn accept_key(
        &self,
        ceremony_id: CeremonyId,
        key_id: KeyId,
        group_key: GroupPublicKey,
        receipts: Vec<ShareReceipt>,
        unconfirmed: &[u32],
    ) -> Transition<GroupKey> {
        if !unconfirmed.is_empty() {
            self.discard(&receipts).await;
            return Err(CeremonyFault::blame_all(
                Error::WipeUnconfirmed(self.serials(unconfirmed).join(", ")),
                unconfirmed.to_vec(),
            ));
        }
        let attestations = receipts
            .iter()
            .map(|r| (r.index, r.attestation.clone()))
            .collect();
        if let Err(fault) = self.admit_attestations(&ceremony_id, attestations) {
            self.discard(&receipts).await;
            return Err(fault);
        }

        let mut shares = Vec::with_capacity(receipts.len());
        for r in receipts {
            shares.push(ShareRecord {
                index: r.index,
                domain: self.domain(r.index)?.identity().clone(),
                share_id: r.share_id,
                capability: r.capability,
                public_share: r.public_share,
            });
        }
        shares.sort_by_key(|s| s.index);
        info!(%ceremony_id, %key_id, threshold = self.config.threshold, "group key established");
        Ok(GroupKey {
            key_id,
            verifying_key: group_key,
            threshold: self.config.threshold,
            shares,
        })
    }

    /// remove every share of `key` from its domain
    pub async fn destroy(&self, key: &GroupKey) -> Result<()> {
        self.check_key(key)?;
        let lock = self.key_lock(key.key_id)?;
        let _serial = lock.lock().await;
        // a leased share cannot be destroyed
        let stuck = self.settle_wipes(key.key_id).await?;
        if !stuck.is_empty() {
            warn!(key_id = %key.key_id, participants = ?stuck, "destroying with unwiped ceremony state");
        }
        let mut calls = Vec::with_capacity(key.shares.len());
        for s in &key.shares {
            calls.push((s.index, self.domain(s.index)?.destroy_share(s.share_id, s.capability.clone())));
        }
        let (_, failed) = partition(self.round("destroy", calls).await);
        match failed.into_iter().next() {
            Some((i, e)) => {
                warn!(key_id = %key.key_id, participant = i, error = %e, "share not destroyed");
                Err(e)
            }
            None => {
                self.pending_wipes
                    .lock()
                    .map_err(|e| Error::Storage(e.to_string()))?
                    .remove(&key.key_id);
                info!(key_id = %key.key_id, "group key destroyed");
                Ok(())
            }
        }
    }

    // ========================================================================
    // signing
    // ========================================================================

    fn check_key(&self, key: &GroupKey) -> Result<()> {
        if key.threshold == 0 || key.threshold as usize > key.shares.len() {
            return Err(Error::InvalidInput("group key threshold out of range".into()));
        }
        for s in &key.shares {
            let d = self.domain(s.index)?;
            if *d.identity() != s.domain {
                return Err(Error::InvalidInput(format!(
                    "share {} belongs to {}, participant {} is {}",
                    s.index,
                    s.domain,
                    s.index,
                    d.identity()
                )));
            }
        }
        Ok(())
    }

    /// threshold-sign `request.message` with `key`
    pub async fn sign(&self, key: &GroupKey, request: SigningRequest) -> Result<SignedMessage> {
        self.check_key(key)?;
        let lock = self.key_lock(key.key_id)?;
        let _serial = lock.lock().await;

        let client = request.client.as_deref();
        let mut excluded = self.settle_wipes(key.key_id).await?;
        if !excluded.is_empty() {
            warn!(key_id = %key.key_id, participants = ?excluded, "unwiped ceremony state, sitting out");
        }
        let mut last = None;
        for attempt in 1..=self.config.max_ceremony_attempts {
            let candidates: Vec<&ShareRecord> = key
                .shares
                .iter()
                .filter(|s| !excluded.contains(&s.index))
                .collect();
            if candidates.len() < key.threshold as usize {
                last = Some(Error::QuorumNotMet {
                    have: candidates.len(),
                    need: key.threshold as usize,
                });
                break;
            }

            let mut log = AttemptLog::new(CeremonyKind::Signing, key.key_id, attempt);
            let result = self
                .sign_once(key, &request.message, &candidates, &mut log)
                .await;
            self.report(log, client, result.as_ref().err());
            match result {
                Ok(signed) => {
                    info!(
                        key_id = %key.key_id,
                        ceremony_id = %signed.ceremony_id,
                        attempt,
                        participants = ?signed.participants,
                        "message signed"
                    );
                    return Ok(signed);
                }
                Err(fault) => {
                    warn!(
                        key_id = %key.key_id,
                        attempt,
                        error = %fault.error,
                        culprits = ?fault.culprits,
                        "signing attempt failed"
                    );
                    let retry = fault.error.is_retryable();
                    excluded.extend(fault.culprits);
                    if !retry {
                        return Err(fault.error);
                    }
                    last = Some(fault.error);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::ProtocolViolation("signing never attempted".into())))
    }

    async fn sign_once(
        &self,
        key: &GroupKey,
        message: &[u8],
        candidates: &[&ShareRecord],
        log: &mut AttemptLog,
    ) -> Transition<SignedMessage> {
        let ceremony = SigningCeremony::new(
            key.key_id,
            key.verifying_key,
            key.threshold,
            message.to_vec(),
        );
        let id = ceremony.id();
        let contacted: Vec<u32> = candidates.iter().map(|s| s.index).collect();
        log.begin(id, &contacted);
        let mut targets = Vec::with_capacity(contacted.len());
        for i in &contacted {
            targets.push(self.domain(*i)?.clone());
        }
        let guard = WipeGuard::arm(id, targets);

        let result = self.run_signing(ceremony, key, candidates, log).await;

        let unconfirmed = self.wipe_all(id, &contacted).await;
        guard.disarm();
        log.unconfirmed = self.serials(&unconfirmed);
        self.defer_wipes(key.key_id, id, &unconfirmed)?;
        let ceremony = result?;
        if !unconfirmed.is_empty() {
            return Err(CeremonyFault::blame_all(
                Error::WipeUnconfirmed(self.serials(&unconfirmed).join(", ")),
                unconfirmed,
            ));
        }

        let signers = ceremony.signers();
        let mut calls = Vec::with_capacity(signers.len());
        for i in &signers {
            calls.push((*i, self.domain(*i)?.attest(id)));
        }
        let attestations = self
            .round("attest", calls)
            .await
            .into_iter()
            .map(|(i, r)| (i, r.ok()))
            .collect();
        let attestations = self.admit_attestations(&id, attestations)?;

        let ceremony = ceremony.wiped(attestations);
        log.phase = ceremony.phase();
        let (signature, participants, attestations) = ceremony.into_output();
        Ok(SignedMessage {
            key_id: key.key_id,
            ceremony_id: id,
            signature,
            participants,
            attestations,
        })
    }

    async fn run_signing(
        &self,
        ceremony: SigningCeremony<signing::Idle>,
        key: &GroupKey,
        candidates: &[&ShareRecord],
        log: &mut AttemptLog,
    ) -> Transition<SigningCeremony<signing::Aggregated>> {
        let id = ceremony.id();

        // idle -> shares retrieved: every responsive candidate signs
        let mut calls = Vec::with_capacity(candidates.len());
        for s in candidates {
            let d = self.domain(s.index)?;
            calls.push((s.index, d.load_share(id, s.share_id, s.capability.clone())));
        }
        let (handles, failed) = partition(self.round("load", calls).await);
        if let Some((i, _)) = failed.iter().find(|(_, e)| matches!(e, Error::AccessDenied)) {
            return Err(CeremonyFault::blame(Error::AccessDenied, *i));
        }
        let missing: Vec<u32> = failed.iter().map(|(i, _)| *i).collect();
        if let Some((i, _)) = handles.iter().find(|(i, h)| h.index != *i) {
            return Err(CeremonyFault::blame(
                Error::ProtocolViolation(format!("participant {} loaded a foreign share", i)),
                *i,
            ));
        }
        let expected: Vec<(u32, RistrettoPoint)> =
            key.shares.iter().map(|s| (s.index, s.public_share)).collect();
        let ceremony = ceremony
            .shares_retrieved(values(handles), &expected)
            .map_err(|mut fault| {
                if fault.culprits.is_empty() {
                    fault.culprits = missing.clone();
                }
                fault
            })?;
        log.phase = ceremony.phase();
        log.participants = ceremony.signers();

        // round 1: commitments
        let mut calls = Vec::new();
        for i in ceremony.signers() {
            calls.push((i, self.domain(i)?.sign_commit(id)));
        }
        let (commitments, failed) = partition(self.round("round1", calls).await);
        if !failed.is_empty() {
            return Err(round_fault(failed));
        }
        let ceremony = ceremony.commitments_fixed(values(commitments))?;
        log.phase = ceremony.phase();

        // round 2: partials over the fixed package
        let package = ceremony.signing_package().clone();
        let mut calls = Vec::new();
        for i in ceremony.signers() {
            calls.push((i, self.domain(i)?.sign_share(id, package.clone())));
        }
        let (shares, failed) = partition(self.round("round2", calls).await);
        if !failed.is_empty() {
            return Err(round_fault(failed));
        }
        let ceremony = ceremony.partials_collected(values(shares))?;
        log.phase = ceremony.phase();

        let ceremony = ceremony.aggregate()?;
        log.phase = ceremony.phase();
        Ok(ceremony)
    }
}

impl<D: Domain> core::fmt::Debug for Coordinator<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("threshold", &self.config.threshold)
            .field(
                "domains",
                &self.domains.iter().map(|d| d.identity().serial.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(all(test, feature = "software"))]
mod tests {
    use super::*;
    use crate::domain::software::SoftwareDomain;
    use rand::rngs::OsRng;

    fn domains(n: u32) -> Vec<Arc<SoftwareDomain>> {
        (1..=n)
            .map(|i| Arc::new(SoftwareDomain::new(format!("hsm-{}", i))))
            .collect()
    }

    #[test]
    fn test_rejects_domain_count_mismatch() {
        let config = Config::default();
        assert!(matches!(
            Coordinator::new(config, domains(2)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_domains() {
        let d = Arc::new(SoftwareDomain::new("hsm-1"));
        let list = vec![d.clone(), d.clone(), d];
        assert!(matches!(
            Coordinator::new(Config::default(), list),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_keygen_then_sign() {
        let coordinator = Coordinator::new(Config::default(), domains(3)).unwrap();
        let key = coordinator.keygen().await.unwrap();
        assert_eq!(key.shares.len(), 3);

        let signed = coordinator
            .sign(&key, SigningRequest::new(b"hello".to_vec()))
            .await
            .unwrap();
        key.verifying_key.verify(b"hello", &signed.signature).unwrap();
        assert_eq!(signed.participants, vec![1, 2, 3]);
        assert_eq!(signed.attestations.len(), 3);
    }

    #[tokio::test]
    async fn test_import_bundle_checks() {
        let coordinator = Coordinator::new(Config::default(), domains(3)).unwrap();
        let secret = SecretKey::generate(&mut OsRng);
        let mut bundle =
            ImportBundle::prepare(&secret, 2, &coordinator.transport_keys(), &mut OsRng).unwrap();
        bundle.shares.pop();
        assert!(matches!(
            coordinator.import(bundle).await,
            Err(Error::InvalidInput(_))
        ));

        let bundle =
            ImportBundle::prepare(&secret, 2, &coordinator.transport_keys(), &mut OsRng).unwrap();
        let key = coordinator.import(bundle).await.unwrap();
        assert_eq!(key.verifying_key, secret.public_key());
    }

    #[tokio::test]
    async fn test_idle_key_locks_pruned() {
        let coordinator = Coordinator::new(Config::default(), domains(3)).unwrap();
        let first = coordinator.keygen().await.unwrap();
        let second = coordinator.keygen().await.unwrap();
        for key in [&first, &second, &first] {
            coordinator
                .sign(key, SigningRequest::new(b"m".to_vec()))
                .await
                .unwrap();
        }
        assert_eq!(coordinator.key_locks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_resends_owed_wipes() {
        let hsms = domains(3);
        let coordinator = Coordinator::new(Config::default(), hsms.clone()).unwrap();
        let key = coordinator.keygen().await.unwrap();
        hsms[2].set_fault(Some(crate::domain::software::Fault::FailAt(
            crate::domain::software::Stage::Wipe,
        )))
        .unwrap();
        coordinator
            .sign(&key, SigningRequest::new(b"m".to_vec()))
            .await
            .unwrap();
        assert_eq!(coordinator.pending_wipes.lock().unwrap()[&key.key_id].len(), 1);

        hsms[2].revive().unwrap();
        coordinator.destroy(&key).await.unwrap();
        assert!(coordinator.pending_wipes.lock().unwrap().is_empty());
        assert_eq!(hsms[2].active_sessions().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_foreign_key_rejected() {
        let coordinator = Coordinator::new(Config::default(), domains(3)).unwrap();
        let mut key = coordinator.keygen().await.unwrap();
        key.shares[0].domain = DomainIdentity::new("elsewhere");
        assert!(matches!(
            coordinator.sign(&key, SigningRequest::new(b"m".to_vec())).await,
            Err(Error::InvalidInput(_))
        ));
    }
}

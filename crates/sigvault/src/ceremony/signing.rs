//! signing ceremony states

use curve25519_dalek::ristretto::RistrettoPoint;

use super::{CeremonyFault, CeremonyId, CeremonyPhase, KeyId, State, Transition};
use crate::attest::Attestation;
use crate::domain::ShareHandle;
use crate::frost::{
    aggregate, verify_share, GroupPublicKey, Signature, SignatureShare, SigningCommitments,
    SigningPackage,
};
use crate::Error;

pub struct Idle;

pub struct SharesRetrieved {
    signers: Vec<ShareHandle>,
}

pub struct Round1Committed {
    signers: Vec<ShareHandle>,
    package: SigningPackage,
}

pub struct Round2Signed {
    signers: Vec<ShareHandle>,
    package: SigningPackage,
    shares: Vec<SignatureShare>,
}

pub struct Aggregated {
    signers: Vec<ShareHandle>,
    signature: Signature,
}

pub struct Wiped {
    signers: Vec<ShareHandle>,
    signature: Signature,
    attestations: Vec<Attestation>,
}

impl State for Idle {
    const PHASE: CeremonyPhase = CeremonyPhase::Idle;
}

impl State for SharesRetrieved {
    const PHASE: CeremonyPhase = CeremonyPhase::SharesRetrieved;
}

impl State for Round1Committed {
    const PHASE: CeremonyPhase = CeremonyPhase::Round1Committed;
}

impl State for Round2Signed {
    const PHASE: CeremonyPhase = CeremonyPhase::Round2Signed;
}

impl State for Aggregated {
    const PHASE: CeremonyPhase = CeremonyPhase::Aggregated;
}

impl State for Wiped {
    const PHASE: CeremonyPhase = CeremonyPhase::Wiped;
}

/// one signing ceremony in state `S`
pub struct SigningCeremony<S> {
    id: CeremonyId,
    key_id: KeyId,
    group_key: GroupPublicKey,
    threshold: u32,
    message: Vec<u8>,
    state: S,
}

impl<S> SigningCeremony<S> {
    pub fn id(&self) -> CeremonyId {
        self.id
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    fn advance<T>(self, state: T) -> SigningCeremony<T> {
        SigningCeremony {
            id: self.id,
            key_id: self.key_id,
            group_key: self.group_key,
            threshold: self.threshold,
            message: self.message,
            state,
        }
    }
}

impl<S: State> SigningCeremony<S> {
    pub fn phase(&self) -> CeremonyPhase {
        S::PHASE
    }
}

fn indices(signers: &[ShareHandle]) -> Vec<u32> {
    signers.iter().map(|s| s.index).collect()
}

impl SigningCeremony<Idle> {
    pub fn new(key_id: KeyId, group_key: GroupPublicKey, threshold: u32, message: Vec<u8>) -> Self {
        Self {
            id: CeremonyId::random(),
            key_id,
            group_key,
            threshold,
            message,
            state: Idle,
        }
    }

    /// `expected` is the public share on record for each participant
    pub fn shares_retrieved(
        self,
        mut handles: Vec<ShareHandle>,
        expected: &[(u32, RistrettoPoint)],
    ) -> Transition<SigningCeremony<SharesRetrieved>> {
        handles.sort_by_key(|h| h.index);
        handles.dedup_by_key(|h| h.index);
        for h in &handles {
            let on_record = expected.iter().find(|(i, _)| *i == h.index).map(|(_, p)| p);
            if on_record != Some(&h.public_share) {
                return Err(CeremonyFault::blame(
                    Error::ProtocolViolation(format!(
                        "participant {} loaded a share that is not on record",
                        h.index
                    )),
                    h.index,
                ));
            }
        }
        if handles.len() < self.threshold as usize {
            return Err(CeremonyFault::new(Error::QuorumNotMet {
                have: handles.len(),
                need: self.threshold as usize,
            }));
        }
        Ok(self.advance(SharesRetrieved { signers: handles }))
    }
}

impl SigningCeremony<SharesRetrieved> {
    pub fn signers(&self) -> Vec<u32> {
        indices(&self.state.signers)
    }

    /// fix the commitment set. needs exactly one from every signer
    pub fn commitments_fixed(
        self,
        commitments: Vec<SigningCommitments>,
    ) -> Transition<SigningCeremony<Round1Committed>> {
        let signers = indices(&self.state.signers);
        if let Some(stray) = commitments.iter().find(|c| !signers.contains(&c.index)) {
            return Err(CeremonyFault::blame(
                Error::ProtocolViolation(format!("commitment from non-signer {}", stray.index)),
                stray.index,
            ));
        }
        let missing: Vec<u32> = signers
            .iter()
            .copied()
            .filter(|i| !commitments.iter().any(|c| c.index == *i))
            .collect();
        if !missing.is_empty() {
            return Err(CeremonyFault::blame_all(
                Error::ProtocolViolation(format!("missing commitments from {:?}", missing)),
                missing,
            ));
        }

        let package = SigningPackage::new(self.message.clone(), commitments.clone()).map_err(|e| {
            // attribute a duplicate to whoever sent it second
            let culprit = duplicate_sender(&commitments);
            match culprit {
                Some(i) => CeremonyFault::blame(e, i),
                None => CeremonyFault::new(e),
            }
        })?;
        let signers = self.state.signers.clone();
        Ok(self.advance(Round1Committed { signers, package }))
    }
}

fn duplicate_sender(commitments: &[SigningCommitments]) -> Option<u32> {
    let mut seen = std::collections::HashMap::new();
    for c in commitments {
        for p in [c.hiding, c.binding] {
            if let Some(first) = seen.insert(p.compress().to_bytes(), c.index) {
                return Some(first.max(c.index));
            }
        }
    }
    None
}

impl SigningCeremony<Round1Committed> {
    /// only exists once every commitment is fixed
    pub fn signing_package(&self) -> &SigningPackage {
        &self.state.package
    }

    pub fn signers(&self) -> Vec<u32> {
        indices(&self.state.signers)
    }

    /// verify each partial against its signer's public share
    pub fn partials_collected(
        self,
        shares: Vec<SignatureShare>,
    ) -> Transition<SigningCeremony<Round2Signed>> {
        let signers = indices(&self.state.signers);
        let mut bad = Vec::new();
        for i in &signers {
            let Some(share) = shares.iter().find(|s| s.index == *i) else {
                bad.push(*i);
                continue;
            };
            let Some(handle) = self.state.signers.iter().find(|h| h.index == *i) else {
                bad.push(*i);
                continue;
            };
            let package = &self.state.package;
            if verify_share(share, &handle.public_share, package, &self.group_key).is_err() {
                bad.push(*i);
            }
        }
        if !bad.is_empty() {
            return Err(CeremonyFault::blame_all(
                Error::ProtocolViolation(format!("invalid or missing partials from {:?}", bad)),
                bad,
            ));
        }
        if shares.len() != signers.len() {
            return Err(CeremonyFault::new(Error::ProtocolViolation(
                "unexpected extra partial signatures".into(),
            )));
        }
        let Round1Committed { signers, package } = self.state;
        let next = Round2Signed {
            signers,
            package,
            shares,
        };
        Ok(SigningCeremony {
            id: self.id,
            key_id: self.key_id,
            group_key: self.group_key,
            threshold: self.threshold,
            message: self.message,
            state: next,
        })
    }
}

impl SigningCeremony<Round2Signed> {
    pub fn aggregate(self) -> Transition<SigningCeremony<Aggregated>> {
        let public: Vec<(u32, RistrettoPoint)> = self
            .state
            .signers
            .iter()
            .map(|h| (h.index, h.public_share))
            .collect();
        let signature = aggregate(
            &self.state.package,
            &self.state.shares,
            &public,
            &self.group_key,
            self.threshold,
        )?;
        let signers = self.state.signers.clone();
        Ok(self.advance(Aggregated { signers, signature }))
    }
}

impl SigningCeremony<Aggregated> {
    pub fn signers(&self) -> Vec<u32> {
        indices(&self.state.signers)
    }

    /// every signer confirmed its wipe; attach the attestations
    pub fn wiped(self, attestations: Vec<Attestation>) -> SigningCeremony<Wiped> {
        let Aggregated { signers, signature } = self.state;
        SigningCeremony {
            id: self.id,
            key_id: self.key_id,
            group_key: self.group_key,
            threshold: self.threshold,
            message: self.message,
            state: Wiped {
                signers,
                signature,
                attestations,
            },
        }
    }
}

impl SigningCeremony<Wiped> {
    pub fn signature(&self) -> &Signature {
        &self.state.signature
    }

    /// (signature, signer indices, attestations)
    pub fn into_output(self) -> (Signature, Vec<u32>, Vec<Attestation>) {
        let signers = indices(&self.state.signers);
        (self.state.signature, signers, self.state.attestations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frost::{dealer, KeyPackage, SecretKey, SigningNonces};
    use rand::rngs::OsRng;

    struct Fixture {
        group: GroupPublicKey,
        keys: Vec<KeyPackage>,
    }

    fn fixture() -> Fixture {
        let secret = SecretKey::generate(&mut OsRng);
        let group = secret.public_key();
        let out = dealer::split(&secret, 2, 3, &mut OsRng).unwrap();
        let keys = out
            .shares
            .iter()
            .map(|s| KeyPackage::new(s.index(), 2, *s.value(), group).unwrap())
            .collect();
        Fixture { group, keys }
    }

    fn handles(f: &Fixture, which: &[usize]) -> Vec<ShareHandle> {
        which
            .iter()
            .map(|&i| ShareHandle {
                index: f.keys[i].index(),
                public_share: *f.keys[i].public_share(),
            })
            .collect()
    }

    fn record(f: &Fixture) -> Vec<(u32, RistrettoPoint)> {
        f.keys.iter().map(|k| (k.index(), *k.public_share())).collect()
    }

    #[test]
    fn test_full_walk() {
        let f = fixture();
        let c = SigningCeremony::new(KeyId::random(), f.group, 2, b"pay bob".to_vec());
        assert_eq!(c.phase(), CeremonyPhase::Idle);
        let c = c.shares_retrieved(handles(&f, &[0, 2]), &record(&f)).unwrap();
        assert_eq!(c.phase(), CeremonyPhase::SharesRetrieved);
        assert_eq!(c.signers(), vec![1, 3]);

        let nonces: Vec<SigningNonces> = [0, 2]
            .iter()
            .map(|&i| f.keys[i].commit(&mut OsRng))
            .collect();
        let c = c
            .commitments_fixed(nonces.iter().map(|n| n.commitments()).collect())
            .unwrap();
        let package = c.signing_package().clone();
        let shares = [0, 2]
            .iter()
            .zip(nonces)
            .map(|(&i, n)| f.keys[i].sign(&package, n).unwrap())
            .collect();
        let c = c.partials_collected(shares).unwrap().aggregate().unwrap();
        assert_eq!(c.phase(), CeremonyPhase::Aggregated);
        let done = c.wiped(Vec::new());
        assert_eq!(done.phase(), CeremonyPhase::Wiped);
        f.group.verify(b"pay bob", done.signature()).unwrap();
        let (_, signers, _) = done.into_output();
        assert_eq!(signers, vec![1, 3]);
    }

    #[test]
    fn test_quorum_not_met() {
        let f = fixture();
        let c = SigningCeremony::new(KeyId::random(), f.group, 2, b"m".to_vec());
        let fault = c.shares_retrieved(handles(&f, &[1]), &record(&f)).err().unwrap();
        assert!(matches!(fault.error, Error::QuorumNotMet { have: 1, need: 2 }));
    }

    #[test]
    fn test_unknown_share_blamed() {
        let f = fixture();
        let mut h = handles(&f, &[0, 1]);
        h[1].public_share = *f.keys[2].public_share();
        let c = SigningCeremony::new(KeyId::random(), f.group, 2, b"m".to_vec());
        let fault = c.shares_retrieved(h, &record(&f)).err().unwrap();
        assert_eq!(fault.culprits, vec![2]);
    }

    #[test]
    fn test_missing_commitment_blamed() {
        let f = fixture();
        let c = SigningCeremony::new(KeyId::random(), f.group, 2, b"m".to_vec())
            .shares_retrieved(handles(&f, &[0, 1, 2]), &record(&f))
            .unwrap();
        let n1 = f.keys[0].commit(&mut OsRng);
        let n2 = f.keys[1].commit(&mut OsRng);
        let fault = c
            .commitments_fixed(vec![n1.commitments(), n2.commitments()])
            .err()
            .unwrap();
        assert_eq!(fault.culprits, vec![3]);
    }

    #[test]
    fn test_bad_partial_blamed() {
        let f = fixture();
        let c = SigningCeremony::new(KeyId::random(), f.group, 2, b"m".to_vec())
            .shares_retrieved(handles(&f, &[0, 1]), &record(&f))
            .unwrap();
        let n1 = f.keys[0].commit(&mut OsRng);
        let n2 = f.keys[1].commit(&mut OsRng);
        let c = c
            .commitments_fixed(vec![n1.commitments(), n2.commitments()])
            .unwrap();
        let package = c.signing_package().clone();
        let s1 = f.keys[0].sign(&package, n1).unwrap();
        let mut s2 = f.keys[1].sign(&package, n2).unwrap();
        s2.z = s1.z;
        let fault = c.partials_collected(vec![s1, s2]).err().unwrap();
        assert_eq!(fault.culprits, vec![2]);
    }
}

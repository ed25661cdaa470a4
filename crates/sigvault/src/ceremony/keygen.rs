//! key-generation and import ceremony states
//!
//! the coordinator only relays: round-1 packages (public), sealed
//! sub-shares (ciphertext), receipts (public shares). it accepts the key
//! once every receipt matches what the commitments imply and all domains
//! agree on one group key.

use curve25519_dalek::ristretto::RistrettoPoint;

use super::{CeremonyFault, CeremonyId, CeremonyPhase, KeyId, State, Transition};
use crate::domain::{DealtShare, ShareReceipt};
use crate::frost::dkg::{self, Commitment, Round1Package};
use crate::frost::GroupPublicKey;
use crate::Error;

pub struct Idle;

pub struct Committed {
    packages: Vec<Round1Package>,
}

pub struct Dealt {
    packages: Vec<Round1Package>,
    dealt: Vec<DealtShare>,
}

pub struct Finalized {
    group_key: GroupPublicKey,
    receipts: Vec<ShareReceipt>,
}

impl State for Idle {
    const PHASE: CeremonyPhase = CeremonyPhase::Idle;
}

impl State for Committed {
    const PHASE: CeremonyPhase = CeremonyPhase::Committed;
}

impl State for Dealt {
    const PHASE: CeremonyPhase = CeremonyPhase::Dealt;
}

impl State for Finalized {
    const PHASE: CeremonyPhase = CeremonyPhase::Finalized;
}

pub struct KeygenCeremony<S> {
    id: CeremonyId,
    key_id: KeyId,
    threshold: u32,
    participants: Vec<u32>,
    state: S,
}

impl<S> KeygenCeremony<S> {
    pub fn id(&self) -> CeremonyId {
        self.id
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn participants(&self) -> &[u32] {
        &self.participants
    }

    /// context string the proofs of knowledge are bound to
    pub fn context(&self) -> Vec<u8> {
        dkg_context(&self.id, &self.key_id)
    }

    fn advance<T>(self, state: T) -> KeygenCeremony<T> {
        KeygenCeremony {
            id: self.id,
            key_id: self.key_id,
            threshold: self.threshold,
            participants: self.participants,
            state,
        }
    }
}

pub fn dkg_context(ceremony_id: &CeremonyId, key_id: &KeyId) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(32);
    ctx.extend_from_slice(ceremony_id.as_bytes());
    ctx.extend_from_slice(key_id.as_bytes());
    ctx
}

fn check_receipts(
    receipts: &[ShareReceipt],
    participants: &[u32],
    group_key: &GroupPublicKey,
    expected: impl Fn(u32) -> RistrettoPoint,
) -> Transition<()> {
    let mut bad = Vec::new();
    for i in participants {
        match receipts.iter().find(|r| r.index == *i) {
            Some(r) if r.group_key == *group_key && r.public_share == expected(*i) => {}
            _ => bad.push(*i),
        }
    }
    if !bad.is_empty() {
        return Err(CeremonyFault::blame_all(
            Error::ProtocolViolation(format!("inconsistent key shares from {:?}", bad)),
            bad,
        ));
    }
    Ok(())
}

impl<S: State> KeygenCeremony<S> {
    pub fn phase(&self) -> CeremonyPhase {
        S::PHASE
    }
}

impl KeygenCeremony<Idle> {
    pub fn new(key_id: KeyId, threshold: u32, participants: Vec<u32>) -> Result<Self, Error> {
        if threshold == 0 || threshold as usize > participants.len() {
            return Err(Error::InvalidInput(format!(
                "cannot run {}-of-{} key generation",
                threshold,
                participants.len()
            )));
        }
        Ok(Self {
            id: CeremonyId::random(),
            key_id,
            threshold,
            participants,
            state: Idle,
        })
    }

    /// every participant's polynomial commitment and proof check out
    pub fn committed(self, packages: Vec<Round1Package>) -> Transition<KeygenCeremony<Committed>> {
        let ctx = self.context();
        let mut bad = Vec::new();
        for i in &self.participants {
            match packages.iter().find(|p| p.index == *i) {
                Some(p) if p.verify(self.threshold, &ctx).is_ok() => {}
                _ => bad.push(*i),
            }
        }
        if !bad.is_empty() {
            return Err(CeremonyFault::blame_all(
                Error::ProtocolViolation(format!("bad round-1 packages from {:?}", bad)),
                bad,
            ));
        }
        if packages.len() != self.participants.len() {
            return Err(CeremonyFault::new(Error::ProtocolViolation(
                "round-1 packages from outside the participant set".into(),
            )));
        }
        Ok(self.advance(Committed { packages }))
    }
}

impl KeygenCeremony<Committed> {
    pub fn packages(&self) -> &[Round1Package] {
        &self.state.packages
    }

    /// each participant sealed exactly one sub-share to every other one
    pub fn dealt(self, batches: Vec<(u32, Vec<DealtShare>)>) -> Transition<KeygenCeremony<Dealt>> {
        let mut bad = Vec::new();
        let mut dealt = Vec::new();
        for from in &self.participants {
            let Some((_, batch)) = batches.iter().find(|(i, _)| i == from) else {
                bad.push(*from);
                continue;
            };
            let complete = self
                .participants
                .iter()
                .filter(|to| *to != from)
                .all(|to| batch.iter().filter(|d| d.from == *from && d.to == *to).count() == 1);
            if !complete || batch.len() != self.participants.len() - 1 {
                bad.push(*from);
                continue;
            }
            dealt.extend(batch.iter().cloned());
        }
        if !bad.is_empty() {
            return Err(CeremonyFault::blame_all(
                Error::ProtocolViolation(format!("incomplete sub-share batches from {:?}", bad)),
                bad,
            ));
        }
        let packages = self.state.packages.clone();
        Ok(self.advance(Dealt { packages, dealt }))
    }
}

impl KeygenCeremony<Dealt> {
    /// ciphertexts addressed to `index`
    pub fn inbox_for(&self, index: u32) -> Vec<DealtShare> {
        self.state
            .dealt
            .iter()
            .filter(|d| d.to == index)
            .cloned()
            .collect()
    }

    pub fn finalized(self, receipts: Vec<ShareReceipt>) -> Transition<KeygenCeremony<Finalized>> {
        let packages = &self.state.packages;
        let group_key = dkg::group_key(packages);
        check_receipts(&receipts, &self.participants, &group_key, |j| {
            dkg::expected_public_share(packages, j)
        })?;
        Ok(self.advance(Finalized {
            group_key,
            receipts,
        }))
    }
}

impl KeygenCeremony<Finalized> {
    pub fn group_key(&self) -> &GroupPublicKey {
        &self.state.group_key
    }

    pub fn into_receipts(self) -> (GroupPublicKey, Vec<ShareReceipt>) {
        (self.state.group_key, self.state.receipts)
    }
}

/// import: one round, checked against the dealer's commitment
pub fn verify_import(
    commitment: &Commitment,
    threshold: u32,
    participants: &[u32],
    receipts: &[ShareReceipt],
) -> Transition<GroupPublicKey> {
    if commitment.threshold() != threshold {
        return Err(CeremonyFault::new(Error::InvalidInput(
            "dealer commitment does not match threshold".into(),
        )));
    }
    let group_key = GroupPublicKey::from_point(commitment.constant_term());
    check_receipts(receipts, participants, &group_key, |j| commitment.evaluate_at(j))?;
    Ok(group_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frost::dkg::part1;
    use crate::frost::sealed::{seal_scalar, TransportSecret};
    use crate::store::{Capability, ShareId};
    use rand::rngs::OsRng;

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(KeygenCeremony::new(KeyId::random(), 4, vec![1, 2, 3]).is_err());
        assert!(KeygenCeremony::new(KeyId::random(), 0, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_committed_blames_bad_proof() {
        let c = KeygenCeremony::new(KeyId::random(), 2, vec![1, 2, 3]).unwrap();
        assert_eq!(c.phase(), CeremonyPhase::Idle);
        let ctx = c.context();
        let mut packages: Vec<Round1Package> = (1..=3)
            .map(|i| part1(i, 2, &ctx, &mut OsRng).unwrap().1)
            .collect();
        // participant 3 reuses participant 1's proof
        packages[2].proof = packages[0].proof;
        let fault = c.committed(packages).err().unwrap();
        assert_eq!(fault.culprits, vec![3]);
    }

    #[test]
    fn test_dealt_requires_full_batches() {
        let c = KeygenCeremony::new(KeyId::random(), 2, vec![1, 2]).unwrap();
        let ctx = c.context();
        let secrets: Vec<_> = (1..=2).map(|i| part1(i, 2, &ctx, &mut OsRng).unwrap()).collect();
        let c = c
            .committed(secrets.iter().map(|(_, p)| p.clone()).collect())
            .unwrap();
        assert_eq!(c.phase(), CeremonyPhase::Committed);

        let t = TransportSecret::generate(&mut OsRng);
        let sealed = seal_scalar(
            &secrets[0].0.subshare_for(2).unwrap(),
            &t.public(),
            b"aad",
            &mut OsRng,
        )
        .unwrap();
        let batches = vec![
            (1, vec![DealtShare { from: 1, to: 2, sealed }]),
            (2, vec![]),
        ];
        let fault = c.dealt(batches).err().unwrap();
        assert_eq!(fault.culprits, vec![2]);
    }

    #[test]
    fn test_import_receipts_checked() {
        let secret = crate::frost::SecretKey::generate(&mut OsRng);
        let out = crate::frost::dealer::split(&secret, 2, 2, &mut OsRng).unwrap();
        let group = secret.public_key();
        let receipt = |i: u32, public_share| ShareReceipt {
            index: i,
            share_id: ShareId::random(),
            capability: Capability::from_bytes([0; 32]),
            public_share,
            group_key: group,
            attestation: None,
        };
        let good: Vec<_> = out
            .shares
            .iter()
            .map(|s| receipt(s.index(), RistrettoPoint::mul_base(s.value())))
            .collect();
        assert_eq!(verify_import(&out.commitment, 2, &[1, 2], &good).unwrap(), group);

        let mut bad = good.clone();
        bad[0].public_share = bad[1].public_share;
        let fault = verify_import(&out.commitment, 2, &[1, 2], &bad).err().unwrap();
        assert_eq!(fault.culprits, vec![1]);
    }
}

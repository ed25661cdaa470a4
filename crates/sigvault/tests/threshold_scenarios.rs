//! end-to-end ceremonies against software domains with injected faults

#![cfg(feature = "software")]

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use sigvault::domain::software::{Fault, Stage};
use sigvault::{
    CeremonyKind, Config, Coordinator, Error, GroupKey, ImportBundle, MemoryAudit, SecretKey,
    SigningRequest, SoftwareDomain,
};

fn domains(n: u32) -> Vec<Arc<SoftwareDomain>> {
    (1..=n)
        .map(|i| Arc::new(SoftwareDomain::new(format!("hsm-{}", i))))
        .collect()
}

fn setup(config: Config) -> (Coordinator<SoftwareDomain>, Vec<Arc<SoftwareDomain>>, Arc<MemoryAudit>) {
    let hsms = domains(config.participant_count);
    let audit = Arc::new(MemoryAudit::new());
    let coordinator = Coordinator::new(config, hsms.clone())
        .unwrap()
        .with_audit(audit.clone());
    (coordinator, hsms, audit)
}

/// nothing of `key` may be left unwrapped or leased on `domain`
fn assert_clean(domain: &SoftwareDomain, key: &GroupKey) {
    assert_eq!(domain.active_sessions().unwrap(), 0, "{:?} has live sessions", domain);
    assert_eq!(domain.store().transient_count().unwrap(), 0);
    for s in &key.shares {
        assert!(!domain.store().is_leased(&s.share_id).unwrap());
    }
}

#[tokio::test]
async fn test_two_of_three_healthy() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"transfer 10".to_vec()).with_client("wallet-a"))
        .await
        .unwrap();

    key.verifying_key
        .verify(b"transfer 10", &signed.signature)
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2, 3]);
    for hsm in &hsms {
        assert_clean(hsm, &key);
    }

    let reports = audit.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].kind, CeremonyKind::Keygen);
    assert_eq!(reports[1].kind, CeremonyKind::Signing);
    assert_eq!(reports[1].client.as_deref(), Some("wallet-a"));
    assert!(reports.iter().all(|r| r.succeeded()));
}

#[tokio::test]
async fn test_domain_fails_in_round1_then_retry_succeeds() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[2].set_fault(Some(Fault::FailAt(Stage::Commit))).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();

    key.verifying_key.verify(b"m", &signed.signature).unwrap();
    assert_eq!(signed.participants, vec![1, 2]);

    let signing: Vec<_> = audit
        .reports()
        .into_iter()
        .filter(|r| r.kind == CeremonyKind::Signing)
        .collect();
    assert_eq!(signing.len(), 2);
    assert!(!signing[0].succeeded());
    assert_eq!(signing[0].culprits, vec![3]);
    assert_ne!(signing[0].ceremony_id, signing[1].ceremony_id);
    assert!(signing[1].succeeded());
    for hsm in &hsms {
        assert_clean(hsm, &key);
    }
}

#[tokio::test]
async fn test_two_domains_killed_leaves_nothing_behind() {
    let (coordinator, hsms, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[1].kill().unwrap();
    hsms[2].kill().unwrap();

    let err = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::QuorumNotMet { have: 1, need: 2 }));
    assert_eq!(err.client_message(), "signing failed");
    assert_clean(&hsms[0], &key);
}

#[tokio::test]
async fn test_domain_revived_signs_again() {
    let (coordinator, hsms, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[1].kill().unwrap();
    hsms[2].kill().unwrap();
    assert!(coordinator.sign(&key, SigningRequest::new(b"m".to_vec())).await.is_err());

    // shares are persisted, only ram was lost
    hsms[1].revive().unwrap();
    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_domain_times_out() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[2].set_fault(Some(Fault::StallAt(Stage::Commit))).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2]);

    let failed = audit
        .reports()
        .into_iter()
        .find(|r| !r.succeeded())
        .unwrap();
    assert!(failed.outcome.reason().is_some_and(|r| r.contains("timed out")));
    assert_eq!(failed.culprits, vec![3]);
    for hsm in &hsms {
        assert_clean(hsm, &key);
    }
}

#[tokio::test]
async fn test_corrupt_partial_is_blamed() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[1].set_fault(Some(Fault::CorruptShare)).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    key.verifying_key.verify(b"m", &signed.signature).unwrap();
    assert_eq!(signed.participants, vec![1, 3]);

    let failed = audit
        .reports()
        .into_iter()
        .find(|r| !r.succeeded())
        .unwrap();
    assert_eq!(failed.culprits, vec![2]);
}

#[tokio::test]
async fn test_offline_domain_fails_wipe_and_is_excluded() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[2].kill().unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2]);

    let signing: Vec<_> = audit
        .reports()
        .into_iter()
        .filter(|r| r.kind == CeremonyKind::Signing)
        .collect();
    assert_eq!(signing.len(), 2);
    assert_eq!(signing[0].unconfirmed_wipes, vec!["hsm-3".to_string()]);
    assert_eq!(signing[0].culprits, vec![3]);
    assert!(signing[1].succeeded());
}

#[tokio::test]
async fn test_unconfirmed_wipe_fails_attempt() {
    let (coordinator, hsms, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[0].set_fault(Some(Fault::UnconfirmedWipe)).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![2, 3]);
}

#[tokio::test]
async fn test_domain_with_failed_wipe_rejoins_after_revive() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[2].set_fault(Some(Fault::FailAt(Stage::Wipe))).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"first".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2]);
    // nonces and lease are still held on the domain that never wiped
    assert_eq!(hsms[2].active_sessions().unwrap(), 1);

    // wipe resent and refused again: the domain sits out up front
    let signed = coordinator
        .sign(&key, SigningRequest::new(b"second".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2]);
    let signing = audit
        .reports()
        .into_iter()
        .filter(|r| r.kind == CeremonyKind::Signing)
        .count();
    assert_eq!(signing, 3);

    hsms[2].revive().unwrap();
    let signed = coordinator
        .sign(&key, SigningRequest::new(b"third".to_vec()))
        .await
        .unwrap();
    key.verifying_key.verify(b"third", &signed.signature).unwrap();
    assert_eq!(signed.participants, vec![1, 2, 3]);
    for hsm in &hsms {
        assert_clean(hsm, &key);
    }
}

#[tokio::test(start_paused = true)]
async fn test_domain_killed_mid_round1() {
    let (coordinator, hsms, audit) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[2].set_fault(Some(Fault::StallAt(Stage::Commit))).unwrap();

    let (signed, _) = tokio::join!(
        coordinator.sign(&key, SigningRequest::new(b"m".to_vec())),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            hsms[2].kill().unwrap();
        }
    );
    let signed = signed.unwrap();
    key.verifying_key.verify(b"m", &signed.signature).unwrap();
    assert_eq!(signed.participants, vec![1, 2]);

    let signing: Vec<_> = audit
        .reports()
        .into_iter()
        .filter(|r| r.kind == CeremonyKind::Signing)
        .collect();
    assert_eq!(signing.len(), 2);
    assert!(!signing[0].succeeded());
    assert_eq!(signing[0].culprits, vec![3]);
    assert!(signing[1].succeeded());
    // power loss took the stalled session with it
    for hsm in &hsms {
        assert_clean(hsm, &key);
    }
}

#[tokio::test]
async fn test_forged_attestation_rejected_when_required() {
    let (coordinator, hsms, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    hsms[2].set_fault(Some(Fault::ForgedAttestation)).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2]);
    assert_eq!(signed.attestations.len(), 2);
}

#[tokio::test]
async fn test_forged_attestation_only_dropped_when_optional() {
    let config = Config {
        attestation_required: false,
        ..Config::default()
    };
    let (coordinator, hsms, _) = setup(config);
    let key = coordinator.keygen().await.unwrap();
    hsms[2].set_fault(Some(Fault::ForgedAttestation)).unwrap();

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    assert_eq!(signed.participants, vec![1, 2, 3]);
    assert_eq!(signed.attestations.len(), 2);
}

#[tokio::test]
async fn test_keygen_needs_every_domain() {
    let config = Config {
        max_ceremony_attempts: 2,
        ..Config::default()
    };
    let (coordinator, hsms, audit) = setup(config);
    hsms[1].kill().unwrap();

    assert!(coordinator.keygen().await.is_err());
    assert_eq!(audit.reports().len(), 2);
    for hsm in &hsms {
        assert!(hsm.store().is_empty().unwrap());
        assert_eq!(hsm.active_sessions().unwrap(), 0);
    }
}

#[tokio::test]
async fn test_concurrent_requests_on_one_key() {
    let (coordinator, hsms, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();

    let (a, b) = tokio::join!(
        coordinator.sign(&key, SigningRequest::new(b"first".to_vec())),
        coordinator.sign(&key, SigningRequest::new(b"second".to_vec())),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.ceremony_id, b.ceremony_id);
    key.verifying_key.verify(b"first", &a.signature).unwrap();
    key.verifying_key.verify(b"second", &b.signature).unwrap();
    for hsm in &hsms {
        assert_clean(hsm, &key);
    }
}

#[tokio::test]
async fn test_imported_key_signs_like_the_original() {
    let (coordinator, _, _) = setup(Config::default());
    let secret = SecretKey::generate(&mut OsRng);
    let bundle =
        ImportBundle::prepare(&secret, 2, &coordinator.transport_keys(), &mut OsRng).unwrap();

    let key = coordinator.import(bundle).await.unwrap();
    assert_eq!(key.verifying_key, secret.public_key());

    let signed = coordinator
        .sign(&key, SigningRequest::new(b"imported".to_vec()))
        .await
        .unwrap();
    secret
        .public_key()
        .verify(b"imported", &signed.signature)
        .unwrap();
}

#[tokio::test]
async fn test_destroyed_key_cannot_sign() {
    let (coordinator, hsms, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    coordinator.destroy(&key).await.unwrap();
    for hsm in &hsms {
        assert!(hsm.store().is_empty().unwrap());
    }
    assert!(coordinator
        .sign(&key, SigningRequest::new(b"m".to_vec()))
        .await
        .is_err());
}

#[tokio::test]
async fn test_group_key_survives_json() {
    let (coordinator, _, _) = setup(Config::default());
    let key = coordinator.keygen().await.unwrap();
    let json = serde_json::to_string(&key).unwrap();
    let restored: GroupKey = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, key);

    let signed = coordinator
        .sign(&restored, SigningRequest::new(b"m".to_vec()))
        .await
        .unwrap();
    key.verifying_key.verify(b"m", &signed.signature).unwrap();
}

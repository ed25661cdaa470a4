//! password vault on its own and feeding the threshold coordinator

use std::sync::Arc;

use rand::rngs::OsRng;
use sigvault::config::VaultConfig;
use sigvault::kdf::MIN_WORK_FACTOR;
use sigvault::{
    BackupBlob, Error, KdfParams, MemoryVaultStore, PasswordVault, SecretKey, VaultStore,
};

fn vault_with(limits: VaultConfig) -> PasswordVault<Arc<MemoryVaultStore>> {
    let params = KdfParams::from_work_factor(MIN_WORK_FACTOR).unwrap();
    PasswordVault::with_params(Arc::new(MemoryVaultStore::new()), params, &limits).unwrap()
}

#[test]
fn test_account_lifecycle() {
    let vault = vault_with(VaultConfig::default());
    let key = SecretKey::generate(&mut OsRng);
    vault.create("carol", b"first password", &key.to_bytes()[..]).unwrap();
    assert!(vault.exists("carol").unwrap());

    vault
        .change_password("carol", b"first password", b"second password")
        .unwrap();
    assert!(matches!(
        vault.open("carol", b"first password"),
        Err(Error::AuthenticationFailure)
    ));
    let opened = vault.open_signing_key("carol", b"second password").unwrap();
    assert_eq!(opened.public_key(), key.public_key());

    assert!(vault.delete("carol").unwrap());
    assert!(!vault.exists("carol").unwrap());
    assert!(!vault.delete("carol").unwrap());
}

#[test]
fn test_stored_record_never_holds_password_or_secret() {
    let vault = vault_with(VaultConfig::default());
    vault
        .create("dave", b"correct horse", b"plaintext-marker")
        .unwrap();
    let raw = vault.store().get("dave").unwrap().unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(!text.contains("correct horse"));
    assert!(!text.contains("plaintext-marker"));
    assert!(!text.contains(&hex::encode(b"plaintext-marker")));
}

#[test]
fn test_backup_moves_between_vaults() {
    let source = vault_with(VaultConfig::default());
    source.create("erin", b"pw-erin", b"seed words").unwrap();
    let blob = source.export_backup("erin", b"pw-erin").unwrap();

    let json = serde_json::to_string(&blob).unwrap();
    let blob: BackupBlob = serde_json::from_str(&json).unwrap();

    let target = vault_with(VaultConfig::default());
    let secret = target.import_backup(&blob, b"pw-erin").unwrap();
    assert_eq!(&secret[..], b"seed words");
    assert!(matches!(
        target.import_backup(&blob, b"pw-wrong"),
        Err(Error::DecryptionFailure)
    ));
}

#[test]
fn test_guessing_is_rate_limited_per_account() {
    let vault = vault_with(VaultConfig {
        max_hash_attempts: 3,
        attempt_window_secs: 60,
    });
    vault.create("frank", b"right", b"secret").unwrap();
    vault.create("grace", b"right", b"secret").unwrap();

    for _ in 0..2 {
        assert!(vault.open("frank", b"wrong").is_err());
    }
    assert!(matches!(
        vault.open("frank", b"right"),
        Err(Error::RateLimited { .. })
    ));
    assert_eq!(&vault.open("grace", b"right").unwrap()[..], b"secret");
}

#[cfg(feature = "software")]
#[tokio::test]
async fn test_vault_key_imported_for_threshold_signing() {
    use sigvault::{Config, Coordinator, ImportBundle, SigningRequest, SoftwareDomain};

    let vault = vault_with(VaultConfig::default());
    let key = SecretKey::generate(&mut OsRng);
    vault.create("heidi", b"pw-heidi", &key.to_bytes()[..]).unwrap();

    let hsms: Vec<_> = (1..=3)
        .map(|i| Arc::new(SoftwareDomain::new(format!("hsm-{}", i))))
        .collect();
    let coordinator = Coordinator::new(Config::default(), hsms).unwrap();

    let opened = vault.open_signing_key("heidi", b"pw-heidi").unwrap();
    let bundle =
        ImportBundle::prepare(&opened, 2, &coordinator.transport_keys(), &mut OsRng).unwrap();
    drop(opened);
    let group = coordinator.import(bundle).await.unwrap();

    let signed = coordinator
        .sign(&group, SigningRequest::new(b"pay bob".to_vec()))
        .await
        .unwrap();
    key.public_key().verify(b"pay bob", &signed.signature).unwrap();
}

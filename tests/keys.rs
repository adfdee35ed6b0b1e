use std::{fs, sync::Arc};

use cerberus::{
    error::KeyStoreError,
    keys::{AccountKey, KeyStore, ServerKey},
    Settings,
};

fn store(dir: &std::path::Path) -> (KeyStore, Arc<Settings>) {
    let settings = Arc::new(Settings {
        account_key_file: dir.join("nested/account.pem"),
        server_key_file: dir.join("nested/private.pem"),
        ..Settings::default()
    });
    (KeyStore::new(Arc::clone(&settings)), settings)
}

#[test]
fn keys_are_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let (store, settings) = store(dir.path());

    let account = store.ensure_account_key().unwrap();
    let server = store.ensure_server_key().unwrap();
    let account_pem = fs::read(&settings.account_key_file).unwrap();
    let server_pem = fs::read(&settings.server_key_file).unwrap();

    let account_again = store.ensure_account_key().unwrap();
    let server_again = store.ensure_server_key().unwrap();

    assert_eq!(fs::read(&settings.account_key_file).unwrap(), account_pem);
    assert_eq!(fs::read(&settings.server_key_file).unwrap(), server_pem);
    assert_eq!(account.to_jwk().unwrap(), account_again.to_jwk().unwrap());
    assert_eq!(server.to_jwk(), server_again.to_jwk());
}

#[test]
fn stored_keys_survive_jwk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (store, settings) = store(dir.path());
    store.ensure_account_key().unwrap();
    store.ensure_server_key().unwrap();

    let account = AccountKey::from_pem(&fs::read(&settings.account_key_file).unwrap()).unwrap();
    let restored = AccountKey::from_jwk(&account.to_jwk().unwrap()).unwrap();
    assert_eq!(account.to_jwk().unwrap(), restored.to_jwk().unwrap());

    let server_pem = fs::read(&settings.server_key_file).unwrap();
    let server = ServerKey::from_pem(&server_pem).unwrap();
    let restored = ServerKey::from_jwk(&server.to_jwk()).unwrap();
    assert_eq!(restored.to_pem().unwrap(), server_pem);
}

#[test]
fn broken_key_file_is_reported_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let (store, settings) = store(dir.path());
    fs::create_dir_all(settings.account_key_file.parent().unwrap()).unwrap();
    fs::write(&settings.account_key_file, "not a key").unwrap();

    match store.ensure_account_key() {
        Err(KeyStoreError::Parse { path, .. }) => assert_eq!(path, settings.account_key_file),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("garbage accepted as key"),
    }
}

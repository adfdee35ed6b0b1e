use std::{fs, path::Path, sync::Arc};

use cerberus::{
    error::CertError,
    keys::{KeyStore, ServerKey},
    validator::CertificateValidator,
    CertManager, Settings,
};
use chrono::{Duration, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509},
};

const ACCOUNT: &str = r#"{
    "key": { "kid": "https://acme.test/acct/1" },
    "contact": ["mailto:ops@example.com"],
    "status": "valid",
    "createdAt": "2023-04-01T10:20:30Z"
}"#;

fn settings(dir: &Path, renew_days: u32) -> Arc<Settings> {
    Arc::new(Settings {
        domains: vec!["example.com".to_owned(), "www.example.com".to_owned()],
        account_file: dir.join("account.json"),
        account_key_file: dir.join("account.pem"),
        server_key_file: dir.join("private.pem"),
        full_chain_file: dir.join("fullchain.pem"),
        renew_days,
        ..Settings::default()
    })
}

fn self_signed(key: &ServerKey, domains: &[&str], from_days: i64, until_days: i64) -> Vec<u8> {
    let now = Utc::now();
    let pkey = key.pkey().unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", domains[0]).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    let not_before = Asn1Time::from_unix((now + Duration::days(from_days)).timestamp()).unwrap();
    let not_after = Asn1Time::from_unix((now + Duration::days(until_days)).timestamp()).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();

    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let san = san.build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();

    builder.build().to_pem().unwrap()
}

/// Lay out a complete set of state files with a certificate valid in the given day range.
fn prepare(dir: &Path, renew_days: u32, from_days: i64, until_days: i64) -> Arc<Settings> {
    let settings = settings(dir, renew_days);
    let keys = KeyStore::new(Arc::clone(&settings));
    keys.ensure_account_key().unwrap();
    let server_key = keys.ensure_server_key().unwrap();

    fs::write(&settings.account_file, ACCOUNT).unwrap();
    fs::write(
        &settings.full_chain_file,
        self_signed(
            &server_key,
            &["example.com", "www.example.com"],
            from_days,
            until_days,
        ),
    )
    .unwrap();

    settings
}

#[test]
fn expiring_certificate_needs_renewal() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 5);

    let status = CertificateValidator::new(settings).check();

    assert!(!status.valid);
    assert_eq!(status.problem, None);
    assert!((status.remaining_days - 5.0).abs() < 0.01, "{}", status.remaining_days);
}

#[test]
fn fresh_certificate_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 89);

    let status = CertificateValidator::new(settings).check();

    assert!(status.valid);
    assert!((status.remaining_days - 89.0).abs() < 0.01, "{}", status.remaining_days);
}

#[test]
fn certificate_outside_its_window() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, 1, 90);
    let validator = CertificateValidator::new(Arc::clone(&settings));
    assert_eq!(validator.check().problem, Some(CertError::NotYetValid));

    let later = Utc::now() + Duration::days(100);
    assert_eq!(validator.check_at(later).problem, Some(CertError::Expired));
}

#[test]
fn missing_chain_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CertManager::new(settings(dir.path(), 30));

    assert!(!manager.check_cert());
}

#[test]
fn corrupt_account_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 89);
    fs::write(&settings.account_file, "{}").unwrap();

    let status = CertificateValidator::new(settings).check();

    assert!(!status.valid);
    assert!(matches!(status.problem, Some(CertError::Corrupt(_))));
}

#[test]
fn certificate_of_another_key_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 89);
    let other = ServerKey::generate(2048).unwrap();
    fs::write(
        &settings.full_chain_file,
        self_signed(&other, &["example.com", "www.example.com"], -1, 89),
    )
    .unwrap();

    let status = CertificateValidator::new(settings).check();

    assert!(matches!(status.problem, Some(CertError::Corrupt(_))));
}

#[test]
fn certificate_must_cover_all_domains() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 89);
    let key = ServerKey::from_pem(&fs::read(&settings.server_key_file).unwrap()).unwrap();
    fs::write(&settings.full_chain_file, self_signed(&key, &["example.com"], -1, 89)).unwrap();

    let status = CertificateValidator::new(settings).check();

    assert_eq!(
        status.problem,
        Some(CertError::Uncovered("www.example.com".to_owned()))
    );
}

#[test]
fn parse_describes_the_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 89);

    let report = CertManager::new(settings).parse_cert();

    assert_eq!(report["certificate"]["commonName"], "example.com");
    assert_eq!(report["certificate"]["chainLength"], 1);
    assert_eq!(report["account"]["key"]["kid"], "https://acme.test/acct/1");
    assert_eq!(report["valid"], true);
}

#[test]
fn domain_case_does_not_matter() {
    let dir = tempfile::tempdir().unwrap();
    let settings = prepare(dir.path(), 10, -1, 89);
    let settings = Arc::new(Settings {
        domains: vec!["Example.COM".to_owned(), "WWW.example.com".to_owned()],
        ..(*settings).clone()
    });

    let status = CertificateValidator::new(settings).check();

    assert!(status.valid, "{:?}", status.problem);
}

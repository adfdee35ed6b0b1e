//! Validity checks of the persisted certificate.

use std::{fs, io, path::Path, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use x509_parser::{extensions::GeneralName, parse_x509_certificate};

use crate::{
    account::Account,
    error::CertError,
    keys::{AccountKey, ServerKey},
    settings::Settings,
};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Outcome of a validity check.
#[derive(Clone, Debug, PartialEq)]
pub struct CertStatus {
    pub valid: bool,
    pub remaining_days: f64,
    pub problem: Option<CertError>,
}

impl CertStatus {
    fn invalid(problem: CertError) -> Self {
        Self {
            valid: false,
            remaining_days: 0.0,
            problem: Some(problem),
        }
    }
}

/// Fields of the leaf certificate relevant for renewal decisions.
#[derive(Clone, Debug)]
pub struct ChainInfo {
    pub common_name: Option<String>,
    pub alt_names: Vec<String>,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Number of certificates in the file, leaf included.
    pub chain_len: usize,
    pub public_key: Vec<u8>,
}

/// Parse a PEM full chain and describe its leaf.
pub fn parse_chain(pem: &[u8]) -> Result<ChainInfo, CertError> {
    let ders = rustls_pemfile::certs(&mut &pem[..])
        .map_err(|e| CertError::Corrupt(format!("certificate chain: {e}")))?;
    let leaf = ders
        .first()
        .ok_or_else(|| CertError::Corrupt("certificate chain holds no certificate".to_owned()))?;
    let (_, cert) = parse_x509_certificate(leaf)
        .map_err(|e| CertError::Corrupt(format!("leaf certificate: {e}")))?;

    let timestamp = |secs| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| CertError::Corrupt(format!("timestamp {secs} out of range")))
    };

    let alt_names = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some((*dns).to_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);

    let info = ChainInfo {
        common_name,
        alt_names,
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: timestamp(cert.validity().not_before.timestamp())?,
        not_after: timestamp(cert.validity().not_after.timestamp())?,
        chain_len: ders.len(),
        public_key: cert.public_key().raw.to_vec(),
    };

    Ok(info)
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>, CertError> {
    fs::read(path).map_err(|e| CertError::Corrupt(format!("{what} {}: {e}", path.display())))
}

pub struct CertificateValidator {
    settings: Arc<Settings>,
}

impl CertificateValidator {
    pub const fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn check(&self) -> CertStatus {
        self.check_at(Utc::now())
    }

    /// Same as [`check`](Self::check), against an explicit point in time.
    pub fn check_at(&self, now: DateTime<Utc>) -> CertStatus {
        let status = match self.inspect() {
            Ok(info) => self.evaluate(&info, now),
            Err(problem) => CertStatus::invalid(problem),
        };

        match &status.problem {
            Some(problem) => warn!("certificate unusable: {problem}"),
            None if status.valid => info!(
                "certificate valid for another {:.1} days",
                status.remaining_days
            ),
            None => warn!(
                "certificate expires in {:.1} days, below the renewal threshold of {} days",
                status.remaining_days, self.settings.renew_days
            ),
        }

        status
    }

    fn evaluate(&self, info: &ChainInfo, now: DateTime<Utc>) -> CertStatus {
        if now < info.not_before {
            return CertStatus::invalid(CertError::NotYetValid);
        }
        if now > info.not_after {
            return CertStatus::invalid(CertError::Expired);
        }

        let remaining_days = (info.not_after - now).num_milliseconds() as f64 / MILLIS_PER_DAY;

        CertStatus {
            valid: remaining_days >= f64::from(self.settings.renew_days),
            remaining_days,
            problem: None,
        }
    }

    /// Load all persisted state and describe the leaf certificate.
    pub fn inspect(&self) -> Result<ChainInfo, CertError> {
        let settings = &self.settings;

        let chain = match fs::read(&settings.full_chain_file) {
            Ok(chain) => chain,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CertError::Missing),
            Err(e) => return Err(CertError::Corrupt(format!("certificate chain: {e}"))),
        };

        Account::from_json(&read(&settings.account_file, "account")?)
            .map_err(|e| CertError::Corrupt(format!("account: {e}")))?;
        let server_key = ServerKey::from_pem(&read(&settings.server_key_file, "server key")?)
            .map_err(|e| CertError::Corrupt(format!("server key: {e}")))?;
        AccountKey::from_pem(&read(&settings.account_key_file, "account key")?)
            .map_err(|e| CertError::Corrupt(format!("account key: {e}")))?;

        let info = parse_chain(&chain)?;

        let server_public = server_key
            .public_key_der()
            .map_err(|e| CertError::Corrupt(format!("server key: {e}")))?;
        if server_public != info.public_key {
            return Err(CertError::Corrupt(
                "certificate was not issued for the server key".to_owned(),
            ));
        }

        if let Some(missing) = settings
            .domains
            .iter()
            .find(|domain| {
                !info
                    .alt_names
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(domain))
            })
        {
            return Err(CertError::Uncovered(missing.clone()));
        }

        Ok(info)
    }
}

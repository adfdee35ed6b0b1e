//! Error types of the certificate pipeline.

use std::{io, path::PathBuf};

use openssl::error::ErrorStack;
use thiserror::Error;

/// Problem type sent by ACME servers when the terms of service were not accepted.
pub const AGREEMENT_REQUIRED_URNS: [&str; 2] = [
    "urn:ietf:params:acme:error:agreementRequired",
    "urn:ietf:params:acme:error:userActionRequired",
];

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed accessing key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("key in {path} is unusable: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ErrorStack,
    },
    #[error("key in {path} is not supported: {reason}")]
    Unsupported { path: PathBuf, reason: String },
    #[error("key generation failed: {0}")]
    Generate(#[source] ErrorStack),
    #[error("invalid JWK: {0}")]
    Jwk(String),
}

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signing failed: {0}")]
    Crypto(#[from] ErrorStack),
    #[error("acme server answered {status}: {urn}: {detail}")]
    Protocol {
        urn: String,
        detail: String,
        status: u16,
    },
    #[error("the terms of service must be agreed to before registering an account")]
    AgreementRequired,
    #[error("response is missing the {0} header")]
    MissingHeader(&'static str),
    #[error("no http-01 challenge offered for {0}")]
    NoHttpChallenge(String),
    #[error("{resource} ended up {status}")]
    Invalid {
        resource: String,
        status: String,
    },
    #[error("{resource} did not settle after {attempts} polls")]
    Timeout { resource: String, attempts: u32 },
    #[error("no account key-id known, register the account first")]
    NoAccount,
}

impl AcmeError {
    pub fn is_agreement_required(&self) -> bool {
        matches!(self, Self::AgreementRequired)
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("failed accessing account file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("account file {path} is malformed: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Acme(#[from] AcmeError),
}

impl AccountError {
    pub fn is_agreement_required(&self) -> bool {
        matches!(self, Self::Acme(e) if e.is_agreement_required())
    }
}

#[derive(Debug, Error)]
pub enum CsrError {
    #[error("no domains configured")]
    NoDomains,
    #[error("csr subject is {found:?} but must be {expected:?}")]
    SubjectMismatch {
        expected: String,
        found: Option<String>,
    },
    #[error("csr alternative names {found:?} do not match the domains {expected:?}")]
    AltNameMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("failed building csr: {0}")]
    Build(#[from] ErrorStack),
    #[error("failed decoding csr: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("failed binding challenge responder to {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: hyper::Error,
    },
    #[error("challenge responder failed: {0}")]
    Serve(#[source] hyper::Error),
    #[error("challenge responder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Csr(#[from] CsrError),
    #[error(transparent)]
    Responder(#[from] ResponderError),
    #[error(transparent)]
    Acme(#[from] AcmeError),
    #[error("failed writing certificate chain to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reasons why the persisted certificate is not usable.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CertError {
    #[error("certificate chain file is missing")]
    Missing,
    #[error("stored state is corrupt: {0}")]
    Corrupt(String),
    #[error("certificate is not valid yet")]
    NotYetValid,
    #[error("certificate has expired")]
    Expired,
    #[error("certificate does not cover {0}")]
    Uncovered(String),
}

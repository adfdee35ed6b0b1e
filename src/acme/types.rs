//! Wire types of the ACME protocol (RFC 8555).

use serde::{Deserialize, Serialize};

use crate::error::{AcmeError, AGREEMENT_REQUIRED_URNS};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub terms_of_service: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_owned(),
            value: value.into(),
        }
    }
}

/// Account object as returned by `newAccount`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResource {
    pub status: Status,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub initial_ip: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: Status,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: Status,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    pub fn http_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == "http-01")
    }

    /// First error reported by any of the challenges.
    pub fn problem(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: Status,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// Problem document (RFC 7807).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub urn: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Problem {
    pub fn is_bad_nonce(&self) -> bool {
        self.urn == "urn:ietf:params:acme:error:badNonce"
    }

    pub fn into_error(self, http_status: u16) -> AcmeError {
        if AGREEMENT_REQUIRED_URNS.contains(&self.urn.as_str()) {
            return AcmeError::AgreementRequired;
        }

        AcmeError::Protocol {
            urn: self.urn,
            detail: self.detail,
            status: self.status.unwrap_or(http_status),
        }
    }
}

#[derive(Serialize)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Leaf certificate plus its intermediates, both PEM encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateChain {
    pub leaf: String,
    pub chain: String,
}

impl CertificateChain {
    const END: &'static str = "-----END CERTIFICATE-----";

    /// Split a `application/pem-certificate-chain` document into leaf and rest.
    pub fn from_pem(pem: &str) -> Option<Self> {
        let blocks = pem
            .split_inclusive(Self::END)
            .map(str::trim)
            .filter(|block| {
                block.starts_with("-----BEGIN CERTIFICATE-----") && block.ends_with(Self::END)
            })
            .collect::<Vec<_>>();

        let (leaf, rest) = blocks.split_first()?;

        Some(Self {
            leaf: (*leaf).to_owned(),
            chain: rest.join("\n"),
        })
    }

    /// Layout written to the full chain file.
    pub fn to_pem(&self) -> String {
        format!("{}\n{}\n", self.leaf, self.chain)
    }
}

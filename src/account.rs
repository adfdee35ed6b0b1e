//! ACME account persistence.

use std::{fs, io, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{acme::AcmeClient, error::AccountError, settings::Settings};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountId {
    pub kid: String,
}

/// Registration record kept in the account file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub key: AccountId,
    #[serde(default)]
    pub contact: Vec<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub initial_ip: Option<String>,
    /// Directory the account was registered with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl Account {
    pub fn kid(&self) -> &str {
        &self.key.kid
    }

    pub fn from_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }
}

pub struct AccountManager {
    settings: Arc<Settings>,
}

impl AccountManager {
    pub const fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Read the stored account, `None` if there is none yet.
    pub fn load(&self) -> Result<Option<Account>, AccountError> {
        let path = &self.settings.account_file;
        let json = match fs::read(path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(AccountError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        Account::from_json(&json)
            .map(Some)
            .map_err(|source| AccountError::Json {
                path: path.clone(),
                source,
            })
    }

    /// Load the stored account or register a new one through `client`.
    pub async fn ensure_account(&self, client: &AcmeClient) -> Result<Account, AccountError> {
        let directory = &self.settings.directory_url;

        match self.load()? {
            Some(account) if account.directory.as_ref().map_or(true, |d| d == directory) => {
                debug!("using stored account {}", account.kid());
                return Ok(account);
            }
            Some(account) => warn!(
                "stored account {} belongs to another directory, registering a new one",
                account.kid()
            ),
            None => info!("no account found, registering with {directory}"),
        }

        let registration = client
            .create_account(&self.settings.contacts(), self.settings.agree_tos)
            .await?;
        let resource = registration.resource;

        let account = Account {
            key: AccountId {
                kid: registration.kid,
            },
            contact: resource.contact,
            status: resource.status.as_str().to_owned(),
            created_at: resource
                .created_at
                .as_deref()
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
                .map_or_else(Utc::now, |at| at.with_timezone(&Utc)),
            initial_ip: resource.initial_ip,
            directory: Some(directory.clone()),
        };

        self.persist(&account)?;
        Ok(account)
    }

    fn persist(&self, account: &Account) -> Result<(), AccountError> {
        let path = &self.settings.account_file;
        let io = |source| AccountError::Io {
            path: path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(account).map_err(|source| AccountError::Json {
            path: path.clone(),
            source,
        })?;

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io)?;
        }
        fs::write(path, json).map_err(io)?;

        info!("saved account {} to {}", account.kid(), path.display());
        Ok(())
    }
}

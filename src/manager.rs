//! Entry points tying keys, account, order and validation together.

use std::{fs, future::Future, sync::Arc};

use eyre::{Result, WrapErr};
use log::{info, warn};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::{
    account::{Account, AccountManager},
    acme::{AcmeClient, Polling},
    keys::{AccountKey, KeyStore, ServerKey},
    order::OrderOrchestrator,
    scheduler::{Renewal, RenewalScheduler},
    settings::Settings,
    validator::{parse_chain, CertStatus, CertificateValidator},
};

pub struct CertManager {
    settings: Arc<Settings>,
    keys: KeyStore,
    accounts: AccountManager,
    validator: CertificateValidator,
}

impl CertManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            keys: KeyStore::new(Arc::clone(&settings)),
            accounts: AccountManager::new(Arc::clone(&settings)),
            validator: CertificateValidator::new(Arc::clone(&settings)),
            settings,
        }
    }

    /// Make sure a valid certificate exists, ordering a new one if needed.
    pub async fn get_cert(&self) -> Result<bool> {
        if !self.settings.has_domains() {
            info!("no domains configured, skipping certificate");
            return Ok(false);
        }
        if self.check_cert() {
            return Ok(true);
        }

        self.create_cert(true).await
    }

    pub fn check_cert(&self) -> bool {
        self.validator.check().valid
    }

    pub fn create_keys(&self) -> Result<(AccountKey, ServerKey)> {
        let account_key = self
            .keys
            .ensure_account_key()
            .wrap_err("failed preparing the account key")?;
        let server_key = self
            .keys
            .ensure_server_key()
            .wrap_err("failed preparing the server key")?;

        Ok((account_key, server_key))
    }

    /// Order a certificate, unless the current one is still valid and `force` is not set.
    ///
    /// Resolves to whether a new certificate was stored. Only a missing terms of service
    /// agreement and unusable key files are reported as errors.
    pub async fn create_cert(&self, force: bool) -> Result<bool> {
        if !self.settings.has_domains() {
            info!("no domains configured, skipping certificate");
            return Ok(false);
        }
        if !force && self.check_cert() {
            info!("certificate is still valid, not ordering a new one");
            return Ok(false);
        }

        let (account_key, server_key) = self.create_keys()?;

        let Some(account) = self.account(&account_key).await? else {
            return Ok(false);
        };

        Ok(OrderOrchestrator::new(Arc::clone(&self.settings))
            .run(&account_key, &server_key, &account)
            .await)
    }

    async fn account(&self, key: &AccountKey) -> Result<Option<Account>> {
        let polling = Polling {
            attempts: self.settings.poll_attempts,
            interval: self.settings.poll_interval(),
        };

        let discovered =
            AcmeClient::discover(&self.settings.directory_url, key.clone(), polling).await;
        let client = match discovered {
            Ok(client) => client,
            Err(e) => {
                warn!("failed reaching {}: {e}", self.settings.directory_url);
                return Ok(None);
            }
        };

        match self.accounts.ensure_account(&client).await {
            Ok(account) => Ok(Some(account)),
            Err(e) if e.is_agreement_required() => {
                Err(e).wrap_err("set `agree_tos = true` to accept the terms of service")
            }
            Err(e) => {
                warn!("failed preparing the acme account: {e}");
                Ok(None)
            }
        }
    }

    /// Diagnostic view of all stored state. Unreadable parts show up as `{"error": ...}`.
    pub fn parse_cert(&self) -> Value {
        let settings = &self.settings;

        let account = match self.accounts.load() {
            Ok(Some(account)) => json!(account),
            Ok(None) => error("no account stored"),
            Err(e) => error(e),
        };

        let account_key = fs::read(&settings.account_key_file)
            .map_err(|e| e.to_string())
            .and_then(|pem| AccountKey::from_pem(&pem).map_err(|e| e.to_string()))
            .and_then(|key| {
                Ok(json!({
                    "jwk": key.public_jwk().map_err(|e| e.to_string())?,
                    "thumbprint": key.thumbprint().map_err(|e| e.to_string())?,
                }))
            })
            .unwrap_or_else(error);

        let server_key = fs::read(&settings.server_key_file)
            .map_err(|e| e.to_string())
            .and_then(|pem| ServerKey::from_pem(&pem).map_err(|e| e.to_string()))
            .map_or_else(error, |key| json!({ "bits": key.bits() }));

        let certificate = fs::read(&settings.full_chain_file)
            .map_err(|e| e.to_string())
            .and_then(|pem| parse_chain(&pem).map_err(|e| e.to_string()))
            .map_or_else(error, |info| {
                json!({
                    "commonName": info.common_name,
                    "altNames": info.alt_names,
                    "issuer": info.issuer,
                    "serial": info.serial,
                    "notBefore": info.not_before,
                    "notAfter": info.not_after,
                    "chainLength": info.chain_len,
                })
            });

        let status = self.validator.check();

        json!({
            "domains": settings.domains,
            "account": account,
            "accountKey": account_key,
            "serverKey": server_key,
            "certificate": certificate,
            "valid": status.valid,
            "remainingDays": status.remaining_days,
            "problem": status.problem.map(|p| p.to_string()),
        })
    }

    /// Start the renewal loop. Returns `None` if there is nothing to monitor.
    pub fn monitor_cert<F>(self: Arc<Self>, on_renew: F) -> Option<JoinHandle<()>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.settings.has_domains() {
            info!("no domains configured, not monitoring");
            return None;
        }

        let interval = self.settings.monitor_interval();
        info!("checking the certificate every {} minutes", self.settings.monitor_interval);

        Some(Arc::new(RenewalScheduler::new(self, interval)).start(on_renew))
    }
}

impl Renewal for CertManager {
    fn status(&self) -> CertStatus {
        self.validator.check()
    }

    fn renew(&self) -> impl Future<Output = Result<bool>> + Send {
        self.create_cert(true)
    }
}

fn error(e: impl ToString) -> Value {
    json!({ "error": e.to_string() })
}

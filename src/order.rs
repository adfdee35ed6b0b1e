//! A single certificate issuance attempt.

use std::{error::Error as StdError, fs, io, path::Path, sync::Arc};

use log::{debug, info, warn};

use crate::{
    account::Account,
    acme::{AcmeClient, CertificateChain, Polling},
    challenge::ChallengeNotifier,
    csr,
    error::{AcmeError, OrderError},
    keys::{AccountKey, ServerKey},
    responder::ChallengeResponder,
    settings::Settings,
};

pub struct OrderOrchestrator {
    settings: Arc<Settings>,
}

impl OrderOrchestrator {
    pub const fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Order a new certificate and store it in the full chain file.
    ///
    /// Returns `false` if the attempt failed for any reason. An existing chain file is left
    /// untouched in that case.
    pub async fn run(
        &self,
        account_key: &AccountKey,
        server_key: &ServerKey,
        account: &Account,
    ) -> bool {
        match self.attempt(account_key, server_key, account).await {
            Ok(()) => true,
            Err(e) => {
                warn!("certificate order failed: {e}");
                if let Some(diag) = diagnose(&e) {
                    warn!("{diag}");
                }
                false
            }
        }
    }

    async fn attempt(
        &self,
        account_key: &AccountKey,
        server_key: &ServerKey,
        account: &Account,
    ) -> Result<(), OrderError> {
        let settings = &self.settings;
        let csr = csr::generate(&settings.domains, server_key)?;
        debug!("built csr for {}", settings.domains.join(", "));

        let mailbox = Arc::new(ChallengeNotifier::new());
        let responder = ChallengeResponder::start(
            settings.listen,
            Arc::clone(&mailbox),
            settings.challenge_timeout(),
        )?;

        let result = self.submit(account_key, account, &csr, &mailbox).await;
        if mailbox.is_empty() {
            debug!("no challenges were presented");
        } else {
            debug!("{} challenges were presented", mailbox.len());
        }

        if let Err(e) = responder.stop().await {
            warn!("stopping the challenge responder failed: {e}");
        }

        let chain = result?;
        self.persist(&chain)?;

        info!(
            "new certificate for {} saved to {}",
            settings.domains.join(", "),
            settings.full_chain_file.display()
        );
        Ok(())
    }

    async fn submit(
        &self,
        account_key: &AccountKey,
        account: &Account,
        csr: &[u8],
        mailbox: &ChallengeNotifier,
    ) -> Result<CertificateChain, AcmeError> {
        let settings = &self.settings;
        let polling = Polling {
            attempts: settings.poll_attempts,
            interval: settings.poll_interval(),
        };

        let mut client =
            AcmeClient::discover(&settings.directory_url, account_key.clone(), polling).await?;
        client.set_kid(account.kid());

        client.create_order(&settings.domains, csr, mailbox).await
    }

    fn persist(&self, chain: &CertificateChain) -> Result<(), OrderError> {
        let path = &self.settings.full_chain_file;
        let persist = |source| OrderError::Persist {
            path: path.clone(),
            source,
        };

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist)?;
        }
        fs::write(path, chain.to_pem()).map_err(persist)
    }
}

/// Describe a network failure in terms of the failing connection, if the error came from one.
fn diagnose(error: &OrderError) -> Option<String> {
    let OrderError::Acme(AcmeError::Http(e)) = error else {
        return None;
    };

    let mut parts = Vec::new();

    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            parts.push(format!("code={:?}", io.kind()));
            break;
        }
        source = err.source();
    }

    if e.is_connect() {
        parts.push("syscall=connect".to_owned());
    } else if e.is_timeout() {
        parts.push("syscall=timeout".to_owned());
    }

    if let Some(url) = e.url() {
        if let Some(host) = url.host_str() {
            parts.push(format!("address={host}"));
        }
        if let Some(port) = url.port_or_known_default() {
            parts.push(format!("port={port}"));
        }
    }

    (!parts.is_empty()).then(|| format!("network failure: {}", parts.join(" ")))
}

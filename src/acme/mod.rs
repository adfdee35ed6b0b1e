//! Minimal ACME v2 client.
//!
//! Covers the subset needed for HTTP-01 issuance: account registration and a full order run.
//! Progress of an order is reported through a [`Notifier`], which is how the challenge responder
//! learns about the tokens it has to serve.

use std::time::Duration;

use log::{debug, info, trace};
use parking_lot::Mutex;
use reqwest::{
    header::{ACCEPT, CONTENT_TYPE},
    Client, Response,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

pub use self::types::{
    AccountResource, Authorization, CertificateChain, Directory, Identifier, Order, Problem, Status,
};
use self::types::Jws;
use crate::{
    error::AcmeError,
    keys::{base64url, AccountKey, Jwk},
};

pub mod types;

const REPLAY_NONCE: &str = "replay-nonce";
const LOCATION_HEADER: &str = "location";
const BAD_NONCE_RETRIES: usize = 3;
const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Progress reported while an order is driven.
#[derive(Debug)]
pub enum Event<'a> {
    /// A challenge was picked for `altname` and must now be served.
    ChallengeSelected {
        altname: &'a str,
        token: &'a str,
        key_authorization: &'a str,
    },
    ChallengeStatus { altname: &'a str, status: Status },
    OrderStatus { status: Status },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event<'_>);
}

/// Bounds for status polling of authorizations and orders.
#[derive(Clone, Copy, Debug)]
pub struct Polling {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(3),
        }
    }
}

/// Result of a `newAccount` call.
#[derive(Debug)]
pub struct Registration {
    pub kid: String,
    pub resource: AccountResource,
}

#[derive(Clone, Copy)]
enum Auth {
    Jwk,
    Kid,
}

#[derive(Serialize)]
struct Protected<'a> {
    alg: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    nonce: &'a str,
    url: &'a str,
}

pub struct AcmeClient {
    http: Client,
    directory: Directory,
    key: AccountKey,
    kid: Option<String>,
    nonce: Mutex<Option<String>>,
    polling: Polling,
}

impl AcmeClient {
    /// Fetch the directory at `url` and create a client for it.
    pub async fn discover(url: &str, key: AccountKey, polling: Polling) -> Result<Self, AcmeError> {
        let http = Client::new();
        let directory = http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Directory>()
            .await?;
        debug!("discovered acme directory at {url}");

        Ok(Self::with_client(http, directory, key, polling))
    }

    pub fn with_directory(directory: Directory, key: AccountKey, polling: Polling) -> Self {
        Self::with_client(Client::new(), directory, key, polling)
    }

    fn with_client(http: Client, directory: Directory, key: AccountKey, polling: Polling) -> Self {
        Self {
            http,
            directory,
            key,
            kid: None,
            nonce: Mutex::new(None),
            polling,
        }
    }

    pub fn set_kid(&mut self, kid: impl Into<String>) {
        self.kid = Some(kid.into());
    }

    /// Register a new account (or look up the existing one for this key).
    pub async fn create_account(
        &self,
        contacts: &[String],
        agree_tos: bool,
    ) -> Result<Registration, AcmeError> {
        if !agree_tos {
            if let Some(tos) = self.terms_of_service() {
                info!("terms of service of this acme server: {tos}");
            }
            return Err(AcmeError::AgreementRequired);
        }

        let payload = json!({
            "termsOfServiceAgreed": true,
            "contact": contacts,
        });
        let res = self
            .post(&self.directory.new_account, Some(&payload), Auth::Jwk)
            .await?;
        let kid = header(&res, LOCATION_HEADER)?;
        let resource = res.json::<AccountResource>().await?;
        info!("acme account {kid} is {}", resource.status.as_str());

        Ok(Registration { kid, resource })
    }

    pub fn terms_of_service(&self) -> Option<&str> {
        self.directory
            .meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_deref())
    }

    /// Run a complete order for `domains`: create it, complete the HTTP-01 challenges, submit the
    /// CSR and download the issued chain.
    pub async fn create_order(
        &self,
        domains: &[String],
        csr_der: &[u8],
        notifier: &dyn Notifier,
    ) -> Result<CertificateChain, AcmeError> {
        let payload = json!({
            "identifiers": domains.iter().map(Identifier::dns).collect::<Vec<_>>(),
        });
        let res = self
            .post(&self.directory.new_order, Some(&payload), Auth::Kid)
            .await?;
        let order_url = header(&res, LOCATION_HEADER)?;
        let order = res.json::<Order>().await?;
        info!("created order {order_url}");
        notifier.notify(&Event::OrderStatus {
            status: order.status,
        });

        let thumbprint = self.key.thumbprint()?;
        let mut selected = Vec::with_capacity(order.authorizations.len());

        for url in &order.authorizations {
            let authz = self.fetch::<Authorization>(url).await?;
            let altname = authz.identifier.value.clone();

            if authz.status == Status::Valid {
                debug!("authorization for {altname} is already valid");
                continue;
            }

            let challenge = authz
                .http_challenge()
                .ok_or_else(|| AcmeError::NoHttpChallenge(altname.clone()))?;
            let key_authorization = format!("{}.{thumbprint}", challenge.token);

            notifier.notify(&Event::ChallengeSelected {
                altname: &altname,
                token: &challenge.token,
                key_authorization: &key_authorization,
            });
            selected.push((url.clone(), challenge.url.clone(), altname));
        }

        for (authz_url, challenge_url, altname) in &selected {
            debug!("presenting challenge for {altname}");
            self.post(challenge_url, Some(&json!({})), Auth::Kid).await?;
            self.poll_authorization(authz_url, altname, notifier).await?;
        }

        let mut order = self
            .poll_order(&order_url, &[Status::Pending], notifier)
            .await?;

        if order.status == Status::Ready {
            debug!("finalizing order {order_url}");
            let payload = json!({ "csr": base64url(csr_der) });
            let finalized = self
                .post(&order.finalize, Some(&payload), Auth::Kid)
                .await?
                .json::<Order>()
                .await?;

            order = if finalized.status == Status::Valid {
                finalized
            } else {
                self.poll_order(&order_url, &[Status::Ready, Status::Processing], notifier)
                    .await?
            };
        }

        let cert_url = match (order.status, order.certificate) {
            (Status::Valid, Some(url)) => url,
            (status, _) => {
                return Err(AcmeError::Invalid {
                    resource: format!("order {order_url}"),
                    status: status.as_str().to_owned(),
                })
            }
        };

        let pem = self
            .post_with_accept(&cert_url, PEM_CHAIN)
            .await?
            .text()
            .await?;
        info!("downloaded certificate from {cert_url}");

        CertificateChain::from_pem(&pem).ok_or_else(|| AcmeError::Invalid {
            resource: format!("certificate {cert_url}"),
            status: "empty".to_owned(),
        })
    }

    async fn poll_authorization(
        &self,
        url: &str,
        altname: &str,
        notifier: &dyn Notifier,
    ) -> Result<(), AcmeError> {
        for attempt in 1..=self.polling.attempts {
            let authz = self.fetch::<Authorization>(url).await?;
            trace!("authorization for {altname} is {} ({attempt})", authz.status.as_str());
            notifier.notify(&Event::ChallengeStatus {
                altname,
                status: authz.status,
            });

            match authz.status {
                Status::Valid => return Ok(()),
                Status::Pending | Status::Processing => {
                    tokio::time::sleep(self.polling.interval).await;
                }
                status => {
                    return Err(match authz.problem() {
                        Some(problem) => problem.clone().into_error(400),
                        None => AcmeError::Invalid {
                            resource: format!("authorization for {altname}"),
                            status: status.as_str().to_owned(),
                        },
                    });
                }
            }
        }

        Err(AcmeError::Timeout {
            resource: format!("authorization for {altname}"),
            attempts: self.polling.attempts,
        })
    }

    /// Poll the order while its status is one of `waiting`.
    async fn poll_order(
        &self,
        url: &str,
        waiting: &[Status],
        notifier: &dyn Notifier,
    ) -> Result<Order, AcmeError> {
        for attempt in 1..=self.polling.attempts {
            let order = self.fetch::<Order>(url).await?;
            trace!("order {url} is {} ({attempt})", order.status.as_str());
            notifier.notify(&Event::OrderStatus {
                status: order.status,
            });

            if order.status == Status::Invalid {
                return Err(match order.error {
                    Some(problem) => problem.into_error(400),
                    None => AcmeError::Invalid {
                        resource: format!("order {url}"),
                        status: order.status.as_str().to_owned(),
                    },
                });
            }
            if !waiting.contains(&order.status) {
                return Ok(order);
            }

            tokio::time::sleep(self.polling.interval).await;
        }

        Err(AcmeError::Timeout {
            resource: format!("order {url}"),
            attempts: self.polling.attempts,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<T, AcmeError> {
        Ok(self.post(url, None, Auth::Kid).await?.json::<T>().await?)
    }

    async fn post_with_accept(&self, url: &str, accept: &str) -> Result<Response, AcmeError> {
        self.send(url, None, Auth::Kid, Some(accept)).await
    }

    async fn post(
        &self,
        url: &str,
        payload: Option<&Value>,
        auth: Auth,
    ) -> Result<Response, AcmeError> {
        self.send(url, payload, auth, None).await
    }

    /// Signed POST. A `None` payload makes it a POST-as-GET.
    async fn send(
        &self,
        url: &str,
        payload: Option<&Value>,
        auth: Auth,
        accept: Option<&str>,
    ) -> Result<Response, AcmeError> {
        let mut retries = 0;

        loop {
            let nonce = self.nonce().await?;
            let body = serde_json::to_vec(&self.sign(url, &nonce, payload, auth)?)?;

            let mut req = self
                .http
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json")
                .body(body);
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }

            let res = req.send().await?;
            self.store_nonce(&res);

            if res.status().is_success() {
                return Ok(res);
            }

            let status = res.status().as_u16();
            let problem = res.json::<Problem>().await.unwrap_or_default();

            if problem.is_bad_nonce() && retries < BAD_NONCE_RETRIES {
                retries += 1;
                debug!("nonce rejected by {url}, retrying ({retries})");
                continue;
            }

            return Err(problem.into_error(status));
        }
    }

    fn sign(
        &self,
        url: &str,
        nonce: &str,
        payload: Option<&Value>,
        auth: Auth,
    ) -> Result<Jws, AcmeError> {
        let protected = match auth {
            Auth::Jwk => Protected {
                alg: "ES256",
                jwk: Some(self.key.public_jwk()?),
                kid: None,
                nonce,
                url,
            },
            Auth::Kid => Protected {
                alg: "ES256",
                jwk: None,
                kid: Some(self.kid.as_deref().ok_or(AcmeError::NoAccount)?),
                nonce,
                url,
            },
        };

        let protected = base64url(&serde_json::to_vec(&protected)?);
        let payload = match payload {
            Some(payload) => base64url(&serde_json::to_vec(payload)?),
            None => String::new(),
        };
        let signature = base64url(&self.key.sign(format!("{protected}.{payload}").as_bytes())?);

        Ok(Jws {
            protected,
            payload,
            signature,
        })
    }

    async fn nonce(&self) -> Result<String, AcmeError> {
        let cached = self.nonce.lock().take();
        if let Some(nonce) = cached {
            return Ok(nonce);
        }

        let res = self.http.head(&self.directory.new_nonce).send().await?;
        header(&res, REPLAY_NONCE)
    }

    fn store_nonce(&self, res: &Response) {
        if let Ok(nonce) = header(res, REPLAY_NONCE) {
            *self.nonce.lock() = Some(nonce);
        }
    }
}

fn header(res: &Response, name: &'static str) -> Result<String, AcmeError> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or(AcmeError::MissingHeader(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> Directory {
        Directory {
            new_nonce: "http://127.0.0.1:1/nonce".to_owned(),
            new_account: "http://127.0.0.1:1/account".to_owned(),
            new_order: "http://127.0.0.1:1/order".to_owned(),
            revoke_cert: None,
            key_change: None,
            meta: None,
        }
    }

    #[tokio::test]
    async fn refuses_registration_without_agreement() {
        let client = AcmeClient::with_directory(
            directory(),
            AccountKey::generate().unwrap(),
            Polling::default(),
        );

        let err = client
            .create_account(&["mailto:ops@example.com".to_owned()], false)
            .await
            .unwrap_err();
        assert!(err.is_agreement_required());
    }

    #[test]
    fn kid_is_required_for_account_requests() {
        let client = AcmeClient::with_directory(
            directory(),
            AccountKey::generate().unwrap(),
            Polling::default(),
        );

        assert!(matches!(
            client.sign("http://127.0.0.1:1/order", "nonce", None, Auth::Kid),
            Err(AcmeError::NoAccount)
        ));
    }

    #[test]
    fn jws_header_embeds_public_jwk() {
        let client = AcmeClient::with_directory(
            directory(),
            AccountKey::generate().unwrap(),
            Polling::default(),
        );

        let jws = client
            .sign("http://127.0.0.1:1/account", "abc", Some(&json!({})), Auth::Jwk)
            .unwrap();
        let protected = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            jws.protected,
        )
        .unwrap();
        let protected: Value = serde_json::from_slice(&protected).unwrap();

        assert_eq!(protected["alg"], "ES256");
        assert_eq!(protected["nonce"], "abc");
        assert_eq!(protected["jwk"]["kty"], "EC");
        assert!(protected["jwk"].get("d").is_none());
        assert!(protected.get("kid").is_none());
    }
}

//! In-memory mailbox for HTTP-01 challenges.
//!
//! The ACME client publishes challenges through the [`Notifier`] callback while the responder
//! waits for them, so validation requests that arrive before the token is known are held back
//! instead of failing.

use std::{collections::HashMap, pin::pin, time::Duration};

use ahash::RandomState;
use log::{debug, trace};
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::acme::{Event, Notifier};

pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingChallenge {
    pub token: String,
    pub key_authorization: String,
    pub host: String,
}

impl PendingChallenge {
    pub fn new(token: &str, key_authorization: &str, host: &str) -> Self {
        Self {
            token: token.to_owned(),
            key_authorization: key_authorization.to_owned(),
            host: host.to_owned(),
        }
    }

    pub fn path(&self) -> String {
        format!("{CHALLENGE_PREFIX}{}", self.token)
    }
}

/// Challenges of one order attempt, keyed by token.
#[derive(Default)]
pub struct ChallengeNotifier {
    challenges: RwLock<HashMap<String, PendingChallenge, RandomState>>,
    published: Notify,
}

impl ChallengeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, challenge: PendingChallenge) {
        debug!("publishing challenge for {} at {}", challenge.host, challenge.path());
        self.challenges
            .write()
            .insert(challenge.token.clone(), challenge);
        self.published.notify_waiters();
    }

    /// Key authorization for `token`, if already published.
    pub fn get(&self, token: &str) -> Option<String> {
        self.challenges
            .read()
            .get(token)
            .map(|c| c.key_authorization.clone())
    }

    pub fn len(&self) -> usize {
        self.challenges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.read().is_empty()
    }

    /// Wait until `token` is published, giving up after `timeout`.
    pub async fn wait_for(&self, token: &str, timeout: Duration) -> Option<String> {
        let wait = async {
            loop {
                let mut published = pin!(self.published.notified());
                // register before looking, so a publish in between is not missed
                published.as_mut().enable();

                if let Some(key_authorization) = self.get(token) {
                    return key_authorization;
                }

                trace!("token {token} not published yet, waiting");
                published.await;
            }
        };

        tokio::time::timeout(timeout, wait).await.ok()
    }
}

impl Notifier for ChallengeNotifier {
    fn notify(&self, event: &Event<'_>) {
        match *event {
            Event::ChallengeSelected {
                altname,
                token,
                key_authorization,
            } => self.publish(PendingChallenge::new(token, key_authorization, altname)),
            Event::ChallengeStatus { altname, status } => {
                debug!("challenge for {altname} is {}", status.as_str());
            }
            Event::OrderStatus { status } => debug!("order is {}", status.as_str()),
        }
    }
}

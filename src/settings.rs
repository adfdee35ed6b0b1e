//! Global application settings.

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{ensure, Result};
use serde::Deserialize;

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// Hostnames to certify. The first one becomes the certificate's common name.
    pub domains: Vec<String>,
    #[serde(alias = "maintainer")]
    pub maintainer_email: String,
    #[serde(alias = "subscriber")]
    pub subscriber_email: String,
    #[serde(alias = "accountFile")]
    pub account_file: PathBuf,
    #[serde(alias = "accountKeyFile")]
    pub account_key_file: PathBuf,
    #[serde(alias = "ServerKeyFile")]
    pub server_key_file: PathBuf,
    #[serde(alias = "fullChain")]
    pub full_chain_file: PathBuf,
    pub directory_url: String,
    pub agree_tos: bool,
    /// Renew once fewer than this many days of validity remain.
    #[serde(alias = "renewDays")]
    pub renew_days: u32,
    /// Minutes between two renewal checks.
    #[serde(alias = "monitorInterval")]
    pub monitor_interval: u64,
    pub listen: SocketAddr,
    /// Seconds a validation request may wait for its token to be published.
    pub challenge_timeout: u64,
    pub poll_attempts: u32,
    /// Seconds between two status polls of an authorization or order.
    pub poll_interval: u64,
    pub rsa_bits: u32,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            maintainer_email: String::new(),
            subscriber_email: String::new(),
            account_file: PathBuf::from("cert/account.json"),
            account_key_file: PathBuf::from("cert/account.pem"),
            server_key_file: PathBuf::from("cert/private.pem"),
            full_chain_file: PathBuf::from("cert/fullchain.pem"),
            directory_url: LETS_ENCRYPT_PRODUCTION.to_owned(),
            agree_tos: false,
            renew_days: 30,
            monitor_interval: 24 * 60,
            listen: (Ipv4Addr::UNSPECIFIED, 80).into(),
            challenge_timeout: 30,
            poll_attempts: 10,
            poll_interval: 3,
            rsa_bits: 2048,
            debug: false,
        }
    }
}

impl Settings {
    /// Parse settings from TOML. Missing keys fall back to their defaults.
    pub fn from_toml(input: &str) -> Result<Self> {
        let mut settings: Self = basic_toml::from_str(input)?;
        settings.normalize_domains();
        settings.validate()?;
        Ok(settings)
    }

    /// Trim and lowercase the domains, as issued certificates carry them.
    pub fn normalize_domains(&mut self) {
        for domain in &mut self.domains {
            *domain = domain.trim().to_ascii_lowercase();
        }
    }

    pub fn has_domains(&self) -> bool {
        !self.domains.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.monitor_interval > 0, "monitor_interval must be at least one minute");
        ensure!(self.poll_attempts > 0, "poll_attempts must be at least 1");
        ensure!(self.rsa_bits >= 2048, "rsa_bits below 2048 are rejected by ACME servers");
        ensure!(
            self.domains.iter().all(|d| !d.trim().is_empty()),
            "domains must not contain empty entries"
        );
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval * 60)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Contact list sent to the ACME server on registration.
    pub fn contacts(&self) -> Vec<String> {
        [&self.subscriber_email, &self.maintainer_email]
            .into_iter()
            .filter(|mail| !mail.is_empty())
            .map(|mail| format!("mailto:{mail}"))
            .fold(Vec::new(), |mut acc, mail| {
                if !acc.contains(&mail) {
                    acc.push(mail);
                }
                acc
            })
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
    Settings::from_toml(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_merges_over_defaults() {
        let settings = Settings::from_toml(
            r#"
            domains = ["example.com", "www.example.com"]
            subscriber = "ops@example.com"
            renew_days = 10
            "#,
        )
        .unwrap();

        assert_eq!(settings.domains, ["example.com", "www.example.com"]);
        assert_eq!(settings.subscriber_email, "ops@example.com");
        assert_eq!(settings.renew_days, 10);
        assert_eq!(settings.monitor_interval, 24 * 60);
        assert_eq!(settings.full_chain_file, PathBuf::from("cert/fullchain.pem"));
        assert_eq!(settings.listen.port(), 80);
    }

    #[test]
    fn accepts_camel_case_keys() {
        let settings = Settings::from_toml(
            r#"
            accountFile = "x/acct.json"
            accountKeyFile = "x/acct.pem"
            ServerKeyFile = "x/private.pem"
            fullChain = "x/fullchain.pem"
            monitorInterval = 5
            renewDays = 7
            "#,
        )
        .unwrap();

        assert_eq!(settings.account_file, PathBuf::from("x/acct.json"));
        assert_eq!(settings.account_key_file, PathBuf::from("x/acct.pem"));
        assert_eq!(settings.server_key_file, PathBuf::from("x/private.pem"));
        assert_eq!(settings.full_chain_file, PathBuf::from("x/fullchain.pem"));
        assert_eq!(settings.monitor_interval, 5);
        assert_eq!(settings.renew_days, 7);
    }

    #[test]
    fn domains_are_lowercased() {
        let settings =
            Settings::from_toml(r#"domains = ["Example.COM", " www.example.com "]"#).unwrap();
        assert_eq!(settings.domains, ["example.com", "www.example.com"]);
    }

    #[test]
    fn empty_file_is_valid() {
        let settings = Settings::from_toml("").unwrap();
        assert!(!settings.has_domains());
        assert_eq!(settings.directory_url, LETS_ENCRYPT_PRODUCTION);
    }

    #[test]
    fn rejects_weak_rsa() {
        assert!(Settings::from_toml("rsa_bits = 1024").is_err());
    }

    #[test]
    fn contacts_are_deduplicated() {
        let settings = Settings {
            maintainer_email: "a@example.com".to_owned(),
            subscriber_email: "a@example.com".to_owned(),
            ..Settings::default()
        };
        assert_eq!(settings.contacts(), ["mailto:a@example.com"]);
    }
}

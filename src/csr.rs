//! Certificate signing requests.

use std::collections::BTreeSet;

use openssl::{
    hash::MessageDigest,
    nid::Nid,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509ReqBuilder},
};
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::FromDer,
};

use crate::{error::CsrError, keys::ServerKey};

/// Build a DER encoded CSR for `domains`, signed with the server key, and check that it carries
/// exactly the requested identities.
pub fn generate(domains: &[String], key: &ServerKey) -> Result<Vec<u8>, CsrError> {
    let der = build(domains, key)?;
    verify(&der, domains)?;
    Ok(der)
}

fn build(domains: &[String], key: &ServerKey) -> Result<Vec<u8>, CsrError> {
    let common_name = domains.first().ok_or(CsrError::NoDomains)?;
    let pkey = key.pkey()?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&pkey)?;

    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let mut extensions = Stack::new()?;
    extensions.push(san.build(&builder.x509v3_context(None))?)?;
    builder.add_extensions(&extensions)?;

    builder.sign(&pkey, MessageDigest::sha256())?;
    Ok(builder.build().to_der()?)
}

/// Subject must be `domains[0]`, the alternative names must be the set of `domains`.
pub fn verify(der: &[u8], domains: &[String]) -> Result<(), CsrError> {
    let expected_cn = domains.first().ok_or(CsrError::NoDomains)?;
    let (_, csr) =
        X509CertificationRequest::from_der(der).map_err(|e| CsrError::Decode(e.to_string()))?;

    let common_name = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);

    if common_name.as_deref() != Some(expected_cn.as_str()) {
        return Err(CsrError::SubjectMismatch {
            expected: expected_cn.clone(),
            found: common_name,
        });
    }

    let alt_names = csr
        .requested_extensions()
        .into_iter()
        .flatten()
        .filter_map(|ext| match ext {
            ParsedExtension::SubjectAlternativeName(san) => Some(&san.general_names),
            _ => None,
        })
        .flatten()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_owned()),
            _ => None,
        })
        .collect::<BTreeSet<_>>();
    let expected = domains.iter().cloned().collect::<BTreeSet<_>>();

    if alt_names != expected {
        return Err(CsrError::AltNameMismatch {
            expected: expected.into_iter().collect(),
            found: alt_names.into_iter().collect(),
        });
    }

    Ok(())
}

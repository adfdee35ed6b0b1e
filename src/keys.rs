//! Account and server keys.
//!
//! The account key (EC P-256) signs every ACME request, the server key (RSA) is the one the issued
//! certificate is bound to. Both are kept on disk as PEM and created on first use.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use log::{debug, info};
use openssl::{
    bn::{BigNum, BigNumContext, BigNumRef},
    ec::{EcGroup, EcKey, EcPoint},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    sha::sha256,
};
use serde::{Deserialize, Serialize};

use crate::{error::KeyStoreError, settings::Settings};

const P256_WIDTH: i32 = 32;

pub fn base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode(field: &'static str, value: &str) -> Result<BigNum, KeyStoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| KeyStoreError::Jwk(format!("field {field}: {e}")))?;
    BigNum::from_slice(&bytes).map_err(|e| KeyStoreError::Jwk(format!("field {field}: {e}")))
}

fn encode_opt(value: Option<&BigNumRef>) -> Option<String> {
    value.map(|v| base64url(&v.to_vec()))
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, KeyStoreError> {
    value
        .as_deref()
        .ok_or_else(|| KeyStoreError::Jwk(format!("missing field {field}")))
}

/// JSON Web Key (RFC 7517) representation of the keys we handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "EC")]
    Ec {
        crv: String,
        x: String,
        y: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        d: Option<String>,
    },
    #[serde(rename = "RSA")]
    Rsa {
        n: String,
        e: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        d: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        p: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        q: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dq: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qi: Option<String>,
    },
}

impl Jwk {
    /// The same key with every private component stripped.
    pub fn public(&self) -> Self {
        match self {
            Self::Ec { crv, x, y, .. } => Self::Ec {
                crv: crv.clone(),
                x: x.clone(),
                y: y.clone(),
                d: None,
            },
            Self::Rsa { n, e, .. } => Self::Rsa {
                n: n.clone(),
                e: e.clone(),
                d: None,
                p: None,
                q: None,
                dp: None,
                dq: None,
                qi: None,
            },
        }
    }

    /// RFC 7638 thumbprint, base64url encoded.
    pub fn thumbprint(&self) -> String {
        // members in lexicographic order, no whitespace
        let canonical = match self {
            Self::Ec { crv, x, y, .. } => {
                format!(r#"{{"crv":"{crv}","kty":"EC","x":"{x}","y":"{y}"}}"#)
            }
            Self::Rsa { n, e, .. } => format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#),
        };
        base64url(&sha256(canonical.as_bytes()))
    }
}

/// EC P-256 key used to sign ACME requests (ES256).
#[derive(Clone)]
pub struct AccountKey(EcKey<Private>);

impl AccountKey {
    pub fn generate() -> Result<Self, ErrorStack> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        EcKey::generate(&group).map(Self)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyStoreError> {
        let parse = |source| KeyStoreError::Parse {
            path: PathBuf::new(),
            source,
        };
        let key = PKey::private_key_from_pem(pem).map_err(parse)?;
        let key = key.ec_key().map_err(|_| KeyStoreError::Unsupported {
            path: PathBuf::new(),
            reason: "account key must be an EC key".to_owned(),
        })?;

        if key.group().curve_name() != Some(Nid::X9_62_PRIME256V1) {
            return Err(KeyStoreError::Unsupported {
                path: PathBuf::new(),
                reason: "account key must use the P-256 curve".to_owned(),
            });
        }

        Ok(Self(key))
    }

    /// SEC1 encoded PEM.
    pub fn to_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.0.private_key_to_pem()
    }

    pub fn to_jwk(&self) -> Result<Jwk, ErrorStack> {
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        self.0
            .public_key()
            .affine_coordinates_gfp(self.0.group(), &mut x, &mut y, &mut ctx)?;

        Ok(Jwk::Ec {
            crv: "P-256".to_owned(),
            x: base64url(&x.to_vec_padded(P256_WIDTH)?),
            y: base64url(&y.to_vec_padded(P256_WIDTH)?),
            d: Some(base64url(&self.0.private_key().to_vec_padded(P256_WIDTH)?)),
        })
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyStoreError> {
        let Jwk::Ec { crv, x, y, d } = jwk else {
            return Err(KeyStoreError::Jwk("account key must be an EC key".to_owned()));
        };
        if crv != "P-256" {
            return Err(KeyStoreError::Jwk(format!("unsupported curve {crv}")));
        }

        let d = decode("d", required("d", d)?)?;
        let key = p256_from_private(&d)
            .map(Self)
            .map_err(|e| KeyStoreError::Jwk(e.to_string()))?;

        match key.to_jwk() {
            Ok(Jwk::Ec { x: kx, y: ky, .. }) if &kx == x && &ky == y => Ok(key),
            Ok(_) => Err(KeyStoreError::Jwk(
                "public point does not belong to the private key".to_owned(),
            )),
            Err(e) => Err(KeyStoreError::Jwk(e.to_string())),
        }
    }

    /// ES256 signature in the fixed-width `r || s` form JWS expects.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let sig = EcdsaSig::sign(&sha256(data), &self.0)?;
        let mut out = sig.r().to_vec_padded(P256_WIDTH)?;
        out.extend(sig.s().to_vec_padded(P256_WIDTH)?);
        Ok(out)
    }

    /// Public JWK, as embedded in the `newAccount` request.
    pub fn public_jwk(&self) -> Result<Jwk, ErrorStack> {
        self.to_jwk().map(|jwk| jwk.public())
    }

    pub fn thumbprint(&self) -> Result<String, ErrorStack> {
        self.to_jwk().map(|jwk| jwk.thumbprint())
    }
}

fn p256_from_private(d: &BigNumRef) -> Result<EcKey<Private>, ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let mut ctx = BigNumContext::new()?;
    let mut point = EcPoint::new(&group)?;
    point.mul_generator2(&group, d, &mut ctx)?;
    let key = EcKey::from_private_components(&group, d, &point)?;
    key.check_key()?;
    Ok(key)
}

/// RSA key the issued certificate is bound to.
#[derive(Clone)]
pub struct ServerKey(Rsa<Private>);

impl ServerKey {
    pub fn generate(bits: u32) -> Result<Self, ErrorStack> {
        Rsa::generate(bits).map(Self)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyStoreError> {
        let key = PKey::private_key_from_pem(pem).map_err(|source| KeyStoreError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        key.rsa().map(Self).map_err(|_| KeyStoreError::Unsupported {
            path: PathBuf::new(),
            reason: "server key must be an RSA key".to_owned(),
        })
    }

    /// PKCS#1 encoded PEM.
    pub fn to_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.0.private_key_to_pem()
    }

    pub fn pkey(&self) -> Result<PKey<Private>, ErrorStack> {
        PKey::from_rsa(self.0.clone())
    }

    /// DER encoded SubjectPublicKeyInfo, for comparison with issued certificates.
    pub fn public_key_der(&self) -> Result<Vec<u8>, ErrorStack> {
        self.pkey()?.public_key_to_der()
    }

    pub fn bits(&self) -> u32 {
        self.0.size() * 8
    }

    pub fn to_jwk(&self) -> Jwk {
        let rsa = &self.0;
        Jwk::Rsa {
            n: base64url(&rsa.n().to_vec()),
            e: base64url(&rsa.e().to_vec()),
            d: Some(base64url(&rsa.d().to_vec())),
            p: encode_opt(rsa.p()),
            q: encode_opt(rsa.q()),
            dp: encode_opt(rsa.dmp1()),
            dq: encode_opt(rsa.dmq1()),
            qi: encode_opt(rsa.iqmp()),
        }
    }

    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyStoreError> {
        let Jwk::Rsa {
            n,
            e,
            d,
            p,
            q,
            dp,
            dq,
            qi,
        } = jwk
        else {
            return Err(KeyStoreError::Jwk("server key must be an RSA key".to_owned()));
        };

        let rsa = Rsa::from_private_components(
            decode("n", n)?,
            decode("e", e)?,
            decode("d", required("d", d)?)?,
            decode("p", required("p", p)?)?,
            decode("q", required("q", q)?)?,
            decode("dp", required("dp", dp)?)?,
            decode("dq", required("dq", dq)?)?,
            decode("qi", required("qi", qi)?)?,
        )
        .map_err(|e| KeyStoreError::Jwk(e.to_string()))?;

        match rsa.check_key() {
            Ok(true) => Ok(Self(rsa)),
            Ok(false) => Err(KeyStoreError::Jwk("inconsistent RSA components".to_owned())),
            Err(e) => Err(KeyStoreError::Jwk(e.to_string())),
        }
    }
}

/// Keys persisted as PEM files.
trait PemKey: Sized {
    const KIND: &'static str;

    fn from_pem(pem: &[u8]) -> Result<Self, KeyStoreError>;

    fn to_pem(&self) -> Result<Vec<u8>, ErrorStack>;
}

impl PemKey for AccountKey {
    const KIND: &'static str = "account";

    fn from_pem(pem: &[u8]) -> Result<Self, KeyStoreError> {
        Self::from_pem(pem)
    }

    fn to_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.to_pem()
    }
}

impl PemKey for ServerKey {
    const KIND: &'static str = "server";

    fn from_pem(pem: &[u8]) -> Result<Self, KeyStoreError> {
        Self::from_pem(pem)
    }

    fn to_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.to_pem()
    }
}

pub struct KeyStore {
    settings: Arc<Settings>,
}

impl KeyStore {
    pub const fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    pub fn ensure_account_key(&self) -> Result<AccountKey, KeyStoreError> {
        load_or_create(&self.settings.account_key_file, AccountKey::generate)
    }

    pub fn ensure_server_key(&self) -> Result<ServerKey, KeyStoreError> {
        let bits = self.settings.rsa_bits;
        load_or_create(&self.settings.server_key_file, || ServerKey::generate(bits))
    }
}

fn load_or_create<K: PemKey>(
    path: &Path,
    generate: impl FnOnce() -> Result<K, ErrorStack>,
) -> Result<K, KeyStoreError> {
    let io = |source| KeyStoreError::Io {
        path: path.to_owned(),
        source,
    };

    if path.exists() {
        debug!("loading {} key from {}", K::KIND, path.display());
        let pem = fs::read(path).map_err(io)?;
        return K::from_pem(&pem).map_err(|e| with_path(e, path));
    }

    info!("generating new {} key at {}", K::KIND, path.display());
    let key = generate().map_err(KeyStoreError::Generate)?;
    let pem = key.to_pem().map_err(KeyStoreError::Generate)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io)?;
    }
    fs::write(path, pem).map_err(io)?;

    Ok(key)
}

fn with_path(err: KeyStoreError, path: &Path) -> KeyStoreError {
    match err {
        KeyStoreError::Parse { source, .. } => KeyStoreError::Parse {
            path: path.to_owned(),
            source,
        },
        KeyStoreError::Unsupported { reason, .. } => KeyStoreError::Unsupported {
            path: path.to_owned(),
            reason,
        },
        other => other,
    }
}

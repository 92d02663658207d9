// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! RSA key material and conversions

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use tracing::debug;
use x509_parser::prelude::*;

use tpm2::{Tpm2bPublic, TpmAlgId, TpmaObject, TpmtPublic};
use tpm_types::{QuoteKeyInfo, RsaKeyInfo};

use crate::error::{Error, Result};

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];

/// An RSA key, with or without its private half
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    PublicOnly(RsaPublicKey),
    WithPrivate(RsaPrivateKey),
}

impl KeyMaterial {
    /// Generate a fresh key with exponent 65537
    pub fn generate(bits: usize) -> Result<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        Ok(KeyMaterial::WithPrivate(key))
    }

    pub fn public(&self) -> RsaPublicKey {
        match self {
            KeyMaterial::PublicOnly(key) => key.clone(),
            KeyMaterial::WithPrivate(key) => key.to_public_key(),
        }
    }

    pub fn private(&self) -> Result<&RsaPrivateKey> {
        match self {
            KeyMaterial::PublicOnly(_) => Err(Error::InvalidKey(
                "operation needs a private key, only the public half is known".into(),
            )),
            KeyMaterial::WithPrivate(key) => Ok(key),
        }
    }

    pub fn has_private(&self) -> bool {
        matches!(self, KeyMaterial::WithPrivate(_))
    }

    pub fn key_info(&self) -> RsaKeyInfo {
        key_info_from_public(&self.public())
    }
}

impl From<RsaPublicKey> for KeyMaterial {
    fn from(key: RsaPublicKey) -> Self {
        KeyMaterial::PublicOnly(key)
    }
}

impl From<RsaPrivateKey> for KeyMaterial {
    fn from(key: RsaPrivateKey) -> Self {
        KeyMaterial::WithPrivate(key)
    }
}

pub fn key_info_from_public(key: &RsaPublicKey) -> RsaKeyInfo {
    RsaKeyInfo::rsa(
        key.n().bits() as u32,
        key.e().to_bytes_be(),
        key.n().to_bytes_be(),
    )
}

pub fn public_key_from_parts(modulus: &[u8], exponent: &[u8]) -> Result<RsaPublicKey> {
    if modulus.is_empty() {
        return Err(Error::InvalidKey("empty modulus".into()));
    }
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from_bytes_be(exponent);
    Ok(RsaPublicKey::new(n, e)?)
}

pub fn public_key_from_info(info: &RsaKeyInfo) -> Result<RsaPublicKey> {
    if !info.key_type.eq_ignore_ascii_case("rsa") {
        return Err(Error::InvalidKey(format!("key type {}", info.key_type)));
    }
    let key = public_key_from_parts(&info.modulus, &info.exponent)?;
    if key.n().bits() as u32 != info.bit_modulus_size {
        return Err(Error::InvalidKey(format!(
            "modulus has {} bits, {} declared",
            key.n().bits(),
            info.bit_modulus_size
        )));
    }
    Ok(key)
}

pub fn public_key_from_quote_key(info: &QuoteKeyInfo) -> Result<RsaPublicKey> {
    public_key_from_info(&info.key)
}

/// Check that a quote key's name, public area and RSA key describe the same
/// TPM-resident restricted signing key, and return that key.
///
/// The credential is bound to `info.name`, so the name has to belong to the
/// key that signed the quote.
pub fn check_quote_key(info: &QuoteKeyInfo) -> Result<RsaPublicKey> {
    let name_alg = info
        .name
        .get(..2)
        .and_then(|alg| TpmAlgId::from_u16(u16::from_be_bytes([alg[0], alg[1]])))
        .ok_or_else(|| Error::InvalidKey("quote key name has no known name algorithm".into()))?;
    if crate::crypto::object_name(name_alg, &info.public_area)? != info.name {
        return Err(Error::QuoteMismatch("quote key name does not match its public area"));
    }

    let public = Tpm2bPublic {
        public_area: info.public_area.clone(),
    }
    .decode()?;
    let required = TpmaObject::FIXED_TPM | TpmaObject::RESTRICTED | TpmaObject::SIGN_ENCRYPT;
    if !public.object_attributes.contains(required) {
        return Err(Error::InvalidKey(
            "quote key is not a fixedTPM restricted signing key".into(),
        ));
    }

    let key = public_key_from_tpm(&public)?;
    if key_info_from_public(&key) != info.key {
        return Err(Error::QuoteMismatch("quote key differs from its public area"));
    }
    Ok(key)
}

/// RSA public key of a TPM object
pub fn public_key_from_tpm(public: &TpmtPublic) -> Result<RsaPublicKey> {
    let exponent = public
        .rsa_exponent()
        .ok_or_else(|| Error::InvalidKey("TPM object is not an RSA key".into()))?;
    public_key_from_parts(&public.unique, &exponent.to_be_bytes())
}

/// Extract the RSA subject key of a DER certificate
pub fn public_key_from_cert_der(cert_der: &[u8]) -> Result<RsaPublicKey> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

    let spki = cert.public_key();
    let oid: Vec<u64> = spki
        .algorithm
        .algorithm
        .iter()
        .ok_or_else(|| Error::Certificate("invalid key algorithm OID".into()))?
        .collect();
    if oid != OID_RSA_ENCRYPTION {
        return Err(Error::InvalidKey(format!(
            "unsupported public key algorithm {oid:?}"
        )));
    }

    let key = RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
        .map_err(|e| Error::InvalidKey(format!("bad RSA public key in certificate: {e}")))?;
    debug!("certificate carries a {} bit RSA key", key.size() * 8);
    Ok(key)
}

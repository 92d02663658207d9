// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Hash, HMAC and KDFa primitives
//!
//! Only SHA-1 and SHA-256 are accepted; anything else is
//! [`Error::UnsupportedAlgorithm`].

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tpm2::TpmAlgId;

use crate::error::{Error, Result};

pub const LABEL_IDENTITY: &[u8] = b"IDENTITY";
pub const LABEL_STORAGE: &[u8] = b"STORAGE";
pub const LABEL_INTEGRITY: &[u8] = b"INTEGRITY";
pub const LABEL_PROTECT: &[u8] = b"PROTECT";

/// Digest size of a supported hash
pub fn hash_size(alg: TpmAlgId) -> Result<usize> {
    match alg {
        TpmAlgId::Sha1 | TpmAlgId::Sha256 => Ok(alg.digest_size()),
        other => Err(Error::unsupported(other)),
    }
}

/// Resolve a hash name as carried in protocol messages ("sha1", "sha256")
pub fn hash_alg_from_name(name: &str) -> Result<TpmAlgId> {
    match TpmAlgId::from_name(name) {
        Some(alg @ (TpmAlgId::Sha1 | TpmAlgId::Sha256)) => Ok(alg),
        _ => Err(Error::UnsupportedAlgorithm(name.to_string())),
    }
}

pub fn hash(alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>> {
    match alg {
        TpmAlgId::Sha1 => Ok(Sha1::digest(data).to_vec()),
        TpmAlgId::Sha256 => Ok(Sha256::digest(data).to_vec()),
        other => Err(Error::unsupported(other)),
    }
}

fn keyed<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<M> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::InvalidKey("bad HMAC key length".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// HMAC over the concatenation of `parts`
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let tag = match alg {
        TpmAlgId::Sha1 => keyed::<Hmac<Sha1>>(key, parts)?.finalize().into_bytes().to_vec(),
        TpmAlgId::Sha256 => keyed::<Hmac<Sha256>>(key, parts)?
            .finalize()
            .into_bytes()
            .to_vec(),
        other => return Err(Error::unsupported(other)),
    };
    Ok(tag)
}

/// Constant-time comparison of `expected` against the HMAC of `parts`
pub fn hmac_verify(alg: TpmAlgId, key: &[u8], parts: &[&[u8]], expected: &[u8]) -> Result<()> {
    let matches = match alg {
        TpmAlgId::Sha1 => keyed::<Hmac<Sha1>>(key, parts)?
            .verify_slice(expected)
            .is_ok(),
        TpmAlgId::Sha256 => keyed::<Hmac<Sha256>>(key, parts)?
            .verify_slice(expected)
            .is_ok(),
        other => return Err(Error::unsupported(other)),
    };
    if matches {
        Ok(())
    } else {
        Err(Error::IntegrityCheckFailed)
    }
}

/// TPM KDFa (SP800-108 counter mode with HMAC)
///
/// `label` is given without its terminating zero; the zero is always added.
/// Only whole-byte lengths are produced, the output is `ceil(bits / 8)` bytes.
pub fn kdf_a(
    alg: TpmAlgId,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let wanted = bits.div_ceil(8) as usize;
    let block = hash_size(alg)?;
    let mut out = Vec::with_capacity(wanted + block);
    let bits_be = bits.to_be_bytes();
    let mut counter: u32 = 1;
    while out.len() < wanted {
        let counter_be = counter.to_be_bytes();
        let chunk = hmac(
            alg,
            key,
            &[&counter_be, label, &[0], context_u, context_v, &bits_be],
        )?;
        out.extend_from_slice(&chunk);
        counter += 1;
    }
    out.truncate(wanted);
    Ok(out)
}

/// TPM object name: `nameAlg || H(nameAlg, public area)`
pub fn object_name(name_alg: TpmAlgId, public_area: &[u8]) -> Result<Vec<u8>> {
    let digest = hash(name_alg, public_area)?;
    let mut name = Vec::with_capacity(2 + digest.len());
    name.extend_from_slice(&name_alg.to_u16().to_be_bytes());
    name.extend_from_slice(&digest);
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_sizes() {
        assert_eq!(hash(TpmAlgId::Sha1, b"abc").unwrap().len(), 20);
        assert_eq!(
            hex::encode(hash(TpmAlgId::Sha256, b"abc").unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches!(
            hash(TpmAlgId::Sha384, b"abc"),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_hmac_rfc4231_case2() {
        let tag = hmac(
            TpmAlgId::Sha256,
            b"Jefe",
            &[b"what do ya want ", b"for nothing?"],
        )
        .unwrap();
        assert_eq!(
            hex::encode(&tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        hmac_verify(TpmAlgId::Sha256, b"Jefe", &[b"what do ya want for nothing?"], &tag)
            .unwrap();
        assert!(matches!(
            hmac_verify(TpmAlgId::Sha256, b"Jefe", &[b"what do ya want"], &tag),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_kdf_a_first_block() {
        let key = [7u8; 16];
        let out = kdf_a(TpmAlgId::Sha256, &key, LABEL_STORAGE, b"name", b"", 128).unwrap();
        let mut input = 1u32.to_be_bytes().to_vec();
        input.extend_from_slice(b"STORAGE\0name");
        input.extend_from_slice(&128u32.to_be_bytes());
        let block = hmac(TpmAlgId::Sha256, &key, &[&input]).unwrap();
        assert_eq!(out, block[..16]);
    }

    #[test]
    fn test_kdf_a_lengths() {
        let key = b"seed";
        for bits in [8, 128, 160, 256, 512, 1000] {
            let a = kdf_a(TpmAlgId::Sha1, key, LABEL_PROTECT, b"", b"", bits).unwrap();
            let b = kdf_a(TpmAlgId::Sha1, key, LABEL_PROTECT, b"", b"", bits).unwrap();
            assert_eq!(a.len(), bits.div_ceil(8) as usize);
            assert_eq!(a, b);
        }
        // the requested length is an HMAC input, so outputs are not prefixes
        let short = kdf_a(TpmAlgId::Sha256, key, LABEL_PROTECT, b"", b"", 128).unwrap();
        let long = kdf_a(TpmAlgId::Sha256, key, LABEL_PROTECT, b"", b"", 256).unwrap();
        assert_ne!(short[..], long[..16]);
    }

    #[test]
    fn test_object_name_prefix() {
        let name = object_name(TpmAlgId::Sha256, b"public").unwrap();
        assert_eq!(&name[..2], &[0x00, 0x0b]);
        assert_eq!(name.len(), 34);
        assert_eq!(name[2..], hash(TpmAlgId::Sha256, b"public").unwrap()[..]);
    }

    #[test]
    fn test_hash_names() {
        assert_eq!(hash_alg_from_name("SHA256").unwrap(), TpmAlgId::Sha256);
        assert!(hash_alg_from_name("sha512").is_err());
        assert!(hash_alg_from_name("md5").is_err());
    }
}

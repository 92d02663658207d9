// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Credential binding (the software half of MakeCredential/ActivateCredential)
//! and data protection under a released credential.

use aes::Aes128;
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit, StreamCipher};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use tracing::debug;

use tpm2::{CommandBuffer, ResponseBuffer, TpmAlgId};

use crate::crypto::*;
use crate::error::{Error, Result};
use crate::keys::KeyMaterial;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Seed size used by MakeCredential
pub const SEED_SIZE: usize = 16;

/// Symmetric key size for encIdentity; the TPM derives 128 bits for AES-128
const SYM_KEY_BITS: u32 = 128;

/// OAEP label, including its terminating zero
const OAEP_IDENTITY_LABEL: &str = "IDENTITY\0";

/// Output of [`make_credential`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBlob {
    /// Seed wrapped with RSA-OAEP under the protector key
    pub encrypted_secret: Vec<u8>,
    pub enc_identity: Vec<u8>,
    /// TPM2B-encoded integrity HMAC
    pub integrity_hmac: Vec<u8>,
}

impl CredentialBlob {
    /// TPM2B_ID_OBJECT contents: integrity HMAC followed by encIdentity
    pub fn id_object(&self) -> Vec<u8> {
        id_object(&self.integrity_hmac, &self.enc_identity)
    }
}

pub fn id_object(integrity_hmac: &[u8], enc_identity: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(integrity_hmac.len() + enc_identity.len());
    blob.extend_from_slice(integrity_hmac);
    blob.extend_from_slice(enc_identity);
    blob
}

fn oaep(alg: TpmAlgId) -> Result<Oaep> {
    match alg {
        TpmAlgId::Sha1 => Ok(Oaep::new_with_label::<Sha1, _>(OAEP_IDENTITY_LABEL)),
        TpmAlgId::Sha256 => Ok(Oaep::new_with_label::<Sha256, _>(OAEP_IDENTITY_LABEL)),
        other => Err(Error::unsupported(other)),
    }
}

fn cfb_key(alg: TpmAlgId, seed: &[u8], name: &[u8]) -> Result<Vec<u8>> {
    kdf_a(alg, seed, LABEL_STORAGE, name, &[], SYM_KEY_BITS)
}

fn integrity_key(alg: TpmAlgId, seed: &[u8]) -> Result<Vec<u8>> {
    kdf_a(alg, seed, LABEL_INTEGRITY, &[], &[], 8 * hash_size(alg)? as u32)
}

fn bad_key(_: cipher::InvalidLength) -> Error {
    Error::InvalidKey("derived key has the wrong length".into())
}

/// Encrypt and authenticate `credential` for the object `name` with a known
/// seed. Returns `(enc_identity, TPM2B(integrity_hmac))`.
pub fn protect_credential(
    alg: TpmAlgId,
    seed: &[u8],
    credential: &[u8],
    name: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = CommandBuffer::new();
    buf.put_tpm2b(credential)?;
    let mut enc_identity = buf.into_vec();

    let sym_key = cfb_key(alg, seed, name)?;
    let iv = [0u8; 16];
    Encryptor::<Aes128>::new_from_slices(&sym_key, &iv)
        .map_err(bad_key)?
        .encrypt(&mut enc_identity);

    let hmac_key = integrity_key(alg, seed)?;
    let tag = hmac(alg, &hmac_key, &[&enc_identity, name])?;
    let mut integrity = CommandBuffer::new();
    integrity.put_tpm2b(&tag)?;

    Ok((enc_identity, integrity.into_vec()))
}

/// Bind a credential to the object `name`, wrapping the seed for `protector`.
pub fn make_credential(
    protector: &RsaPublicKey,
    alg: TpmAlgId,
    credential: &[u8],
    name: &[u8],
) -> Result<CredentialBlob> {
    let mut rng = rand::thread_rng();
    let mut seed = [0u8; SEED_SIZE];
    rng.fill_bytes(&mut seed);

    let encrypted_secret = protector.encrypt(&mut rng, oaep(alg)?, &seed)?;
    let (enc_identity, integrity_hmac) = protect_credential(alg, &seed, credential, name)?;
    debug!(
        "bound {} byte credential to object name of {} bytes",
        credential.len(),
        name.len()
    );

    Ok(CredentialBlob {
        encrypted_secret,
        enc_identity,
        integrity_hmac,
    })
}

/// Inverse of [`protect_credential`]. The HMAC is checked before anything
/// is decrypted.
pub fn recover_credential(
    alg: TpmAlgId,
    seed: &[u8],
    name: &[u8],
    enc_identity: &[u8],
    integrity_hmac: &[u8],
) -> Result<Vec<u8>> {
    let mut wrapped = ResponseBuffer::new(integrity_hmac);
    let tag = wrapped.get_tpm2b().map_err(|_| Error::IntegrityCheckFailed)?;
    wrapped.finish().map_err(|_| Error::IntegrityCheckFailed)?;

    let hmac_key = integrity_key(alg, seed)?;
    hmac_verify(alg, &hmac_key, &[enc_identity, name], &tag)?;

    let sym_key = cfb_key(alg, seed, name)?;
    let iv = [0u8; 16];
    let mut plain = enc_identity.to_vec();
    Decryptor::<Aes128>::new_from_slices(&sym_key, &iv)
        .map_err(bad_key)?
        .decrypt(&mut plain);

    let mut buf = ResponseBuffer::new(&plain);
    let credential = buf.get_tpm2b()?;
    buf.finish()?;
    Ok(credential)
}

/// Unwrap the seed with `key` and recover the credential, as the TPM does in
/// ActivateCredential.
pub fn activate_credential(
    key: &KeyMaterial,
    alg: TpmAlgId,
    encrypted_secret: &[u8],
    name: &[u8],
    enc_identity: &[u8],
    integrity_hmac: &[u8],
) -> Result<Vec<u8>> {
    let private: &RsaPrivateKey = key.private()?;
    let seed = private.decrypt(oaep(alg)?, encrypted_secret)?;
    recover_credential(alg, &seed, name, enc_identity, integrity_hmac)
}

/// Encrypt (or decrypt) `data` under keys derived from a released credential.
///
/// Returns `(output, hmac)`. The HMAC always covers the plaintext. When
/// decrypting, `supplied_hmac` must match or no output is returned.
pub fn encrypt_data_with_credential(
    encrypt: bool,
    alg: TpmAlgId,
    credential: &[u8],
    data: &[u8],
    supplied_hmac: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let keys = kdf_a(alg, credential, LABEL_PROTECT, &[], &[], 512)?;
    let hmac_key = match alg {
        TpmAlgId::Sha1 => &keys[48..64],
        TpmAlgId::Sha256 => &keys[32..64],
        other => return Err(Error::unsupported(other)),
    };

    let mut output = data.to_vec();
    Aes128Ctr::new_from_slices(&keys[0..16], &keys[16..32])
        .map_err(bad_key)?
        .apply_keystream(&mut output);

    let plaintext = if encrypt { data } else { &output[..] };
    let tag = hmac(alg, hmac_key, &[plaintext])?;

    if !encrypt {
        hmac_verify(alg, hmac_key, &[plaintext], supplied_hmac)?;
    }
    Ok((output, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &[u8] = &[0x00, 0x0b, 1, 2, 3, 4];

    #[test]
    fn test_protect_then_recover() {
        for alg in [TpmAlgId::Sha1, TpmAlgId::Sha256] {
            let seed = [9u8; SEED_SIZE];
            let (enc, hmac) = protect_credential(alg, &seed, b"0123456789abcdef", NAME).unwrap();
            assert_eq!(enc.len(), 18);
            assert_eq!(hmac.len(), 2 + alg.digest_size());
            let cred = recover_credential(alg, &seed, NAME, &enc, &hmac).unwrap();
            assert_eq!(cred, b"0123456789abcdef");
        }
    }

    #[test]
    fn test_tampering_fails_integrity() {
        let seed = [3u8; SEED_SIZE];
        let alg = TpmAlgId::Sha256;
        let (enc, hmac) = protect_credential(alg, &seed, &[5u8; 16], NAME).unwrap();

        let mut bad_enc = enc.clone();
        bad_enc[4] ^= 0x01;
        assert!(matches!(
            recover_credential(alg, &seed, NAME, &bad_enc, &hmac),
            Err(Error::IntegrityCheckFailed)
        ));

        let mut bad_tag = hmac.clone();
        bad_tag[10] ^= 0x80;
        assert!(matches!(
            recover_credential(alg, &seed, NAME, &enc, &bad_tag),
            Err(Error::IntegrityCheckFailed)
        ));

        // a different object name changes both keys
        assert!(matches!(
            recover_credential(alg, &seed, &[0x00, 0x0b, 9], &enc, &hmac),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_make_and_activate() {
        let ek = KeyMaterial::generate(1024).unwrap();
        let blob = make_credential(&ek.public(), TpmAlgId::Sha1, &[0x42; 16], NAME).unwrap();
        assert_eq!(blob.encrypted_secret.len(), 128);
        assert_eq!(
            blob.id_object(),
            [blob.integrity_hmac.clone(), blob.enc_identity.clone()].concat()
        );

        let cred = activate_credential(
            &ek,
            TpmAlgId::Sha1,
            &blob.encrypted_secret,
            NAME,
            &blob.enc_identity,
            &blob.integrity_hmac,
        )
        .unwrap();
        assert_eq!(cred, vec![0x42; 16]);

        let public_only = KeyMaterial::from(ek.public());
        assert!(matches!(
            activate_credential(
                &public_only,
                TpmAlgId::Sha1,
                &blob.encrypted_secret,
                NAME,
                &blob.enc_identity,
                &blob.integrity_hmac,
            ),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_with_credential() {
        let credential = [0x11u8; 16];
        let data = b"-----BEGIN CERTIFICATE----- not really";
        for alg in [TpmAlgId::Sha1, TpmAlgId::Sha256] {
            let (cipher, tag) =
                encrypt_data_with_credential(true, alg, &credential, data, &[]).unwrap();
            assert_ne!(&cipher[..], &data[..]);
            assert_eq!(tag.len(), alg.digest_size());

            let (plain, _) =
                encrypt_data_with_credential(false, alg, &credential, &cipher, &tag).unwrap();
            assert_eq!(&plain[..], &data[..]);

            let wrong = [0x12u8; 16];
            assert!(matches!(
                encrypt_data_with_credential(false, alg, &wrong, &cipher, &tag),
                Err(Error::IntegrityCheckFailed)
            ));
            let mut bad_tag = tag.clone();
            bad_tag[0] ^= 1;
            assert!(matches!(
                encrypt_data_with_credential(false, alg, &credential, &cipher, &bad_tag),
                Err(Error::IntegrityCheckFailed)
            ));
        }
    }

    #[test]
    fn test_unsupported_hash() {
        assert!(matches!(
            encrypt_data_with_credential(true, TpmAlgId::Sha384, &[0; 16], b"x", &[]),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }
}

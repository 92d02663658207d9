// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Quote signature and endorsement certificate verification

use ::pem::parse_many;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use rustls_pki_types::{CertificateDer, UnixTime};
use tracing::{debug, warn};
use webpki::EndEntityCert;
use x509_parser::prelude::*;

use tpm2::{TpmAlgId, TpmsAttest};
use tpm_types::RsaKeyInfo;

use crate::attest::{parse_generated_attest, PcrPolicy};
use crate::crypto::{hash, hash_size};
use crate::error::{Error, Result};
use crate::keys::public_key_from_info;

/// tcg-kp-EKCertificate (2.23.133.8.1)
const TCG_KP_EK_CERTIFICATE: &[u8] = &[0x67, 0x81, 0x05, 0x08, 0x01];

/// Check a quote in full and return the parsed attestation.
///
/// The signature is checked with a raw RSA public operation: the quote is
/// accepted when the trailing digest of `s^e mod n` equals the hash of
/// `attest_blob`. The padding in front of it is not inspected.
pub fn check_quote(
    key: &RsaPublicKey,
    alg: TpmAlgId,
    attest_blob: &[u8],
    signature: &[u8],
    quoted_data: &[u8],
    policy: &PcrPolicy,
) -> Result<TpmsAttest> {
    let attest = parse_generated_attest(attest_blob)?;
    policy.check(&attest.quote)?;

    if attest.extra_data != quoted_data {
        return Err(Error::QuoteMismatch("qualifying data differs from the quoted data"));
    }

    let digest = hash(alg, attest_blob)?;
    let s = BigUint::from_bytes_be(signature);
    if &s >= key.n() {
        return Err(Error::QuoteMismatch("signature is not smaller than the modulus"));
    }
    let decrypted = s.modpow(key.e(), key.n()).to_bytes_be();
    let size = hash_size(alg)?;
    if decrypted.len() < size {
        return Err(Error::QuoteMismatch("signature block is shorter than the digest"));
    }
    if decrypted[decrypted.len() - size..] != digest[..] {
        return Err(Error::QuoteMismatch("signed digest differs from the attestation"));
    }

    debug!(
        "quote verified, clock {} firmware 0x{:x}",
        attest.clock_info.clock, attest.firmware_version
    );
    Ok(attest)
}

/// Verify a quote made by the key described in `key_info` over
/// `quoted_data`, accepting any PCR state.
pub fn verify_quote(
    quoted_data: &[u8],
    key_info: &RsaKeyInfo,
    alg: TpmAlgId,
    attest_blob: &[u8],
    signature: &[u8],
) -> bool {
    verify_quote_with_policy(
        quoted_data,
        key_info,
        alg,
        attest_blob,
        signature,
        &PcrPolicy::AcceptAny,
    )
}

pub fn verify_quote_with_policy(
    quoted_data: &[u8],
    key_info: &RsaKeyInfo,
    alg: TpmAlgId,
    attest_blob: &[u8],
    signature: &[u8],
    policy: &PcrPolicy,
) -> bool {
    let result = public_key_from_info(key_info).and_then(|key| {
        check_quote(&key, alg, attest_blob, signature, quoted_data, policy)
    });
    match result {
        Ok(_) => true,
        Err(err) => {
            warn!("quote rejected: {err}");
            false
        }
    }
}

fn extract_certs_webpki(cert_pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let pem_items =
        parse_many(cert_pem).map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
    Ok(pem_items
        .into_iter()
        .map(|pem| CertificateDer::from(pem.into_contents()))
        .collect())
}

/// Verify that the DER certificate `leaf_der` was issued by the first
/// certificate in `root_pem`, is valid now, and (if it has an extended key
/// usage) is marked as an EK certificate.
pub fn verify_cert_chain(leaf_der: &[u8], root_pem: &str) -> Result<()> {
    let leaf_owned = CertificateDer::from(leaf_der.to_vec());
    let leaf = EndEntityCert::try_from(&leaf_owned)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

    let roots = extract_certs_webpki(root_pem.as_bytes())?;
    let Some(root_der) = roots.first() else {
        return Err(Error::Certificate("no root certificate in PEM".into()));
    };
    if let Ok((_, cert)) = X509Certificate::from_der(root_der.as_ref()) {
        debug!(
            "trust anchor: subject={}, issuer={}",
            cert.subject(),
            cert.issuer()
        );
    }
    let anchor = webpki::anchor_from_trusted_cert(root_der)
        .map_err(|e| Error::Certificate(format!("bad trust anchor: {e}")))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| Error::Certificate(format!("failed to get current time: {e}")))?;

    leaf.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        &[anchor],
        &[],
        UnixTime::since_unix_epoch(now),
        webpki::KeyUsage::required_if_present(TCG_KP_EK_CERTIFICATE),
        None,
        None,
    )
    .map_err(|e| Error::Certificate(format!("chain verification failed: {e}")))?;
    debug!("endorsement certificate chains to the trust anchor");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::key_info_from_public;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};
    use tpm2::{
        CommandBuffer, Marshal, TpmSt, TpmlPcrSelection, TpmsClockInfo, TpmsQuoteInfo,
        TPM_GENERATED_VALUE,
    };

    const QUOTED: &[u8] = b"program key parameter hash......";

    fn attest_blob(magic: u32, extra: &[u8]) -> Vec<u8> {
        let attest = TpmsAttest {
            magic,
            attest_type: TpmSt::AttestQuote.to_u16(),
            qualified_signer: vec![0x00, 0x0b, 0x01],
            extra_data: extra.to_vec(),
            clock_info: TpmsClockInfo::default(),
            firmware_version: 0x2000_0001,
            quote: TpmsQuoteInfo {
                pcr_select: TpmlPcrSelection::single(TpmAlgId::Sha1, &[7]),
                pcr_digest: vec![0xab; 32],
            },
        };
        let mut buf = CommandBuffer::new();
        attest.marshal(&mut buf).unwrap();
        buf.into_vec()
    }

    fn sign(key: &RsaPrivateKey, blob: &[u8]) -> Vec<u8> {
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(blob))
            .unwrap()
    }

    fn quote_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    #[test]
    fn test_verify_quote() {
        let key = quote_key();
        let info = key_info_from_public(&key.to_public_key());
        let blob = attest_blob(TPM_GENERATED_VALUE, QUOTED);
        let sig = sign(&key, &blob);

        assert!(verify_quote(QUOTED, &info, TpmAlgId::Sha256, &blob, &sig));
        // wrong hash algorithm for the signature
        assert!(!verify_quote(QUOTED, &info, TpmAlgId::Sha1, &blob, &sig));
        // other quoted data
        assert!(!verify_quote(b"other", &info, TpmAlgId::Sha256, &blob, &sig));
    }

    #[test]
    fn test_altered_modulus_rejected() {
        let key = quote_key();
        let blob = attest_blob(TPM_GENERATED_VALUE, QUOTED);
        let sig = sign(&key, &blob);

        let mut info = key_info_from_public(&key.to_public_key());
        let last = info.modulus.len() - 1;
        info.modulus[last] ^= 0x02;
        assert!(!verify_quote(QUOTED, &info, TpmAlgId::Sha256, &blob, &sig));
    }

    #[test]
    fn test_altered_magic_rejected() {
        let key = quote_key();
        let blob = attest_blob(0xff544348, QUOTED);
        let sig = sign(&key, &blob);
        let public = key.to_public_key();

        assert!(matches!(
            check_quote(&public, TpmAlgId::Sha256, &blob, &sig, QUOTED, &PcrPolicy::AcceptAny),
            Err(Error::MagicMismatch(0xff544348))
        ));
        assert!(!verify_quote(
            QUOTED,
            &key_info_from_public(&public),
            TpmAlgId::Sha256,
            &blob,
            &sig
        ));
    }

    #[test]
    fn test_tampered_attest_rejected() {
        let key = quote_key();
        let public = key.to_public_key();
        let blob = attest_blob(TPM_GENERATED_VALUE, QUOTED);
        let sig = sign(&key, &blob);

        let mut tampered = blob.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(matches!(
            check_quote(&public, TpmAlgId::Sha256, &tampered, &sig, QUOTED, &PcrPolicy::AcceptAny),
            Err(Error::QuoteMismatch(_))
        ));

        let mut bad_sig = sig.clone();
        bad_sig[5] ^= 0x10;
        assert!(matches!(
            check_quote(&public, TpmAlgId::Sha256, &blob, &bad_sig, QUOTED, &PcrPolicy::AcceptAny),
            Err(Error::QuoteMismatch(_))
        ));
    }

    #[test]
    fn test_pcr_policy_applied() {
        let key = quote_key();
        let info = key_info_from_public(&key.to_public_key());
        let blob = attest_blob(TPM_GENERATED_VALUE, QUOTED);
        let sig = sign(&key, &blob);

        let matching = PcrPolicy::Expect {
            selection: TpmlPcrSelection::single(TpmAlgId::Sha1, &[7]),
            digest: vec![0xab; 32],
        };
        assert!(verify_quote_with_policy(
            QUOTED,
            &info,
            TpmAlgId::Sha256,
            &blob,
            &sig,
            &matching
        ));

        let other = PcrPolicy::Expect {
            selection: TpmlPcrSelection::single(TpmAlgId::Sha1, &[7]),
            digest: vec![0xac; 32],
        };
        assert!(!verify_quote_with_policy(
            QUOTED,
            &info,
            TpmAlgId::Sha256,
            &blob,
            &sig,
            &other
        ));
    }

    mod chain {
        use super::*;
        use rcgen::{
            BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
            PKCS_ECDSA_P256_SHA256,
        };

        const TCG_EK_OID: &[u64] = &[2, 23, 133, 8, 1];

        fn make_root() -> (rcgen::Certificate, KeyPair) {
            let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
            let mut params = CertificateParams::default();
            params
                .distinguished_name
                .push(DnType::OrganizationName, "PolicyAuthority");
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            (params.self_signed(&key).unwrap(), key)
        }

        fn leaf(
            issuer: &rcgen::Certificate,
            issuer_key: &KeyPair,
            eku: Vec<ExtendedKeyUsagePurpose>,
        ) -> Vec<u8> {
            let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
            let mut params = CertificateParams::default();
            params.distinguished_name.push(DnType::CommonName, "ek");
            params.extended_key_usages = eku;
            params
                .signed_by(&key, issuer, issuer_key)
                .unwrap()
                .der()
                .to_vec()
        }

        #[test]
        fn test_ek_cert_chains_to_root() {
            let _ = tracing_subscriber::fmt::try_init();
            let (root, root_key) = make_root();
            let ek = leaf(
                &root,
                &root_key,
                vec![ExtendedKeyUsagePurpose::Other(TCG_EK_OID.to_vec())],
            );
            verify_cert_chain(&ek, &root.pem()).unwrap();

            // no EKU at all is also acceptable
            let plain = leaf(&root, &root_key, vec![]);
            verify_cert_chain(&plain, &root.pem()).unwrap();
        }

        #[test]
        fn test_foreign_root_rejected() {
            let (root, root_key) = make_root();
            let (other_root, _) = make_root();
            let ek = leaf(
                &root,
                &root_key,
                vec![ExtendedKeyUsagePurpose::Other(TCG_EK_OID.to_vec())],
            );
            assert!(matches!(
                verify_cert_chain(&ek, &other_root.pem()),
                Err(Error::Certificate(_))
            ));
            assert!(matches!(
                verify_cert_chain(&ek, "not a pem"),
                Err(Error::Certificate(_))
            ));
        }

        #[test]
        fn test_wrong_usage_rejected() {
            let (root, root_key) = make_root();
            let tls = leaf(&root, &root_key, vec![ExtendedKeyUsagePurpose::ServerAuth]);
            assert!(matches!(
                verify_cert_chain(&tls, &root.pem()),
                Err(Error::Certificate(_))
            ));
        }
    }
}

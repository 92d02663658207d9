// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! The policy authority: a certificate and private key that issues program
//! certificates and, for test deployments, endorsement certificates.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use fs_err as fs;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SignatureAlgorithm, SubjectPublicKeyInfo,
};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::debug;

use tpm_types::{ProgramKeyParameters, SigningInstructions};

/// tcg-kp-EKCertificate
const TCG_KP_EK_CERTIFICATE: &[u64] = &[2, 23, 133, 8, 1];

/// 9999-12-31T23:59:59Z, the last instant an X.509 validity can express
const MAX_NOT_AFTER_SECS: u64 = 253_402_300_799;

/// Policy key size when one is generated with the RSA algorithm
const POLICY_RSA_BITS: usize = 2048;

/// A policy certificate and its private key.
pub struct PolicyAuthority {
    /// The original PEM certificate, used as the trust anchor.
    pub pem_cert: String,
    cert: Certificate,
    key: KeyPair,
}

impl PolicyAuthority {
    /// Instantiate from a PEM certificate and PEM (PKCS#8) private key.
    pub fn new(pem_cert: String, pem_key: String) -> Result<Self> {
        let key = KeyPair::from_pem(&pem_key).context("Failed to parse policy key")?;
        let params = CertificateParams::from_ca_cert_pem(&pem_cert)
            .context("Failed to parse policy cert")?;
        let cert = params
            .self_signed(&key)
            .context("Failed to rebuild policy cert")?;
        Ok(Self {
            pem_cert,
            cert,
            key,
        })
    }

    pub fn from_parts(key: KeyPair, cert: Certificate) -> Self {
        Self {
            pem_cert: cert.pem(),
            cert,
            key,
        }
    }

    /// Load the policy certificate and key from PEM files.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let pem_key = fs::read_to_string(key_path).context("Failed to read policy key file")?;
        let pem_cert = fs::read_to_string(cert_path).context("Failed to read policy cert file")?;
        Self::new(pem_cert, pem_key)
    }

    pub fn cert_pem(&self) -> &str {
        &self.pem_cert
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Check that `ek_cert_der` was issued by this authority.
    pub fn verify_endorsement_cert(&self, ek_cert_der: &[u8]) -> tpm_qvl::Result<()> {
        tpm_qvl::verify_cert_chain(ek_cert_der, &self.pem_cert)
    }

    /// Issue a certificate (DER) for a program key.
    pub fn issue_program_cert(
        &self,
        instructions: &SigningInstructions,
        program_key: &ProgramKeyParameters,
    ) -> Result<Vec<u8>> {
        let public = tpm_qvl::public_key_from_info(&program_key.key)
            .context("Invalid program key")?;
        let spki = spki_of(&public)?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::OrganizationName, instructions.issuer.as_str());
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, instructions.purpose.as_str());
        params
            .distinguished_name
            .push(DnType::CommonName, program_key.program_name.as_str());
        set_validity(&mut params, instructions.duration_secs)?;

        if instructions.can_sign {
            params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        }
        params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        if instructions.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        }

        let cert = params
            .signed_by(&spki, &self.cert, &self.key)
            .context("Failed to sign program certificate")?;
        debug!(
            "issued certificate for program {:?}, valid {}s",
            program_key.program_name, instructions.duration_secs
        );
        Ok(cert.der().to_vec())
    }

    /// Issue an endorsement certificate (DER) for an EK public key.
    pub fn issue_endorsement_cert(&self, ek_public: &RsaPublicKey, subject: &str) -> Result<Vec<u8>> {
        let spki = spki_of(ek_public)?;
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, subject);
        params.key_usages = vec![KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::Other(
            TCG_KP_EK_CERTIFICATE.to_vec(),
        )];
        set_validity(&mut params, 10 * 365 * 24 * 60 * 60)?;
        let cert = params
            .signed_by(&spki, &self.cert, &self.key)
            .context("Failed to sign endorsement certificate")?;
        Ok(cert.der().to_vec())
    }
}

fn set_validity(params: &mut CertificateParams, duration_secs: u64) -> Result<()> {
    let now = SystemTime::now();
    let latest = UNIX_EPOCH + Duration::from_secs(MAX_NOT_AFTER_SECS);
    let not_after = now
        .checked_add(Duration::from_secs(duration_secs))
        .filter(|t| *t <= latest)
        .with_context(|| format!("validity of {duration_secs}s is out of range"))?;
    params.not_before = now.into();
    params.not_after = not_after.into();
    Ok(())
}

fn spki_of(key: &RsaPublicKey) -> Result<SubjectPublicKeyInfo> {
    let der = key
        .to_public_key_der()
        .context("Failed to encode public key")?;
    SubjectPublicKeyInfo::from_der(der.as_bytes()).context("Failed to parse public key")
}

fn signature_algorithm(sign_alg: &str, hash_alg: &str) -> Result<&'static SignatureAlgorithm> {
    let alg = match (sign_alg, hash_alg) {
        ("rsa", "sha256") => &rcgen::PKCS_RSA_SHA256,
        ("rsa", "sha384") => &rcgen::PKCS_RSA_SHA384,
        ("rsa", "sha512") => &rcgen::PKCS_RSA_SHA512,
        ("ecdsa", "sha256") => &rcgen::PKCS_ECDSA_P256_SHA256,
        ("ecdsa", "sha384") => &rcgen::PKCS_ECDSA_P384_SHA384,
        _ => bail!("unsupported policy key algorithm {sign_alg}/{hash_alg}"),
    };
    Ok(alg)
}

fn generate_key_pair(sign_alg: &str, hash_alg: &str) -> Result<KeyPair> {
    let alg = signature_algorithm(sign_alg, hash_alg)?;
    if sign_alg != "rsa" {
        return KeyPair::generate_for(alg).context("Failed to generate policy key");
    }
    // rcgen cannot generate RSA keys itself
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), POLICY_RSA_BITS)
        .context("Failed to generate RSA policy key")?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .context("Failed to encode RSA policy key")?;
    KeyPair::from_pem_and_sign_algo(&pem, alg).context("Failed to load RSA policy key")
}

/// Create a self-signed policy CA with a fresh key of the instructions'
/// algorithm.
pub fn generate_self_signed_policy_cert(
    instructions: &SigningInstructions,
) -> Result<PolicyAuthority> {
    let key = generate_key_pair(&instructions.sign_alg, &instructions.hash_alg)?;
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, instructions.issuer.as_str());
    params
        .distinguished_name
        .push(DnType::CommonName, "Policy Authority");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, instructions.duration_secs)?;
    let cert = params
        .self_signed(&key)
        .context("Failed to self-sign policy cert")?;
    Ok(PolicyAuthority::from_parts(key, cert))
}

/// Sign an endorsement key with the policy key, standing in for the TPM
/// manufacturer.
pub fn generate_hw_cert(authority: &PolicyAuthority, ek_public: &RsaPublicKey) -> Result<Vec<u8>> {
    authority.issue_endorsement_cert(ek_public, "TPM Endorsement Key")
}

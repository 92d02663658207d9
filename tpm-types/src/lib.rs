// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - messages of the program certificate protocol
//!
//! This crate contains the type definitions shared by both sides:
//! - tpm-attest client (quotes a program key, decodes the certificate)
//! - tpm-attest server (verifies the quote, issues the certificate)
//!
//! All messages derive serde (byte fields are hex in JSON) and SCALE.

use scale::{Decode, Encode};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

/// Request id used by the reference client
pub const DEFAULT_REQUEST_ID: &str = "001";

/// Public half of an RSA key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RsaKeyInfo {
    /// Key type, always "rsa"
    pub key_type: String,

    /// Modulus size in bits
    pub bit_modulus_size: u32,

    /// Public exponent, big-endian
    #[serde(with = "hex_bytes")]
    pub exponent: Vec<u8>,

    /// Modulus, big-endian
    #[serde(with = "hex_bytes")]
    pub modulus: Vec<u8>,
}

impl RsaKeyInfo {
    pub fn rsa(bit_modulus_size: u32, exponent: Vec<u8>, modulus: Vec<u8>) -> Self {
        Self {
            key_type: "rsa".into(),
            bit_modulus_size,
            exponent,
            modulus,
        }
    }
}

/// The program key a certificate is requested for
///
/// Its SCALE encoding is hashed and bound into the quote as qualifying data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ProgramKeyParameters {
    pub program_name: String,
    pub key: RsaKeyInfo,
}

impl ProgramKeyParameters {
    /// Bytes that get hashed into the quote
    pub fn to_scale(&self) -> Vec<u8> {
        self.encode()
    }
}

/// Quote key as seen by the verifier: TPM name plus public RSA material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct QuoteKeyInfo {
    /// TPM object name (nameAlg || H(public area))
    #[serde(with = "hex_bytes")]
    pub name: Vec<u8>,
    /// Marshalled TPMT_PUBLIC the name was computed over
    #[serde(with = "hex_bytes")]
    pub public_area: Vec<u8>,
    pub key: RsaKeyInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct ProgramCertRequest {
    pub request_id: String,

    /// Endorsement key certificate (DER)
    #[serde(with = "hex_bytes")]
    pub endorsement_cert: Vec<u8>,

    pub program_key: ProgramKeyParameters,

    pub quote_key: QuoteKeyInfo,

    /// Quote signature algorithm, e.g. "rsassa"
    pub quote_sig_alg: String,

    /// Hash used for the quote signature and the parameter hash
    pub quote_hash_alg: String,

    /// Marshalled TPMS_ATTEST returned by TPM2_Quote
    #[serde(with = "hex_bytes")]
    pub quoted: Vec<u8>,

    /// Raw RSA signature over `quoted`
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl ProgramCertRequest {
    pub fn from_scale(mut input: &[u8]) -> Result<Self, scale::Error> {
        Self::decode(&mut input)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct ProgramCertResponse {
    pub request_id: String,
    pub program_name: String,

    /// Hash used for the credential HMACs and KDFs
    pub integrity_hash_alg: String,

    /// Credential seed wrapped with the endorsement key
    #[serde(with = "hex_bytes")]
    pub encrypted_secret: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub enc_identity: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub integrity_hmac: Vec<u8>,

    /// Program certificate (DER) encrypted under the credential
    #[serde(with = "hex_bytes")]
    pub encrypted_cert: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub encrypted_cert_hmac: Vec<u8>,
}

impl ProgramCertResponse {
    pub fn from_scale(mut input: &[u8]) -> Result<Self, scale::Error> {
        Self::decode(&mut input)
    }
}

/// What the policy authority puts in an issued certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(default)]
pub struct SigningInstructions {
    /// Issuer organization
    pub issuer: String,
    /// Validity period in seconds, starting now
    pub duration_secs: u64,
    pub purpose: String,
    pub sign_alg: String,
    pub hash_alg: String,
    pub is_ca: bool,
    pub can_sign: bool,
}

impl Default for SigningInstructions {
    fn default() -> Self {
        Self {
            issuer: "PolicyAuthority".into(),
            duration_secs: 365 * 24 * 60 * 60,
            purpose: "signing".into(),
            sign_alg: "rsa".into(),
            hash_alg: "sha256".into(),
            is_ca: false,
            can_sign: true,
        }
    }
}

/// PCR selection specifying which PCRs to include
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PcrSelection {
    /// Hash bank (e.g., "sha1")
    pub bank: String,

    /// List of PCR indices
    pub pcrs: Vec<u32>,
}

impl PcrSelection {
    pub fn new(bank: &str, pcrs: &[u32]) -> Self {
        Self {
            bank: bank.to_string(),
            pcrs: pcrs.to_vec(),
        }
    }

    pub fn sha1(pcrs: &[u32]) -> Self {
        Self::new("sha1", pcrs)
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new("sha256", pcrs)
    }

    /// `bank:1,2,3`
    pub fn to_arg(&self) -> String {
        let pcr_list: Vec<String> = self.pcrs.iter().map(|p| p.to_string()).collect();
        format!("{}:{}", self.bank, pcr_list.join(","))
    }

    /// Parse the `bank:1,2,3` form produced by [`PcrSelection::to_arg`]
    pub fn parse_arg(arg: &str) -> Option<Self> {
        let (bank, list) = arg.split_once(':')?;
        if bank.is_empty() {
            return None;
        }
        let pcrs = if list.is_empty() {
            Vec::new()
        } else {
            list.split(',')
                .map(|p| p.trim().parse().ok())
                .collect::<Option<Vec<u32>>>()?
        };
        Some(Self::new(bank, &pcrs))
    }
}

impl Default for PcrSelection {
    fn default() -> Self {
        Self::sha1(&[7])
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

pub(crate) fn get_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| Error::decode(format!("unknown algorithm 0x{raw:04x}")))
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_tpm2b(&self.buffer)
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 bytes, covering PCR 0-23
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            let byte_idx = (pcr / 8) as usize;
            pcr_select[byte_idx] |= 1 << (pcr % 8);
        }

        Self { hash, pcr_select }
    }

    pub fn sha1(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha1, pcrs)
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected PCR indices in ascending order
    pub fn pcr_indices(&self) -> Vec<u32> {
        let mut indices = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    indices.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        indices
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        let size = u8::try_from(self.pcr_select.len())
            .map_err(|_| Error::InvalidArgument("PCR bitmap longer than 255 bytes".into()))?;
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(size);
        buf.put_bytes(&self.pcr_select);
        Ok(())
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = get_alg(buf)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pcr_selections
            .iter()
            .all(|sel| sel.pcr_select.iter().all(|b| *b == 0))
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf)?;
        }
        Ok(())
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        // TPM implementations cap this at the number of PCR banks
        if count > 16 {
            return Err(Error::decode(format!("PCR selection count {count}")));
        }
        let pcr_selections = (0..count)
            .map(|_| TpmsPcrSelection::unmarshal(buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 8 {
            return Err(Error::decode(format!("digest list count {count}")));
        }
        let digests = (0..count)
            .map(|_| Tpm2bDigest::unmarshal(buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { digests })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
        Ok(())
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = get_alg(buf)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let key_bits = buf.get_u16()?;
        let mode = get_alg(buf)?;
        Ok(Self {
            algorithm,
            key_bits,
            mode,
        })
    }
}

/// TPMT_RSA_SCHEME / TPMT_SIG_SCHEME - scheme plus hash unless NULL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

pub type TpmtRsaScheme = TpmtScheme;
pub type TpmtSigScheme = TpmtScheme;

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn rsassa(hash: TpmAlgId) -> Self {
        Self {
            scheme: TpmAlgId::RsaSsa,
            hash_alg: Some(hash),
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
        Ok(())
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        let hash_alg = match scheme {
            TpmAlgId::Null => None,
            _ => Some(get_alg(buf)?),
        };
        Ok(Self { scheme, hash_alg })
    }
}

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtRsaScheme::null(),
            key_bits: 2048,
            exponent: 0, // Default exponent (65537)
        }
    }

    pub fn signing_key(hash: TpmAlgId) -> Self {
        Self {
            symmetric: TpmtSymDef::null(),
            scheme: TpmtRsaScheme::rsassa(hash),
            key_bits: 2048,
            exponent: 0,
        }
    }
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        self.symmetric.marshal(buf)?;
        self.scheme.marshal(buf)?;
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
        Ok(())
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtRsaScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_KEYEDHASH_PARMS - Keyed hash parameters (for sealed data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmtScheme,
}

impl TpmsKeyedHashParms {
    pub fn null() -> Self {
        Self {
            scheme: TpmtScheme::null(),
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        self.scheme.marshal(buf)
    }
}

impl Unmarshal for TpmsKeyedHashParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = TpmtScheme::unmarshal(buf)?;
        if !matches!(scheme.scheme, TpmAlgId::Null | TpmAlgId::Hmac) {
            return Err(Error::decode(format!(
                "unsupported keyed-hash scheme {}",
                scheme.scheme.name()
            )));
        }
        Ok(Self { scheme })
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    KeyedHash(TpmsKeyedHashParms),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        match self {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.marshal(buf),
        }
    }
}

/// TPMT_PUBLIC - Public area template
///
/// `unique` holds the RSA modulus for RSA keys and the unique digest for
/// keyed-hash objects; both are marshalled as a single TPM2B.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: Vec<u8>,
}

impl TpmtPublic {
    /// RSA storage key (SRK style parent)
    pub fn rsa_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::storage_key()),
            unique: Vec::new(),
        }
    }

    /// Restricted RSASSA signing key, used to quote PCRs
    pub fn rsa_quote_key(hash: TpmAlgId) -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: hash,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_sign_encrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms::signing_key(hash)),
            unique: Vec::new(),
        }
    }

    /// RSA-2048 restricted decrypt key for the endorsement hierarchy
    ///
    /// This is the storage template with a zeroed 256-byte unique, so the key
    /// stays usable with a password session. It is not the TCG default EK
    /// template, which carries a PolicySecret authPolicy and clears
    /// userWithAuth; provisioned EKs at 0x81010001 normally use that one.
    pub fn rsa_endorsement_key() -> Self {
        Self {
            unique: vec![0u8; 256],
            ..Self::rsa_storage_key()
        }
    }

    /// Sealed data object template
    pub fn sealed_object(policy_digest: Tpm2bDigest, name_alg: TpmAlgId) -> Self {
        // Policy-bound objects are not usable with a plain password
        let object_attributes = if policy_digest.buffer.is_empty() {
            TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_user_with_auth()
        } else {
            TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_admin_with_policy()
        };

        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg,
            object_attributes,
            auth_policy: policy_digest,
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::null()),
            unique: Vec::new(),
        }
    }

    pub fn rsa_parms(&self) -> Option<&TpmsRsaParms> {
        match &self.parameters {
            TpmtPublicParms::Rsa(p) => Some(p),
            TpmtPublicParms::KeyedHash(_) => None,
        }
    }

    /// Public exponent with the TPM's zero-means-65537 convention applied
    pub fn rsa_exponent(&self) -> Option<u32> {
        self.rsa_parms().map(|p| match p.exponent {
            0 => 65537,
            e => e,
        })
    }

    /// Hash used by the key's signing scheme, falling back to the name algorithm
    pub fn signing_hash(&self) -> TpmAlgId {
        self.rsa_parms()
            .and_then(|p| p.scheme.hash_alg)
            .unwrap_or(self.name_alg)
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf)?;
        self.parameters.marshal(buf)?;
        buf.put_tpm2b(&self.unique)
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = get_alg(buf)?;
        let name_alg = get_alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let parameters = match type_alg {
            TpmAlgId::Rsa => TpmtPublicParms::Rsa(TpmsRsaParms::unmarshal(buf)?),
            TpmAlgId::KeyedHash => TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::unmarshal(buf)?),
            other => {
                return Err(Error::decode(format!(
                    "unsupported public area type {}",
                    other.name()
                )))
            }
        };
        let unique = buf.get_tpm2b()?;
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>, // Raw marshalled TPMT_PUBLIC
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Result<Self> {
        Ok(Self {
            public_area: template.to_bytes()?,
        })
    }

    /// Decode the wrapped TPMT_PUBLIC
    pub fn decode(&self) -> Result<TpmtPublic> {
        let mut buf = ResponseBuffer::new(&self.public_area);
        let public = TpmtPublic::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(public)
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_tpm2b(&self.public_area)
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let public_area = buf.get_tpm2b()?;
        Ok(Self { public_area })
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

impl Tpm2bSensitiveCreate {
    pub fn new(user_auth: Vec<u8>, data: Vec<u8>) -> Self {
        Self { user_auth, data }
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        let mut inner = CommandBuffer::new();
        inner.put_tpm2b(&self.user_auth)?;
        inner.put_tpm2b(&self.data)?;
        buf.put_tpm2b(inner.as_bytes())
    }
}

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmsClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

impl Marshal for TpmsClockInfo {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u64(self.clock);
        buf.put_u32(self.reset_count);
        buf.put_u32(self.restart_count);
        buf.put_u8(u8::from(self.safe));
        Ok(())
    }
}

impl Unmarshal for TpmsClockInfo {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            clock: buf.get_u64()?,
            reset_count: buf.get_u32()?,
            restart_count: buf.get_u32()?,
            safe: buf.get_bool()?,
        })
    }
}

/// TPMS_TIME_INFO - returned by ReadClock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmsTimeInfo {
    /// Milliseconds since the last TPM reset
    pub time: u64,
    pub clock_info: TpmsClockInfo,
}

impl Unmarshal for TpmsTimeInfo {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            time: buf.get_u64()?,
            clock_info: TpmsClockInfo::unmarshal(buf)?,
        })
    }
}

/// TPMS_QUOTE_INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsQuoteInfo {
    pub pcr_select: TpmlPcrSelection,
    pub pcr_digest: Vec<u8>,
}

/// TPMS_ATTEST - the structure signed by Quote.
///
/// Only the quote variant of the attested union is supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAttest {
    pub magic: u32,
    pub attest_type: u16,
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: TpmsClockInfo,
    pub firmware_version: u64,
    pub quote: TpmsQuoteInfo,
}

impl Marshal for TpmsAttest {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.magic);
        buf.put_u16(self.attest_type);
        buf.put_tpm2b(&self.qualified_signer)?;
        buf.put_tpm2b(&self.extra_data)?;
        self.clock_info.marshal(buf)?;
        buf.put_u64(self.firmware_version);
        self.quote.pcr_select.marshal(buf)?;
        buf.put_tpm2b(&self.quote.pcr_digest)
    }
}

impl Unmarshal for TpmsAttest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let magic = buf.get_u32()?;
        let attest_type = buf.get_u16()?;
        let qualified_signer = buf.get_tpm2b()?;
        let extra_data = buf.get_tpm2b()?;
        let clock_info = TpmsClockInfo::unmarshal(buf)?;
        let firmware_version = buf.get_u64()?;
        if attest_type != TpmSt::AttestQuote.to_u16() {
            return Err(Error::decode(format!(
                "unsupported attest type 0x{attest_type:04x}"
            )));
        }
        let pcr_select = TpmlPcrSelection::unmarshal(buf)?;
        let pcr_digest = buf.get_tpm2b()?;
        Ok(Self {
            magic,
            attest_type,
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            quote: TpmsQuoteInfo {
                pcr_select,
                pcr_digest,
            },
        })
    }
}

/// TPMT_SIGNATURE for the RSA schemes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtSignature {
    pub sig_alg: TpmAlgId,
    pub hash_alg: TpmAlgId,
    pub signature: Vec<u8>,
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u16(self.sig_alg.to_u16());
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_tpm2b(&self.signature)
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sig_alg = get_alg(buf)?;
        if !matches!(sig_alg, TpmAlgId::RsaSsa | TpmAlgId::RsaPss) {
            return Err(Error::decode(format!(
                "unsupported signature algorithm {}",
                sig_alg.name()
            )));
        }
        Ok(Self {
            sig_alg,
            hash_alg: get_alg(buf)?,
            signature: buf.get_tpm2b()?,
        })
    }
}

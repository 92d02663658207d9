// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management

use std::io::{Read, Write};

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::commands::*;
use crate::constants::*;
use crate::device::TpmDevice;
use crate::error::{Error, Result};
use crate::types::*;

const ZERO_NONCE: [u8; 16] = [0u8; 16];

/// Authorization session handle
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    pub nonce_tpm: Vec<u8>,
}

impl AuthSession {
    /// Start an unbound, unsalted session
    pub fn start<S: Read + Write>(
        device: &mut TpmDevice<S>,
        session_type: TpmSe,
        hash_alg: TpmAlgId,
    ) -> Result<Self> {
        let cmd = construct_start_auth_session(
            tpm_rh::NULL,
            tpm_rh::NULL,
            &ZERO_NONCE,
            &[],
            session_type,
            &TpmtSymDef::aes_128_cfb(),
            hash_alg,
        )?;
        let out = decode_start_auth_session(&device.call(&cmd)?)?;
        debug!("started {session_type:?} session 0x{:08x}", out.handle);
        Ok(Self {
            handle: out.handle,
            session_type,
            hash_alg,
            nonce_tpm: out.nonce,
        })
    }

    pub fn start_policy<S: Read + Write>(
        device: &mut TpmDevice<S>,
        hash_alg: TpmAlgId,
    ) -> Result<Self> {
        Self::start(device, TpmSe::Policy, hash_alg)
    }

    /// Start a trial policy session (for computing policy digest)
    pub fn start_trial<S: Read + Write>(
        device: &mut TpmDevice<S>,
        hash_alg: TpmAlgId,
    ) -> Result<Self> {
        Self::start(device, TpmSe::Trial, hash_alg)
    }

    pub fn policy_pcr<S: Read + Write>(
        &self,
        device: &mut TpmDevice<S>,
        pcr_digest: &[u8],
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<()> {
        let cmd = construct_policy_pcr(self.handle, pcr_digest, pcr_selection)?;
        decode_policy_pcr(&device.call(&cmd)?)
    }

    /// Require the object's password on top of the policy
    pub fn policy_password<S: Read + Write>(&self, device: &mut TpmDevice<S>) -> Result<()> {
        let cmd = construct_policy_password(self.handle)?;
        decode_policy_password(&device.call(&cmd)?)
    }

    /// Get the current policy digest
    pub fn get_digest<S: Read + Write>(&self, device: &mut TpmDevice<S>) -> Result<Vec<u8>> {
        let cmd = construct_policy_get_digest(self.handle)?;
        decode_policy_get_digest(&device.call(&cmd)?)
    }

    /// Flush (close) this session
    pub fn flush<S: Read + Write>(self, device: &mut TpmDevice<S>) -> Result<()> {
        let cmd = construct_flush_context(self.handle)?;
        decode_flush_context(&device.call(&cmd)?)
    }
}

/// Hash the concatenated PCR values, as PolicyPCR expects
pub fn compute_pcr_digest(pcr_values: &[Vec<u8>], hash_alg: TpmAlgId) -> Result<Vec<u8>> {
    fn digest_all<D: Digest>(values: &[Vec<u8>]) -> Vec<u8> {
        let mut hasher = D::new();
        for value in values {
            hasher.update(value);
        }
        hasher.finalize().to_vec()
    }

    let digest = match hash_alg {
        TpmAlgId::Sha1 => digest_all::<Sha1>(pcr_values),
        TpmAlgId::Sha256 => digest_all::<Sha256>(pcr_values),
        TpmAlgId::Sha384 => digest_all::<Sha384>(pcr_values),
        TpmAlgId::Sha512 => digest_all::<Sha512>(pcr_values),
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported hash algorithm {} for PCR digest",
                other.name()
            )))
        }
    };
    Ok(digest)
}

/// Read the selected PCRs and hash them
pub fn read_pcr_digest<S: Read + Write>(
    device: &mut TpmDevice<S>,
    pcr_selection: &TpmlPcrSelection,
    hash_alg: TpmAlgId,
) -> Result<Vec<u8>> {
    let cmd = construct_read_pcrs(pcr_selection)?;
    let out = decode_read_pcrs(&device.call(&cmd)?)?;
    compute_pcr_digest(&out.digests, hash_alg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_digest_concatenates() {
        let values = vec![vec![0u8; 32], vec![1u8; 32]];
        let mut joined = vec![0u8; 32];
        joined.extend_from_slice(&[1u8; 32]);
        assert_eq!(
            compute_pcr_digest(&values, TpmAlgId::Sha256).unwrap(),
            Sha256::digest(&joined).to_vec()
        );
        assert_eq!(
            compute_pcr_digest(&values, TpmAlgId::Sha1).unwrap().len(),
            20
        );
    }

    #[test]
    fn test_pcr_digest_rejects_non_hash() {
        assert!(matches!(
            compute_pcr_digest(&[], TpmAlgId::Rsa),
            Err(Error::InvalidArgument(_))
        ));
    }
}

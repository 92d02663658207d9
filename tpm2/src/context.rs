// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! High-level TPM operations
//!
//! [`TpmContext`] pairs each construct/decode function with a device round
//! trip and adds the multi-command flows: key hierarchy creation, sealing
//! under a PCR policy and handle housekeeping.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::commands::*;
use crate::constants::*;
use crate::device::{DeviceStream, TpmDevice};
use crate::session::{read_pcr_digest, AuthSession};
use crate::types::*;

/// Largest GetRandom request most TPMs honour in full
const MAX_RANDOM_CHUNK: usize = 48;

/// Handles asked for per GetCapability round trip
const HANDLES_PER_QUERY: u32 = 64;

/// A storage primary and a quote key loaded beneath it
#[derive(Debug, Clone)]
pub struct KeyHierarchy {
    pub primary_handle: u32,
    pub quote_handle: u32,
    /// Marshalled TPMT_PUBLIC of the quote key
    pub quote_public: Vec<u8>,
    pub quote_private: Vec<u8>,
    pub quote_name: Vec<u8>,
    pub saved_primary: Option<Vec<u8>>,
    pub saved_quote: Option<Vec<u8>>,
}

/// Password-authorized endorsement primary, see [`TpmtPublic::rsa_endorsement_key`]
#[derive(Debug, Clone)]
pub struct EndorsementKey {
    pub handle: u32,
    pub public: Vec<u8>,
    pub modulus: Vec<u8>,
    pub exponent: u32,
}

/// Passwords used when building a key hierarchy, hex encoded
#[derive(Debug, Clone, Default)]
pub struct HierarchyAuth {
    pub owner: String,
    pub primary: String,
    pub quote_key: String,
}

/// Pure Rust TPM context
pub struct TpmContext<S = DeviceStream> {
    device: TpmDevice<S>,
}

impl TpmContext<DeviceStream> {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { device })
    }
}

impl<S: Read + Write> TpmContext<S> {
    pub fn from_device(device: TpmDevice<S>) -> Self {
        Self { device }
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.device.path()
    }

    pub fn device_mut(&mut self) -> &mut TpmDevice<S> {
        &mut self.device
    }

    pub fn into_device(self) -> TpmDevice<S> {
        self.device
    }

    fn call(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        Ok(self.device.call(command)?)
    }

    // ==================== Random / Clock ====================

    /// Generate random bytes using the TPM's hardware RNG
    pub fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);

        // TPM may return fewer bytes than requested, so loop
        while result.len() < num_bytes {
            let request_size = (num_bytes - result.len()).min(MAX_RANDOM_CHUNK) as u16;
            let response = self.call(&construct_get_random(request_size)?)?;
            let random_bytes = decode_get_random(&response).context("GetRandom failed")?;
            if random_bytes.is_empty() {
                bail!("TPM returned no random bytes");
            }
            result.extend_from_slice(&random_bytes);
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    pub fn read_clock(&mut self) -> Result<TpmsTimeInfo> {
        let response = self.call(&construct_read_clock()?)?;
        Ok(decode_read_clock(&response)?)
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection, keyed by PCR index
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let response = self.call(&construct_read_pcrs(pcr_selection)?)?;
        let out = decode_read_pcrs(&response).context("PCR_Read failed")?;

        let indices = out
            .selection
            .pcr_selections
            .iter()
            .flat_map(|sel| sel.pcr_indices());
        Ok(indices.zip(out.digests).collect())
    }

    pub fn pcr_event(&mut self, pcr: u32, event_data: &[u8]) -> Result<()> {
        let response = self.call(&construct_pcr_event(pcr, event_data)?)?;
        decode_pcr_event(&response).with_context(|| format!("PCR_Event failed for PCR {pcr}"))?;
        debug!("extended PCR {pcr} with {} bytes of event data", event_data.len());
        Ok(())
    }

    // ==================== Handle Management ====================

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let response = self.call(&construct_flush_context(handle)?)?;
        decode_flush_context(&response)
            .with_context(|| format!("FlushContext failed for 0x{handle:08x}"))?;
        Ok(())
    }

    /// List loaded handles of the given type
    pub fn list_handles(&mut self, handle_type: TpmHt) -> Result<Vec<u32>> {
        let mut handles = Vec::new();
        let mut next = handle_type.first_handle();
        loop {
            let cmd = construct_get_capabilities(TpmCap::Handles, HANDLES_PER_QUERY, next)?;
            let list = decode_get_capabilities(&self.call(&cmd)?)
                .context("GetCapability failed")?;
            let in_range = list
                .handles
                .into_iter()
                .filter(|h| TpmHt::of(*h) == Some(handle_type));
            handles.extend(in_range);
            match handles.last() {
                Some(last) if list.more_data => next = last + 1,
                _ => break,
            }
        }
        Ok(handles)
    }

    /// Flush every transient object, returning how many were flushed
    pub fn flush_all(&mut self) -> Result<usize> {
        let handles = self.list_handles(TpmHt::Transient)?;
        for handle in &handles {
            self.flush_context(*handle)?;
        }
        debug!("flushed {} transient handles", handles.len());
        Ok(handles.len())
    }

    pub fn save_context(&mut self, handle: u32) -> Result<Vec<u8>> {
        let response = self.call(&construct_save_context(handle)?)?;
        Ok(decode_save_context(&response).context("ContextSave failed")?)
    }

    pub fn load_context(&mut self, saved: &[u8]) -> Result<u32> {
        let response = self.call(&construct_load_context(saved)?)?;
        Ok(decode_load_context(&response).context("ContextLoad failed")?)
    }

    /// Make a key persistent at a given handle
    pub fn evict_control(
        &mut self,
        object_handle: u32,
        persistent_handle: u32,
        owner_password: &str,
    ) -> Result<()> {
        let cmd = construct_evict_control(
            tpm_rh::OWNER,
            object_handle,
            persistent_handle,
            owner_password,
        )?;
        decode_evict_control(&self.call(&cmd)?).context("EvictControl failed")?;
        debug!("made key persistent at 0x{persistent_handle:08x}");
        Ok(())
    }

    // ==================== Keys ====================

    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_password: &str,
        object_password: &str,
        template: &TpmtPublic,
    ) -> Result<CreatePrimaryOutput> {
        let cmd = construct_create_primary(
            hierarchy,
            &TpmlPcrSelection::default(),
            hierarchy_password,
            object_password,
            template,
        )?;
        let out = decode_create_primary(&self.call(&cmd)?).context("CreatePrimary failed")?;
        debug!("created primary key with handle 0x{:08x}", out.handle);
        Ok(out)
    }

    pub fn create_key(
        &mut self,
        parent: u32,
        parent_password: &str,
        object_password: &str,
        template: &TpmtPublic,
    ) -> Result<CreateOutput> {
        let cmd = construct_create_key(
            parent,
            &TpmlPcrSelection::default(),
            parent_password,
            object_password,
            template,
        )?;
        Ok(decode_create_key(&self.call(&cmd)?).context("Create failed")?)
    }

    pub fn load(
        &mut self,
        parent: u32,
        parent_password: &str,
        public: &[u8],
        private: &[u8],
    ) -> Result<LoadOutput> {
        let cmd = construct_load(parent, parent_password, public, private)?;
        let out = decode_load(&self.call(&cmd)?).context("Load failed")?;
        debug!("loaded object with handle 0x{:08x}", out.handle);
        Ok(out)
    }

    pub fn read_public(&mut self, handle: u32) -> Result<ReadPublicOutput> {
        let response = self.call(&construct_read_public(handle)?)?;
        Ok(decode_read_public(&response)
            .with_context(|| format!("ReadPublic failed for 0x{handle:08x}"))?)
    }

    /// Create a storage primary under the owner hierarchy and a quote key
    /// beneath it, then load the quote key.
    pub fn create_key_hierarchy(
        &mut self,
        auth: &HierarchyAuth,
        quote_hash: TpmAlgId,
        save_contexts: bool,
    ) -> Result<KeyHierarchy> {
        let primary = self.create_primary(
            tpm_rh::OWNER,
            &auth.owner,
            &auth.primary,
            &TpmtPublic::rsa_storage_key(),
        )?;
        let quote = self.create_key(
            primary.handle,
            &auth.primary,
            &auth.quote_key,
            &TpmtPublic::rsa_quote_key(quote_hash),
        )?;
        let loaded = self.load(primary.handle, &auth.primary, &quote.public, &quote.private)?;

        let (saved_primary, saved_quote) = if save_contexts {
            (
                Some(self.save_context(primary.handle)?),
                Some(self.save_context(loaded.handle)?),
            )
        } else {
            (None, None)
        };

        Ok(KeyHierarchy {
            primary_handle: primary.handle,
            quote_handle: loaded.handle,
            quote_public: quote.public,
            quote_private: quote.private,
            quote_name: loaded.name,
            saved_primary,
            saved_quote,
        })
    }

    /// Create the endorsement primary and return its RSA public parts
    pub fn create_endorsement(&mut self, endorsement_password: &str) -> Result<EndorsementKey> {
        let out = self.create_primary(
            tpm_rh::ENDORSEMENT,
            endorsement_password,
            "",
            &TpmtPublic::rsa_endorsement_key(),
        )?;
        let public = Tpm2bPublic {
            public_area: out.public.clone(),
        }
        .decode()
        .context("endorsement key public area")?;
        let exponent = public
            .rsa_exponent()
            .context("endorsement key is not an RSA key")?;

        Ok(EndorsementKey {
            handle: out.handle,
            modulus: public.unique,
            exponent,
            public: out.public,
        })
    }

    // ==================== Attestation ====================

    pub fn quote(
        &mut self,
        sign_handle: u32,
        password: &str,
        qualifying_data: &[u8],
        pcr_selection: &TpmlPcrSelection,
        hash_alg: TpmAlgId,
    ) -> Result<QuoteOutput> {
        let cmd = construct_quote(
            sign_handle,
            password,
            qualifying_data,
            pcr_selection,
            &TpmtSigScheme::rsassa(hash_alg),
        )?;
        let out = decode_quote(&self.call(&cmd)?).context("Quote failed")?;
        debug!("generated TPM quote over {} bytes", out.attest.len());
        Ok(out)
    }

    pub fn activate_credential(
        &mut self,
        active_handle: u32,
        key_handle: u32,
        active_password: &str,
        key_password: &str,
        credential_blob: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let cmd = construct_activate_credential(
            active_handle,
            key_handle,
            active_password,
            key_password,
            credential_blob,
            secret,
        )?;
        Ok(decode_activate_credential(&self.call(&cmd)?).context("ActivateCredential failed")?)
    }

    pub fn make_credential(
        &mut self,
        protector: u32,
        credential: &[u8],
        name: &[u8],
    ) -> Result<MakeCredentialOutput> {
        let cmd = construct_make_credential(protector, credential, name)?;
        Ok(decode_make_credential(&self.call(&cmd)?).context("MakeCredential failed")?)
    }

    // ==================== Seal/Unseal Operations ====================

    fn policy_digest(
        &mut self,
        pcr_selection: &TpmlPcrSelection,
        with_password: bool,
        hash_alg: TpmAlgId,
    ) -> Result<Vec<u8>> {
        let trial = AuthSession::start_trial(&mut self.device, hash_alg)?;
        let result = apply_policy(&mut self.device, &trial, pcr_selection, with_password)
            .and_then(|_| Ok(trial.get_digest(&mut self.device)?));
        trial.flush(&mut self.device)?;
        result
    }

    /// Seal data under `parent`; returns (public, private)
    ///
    /// A non-empty PCR selection binds the object to the current PCR values.
    pub fn seal(
        &mut self,
        data: &[u8],
        parent: u32,
        parent_password: &str,
        object_password: &str,
        pcr_selection: &TpmlPcrSelection,
        hash_alg: TpmAlgId,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let policy_digest = if pcr_selection.is_empty() {
            vec![]
        } else {
            self.policy_digest(pcr_selection, !object_password.is_empty(), hash_alg)?
        };

        let cmd = construct_create_sealed(
            parent,
            &policy_digest,
            parent_password,
            object_password,
            data,
            &TpmlPcrSelection::default(),
            hash_alg,
        )?;
        let out = decode_create_sealed(&self.call(&cmd)?).context("Create (seal) failed")?;

        debug!("sealed {} bytes", data.len());
        Ok((out.public, out.private))
    }

    /// Load and unseal an object produced by [`TpmContext::seal`]
    #[allow(clippy::too_many_arguments)]
    pub fn unseal(
        &mut self,
        public: &[u8],
        private: &[u8],
        parent: u32,
        parent_password: &str,
        object_password: &str,
        pcr_selection: &TpmlPcrSelection,
        hash_alg: TpmAlgId,
    ) -> Result<Vec<u8>> {
        let object = self.load(parent, parent_password, public, private)?;

        let result = if pcr_selection.is_empty() {
            self.unseal_with(object.handle, object_password, tpm_rh::PW)
        } else {
            let session = AuthSession::start_policy(&mut self.device, hash_alg)?;
            let result = apply_policy(
                &mut self.device,
                &session,
                pcr_selection,
                !object_password.is_empty(),
            )
            .and_then(|_| self.unseal_with(object.handle, object_password, session.handle));
            if let Err(err) = session.flush(&mut self.device) {
                debug!("failed to flush policy session: {err}");
            }
            result
        };

        self.flush_context(object.handle)?;
        let data = result?;
        debug!("unsealed {} bytes", data.len());
        Ok(data)
    }

    fn unseal_with(&mut self, item: u32, password: &str, session: u32) -> Result<Vec<u8>> {
        let response = self.call(&construct_unseal(item, password, session)?)?;
        Ok(decode_unseal(&response).context("Unseal failed")?.data)
    }
}

fn apply_policy<S: Read + Write>(
    device: &mut TpmDevice<S>,
    session: &AuthSession,
    pcr_selection: &TpmlPcrSelection,
    with_password: bool,
) -> Result<()> {
    let pcr_digest = read_pcr_digest(device, pcr_selection, session.hash_alg)?;
    session
        .policy_pcr(device, &pcr_digest, pcr_selection)
        .context("PolicyPCR failed")?;
    if with_password {
        session
            .policy_password(device)
            .context("PolicyPassword failed")?;
    }
    Ok(())
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command construction and response decoding
//!
//! Every operation comes as a pure `construct_*` / `decode_*` pair. Decoders
//! take the raw response including its header, reject short responses and
//! non-success status codes, and either return the whole output or fail.

use crate::auth::AuthArea;
use crate::constants::*;
use crate::device::{TpmCommand, TpmResponse};
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::*;

/// Maximum size of TPM2B_EVENT
pub const MAX_EVENT_DATA: usize = 1024;

fn parse_ok(response: &[u8], command: TpmCc) -> Result<TpmResponse> {
    let response = TpmResponse::parse(response)?;
    response.ensure_success(command)?;
    Ok(response)
}

fn password_auth(password_hex: &str) -> Result<AuthArea> {
    AuthArea::password(password_hex, tpm_rh::PW)
}

// ==================== Random / Clock ====================

pub fn construct_get_random(count: u16) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::GetRandom);
    cmd.add_u16(count);
    cmd.finalize()
}

pub fn decode_get_random(response: &[u8]) -> Result<Vec<u8>> {
    let response = parse_ok(response, TpmCc::GetRandom)?;
    response.data_buffer().get_tpm2b()
}

pub fn construct_read_clock() -> Result<Vec<u8>> {
    TpmCommand::new(TpmCc::ReadClock).finalize()
}

pub fn decode_read_clock(response: &[u8]) -> Result<TpmsTimeInfo> {
    let response = parse_ok(response, TpmCc::ReadClock)?;
    TpmsTimeInfo::unmarshal(&mut response.data_buffer())
}

// ==================== Context Management ====================

pub fn construct_flush_context(handle: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::FlushContext);
    cmd.add_handle(handle);
    cmd.finalize()
}

pub fn decode_flush_context(response: &[u8]) -> Result<()> {
    parse_ok(response, TpmCc::FlushContext).map(|_| ())
}

pub fn construct_save_context(handle: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::ContextSave);
    cmd.add_handle(handle);
    cmd.finalize()
}

/// Returns the marshalled TPMS_CONTEXT, suitable for [`construct_load_context`]
pub fn decode_save_context(response: &[u8]) -> Result<Vec<u8>> {
    let response = parse_ok(response, TpmCc::ContextSave)?;
    if response.data.is_empty() {
        return Err(Error::decode("empty saved context"));
    }
    Ok(response.data)
}

pub fn construct_load_context(saved_context: &[u8]) -> Result<Vec<u8>> {
    if saved_context.is_empty() {
        return Err(Error::InvalidArgument("empty saved context".into()));
    }
    let mut cmd = TpmCommand::new(TpmCc::ContextLoad);
    cmd.add_bytes(saved_context);
    cmd.finalize()
}

pub fn decode_load_context(response: &[u8]) -> Result<u32> {
    let response = parse_ok(response, TpmCc::ContextLoad)?;
    response.data_buffer().get_u32()
}

pub fn construct_evict_control(
    owner: u32,
    object_handle: u32,
    persistent_handle: u32,
    owner_password: &str,
) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::with_sessions(TpmCc::EvictControl);
    cmd.add_handle(owner);
    cmd.add_handle(object_handle);
    cmd.add_auth(&[password_auth(owner_password)?])?;
    cmd.add_handle(persistent_handle);
    cmd.finalize()
}

pub fn decode_evict_control(response: &[u8]) -> Result<()> {
    parse_ok(response, TpmCc::EvictControl).map(|_| ())
}

/// Handles reported by GetCapability(TPM_CAP_HANDLES)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleList {
    pub more_data: bool,
    pub handles: Vec<u32>,
}

pub fn construct_get_capabilities(cap: TpmCap, count: u32, property: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::GetCapability);
    cmd.add_u32(cap.to_u32());
    cmd.add_u32(property);
    cmd.add_u32(count);
    cmd.finalize()
}

pub fn decode_get_capabilities(response: &[u8]) -> Result<HandleList> {
    let response = parse_ok(response, TpmCc::GetCapability)?;
    let mut buf = response.data_buffer();
    let more_data = buf.get_bool()?;
    let cap = buf.get_u32()?;
    if cap != TpmCap::Handles.to_u32() {
        return Err(Error::decode(format!(
            "capability 0x{cap:08x} is not a handle list"
        )));
    }
    let count = buf.get_u32()? as usize;
    if count.saturating_mul(4) > buf.remaining() {
        return Err(Error::ShortBuffer {
            needed: count * 4,
            remaining: buf.remaining(),
        });
    }
    let handles = (0..count)
        .map(|_| buf.get_u32())
        .collect::<Result<Vec<_>>>()?;
    Ok(HandleList { more_data, handles })
}

// ==================== PCR Operations ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrReadOutput {
    pub update_counter: u32,
    pub selection: TpmlPcrSelection,
    /// Bank of the first returned selection
    pub hash_alg: Option<TpmAlgId>,
    pub digests: Vec<Vec<u8>>,
}

pub fn construct_read_pcrs(selection: &TpmlPcrSelection) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::PcrRead);
    cmd.add(selection)?;
    cmd.finalize()
}

pub fn decode_read_pcrs(response: &[u8]) -> Result<PcrReadOutput> {
    let response = parse_ok(response, TpmCc::PcrRead)?;
    let mut buf = response.data_buffer();
    let update_counter = buf.get_u32()?;
    let selection = TpmlPcrSelection::unmarshal(&mut buf)?;
    let digests = TpmlDigest::unmarshal(&mut buf)?;
    Ok(PcrReadOutput {
        update_counter,
        hash_alg: selection.pcr_selections.first().map(|s| s.hash),
        selection,
        digests: digests.digests.into_iter().map(|d| d.buffer).collect(),
    })
}

pub fn construct_pcr_event(pcr: u32, event_data: &[u8]) -> Result<Vec<u8>> {
    if event_data.len() > MAX_EVENT_DATA {
        return Err(Error::InvalidArgument(format!(
            "event data of {} bytes exceeds {MAX_EVENT_DATA}",
            event_data.len()
        )));
    }
    let mut cmd = TpmCommand::with_sessions(TpmCc::PcrEvent);
    cmd.add_handle(pcr);
    cmd.add_auth(&[AuthArea::empty_password()])?;
    cmd.add_tpm2b(event_data)?;
    cmd.finalize()
}

pub fn decode_pcr_event(response: &[u8]) -> Result<()> {
    parse_ok(response, TpmCc::PcrEvent).map(|_| ())
}

// ==================== Object Creation ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePrimaryOutput {
    pub handle: u32,
    pub public: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutput {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

fn add_create_body(
    cmd: &mut TpmCommand,
    parent_password: &str,
    sensitive: &Tpm2bSensitiveCreate,
    template: &TpmtPublic,
    pcr_selection: &TpmlPcrSelection,
) -> Result<()> {
    cmd.add_auth(&[password_auth(parent_password)?])?;
    cmd.add(sensitive)?;
    cmd.add(&Tpm2bPublic::from_template(template)?)?;
    // outsideInfo
    cmd.add_tpm2b_empty();
    cmd.add(pcr_selection)
}

/// `object_password` becomes the new key's userAuth
pub fn construct_create_primary(
    owner: u32,
    pcr_selection: &TpmlPcrSelection,
    owner_password: &str,
    object_password: &str,
    template: &TpmtPublic,
) -> Result<Vec<u8>> {
    let sensitive = Tpm2bSensitiveCreate::new(
        hex::decode(object_password).map_err(Error::BadPassword)?,
        Vec::new(),
    );
    let mut cmd = TpmCommand::with_sessions(TpmCc::CreatePrimary);
    cmd.add_handle(owner);
    add_create_body(&mut cmd, owner_password, &sensitive, template, pcr_selection)?;
    cmd.finalize()
}

pub fn decode_create_primary(response: &[u8]) -> Result<CreatePrimaryOutput> {
    let response = parse_ok(response, TpmCc::CreatePrimary)?;
    // The handle precedes the parameter size
    let mut buf = response.data_buffer();
    let handle = buf.get_u32()?;
    let _param_size = buf.get_u32()?;
    let public = Tpm2bPublic::unmarshal(&mut buf)?;
    Ok(CreatePrimaryOutput {
        handle,
        public: public.public_area,
    })
}

pub fn construct_create_key(
    parent: u32,
    pcr_selection: &TpmlPcrSelection,
    parent_password: &str,
    object_password: &str,
    template: &TpmtPublic,
) -> Result<Vec<u8>> {
    let sensitive = Tpm2bSensitiveCreate::new(
        hex::decode(object_password).map_err(Error::BadPassword)?,
        Vec::new(),
    );
    let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
    cmd.add_handle(parent);
    add_create_body(&mut cmd, parent_password, &sensitive, template, pcr_selection)?;
    cmd.finalize()
}

pub fn decode_create_key(response: &[u8]) -> Result<CreateOutput> {
    decode_create(response)
}

/// Seal `data` under `parent`; a non-empty `policy_digest` binds it to a policy
pub fn construct_create_sealed(
    parent: u32,
    policy_digest: &[u8],
    parent_password: &str,
    object_password: &str,
    data: &[u8],
    pcr_selection: &TpmlPcrSelection,
    hash_alg: TpmAlgId,
) -> Result<Vec<u8>> {
    let sensitive = Tpm2bSensitiveCreate::new(
        hex::decode(object_password).map_err(Error::BadPassword)?,
        data.to_vec(),
    );
    let template = TpmtPublic::sealed_object(Tpm2bDigest::new(policy_digest.to_vec()), hash_alg);
    let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
    cmd.add_handle(parent);
    add_create_body(&mut cmd, parent_password, &sensitive, &template, pcr_selection)?;
    cmd.finalize()
}

pub fn decode_create_sealed(response: &[u8]) -> Result<CreateOutput> {
    decode_create(response)
}

fn decode_create(response: &[u8]) -> Result<CreateOutput> {
    let response = parse_ok(response, TpmCc::Create)?;
    let mut buf = response.skip_parameter_size()?;
    let private = buf.get_tpm2b()?;
    let public = Tpm2bPublic::unmarshal(&mut buf)?;
    Ok(CreateOutput {
        private,
        public: public.public_area,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutput {
    pub handle: u32,
    pub name: Vec<u8>,
}

pub fn construct_load(
    parent: u32,
    parent_password: &str,
    public: &[u8],
    private: &[u8],
) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::with_sessions(TpmCc::Load);
    cmd.add_handle(parent);
    cmd.add_auth(&[password_auth(parent_password)?])?;
    cmd.add_tpm2b(private)?;
    cmd.add_tpm2b(public)?;
    cmd.finalize()
}

pub fn decode_load(response: &[u8]) -> Result<LoadOutput> {
    let response = parse_ok(response, TpmCc::Load)?;
    let mut buf = response.data_buffer();
    let handle = buf.get_u32()?;
    let _param_size = buf.get_u32()?;
    let name = buf.get_tpm2b()?;
    Ok(LoadOutput { handle, name })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPublicOutput {
    pub public: Vec<u8>,
    pub name: Vec<u8>,
    pub qualified_name: Vec<u8>,
}

pub fn construct_read_public(handle: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
    cmd.add_handle(handle);
    cmd.finalize()
}

pub fn decode_read_public(response: &[u8]) -> Result<ReadPublicOutput> {
    let response = parse_ok(response, TpmCc::ReadPublic)?;
    let mut buf = response.data_buffer();
    Ok(ReadPublicOutput {
        public: buf.get_tpm2b()?,
        name: buf.get_tpm2b()?,
        qualified_name: buf.get_tpm2b()?,
    })
}

// ==================== Sessions and Policy ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutput {
    pub handle: u32,
    pub nonce: Vec<u8>,
}

pub fn construct_start_auth_session(
    tpm_key: u32,
    bind: u32,
    nonce_caller: &[u8],
    encrypted_salt: &[u8],
    session_type: TpmSe,
    symmetric: &TpmtSymDef,
    hash_alg: TpmAlgId,
) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
    cmd.add_handle(tpm_key);
    cmd.add_handle(bind);
    cmd.add_tpm2b(nonce_caller)?;
    cmd.add_tpm2b(encrypted_salt)?;
    cmd.add_u8(session_type as u8);
    cmd.add(symmetric)?;
    cmd.add_u16(hash_alg.to_u16());
    cmd.finalize()
}

pub fn decode_start_auth_session(response: &[u8]) -> Result<SessionOutput> {
    let response = parse_ok(response, TpmCc::StartAuthSession)?;
    let mut buf = response.data_buffer();
    Ok(SessionOutput {
        handle: buf.get_u32()?,
        nonce: buf.get_tpm2b()?,
    })
}

pub fn construct_policy_password(session: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::PolicyPassword);
    cmd.add_handle(session);
    cmd.finalize()
}

pub fn decode_policy_password(response: &[u8]) -> Result<()> {
    parse_ok(response, TpmCc::PolicyPassword).map(|_| ())
}

pub fn construct_policy_pcr(
    session: u32,
    expected_digest: &[u8],
    selection: &TpmlPcrSelection,
) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);
    cmd.add_handle(session);
    cmd.add_tpm2b(expected_digest)?;
    cmd.add(selection)?;
    cmd.finalize()
}

pub fn decode_policy_pcr(response: &[u8]) -> Result<()> {
    parse_ok(response, TpmCc::PolicyPcr).map(|_| ())
}

pub fn construct_policy_get_digest(session: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
    cmd.add_handle(session);
    cmd.finalize()
}

pub fn decode_policy_get_digest(response: &[u8]) -> Result<Vec<u8>> {
    let response = parse_ok(response, TpmCc::PolicyGetDigest)?;
    response.data_buffer().get_tpm2b()
}

// ==================== Unseal ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealOutput {
    pub data: Vec<u8>,
    /// HMAC from the response session; empty for password and policy sessions
    pub digest: Vec<u8>,
}

/// `session` is `TPM_RS_PW` for a password, or a satisfied policy session
pub fn construct_unseal(item: u32, password: &str, session: u32) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::with_sessions(TpmCc::Unseal);
    cmd.add_handle(item);
    cmd.add_auth(&[AuthArea::password(password, session)?])?;
    cmd.finalize()
}

pub fn decode_unseal(response: &[u8]) -> Result<UnsealOutput> {
    let response = parse_ok(response, TpmCc::Unseal)?;
    let mut buf = response.skip_parameter_size()?;
    let data = buf.get_tpm2b()?;
    // TPMS_AUTH_RESPONSE: nonce, attributes, hmac
    let digest = if buf.remaining() > 0 {
        let _nonce = buf.get_tpm2b()?;
        let _attributes = buf.get_u8()?;
        buf.get_tpm2b()?
    } else {
        Vec::new()
    };
    Ok(UnsealOutput { data, digest })
}

// ==================== Quote ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteOutput {
    /// Marshalled TPMS_ATTEST, the exact bytes that were signed
    pub attest: Vec<u8>,
    pub signature: TpmtSignature,
}

pub fn construct_quote(
    sign_handle: u32,
    password: &str,
    to_quote: &[u8],
    pcr_selection: &TpmlPcrSelection,
    scheme: &TpmtSigScheme,
) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::with_sessions(TpmCc::Quote);
    cmd.add_handle(sign_handle);
    cmd.add_auth(&[password_auth(password)?])?;
    cmd.add_tpm2b(to_quote)?;
    cmd.add(scheme)?;
    cmd.add(pcr_selection)?;
    cmd.finalize()
}

pub fn decode_quote(response: &[u8]) -> Result<QuoteOutput> {
    let response = parse_ok(response, TpmCc::Quote)?;
    let mut buf = response.skip_parameter_size()?;
    let attest = buf.get_tpm2b()?;
    let signature = TpmtSignature::unmarshal(&mut buf)?;
    Ok(QuoteOutput { attest, signature })
}

// ==================== Credentials ====================

/// `credential_blob` is the TPM2B integrity HMAC followed by encIdentity
pub fn construct_activate_credential(
    active_handle: u32,
    key_handle: u32,
    active_password: &str,
    key_password: &str,
    credential_blob: &[u8],
    secret: &[u8],
) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::with_sessions(TpmCc::ActivateCredential);
    cmd.add_handle(active_handle);
    cmd.add_handle(key_handle);
    cmd.add_auth(&[password_auth(active_password)?, password_auth(key_password)?])?;
    cmd.add_tpm2b(credential_blob)?;
    cmd.add_tpm2b(secret)?;
    cmd.finalize()
}

pub fn decode_activate_credential(response: &[u8]) -> Result<Vec<u8>> {
    let response = parse_ok(response, TpmCc::ActivateCredential)?;
    let mut buf = response.skip_parameter_size()?;
    buf.get_tpm2b()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeCredentialOutput {
    pub credential_blob: Vec<u8>,
    pub secret: Vec<u8>,
}

pub fn construct_make_credential(protector: u32, credential: &[u8], name: &[u8]) -> Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::MakeCredential);
    cmd.add_handle(protector);
    cmd.add_tpm2b(credential)?;
    cmd.add_tpm2b(name)?;
    cmd.finalize()
}

pub fn decode_make_credential(response: &[u8]) -> Result<MakeCredentialOutput> {
    let response = parse_ok(response, TpmCc::MakeCredential)?;
    let mut buf = response.data_buffer();
    Ok(MakeCredentialOutput {
        credential_blob: buf.get_tpm2b()?,
        secret: buf.get_tpm2b()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(tag: TpmSt, rc: u32, body: &[u8]) -> Vec<u8> {
        TpmResponse {
            tag,
            response_code: rc,
            data: body.to_vec(),
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn test_get_random_fixture() {
        let cmd = construct_get_random(16).unwrap();
        assert_eq!(
            cmd,
            vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x7b, 0x00, 0x10]
        );
    }

    #[test]
    fn test_decode_get_random() {
        let raw = response(TpmSt::NoSessions, 0, &[0x00, 0x03, 9, 8, 7]);
        assert_eq!(decode_get_random(&raw).unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn test_decode_rejects_short_response() {
        for raw in [&[][..], &[0x80, 0x01, 0, 0, 0, 10][..]] {
            assert!(matches!(
                decode_get_random(raw),
                Err(Error::ShortResponse(_))
            ));
        }
    }

    #[test]
    fn test_decode_names_failed_operation() {
        let raw = response(TpmSt::NoSessions, 0x18b, &[]);
        let err = decode_read_public(&raw).unwrap_err();
        assert!(matches!(
            err,
            Error::CommandFailed {
                command: TpmCc::ReadPublic,
                code: 0x18b
            }
        ));
        assert!(err.to_string().starts_with("ReadPublic failed"));
    }

    #[test]
    fn test_decode_truncated_body_fails_whole() {
        // name declared as 4 bytes, only 2 present
        let raw = response(TpmSt::NoSessions, 0, &[0x00, 0x00, 0x00, 0x04, 1, 2]);
        assert!(matches!(
            decode_read_public(&raw),
            Err(Error::ShortBuffer { .. })
        ));
    }

    #[test]
    fn test_read_pcrs() {
        let selection = TpmlPcrSelection::single(TpmAlgId::Sha1, &[7]);
        let cmd = construct_read_pcrs(&selection).unwrap();
        assert_eq!(&cmd[10..], &[0, 0, 0, 1, 0x00, 0x04, 3, 0x80, 0, 0]);

        let mut body = CommandBuffer::new();
        body.put_u32(42);
        selection.marshal(&mut body).unwrap();
        body.put_u32(1);
        body.put_tpm2b(&[0xaa; 20]).unwrap();
        let out = decode_read_pcrs(&response(TpmSt::NoSessions, 0, body.as_bytes())).unwrap();
        assert_eq!(out.update_counter, 42);
        assert_eq!(out.selection, selection);
        assert_eq!(out.hash_alg, Some(TpmAlgId::Sha1));
        assert_eq!(out.digests, vec![vec![0xaa; 20]]);
    }

    #[test]
    fn test_read_clock() {
        let mut body = CommandBuffer::new();
        body.put_u64(1000);
        body.put_u64(5000);
        body.put_u32(3);
        body.put_u32(4);
        body.put_u8(1);
        let info = decode_read_clock(&response(TpmSt::NoSessions, 0, body.as_bytes())).unwrap();
        assert_eq!(info.time, 1000);
        assert_eq!(info.clock_info.clock, 5000);
        assert!(info.clock_info.safe);
    }

    #[test]
    fn test_get_capabilities() {
        let cmd = construct_get_capabilities(TpmCap::Handles, 16, 0x80000000).unwrap();
        assert_eq!(&cmd[10..], &[0, 0, 0, 1, 0x80, 0, 0, 0, 0, 0, 0, 16]);

        let body = [
            0, // moreData
            0, 0, 0, 1, // TPM_CAP_HANDLES
            0, 0, 0, 2, // count
            0x80, 0, 0, 0, 0x80, 0, 0, 1,
        ];
        let list = decode_get_capabilities(&response(TpmSt::NoSessions, 0, &body)).unwrap();
        assert_eq!(list.handles, vec![0x80000000, 0x80000001]);
        assert!(!list.more_data);

        let wrong_cap = [0, 0, 0, 0, 6, 0, 0, 0, 0];
        assert!(matches!(
            decode_get_capabilities(&response(TpmSt::NoSessions, 0, &wrong_cap)),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_activate_credential_layout() {
        let cmd =
            construct_activate_credential(0x80000001, 0x80000002, "", "", &[1, 2, 3], &[4, 5])
                .unwrap();
        assert_eq!(&cmd[0..2], &[0x80, 0x02]);
        assert_eq!(&cmd[6..10], &[0x00, 0x00, 0x01, 0x47]);
        assert_eq!(&cmd[10..18], &[0x80, 0, 0, 1, 0x80, 0, 0, 2]);
        // two empty password areas of 9 bytes each
        assert_eq!(&cmd[18..22], &[0, 0, 0, 18]);
        assert_eq!(&cmd[40..], &[0, 3, 1, 2, 3, 0, 2, 4, 5]);
        assert_eq!(cmd.len(), 49);
    }

    #[test]
    fn test_activate_credential_rejects_bad_password() {
        let err = construct_activate_credential(1, 2, "zz", "", &[], &[]).unwrap_err();
        assert!(matches!(err, Error::BadPassword(_)));
    }

    #[test]
    fn test_decode_quote() {
        let mut body = CommandBuffer::new();
        body.put_u32(0); // parameterSize
        body.put_tpm2b(&[0xff, 0x54, 0x43, 0x47]).unwrap();
        TpmtSignature {
            sig_alg: TpmAlgId::RsaSsa,
            hash_alg: TpmAlgId::Sha256,
            signature: vec![7; 8],
        }
        .marshal(&mut body)
        .unwrap();
        // response auth area
        body.put_bytes(&[0, 0, 1, 0, 0]);

        let out = decode_quote(&response(TpmSt::Sessions, 0, body.as_bytes())).unwrap();
        assert_eq!(out.attest, vec![0xff, 0x54, 0x43, 0x47]);
        assert_eq!(out.signature.hash_alg, TpmAlgId::Sha256);
        assert_eq!(out.signature.signature, vec![7; 8]);
    }

    #[test]
    fn test_load_and_create_primary() {
        let load = response(
            TpmSt::Sessions,
            0,
            &[0x80, 0, 0, 5, 0, 0, 0, 6, 0, 4, 0, 0x0b, 1, 2],
        );
        let out = decode_load(&load).unwrap();
        assert_eq!(out.handle, 0x80000005);
        assert_eq!(out.name, vec![0, 0x0b, 1, 2]);

        let template = TpmtPublic::rsa_storage_key();
        let cmd =
            construct_create_primary(tpm_rh::OWNER, &TpmlPcrSelection::default(), "", "01", &template)
                .unwrap();
        // handle, auth size, 9 byte empty password area
        assert_eq!(&cmd[10..18], &[0x40, 0, 0, 1, 0, 0, 0, 9]);
        // inSensitive: size 5, userAuth {0x01}, empty data
        assert_eq!(&cmd[27..34], &[0, 5, 0, 1, 0x01, 0, 0]);
    }

    #[test]
    fn test_unseal_with_policy_session() {
        let cmd = construct_unseal(0x80000003, "", 0x03000000).unwrap();
        assert_eq!(&cmd[14..22], &[0, 0, 0, 9, 0x03, 0, 0, 0]);

        let raw = response(
            TpmSt::Sessions,
            0,
            &[0, 0, 0, 5, 0, 3, b'a', b'b', b'c', 0, 0, 1, 0, 0],
        );
        let out = decode_unseal(&raw).unwrap();
        assert_eq!(out.data, b"abc");
        assert!(out.digest.is_empty());
    }

    #[test]
    fn test_pcr_event_limits() {
        assert!(construct_pcr_event(16, &[0u8; MAX_EVENT_DATA]).is_ok());
        assert!(matches!(
            construct_pcr_event(16, &[0u8; MAX_EVENT_DATA + 1]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_context_round_trip_shapes() {
        let cmd = construct_save_context(0x80000001).unwrap();
        assert_eq!(&cmd[0..2], &[0x80, 0x01]);
        let saved = decode_save_context(&response(TpmSt::NoSessions, 0, &[1, 2, 3])).unwrap();
        let cmd = construct_load_context(&saved).unwrap();
        assert_eq!(&cmd[10..], &[1, 2, 3]);
        assert!(construct_load_context(&[]).is_err());
        let handle =
            decode_load_context(&response(TpmSt::NoSessions, 0, &[0x80, 0, 0, 9])).unwrap();
        assert_eq!(handle, 0x80000009);
    }

    #[test]
    fn test_make_credential() {
        let cmd = construct_make_credential(0x80000001, &[1; 16], &[0, 0x0b]).unwrap();
        let mut expected = vec![0u8, 16];
        expected.extend_from_slice(&[1u8; 16]);
        expected.extend_from_slice(&[0, 2, 0, 0x0b]);
        assert_eq!(&cmd[14..], &expected[..]);
        let out =
            decode_make_credential(&response(TpmSt::NoSessions, 0, &[0, 1, 9, 0, 2, 8, 8]))
                .unwrap();
        assert_eq!(out.credential_blob, vec![9]);
        assert_eq!(out.secret, vec![8, 8]);
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Authority side of the issuance protocol

use rand::RngCore;
use tracing::{info, warn};

use tpm_types::{ProgramCertRequest, ProgramCertResponse, SigningInstructions};

use crate::authority::PolicyAuthority;
use crate::error::IssuanceError;

/// Size of the credential bound to the quote key
pub const CREDENTIAL_SIZE: usize = 16;

/// A response together with the certificate it carries
#[derive(Debug, Clone)]
pub struct Issuance {
    pub response: ProgramCertResponse,
    /// The issued certificate (DER), before encryption
    pub cert_der: Vec<u8>,
}

/// Verify a certificate request and answer it with a program certificate
/// that only the quoting TPM can decrypt.
pub fn construct_server_response(
    authority: &PolicyAuthority,
    instructions: &SigningInstructions,
    request: &ProgramCertRequest,
) -> Result<Issuance, IssuanceError> {
    if !request.quote_sig_alg.eq_ignore_ascii_case("rsassa") {
        return Err(IssuanceError::UnsupportedScheme(request.quote_sig_alg.clone()));
    }
    let alg = tpm_qvl::hash_alg_from_name(&request.quote_hash_alg)?;
    let param_hash = tpm_qvl::hash(alg, &request.program_key.to_scale())?;

    if !tpm_qvl::verify_quote(
        &param_hash,
        &request.quote_key.key,
        alg,
        &request.quoted,
        &request.signature,
    ) {
        warn!("request {}: quote does not verify", request.request_id);
        return Err(IssuanceError::QuoteVerificationFailed);
    }
    tpm_qvl::check_quote_key(&request.quote_key).map_err(IssuanceError::QuoteKeyRejected)?;

    authority
        .verify_endorsement_cert(&request.endorsement_cert)
        .map_err(IssuanceError::EndorsementCertRejected)?;
    let ek_public = tpm_qvl::public_key_from_cert_der(&request.endorsement_cert)
        .map_err(IssuanceError::EndorsementCertRejected)?;

    let cert_der = authority
        .issue_program_cert(instructions, &request.program_key)
        .map_err(|e| IssuanceError::CertIssuance(format!("{e:#}")))?;

    let mut credential = [0u8; CREDENTIAL_SIZE];
    rand::thread_rng().fill_bytes(&mut credential);

    let blob = tpm_qvl::make_credential(&ek_public, alg, &credential, &request.quote_key.name)?;
    let (encrypted_cert, encrypted_cert_hmac) =
        tpm_qvl::encrypt_data_with_credential(true, alg, &credential, &cert_der, &[])?;

    info!(
        "request {}: issued certificate for {:?}",
        request.request_id, request.program_key.program_name
    );
    Ok(Issuance {
        response: ProgramCertResponse {
            request_id: request.request_id.clone(),
            program_name: request.program_key.program_name.clone(),
            integrity_hash_alg: alg.name().into(),
            encrypted_secret: blob.encrypted_secret,
            enc_identity: blob.enc_identity,
            integrity_hmac: blob.integrity_hmac,
            encrypted_cert,
            encrypted_cert_hmac,
        },
        cert_der,
    })
}

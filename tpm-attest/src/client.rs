// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Device side of the issuance protocol: quote a fresh program key and
//! recover the issued certificate with ActivateCredential.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tpm2::{Tpm2bPublic, TpmAlgId, TpmContext, TpmlPcrSelection};
use tpm_qvl::KeyMaterial;
use tpm_types::{
    PcrSelection, ProgramCertRequest, ProgramCertResponse, ProgramKeyParameters, QuoteKeyInfo,
    DEFAULT_REQUEST_ID,
};

/// PCRs a TPM exposes per bank
const PCR_COUNT: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub program_name: String,
    /// Program key modulus size
    pub key_bits: usize,
    pub pcr_selection: PcrSelection,
    /// Quote key password, hex
    pub quote_password: String,
    /// Endorsement key password, hex
    pub endorsement_password: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            program_name: "program".into(),
            key_bits: 2048,
            pcr_selection: PcrSelection::default(),
            quote_password: String::new(),
            endorsement_password: String::new(),
        }
    }
}

/// Convert a protocol PCR selection into its TPM form
pub fn pcr_selection_to_tpm(selection: &PcrSelection) -> Result<TpmlPcrSelection> {
    let Some(bank) = TpmAlgId::from_name(&selection.bank) else {
        bail!("unknown PCR bank {:?}", selection.bank);
    };
    if let Some(pcr) = selection.pcrs.iter().find(|&&p| p >= PCR_COUNT) {
        bail!("PCR index {pcr} out of range");
    }
    Ok(TpmlPcrSelection::single(bank, &selection.pcrs))
}

/// Build a certificate request for a fresh program key, quoted by the key
/// loaded at `quote_handle`.
///
/// Returns the request and the program key, whose private half never
/// leaves the caller.
pub fn construct_client_request<S: Read + Write>(
    ctx: &mut TpmContext<S>,
    quote_handle: u32,
    endorsement_cert: &[u8],
    config: &ClientConfig,
) -> Result<(ProgramCertRequest, KeyMaterial)> {
    let program_key =
        KeyMaterial::generate(config.key_bits).context("Failed to generate program key")?;
    let program_params = ProgramKeyParameters {
        program_name: config.program_name.clone(),
        key: program_key.key_info(),
    };

    let quote_public = ctx.read_public(quote_handle)?;
    let template = Tpm2bPublic {
        public_area: quote_public.public.clone(),
    }
    .decode()
    .context("Failed to decode quote key public area")?;
    let quote_key = tpm_qvl::public_key_from_tpm(&template).context("Unusable quote key")?;
    let hash_alg = template.signing_hash();

    let param_hash = tpm_qvl::hash(hash_alg, &program_params.to_scale())
        .context("Unsupported quote key hash")?;
    let pcr_selection = pcr_selection_to_tpm(&config.pcr_selection)?;
    debug!(
        "quoting {} with {} over PCRs {}",
        hex::encode(&param_hash),
        hash_alg.name(),
        config.pcr_selection.to_arg()
    );
    let quote = ctx.quote(
        quote_handle,
        &config.quote_password,
        &param_hash,
        &pcr_selection,
        hash_alg,
    )?;

    let request = ProgramCertRequest {
        request_id: DEFAULT_REQUEST_ID.into(),
        endorsement_cert: endorsement_cert.to_vec(),
        program_key: program_params,
        quote_key: QuoteKeyInfo {
            name: quote_public.name,
            public_area: quote_public.public,
            key: tpm_qvl::key_info_from_public(&quote_key),
        },
        quote_sig_alg: quote.signature.sig_alg.name().into(),
        quote_hash_alg: hash_alg.name().into(),
        quoted: quote.attest,
        signature: quote.signature.signature,
    };
    info!("built certificate request for {:?}", config.program_name);
    Ok((request, program_key))
}

/// Release the credential with the TPM and decrypt the certificate (DER).
pub fn client_decode_server_response<S: Read + Write>(
    ctx: &mut TpmContext<S>,
    quote_handle: u32,
    endorsement_handle: u32,
    config: &ClientConfig,
    response: &ProgramCertResponse,
) -> Result<Vec<u8>> {
    if response.program_name != config.program_name {
        bail!(
            "response is for program {:?}, expected {:?}",
            response.program_name,
            config.program_name
        );
    }
    let alg = tpm_qvl::hash_alg_from_name(&response.integrity_hash_alg)?;

    let blob = tpm_qvl::id_object(&response.integrity_hmac, &response.enc_identity);
    let credential = ctx.activate_credential(
        quote_handle,
        endorsement_handle,
        &config.quote_password,
        &config.endorsement_password,
        &blob,
        &response.encrypted_secret,
    )?;

    let (cert, _) = tpm_qvl::encrypt_data_with_credential(
        false,
        alg,
        &credential,
        &response.encrypted_cert,
        &response.encrypted_cert_hmac,
    )
    .context("Failed to decrypt program certificate")?;
    info!("recovered {} byte program certificate", cert.len());
    Ok(cert)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_conversion() {
        let sel = pcr_selection_to_tpm(&PcrSelection::sha256(&[0, 7])).unwrap();
        assert_eq!(sel, TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7]));
        assert!(pcr_selection_to_tpm(&PcrSelection::new("md5", &[7])).is_err());
        assert!(pcr_selection_to_tpm(&PcrSelection::sha1(&[24])).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"program_name": "x"}"#).unwrap();
        assert_eq!(config.program_name, "x");
        assert_eq!(config.key_bits, 2048);
        assert_eq!(config.pcr_selection, PcrSelection::sha1(&[7]));
    }
}

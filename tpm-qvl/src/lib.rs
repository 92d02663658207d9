// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Quote Verification Library (QVL)
//!
//! Software counterparts of the TPM operations used for attestation:
//!
//! - [`make_credential`] / [`activate_credential`]: bind a secret to a TPM
//!   object name under an endorsement key
//! - [`encrypt_data_with_credential`]: protect a payload with keys derived
//!   from a released credential
//! - [`verify_quote`]: check a TPM2_Quote over caller-chosen data
//! - [`verify_cert_chain`]: check an endorsement certificate against a
//!   verifier-provided root
//!
//! This crate runs on the verifier side, while `tpm-attest` drives the TPM
//! on the device side.

mod attest;
mod credential;
mod crypto;
mod error;
mod keys;
mod verify;

pub use attest::{parse_attest, parse_generated_attest, PcrPolicy};
pub use credential::{
    activate_credential, encrypt_data_with_credential, id_object, make_credential,
    protect_credential, recover_credential, CredentialBlob, SEED_SIZE,
};
pub use crypto::{
    hash, hash_alg_from_name, hash_size, hmac, hmac_verify, kdf_a, object_name, LABEL_IDENTITY,
    LABEL_INTEGRITY, LABEL_PROTECT, LABEL_STORAGE,
};
pub use error::{Error, Result};
pub use keys::{
    check_quote_key, key_info_from_public, public_key_from_cert_der, public_key_from_info,
    public_key_from_parts, public_key_from_quote_key, public_key_from_tpm, KeyMaterial,
};
pub use verify::{check_quote, verify_cert_chain, verify_quote, verify_quote_with_policy};

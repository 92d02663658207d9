// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Program certificate issuance bound to a TPM quote
//!
//! A device quotes the hash of a fresh program key with its quote key. The
//! policy authority checks the quote and the endorsement certificate, then
//! returns the program certificate encrypted under a credential that only
//! the same TPM can release with ActivateCredential.
//!
//! The device side lives in [`client`]; quote and credential cryptography is
//! in the tpm-qvl crate.

pub mod authority;
pub mod client;
pub mod server;

mod error;

pub use authority::{generate_hw_cert, generate_self_signed_policy_cert, PolicyAuthority};
pub use client::{
    client_decode_server_response, construct_client_request, pcr_selection_to_tpm, ClientConfig,
};
pub use error::IssuanceError;
pub use server::{construct_server_response, Issuance};

pub use tpm_types::{
    PcrSelection, ProgramCertRequest, ProgramCertResponse, ProgramKeyParameters,
    SigningInstructions,
};

/// Persistent handle of the endorsement key in the TCG provisioning guidance
pub const DEFAULT_EK_HANDLE: u32 = 0x81010001;

/// Persistent handle the CLI stores the quote key at
pub const DEFAULT_QUOTE_KEY_HANDLE: u32 = 0x81000100;

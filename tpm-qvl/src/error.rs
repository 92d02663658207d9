// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("integrity check failed")]
    IntegrityCheckFailed,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("malformed TPM structure: {0}")]
    Attest(#[from] tpm2::Error),
    #[error("attestation magic 0x{0:08x} is not TPM_GENERATED")]
    MagicMismatch(u32),
    #[error("PCR policy rejected the quote: {0}")]
    PcrRejected(String),
    #[error("quote does not match: {0}")]
    QuoteMismatch(&'static str),
    #[error("certificate rejected: {0}")]
    Certificate(String),
}

impl Error {
    pub(crate) fn unsupported(alg: tpm2::TpmAlgId) -> Self {
        Error::UnsupportedAlgorithm(alg.name().to_string())
    }
}

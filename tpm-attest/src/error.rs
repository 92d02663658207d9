// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

/// Why the authority refused to issue a certificate
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("quote verification failed")]
    QuoteVerificationFailed,
    #[error("quote key rejected: {0}")]
    QuoteKeyRejected(#[source] tpm_qvl::Error),
    #[error("endorsement certificate rejected: {0}")]
    EndorsementCertRejected(#[source] tpm_qvl::Error),
    #[error("certificate issuance failed: {0}")]
    CertIssuance(String),
    #[error("unsupported quote signature scheme {0:?}")]
    UnsupportedScheme(String),
    #[error(transparent)]
    Crypto(#[from] tpm_qvl::Error),
}

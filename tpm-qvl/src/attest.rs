// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPMS_ATTEST parsing and PCR policy

use tpm2::{
    compute_pcr_digest, ResponseBuffer, TpmAlgId, TpmlPcrSelection, TpmsAttest, TpmsQuoteInfo,
    Unmarshal, TPM_GENERATED_VALUE,
};

use crate::error::{Error, Result};

/// Parse a marshalled TPMS_ATTEST. Only quote attestations are accepted and
/// trailing bytes are an error.
pub fn parse_attest(blob: &[u8]) -> Result<TpmsAttest> {
    let mut buf = ResponseBuffer::new(blob);
    let attest = TpmsAttest::unmarshal(&mut buf)?;
    buf.finish()?;
    Ok(attest)
}

/// [`parse_attest`] plus the TPM_GENERATED magic check
pub fn parse_generated_attest(blob: &[u8]) -> Result<TpmsAttest> {
    let attest = parse_attest(blob)?;
    if attest.magic != TPM_GENERATED_VALUE {
        return Err(Error::MagicMismatch(attest.magic));
    }
    Ok(attest)
}

/// What a verifier requires of the PCR state in a quote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PcrPolicy {
    /// The quoted PCR state is not inspected
    #[default]
    AcceptAny,
    /// The quote must cover exactly `selection` and report `digest`
    Expect {
        selection: TpmlPcrSelection,
        digest: Vec<u8>,
    },
}

impl PcrPolicy {
    /// Expect the digest of known PCR values, in selection order
    pub fn from_values(
        selection: TpmlPcrSelection,
        values: &[Vec<u8>],
        digest_alg: TpmAlgId,
    ) -> Result<Self> {
        let digest = compute_pcr_digest(values, digest_alg)?;
        Ok(PcrPolicy::Expect { selection, digest })
    }

    pub fn check(&self, quote: &TpmsQuoteInfo) -> Result<()> {
        match self {
            PcrPolicy::AcceptAny => Ok(()),
            PcrPolicy::Expect { selection, digest } => {
                if &quote.pcr_select != selection {
                    return Err(Error::PcrRejected(format!(
                        "quoted selection {:?} differs from the expected one",
                        quote.pcr_select
                    )));
                }
                if &quote.pcr_digest != digest {
                    return Err(Error::PcrRejected(format!(
                        "PCR digest {} differs from the expected {}",
                        hex::encode(&quote.pcr_digest),
                        hex::encode(digest)
                    )));
                }
                Ok(())
            }
        }
    }
}

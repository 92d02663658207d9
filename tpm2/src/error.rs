// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::constants::TpmCc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer underflow: need {needed} bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("password is not valid hex: {0}")]
    BadPassword(#[source] hex::FromHexError),
    #[error("TPM response too short: {0} bytes")]
    ShortResponse(usize),
    #[error("{} failed with TPM error 0x{code:08x}", command.name())]
    CommandFailed { command: TpmCc, code: u32 },
    #[error("failed to write TPM command: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("failed to read TPM response: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("TPM response of {size} bytes exceeds the {max} byte limit")]
    ResponseTooLarge { size: usize, max: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to open TPM device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn decode(what: impl Into<String>) -> Self {
        Error::Decode(what.into())
    }

    /// The TPM response code, when the device rejected a command.
    pub fn response_code(&self) -> Option<u32> {
        match self {
            Error::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command authorization areas

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// One TPMS_AUTH_COMMAND entry.
///
/// For password sessions the handle is `TPM_RS_PW` and `hmac` carries the
/// password itself. Policy sessions use the handle returned by
/// StartAuthSession and usually an empty value.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthArea {
    pub handle: u32,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl std::fmt::Debug for AuthArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthArea")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .field("attributes", &self.attributes)
            .field("hmac_len", &self.hmac.len())
            .finish()
    }
}

impl AuthArea {
    /// Build an auth area from a hex-encoded password.
    pub fn password(password_hex: &str, handle: u32) -> Result<Self> {
        let hmac = hex::decode(password_hex).map_err(Error::BadPassword)?;
        Ok(Self {
            handle,
            attributes: TpmaSa::CONTINUE_SESSION,
            hmac,
        })
    }

    /// Password session with an empty password
    pub fn empty_password() -> Self {
        Self {
            handle: tpm_rh::PW,
            attributes: TpmaSa::CONTINUE_SESSION,
            hmac: Vec::new(),
        }
    }

    /// Authorize with a policy session that has already been satisfied
    pub fn policy_session(session_handle: u32) -> Self {
        Self {
            handle: session_handle,
            attributes: TpmaSa::CONTINUE_SESSION,
            hmac: Vec::new(),
        }
    }
}

impl Marshal for AuthArea {
    fn marshal(&self, buf: &mut CommandBuffer) -> Result<()> {
        buf.put_u32(self.handle);
        buf.put_tpm2b_empty(); // nonceCaller
        buf.put_u8(self.attributes);
        buf.put_tpm2b(&self.hmac)
    }
}

/// Write the authorization section: a 4-byte size followed by the areas.
pub fn put_auth_areas(buf: &mut CommandBuffer, areas: &[AuthArea]) -> Result<()> {
    let mut inner = CommandBuffer::new();
    for area in areas {
        area.marshal(&mut inner)?;
    }
    buf.put_u32(inner.len() as u32);
    buf.put_bytes(inner.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_area_layout() {
        let area = AuthArea::password("01020304", tpm_rh::PW).unwrap();
        let mut buf = CommandBuffer::new();
        put_auth_areas(&mut buf, &[area]).unwrap();
        assert_eq!(
            buf.as_bytes(),
            &[
                0x00, 0x00, 0x00, 0x0d, // authorizationSize
                0x40, 0x00, 0x00, 0x09, // TPM_RS_PW
                0x00, 0x00, // empty nonce
                0x01, // continueSession
                0x00, 0x04, 0x01, 0x02, 0x03, 0x04, // password
            ]
        );
    }

    #[test]
    fn test_empty_password() {
        let area = AuthArea::password("", tpm_rh::PW).unwrap();
        assert_eq!(area, AuthArea::empty_password());
        assert_eq!(area.to_bytes().unwrap().len(), 9);
    }

    #[test]
    fn test_bad_password() {
        let err = AuthArea::password("01020g", tpm_rh::PW).unwrap_err();
        assert!(matches!(err, Error::BadPassword(_)));
        let err = AuthArea::password("abc", tpm_rh::PW).unwrap_err();
        assert!(matches!(err, Error::BadPassword(_)));
    }
}

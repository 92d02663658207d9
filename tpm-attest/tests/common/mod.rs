// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! A software TPM answering the commands the issuance protocol sends

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use tpm2::*;
use tpm_qvl::KeyMaterial;

pub const QUOTE_HANDLE: u32 = 0x8000_0001;
pub const EK_HANDLE: u32 = 0x8100_0001;

const TPM_RC_HANDLE: u32 = 0x08b;
const TPM_RC_COMMAND_CODE: u32 = 0x143;
const TPM_RC_INTEGRITY: u32 = 0x09f;

pub struct SoftTpm {
    pub quote_key: RsaPrivateKey,
    pub quote_public: Vec<u8>,
    pub quote_name: Vec<u8>,
    pub ek: KeyMaterial,
    pub commands: Vec<u32>,
    pending: Vec<u8>,
    current: VecDeque<u8>,
}

impl SoftTpm {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let quote_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let ek = KeyMaterial::generate(1024).unwrap();

        use rsa::traits::PublicKeyParts;
        let mut template = TpmtPublic::rsa_quote_key(TpmAlgId::Sha256);
        template.unique = quote_key.n().to_bytes_be();
        let quote_public = Tpm2bPublic::from_template(&template).unwrap().public_area;
        let quote_name = tpm_qvl::object_name(TpmAlgId::Sha256, &quote_public).unwrap();

        Self {
            quote_key,
            quote_public,
            quote_name,
            ek,
            commands: Vec::new(),
            pending: Vec::new(),
            current: VecDeque::new(),
        }
    }

    pub fn into_context(self) -> TpmContext<SoftTpm> {
        TpmContext::from_device(TpmDevice::from_stream(self, "soft"))
    }

    fn handle(&mut self, command: &[u8]) -> Vec<u8> {
        let cc = u32::from_be_bytes([command[6], command[7], command[8], command[9]]);
        self.commands.push(cc);
        let mut buf = ResponseBuffer::new(&command[TPM_HEADER_SIZE..]);
        let result = match cc {
            x if x == TpmCc::ReadPublic as u32 => self.read_public(&mut buf),
            x if x == TpmCc::Quote as u32 => self.quote(&mut buf),
            x if x == TpmCc::ActivateCredential as u32 => self.activate(&mut buf),
            x if x == TpmCc::GetRandom as u32 => {
                let count = buf.get_u16().unwrap();
                let mut body = CommandBuffer::new();
                body.put_tpm2b(&vec![0x5a; count as usize]).unwrap();
                Ok((TpmSt::NoSessions, body.into_vec()))
            }
            x if x == TpmCc::FlushContext as u32 => Ok((TpmSt::NoSessions, Vec::new())),
            _ => Err(TPM_RC_COMMAND_CODE),
        };
        let (tag, data, rc) = match result {
            Ok((tag, data)) => (tag, data, 0),
            Err(rc) => (TpmSt::NoSessions, Vec::new(), rc),
        };
        TpmResponse {
            tag,
            response_code: rc,
            data,
        }
        .to_bytes()
        .unwrap()
    }

    fn read_public(&self, buf: &mut ResponseBuffer) -> std::result::Result<(TpmSt, Vec<u8>), u32> {
        if buf.get_u32().unwrap() != QUOTE_HANDLE {
            return Err(TPM_RC_HANDLE);
        }
        let mut body = CommandBuffer::new();
        body.put_tpm2b(&self.quote_public).unwrap();
        body.put_tpm2b(&self.quote_name).unwrap();
        body.put_tpm2b(&self.quote_name).unwrap();
        Ok((TpmSt::NoSessions, body.into_vec()))
    }

    fn skip_auth(buf: &mut ResponseBuffer) {
        let size = buf.get_u32().unwrap();
        buf.skip(size as usize).unwrap();
    }

    fn with_sessions(params: CommandBuffer) -> (TpmSt, Vec<u8>) {
        let mut body = CommandBuffer::new();
        body.put_u32(params.len() as u32);
        body.put_bytes(params.as_bytes());
        // nonce, attributes, hmac
        body.put_tpm2b_empty();
        body.put_u8(0x01);
        body.put_tpm2b_empty();
        (TpmSt::Sessions, body.into_vec())
    }

    fn quote(&self, buf: &mut ResponseBuffer) -> std::result::Result<(TpmSt, Vec<u8>), u32> {
        if buf.get_u32().unwrap() != QUOTE_HANDLE {
            return Err(TPM_RC_HANDLE);
        }
        Self::skip_auth(buf);
        let qualifying = buf.get_tpm2b().unwrap();
        let _scheme = TpmtScheme::unmarshal(buf).unwrap();
        let pcr_select = TpmlPcrSelection::unmarshal(buf).unwrap();

        let pcr_count = pcr_select
            .pcr_selections
            .iter()
            .map(|s| s.pcr_indices().len())
            .sum::<usize>();
        let pcr_digest = compute_pcr_digest(&vec![vec![0u8; 20]; pcr_count], TpmAlgId::Sha256)
            .unwrap();
        let attest = TpmsAttest {
            magic: TPM_GENERATED_VALUE,
            attest_type: TpmSt::AttestQuote.to_u16(),
            qualified_signer: self.quote_name.clone(),
            extra_data: qualifying,
            clock_info: TpmsClockInfo {
                clock: 1000,
                reset_count: 1,
                restart_count: 0,
                safe: true,
            },
            firmware_version: 0x0001_0002_0003_0004,
            quote: TpmsQuoteInfo {
                pcr_select,
                pcr_digest,
            },
        };
        let mut attest_bytes = CommandBuffer::new();
        attest.marshal(&mut attest_bytes).unwrap();
        let attest_bytes = attest_bytes.into_vec();

        let signature = self
            .quote_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(&attest_bytes))
            .unwrap();

        let mut params = CommandBuffer::new();
        params.put_tpm2b(&attest_bytes).unwrap();
        TpmtSignature {
            sig_alg: TpmAlgId::RsaSsa,
            hash_alg: TpmAlgId::Sha256,
            signature,
        }
        .marshal(&mut params)
        .unwrap();
        Ok(Self::with_sessions(params))
    }

    fn activate(&self, buf: &mut ResponseBuffer) -> std::result::Result<(TpmSt, Vec<u8>), u32> {
        let active = buf.get_u32().unwrap();
        let key = buf.get_u32().unwrap();
        if active != QUOTE_HANDLE || key != EK_HANDLE {
            return Err(TPM_RC_HANDLE);
        }
        Self::skip_auth(buf);
        let id_object = buf.get_tpm2b().unwrap();
        let secret = buf.get_tpm2b().unwrap();

        let mut blob = ResponseBuffer::new(&id_object);
        let hmac = blob.get_tpm2b().map_err(|_| TPM_RC_INTEGRITY)?;
        let enc_identity = blob.get_remaining();
        let mut integrity = CommandBuffer::new();
        integrity.put_tpm2b(&hmac).unwrap();

        let credential = tpm_qvl::activate_credential(
            &self.ek,
            TpmAlgId::Sha256,
            &secret,
            &self.quote_name,
            &enc_identity,
            integrity.as_bytes(),
        )
        .map_err(|_| TPM_RC_INTEGRITY)?;

        let mut params = CommandBuffer::new();
        params.put_tpm2b(&credential).unwrap();
        Ok(Self::with_sessions(params))
    }
}

impl Write for SoftTpm {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let command = std::mem::take(&mut self.pending);
        let response = self.handle(&command);
        self.current = response.into();
        Ok(())
    }
}

impl Read for SoftTpm {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.current.len());
        for (slot, byte) in buf.iter_mut().zip(self.current.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

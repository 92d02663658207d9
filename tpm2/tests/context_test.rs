// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use tpm2::*;

/// Replays canned responses, one per flushed command
#[derive(Default)]
struct ScriptedTpm {
    pending: Vec<u8>,
    commands: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    current: VecDeque<u8>,
}

impl ScriptedTpm {
    fn new(responses: Vec<Vec<u8>>) -> Self {
        Self {
            responses: responses.into(),
            ..Default::default()
        }
    }

    fn command_codes(&self) -> Vec<u32> {
        self.commands
            .iter()
            .map(|c| u32::from_be_bytes([c[6], c[7], c[8], c[9]]))
            .collect()
    }
}

impl Write for ScriptedTpm {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commands.push(std::mem::take(&mut self.pending));
        let next = self
            .responses
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted"))?;
        self.current = next.into();
        Ok(())
    }
}

impl Read for ScriptedTpm {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.current.len());
        for (slot, byte) in buf.iter_mut().zip(self.current.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn reply(tag: TpmSt, rc: u32, body: &[u8]) -> Vec<u8> {
    TpmResponse {
        tag,
        response_code: rc,
        data: body.to_vec(),
    }
    .to_bytes()
    .unwrap()
}

fn ok(body: &[u8]) -> Vec<u8> {
    reply(TpmSt::NoSessions, 0, body)
}

fn ok_sessions(body: &[u8]) -> Vec<u8> {
    reply(TpmSt::Sessions, 0, body)
}

fn context(responses: Vec<Vec<u8>>) -> TpmContext<ScriptedTpm> {
    TpmContext::from_device(TpmDevice::from_stream(ScriptedTpm::new(responses), "script"))
}

#[test]
fn get_random_loops_until_enough_bytes() {
    let mut ctx = context(vec![
        ok(&[&[0u8, 48][..], &[1u8; 48]].concat()),
        ok(&[&[0u8, 12][..], &[2u8; 12]].concat()),
    ]);
    let bytes = ctx.get_random(60).unwrap();
    assert_eq!(bytes.len(), 60);
    assert_eq!(bytes[59], 2);

    let script = ctx.into_device().into_inner();
    assert_eq!(script.commands[0][10..], [0, 48]);
    assert_eq!(script.commands[1][10..], [0, 12]);
}

#[test]
fn flush_all_flushes_each_transient_handle() {
    let handles = [
        0u8, // moreData
        0, 0, 0, 1, // TPM_CAP_HANDLES
        0, 0, 0, 2, // count
        0x80, 0, 0, 0, 0x80, 0, 0, 3,
    ];
    let mut ctx = context(vec![ok(&handles), ok(&[]), ok(&[])]);
    assert_eq!(ctx.flush_all().unwrap(), 2);

    let script = ctx.into_device().into_inner();
    assert_eq!(script.command_codes(), vec![0x17a, 0x165, 0x165]);
    assert_eq!(script.commands[1][10..], [0x80, 0, 0, 0]);
    assert_eq!(script.commands[2][10..], [0x80, 0, 0, 3]);
}

#[test]
fn flush_all_reports_failing_handle() {
    let handles = [0u8, 0, 0, 0, 1, 0, 0, 0, 1, 0x80, 0, 0, 7];
    let mut ctx = context(vec![ok(&handles), reply(TpmSt::NoSessions, 0x18b, &[])]);
    let err = ctx.flush_all().unwrap_err();
    assert!(format!("{err:#}").contains("0x80000007"));
    let root = err.downcast_ref::<Error>().unwrap();
    assert_eq!(root.response_code(), Some(0x18b));
}

#[test]
fn pcr_read_maps_indices() {
    let selection = TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7]);
    let mut body = CommandBuffer::new();
    body.put_u32(9);
    selection.marshal(&mut body).unwrap();
    body.put_u32(2);
    body.put_tpm2b(&[0u8; 32]).unwrap();
    body.put_tpm2b(&[7u8; 32]).unwrap();

    let mut ctx = context(vec![ok(body.as_bytes())]);
    let values = ctx.pcr_read(&selection).unwrap();
    assert_eq!(values, vec![(0, vec![0u8; 32]), (7, vec![7u8; 32])]);
}

#[test]
fn key_hierarchy_runs_create_create_load() {
    let quote_public = TpmtPublic::rsa_quote_key(TpmAlgId::Sha256).to_bytes().unwrap();

    // handle, parameterSize, empty outPublic
    let primary = [0x80, 0, 0, 1, 0, 0, 0, 0, 0, 0];

    let mut create = CommandBuffer::new();
    create.put_u32(0);
    create.put_tpm2b(&[0xaa; 16]).unwrap();
    create.put_tpm2b(&quote_public).unwrap();

    let load = [0x80, 0, 0, 2, 0, 0, 0, 6, 0, 4, 0, 0x0b, 9, 9];

    let mut ctx = context(vec![
        ok_sessions(&primary),
        ok_sessions(create.as_bytes()),
        ok_sessions(&load),
    ]);
    let keys = ctx
        .create_key_hierarchy(&HierarchyAuth::default(), TpmAlgId::Sha256, false)
        .unwrap();
    assert_eq!(keys.primary_handle, 0x80000001);
    assert_eq!(keys.quote_handle, 0x80000002);
    assert_eq!(keys.quote_name, vec![0, 0x0b, 9, 9]);
    assert_eq!(keys.quote_private, vec![0xaa; 16]);
    assert!(keys.saved_quote.is_none());

    let script = ctx.into_device().into_inner();
    assert_eq!(script.command_codes(), vec![0x131, 0x153, 0x157]);
}

#[test]
fn unseal_flushes_object_when_tpm_refuses() {
    let load = [0x80, 0, 0, 4, 0, 0, 0, 2, 0, 0];
    let mut ctx = context(vec![
        ok_sessions(&load),
        reply(TpmSt::NoSessions, 0x98e, &[]),
        ok(&[]),
    ]);
    let err = ctx
        .unseal(&[1], &[2], 0x81000001, "", "", &TpmlPcrSelection::default(), TpmAlgId::Sha256)
        .unwrap_err();
    assert!(format!("{err:#}").contains("Unseal failed"));

    let script = ctx.into_device().into_inner();
    assert_eq!(script.command_codes(), vec![0x157, 0x15e, 0x165]);
    assert_eq!(script.commands[2][10..], [0x80, 0, 0, 4]);
}

#[test]
fn oversized_response_is_rejected() {
    let mut device = TpmDevice::from_stream(
        ScriptedTpm::new(vec![ok(&[&[0u8, 64][..], &[0u8; 64]].concat())]),
        "script",
    );
    device.set_max_response_size(32).unwrap();
    let err = device
        .call(&commands::construct_get_random(64).unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::ResponseTooLarge { size: 76, max: 32 }));
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Commands go to `/dev/tpmrm0`, `/dev/tpm0`, a Unix socket (`unix:<path>`,
//! as exposed by software TPMs) or any caller-supplied `Read + Write` stream.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{put_auth_areas, AuthArea};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// Size of the command and response headers
pub const TPM_HEADER_SIZE: usize = 10;

/// Default maximum TPM response size
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 4096;

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_response_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

/// Byte stream backing a device opened by path
#[derive(Debug)]
pub enum DeviceStream {
    File(File),
    #[cfg(unix)]
    Socket(std::os::unix::net::UnixStream),
}

impl Read for DeviceStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DeviceStream::File(f) => f.read(buf),
            #[cfg(unix)]
            DeviceStream::Socket(s) => s.read(buf),
        }
    }
}

impl Write for DeviceStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            DeviceStream::File(f) => f.write(buf),
            #[cfg(unix)]
            DeviceStream::Socket(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            DeviceStream::File(f) => f.flush(),
            #[cfg(unix)]
            DeviceStream::Socket(s) => s.flush(),
        }
    }
}

/// TPM device handle
///
/// The device is a sequential state machine: `call` takes `&mut self`, so a
/// second command cannot be written before the previous response is read.
pub struct TpmDevice<S = DeviceStream> {
    stream: S,
    path: String,
    max_response_size: usize,
}

impl TpmDevice<DeviceStream> {
    /// Open a TPM device. `unix:<path>` connects to a socket instead.
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        #[cfg(unix)]
        if let Some(socket) = device_path.strip_prefix("unix:") {
            let stream =
                std::os::unix::net::UnixStream::connect(socket).map_err(|source| Error::Open {
                    path: socket.to_string(),
                    source,
                })?;
            return Ok(Self::from_stream(DeviceStream::Socket(stream), device_path));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|source| Error::Open {
                path: device_path.to_string(),
                source,
            })?;

        Ok(Self::from_stream(DeviceStream::File(file), device_path))
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        for candidate in ["/dev/tpmrm0", "/dev/tpm0"] {
            if Path::new(candidate).exists() {
                return Self::open(candidate);
            }
        }
        Err(Error::Open {
            path: "/dev/tpmrm0".into(),
            source: std::io::Error::new(ErrorKind::NotFound, "TPM device not found"),
        })
    }
}

impl<S: Read + Write> TpmDevice<S> {
    /// Wrap an already opened stream
    pub fn from_stream(stream: S, label: &str) -> Self {
        Self {
            stream,
            path: label.to_string(),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    pub fn with_config(mut self, config: &TransportConfig) -> Result<Self> {
        self.set_max_response_size(config.max_response_size)?;
        Ok(self)
    }

    pub fn set_max_response_size(&mut self, size: usize) -> Result<()> {
        if size < TPM_HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "maximum response size {size} is smaller than a response header"
            )));
        }
        self.max_response_size = size;
        Ok(())
    }

    pub fn max_response_size(&self) -> usize {
        self.max_response_size
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write one command and block until its whole response has been read.
    pub fn call(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.stream.write_all(command).map_err(Error::WriteFailed)?;
        self.stream.flush().map_err(Error::WriteFailed)?;

        let max = self.max_response_size;
        let mut response = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            let n = match self.stream.read(&mut response[filled..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ReadFailed(e)),
            };
            filled += n;
            if filled >= TPM_HEADER_SIZE {
                let declared =
                    u32::from_be_bytes([response[2], response[3], response[4], response[5]])
                        as usize;
                if declared > max {
                    return Err(Error::ResponseTooLarge {
                        size: declared,
                        max,
                    });
                }
                if filled >= declared {
                    break;
                }
            }
        }
        response.truncate(filled);

        debug!(
            "TPM round trip: {} byte command, {} byte response",
            command.len(),
            response.len()
        );
        Ok(response)
    }

    /// Execute a command and parse the response header
    pub fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let response_bytes = self.call(command)?;
        TpmResponse::parse(&response_bytes)
    }
}

/// Build the 10-byte header with a zero size placeholder
pub fn make_header(tag: TpmSt, command_code: TpmCc) -> [u8; TPM_HEADER_SIZE] {
    let mut header = [0u8; TPM_HEADER_SIZE];
    header[0..2].copy_from_slice(&tag.to_u16().to_be_bytes());
    header[6..10].copy_from_slice(&command_code.to_u32().to_be_bytes());
    header
}

/// Concatenate header and body, then patch the size field with the total length.
pub fn pack_with_header(header: &[u8; TPM_HEADER_SIZE], body: &[u8]) -> Result<Vec<u8>> {
    let mut buf = CommandBuffer::with_capacity(TPM_HEADER_SIZE + body.len());
    buf.put_bytes(header);
    buf.put_bytes(body);
    let size = u32::try_from(buf.len())
        .map_err(|_| Error::InvalidArgument(format!("command of {} bytes", buf.len())))?;
    buf.update_u32(2, size)?;
    Ok(buf.into_vec())
}

/// TPM command builder
pub struct TpmCommand {
    header: [u8; TPM_HEADER_SIZE],
    body: CommandBuffer,
}

impl TpmCommand {
    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self {
            header: make_header(TpmSt::NoSessions, command_code),
            body: CommandBuffer::with_capacity(256),
        }
    }

    /// Create a new command with sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self {
            header: make_header(TpmSt::Sessions, command_code),
            body: CommandBuffer::with_capacity(256),
        }
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.body.put_u32(handle);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.body.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.body.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.body.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.body.put_u32(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) -> Result<()> {
        self.body.put_tpm2b(data)
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.body.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) -> Result<()> {
        value.marshal(&mut self.body)
    }

    /// Add the authorization section
    pub fn add_auth(&mut self, areas: &[AuthArea]) -> Result<()> {
        put_auth_areas(&mut self.body, areas)
    }

    /// Finalize the command and return the bytes
    pub fn finalize(self) -> Result<Vec<u8>> {
        pack_with_header(&self.header, self.body.as_bytes())
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < TPM_HEADER_SIZE {
            return Err(Error::ShortResponse(response.len()));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| Error::Decode(format!("invalid response tag 0x{tag_raw:04x}")))?;

        let size = buf.get_u32()? as usize;
        if size < TPM_HEADER_SIZE || response.len() < size {
            return Err(Error::Decode(format!(
                "response size field {size} does not match {} received bytes",
                response.len()
            )));
        }

        let response_code = buf.get_u32()?;
        let data = response[TPM_HEADER_SIZE..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    /// Encode a response, as produced by a device
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = CommandBuffer::with_capacity(TPM_HEADER_SIZE + self.data.len());
        buf.put_u16(self.tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(self.response_code);
        buf.put_bytes(&self.data);
        let size = buf.len() as u32;
        buf.update_u32(2, size)?;
        Ok(buf.into_vec())
    }

    pub fn is_success(&self) -> bool {
        self.response_code == TPM_RC_SUCCESS
    }

    /// Fail with an error naming `command` unless the TPM reported success
    pub fn ensure_success(&self, command: TpmCc) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command,
                code: self.response_code,
            })
        }
    }

    /// Get a response buffer for parsing the data
    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Skip the parameter size field (for commands with sessions)
    pub fn skip_parameter_size(&self) -> Result<ResponseBuffer<'_>> {
        let mut buf = self.data_buffer();
        if self.tag == TpmSt::Sessions {
            let _param_size = buf.get_u32()?;
        }
        Ok(buf)
    }
}

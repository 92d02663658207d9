// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 implementation
//!
//! This crate builds TPM 2.0 command byte strings, parses responses and
//! talks to the TPM device directly, without C library dependencies.
//!
//! ## Layers
//!
//! - [`marshal`]: big-endian cursor codec and TPM2B buffers
//! - [`commands`]: one pure `construct_*` / `decode_*` pair per operation
//! - [`TpmDevice`]: a `/dev/tpmrm0`, `/dev/tpm0`, `unix:` socket or any
//!   `Read + Write` stream
//! - [`TpmContext`]: device round trips plus key hierarchy, sealing and
//!   handle housekeeping flows
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::TpmContext;
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let random_bytes = ctx.get_random(32)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod commands;
pub mod marshal;

mod auth;
mod constants;
mod context;
mod device;
mod error;
mod session;
mod types;

pub use auth::{put_auth_areas, AuthArea};
pub use constants::*;
pub use context::{EndorsementKey, HierarchyAuth, KeyHierarchy, TpmContext};
pub use error::{Error, Result};
pub use types::*;

pub use device::{
    make_header, pack_with_header, DeviceStream, TpmCommand, TpmDevice, TpmResponse,
    TransportConfig, DEFAULT_MAX_RESPONSE_SIZE, TPM_HEADER_SIZE,
};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{compute_pcr_digest, AuthSession};

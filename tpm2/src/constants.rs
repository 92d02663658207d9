// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Quote = 0x00000158,
    Unseal = 0x0000015E,
    ContextLoad = 0x00000161,
    ContextSave = 0x00000162,
    FlushContext = 0x00000165,
    MakeCredential = 0x00000168,
    PolicyPassword = 0x0000018C,
    ReadPublic = 0x00000173,
    ActivateCredential = 0x00000147,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    ReadClock = 0x00000181,
    PcrEvent = 0x0000013C,
    PolicyGetDigest = 0x00000189,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Command name as used in error messages
    pub fn name(self) -> &'static str {
        match self {
            TpmCc::EvictControl => "EvictControl",
            TpmCc::CreatePrimary => "CreatePrimary",
            TpmCc::Create => "Create",
            TpmCc::Load => "Load",
            TpmCc::Quote => "Quote",
            TpmCc::Unseal => "Unseal",
            TpmCc::ContextLoad => "LoadContext",
            TpmCc::ContextSave => "SaveContext",
            TpmCc::FlushContext => "FlushContext",
            TpmCc::MakeCredential => "MakeCredential",
            TpmCc::PolicyPassword => "PolicyPassword",
            TpmCc::ReadPublic => "ReadPublic",
            TpmCc::ActivateCredential => "ActivateCredential",
            TpmCc::StartAuthSession => "StartAuthSession",
            TpmCc::GetCapability => "GetCapability",
            TpmCc::GetRandom => "GetRandom",
            TpmCc::PcrRead => "PCR_Read",
            TpmCc::PolicyPcr => "PolicyPCR",
            TpmCc::ReadClock => "ReadClock",
            TpmCc::PcrEvent => "PCR_Event",
            TpmCc::PolicyGetDigest => "PolicyGetDigest",
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        const ALL: [TpmCc; 21] = [
            TpmCc::EvictControl,
            TpmCc::CreatePrimary,
            TpmCc::Create,
            TpmCc::Load,
            TpmCc::Quote,
            TpmCc::Unseal,
            TpmCc::ContextLoad,
            TpmCc::ContextSave,
            TpmCc::FlushContext,
            TpmCc::MakeCredential,
            TpmCc::PolicyPassword,
            TpmCc::ReadPublic,
            TpmCc::ActivateCredential,
            TpmCc::StartAuthSession,
            TpmCc::GetCapability,
            TpmCc::GetRandom,
            TpmCc::PcrRead,
            TpmCc::PolicyPcr,
            TpmCc::ReadClock,
            TpmCc::PcrEvent,
            TpmCc::PolicyGetDigest,
        ];
        ALL.into_iter().find(|cc| cc.to_u32() == v)
    }
}

/// TPM_RC_SUCCESS
pub const TPM_RC_SUCCESS: u32 = 0;

/// TPM_GENERATED_VALUE, the magic at the start of every TPMS_ATTEST
pub const TPM_GENERATED_VALUE: u32 = 0xff544347;

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Rsa = 0x0001,
    Hmac = 0x0005,
    Aes = 0x0006,
    Cfb = 0x0043,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    KeyedHash = 0x0008,
    SymCipher = 0x0025,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0001 => Some(TpmAlgId::Rsa),
            0x0005 => Some(TpmAlgId::Hmac),
            0x0006 => Some(TpmAlgId::Aes),
            0x0043 => Some(TpmAlgId::Cfb),
            0x0014 => Some(TpmAlgId::RsaSsa),
            0x0016 => Some(TpmAlgId::RsaPss),
            0x0017 => Some(TpmAlgId::Oaep),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x0025 => Some(TpmAlgId::SymCipher),
            _ => None,
        }
    }

    /// Parse a lowercase algorithm name ("sha1", "sha256", "rsassa", ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "null" => Some(TpmAlgId::Null),
            "sha1" => Some(TpmAlgId::Sha1),
            "sha256" => Some(TpmAlgId::Sha256),
            "sha384" => Some(TpmAlgId::Sha384),
            "sha512" => Some(TpmAlgId::Sha512),
            "rsa" => Some(TpmAlgId::Rsa),
            "rsassa" => Some(TpmAlgId::RsaSsa),
            "rsapss" => Some(TpmAlgId::RsaPss),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TpmAlgId::Null => "null",
            TpmAlgId::Sha1 => "sha1",
            TpmAlgId::Sha256 => "sha256",
            TpmAlgId::Sha384 => "sha384",
            TpmAlgId::Sha512 => "sha512",
            TpmAlgId::Rsa => "rsa",
            TpmAlgId::Hmac => "hmac",
            TpmAlgId::Aes => "aes",
            TpmAlgId::Cfb => "cfb",
            TpmAlgId::RsaSsa => "rsassa",
            TpmAlgId::RsaPss => "rsapss",
            TpmAlgId::Oaep => "oaep",
            TpmAlgId::KeyedHash => "keyedhash",
            TpmAlgId::SymCipher => "symcipher",
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }

    /// First handle of this range
    pub fn first_handle(self) -> u32 {
        (self as u32) << 24
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
    pub const PW: u32 = 0x40000009; // Password authorization
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
    Commands = 0x00000002,
    Pcrs = 0x00000005,
    TpmProperties = 0x00000006,
}

impl TpmCap {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_admin_with_policy(mut self) -> Self {
        self.0 |= Self::ADMIN_WITH_POLICY;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_sign_encrypt(mut self) -> Self {
        self.0 |= Self::SIGN_ENCRYPT;
        self
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    AttestQuote = 0x8018,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x8018 => Some(TpmSt::AttestQuote),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

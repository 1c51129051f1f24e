//! Immutable snapshots of the info structures a module fills in.

use std::fmt;

use cryptoki_sys::{
    CKF_CLOCK_ON_TOKEN, CKF_HW_SLOT, CKF_LOGIN_REQUIRED, CKF_REMOVABLE_DEVICE, CKF_RW_SESSION,
    CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED,
};
use time::PrimitiveDateTime;

use crate::error::Pkcs11Result;
use crate::layout::{INFO, Layout, MECHANISM_INFO, SESSION_INFO, SLOT_INFO, TOKEN_INFO};
use crate::marshal::{decode_padded, decode_utc_time, read_ulong};

/// `CK_VERSION`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    fn read(buf: &[u8], offset: usize) -> Self {
        Self {
            major: buf[offset],
            minor: buf[offset + 1],
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Copies a fixed-size blank-padded field out of a record.
fn padded(buf: &[u8], offset: usize, len: usize) -> Pkcs11Result<String> {
    decode_padded(&buf[offset..offset + len])
}

/// `CK_INFO`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LibraryInfo {
    pub cryptoki_version: Version,
    pub manufacturer_id: String,
    pub flags: u64,
    pub library_description: String,
    pub library_version: Version,
}

impl LibraryInfo {
    pub fn size(layout: &Layout) -> usize {
        layout.record(INFO).size()
    }

    pub fn decode(layout: &Layout, buf: &[u8]) -> Pkcs11Result<Self> {
        let record = layout.record(INFO);
        Ok(Self {
            cryptoki_version: Version::read(buf, record.offset(0)),
            manufacturer_id: padded(buf, record.offset(1), 32)?,
            flags: read_ulong(layout, buf, record.offset(2)),
            library_description: padded(buf, record.offset(3), 32)?,
            library_version: Version::read(buf, record.offset(4)),
        })
    }
}

/// `CK_SLOT_INFO`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_description: String,
    pub manufacturer_id: String,
    pub flags: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

impl SlotInfo {
    pub fn size(layout: &Layout) -> usize {
        layout.record(SLOT_INFO).size()
    }

    pub fn decode(layout: &Layout, buf: &[u8]) -> Pkcs11Result<Self> {
        let record = layout.record(SLOT_INFO);
        Ok(Self {
            slot_description: padded(buf, record.offset(0), 64)?,
            manufacturer_id: padded(buf, record.offset(1), 32)?,
            flags: read_ulong(layout, buf, record.offset(2)),
            hardware_version: Version::read(buf, record.offset(3)),
            firmware_version: Version::read(buf, record.offset(4)),
        })
    }

    pub fn token_present(&self) -> bool {
        self.flags & CKF_TOKEN_PRESENT as u64 != 0
    }

    pub fn removable_device(&self) -> bool {
        self.flags & CKF_REMOVABLE_DEVICE as u64 != 0
    }

    pub fn hardware_slot(&self) -> bool {
        self.flags & CKF_HW_SLOT as u64 != 0
    }
}

/// `CK_TOKEN_INFO`. Counters are widened to 64 bits as reported; the
/// unavailable-information marker keeps its all-ones value at the module's
/// width.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    pub flags: u64,
    pub max_session_count: u64,
    pub session_count: u64,
    pub max_rw_session_count: u64,
    pub rw_session_count: u64,
    pub max_pin_len: u64,
    pub min_pin_len: u64,
    pub total_public_memory: u64,
    pub free_public_memory: u64,
    pub total_private_memory: u64,
    pub free_private_memory: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
    /// Only set for tokens with their own clock.
    pub utc_time: Option<PrimitiveDateTime>,
}

impl TokenInfo {
    pub fn size(layout: &Layout) -> usize {
        layout.record(TOKEN_INFO).size()
    }

    pub fn decode(layout: &Layout, buf: &[u8]) -> Pkcs11Result<Self> {
        let record = layout.record(TOKEN_INFO);
        let ulong = |field: usize| read_ulong(layout, buf, record.offset(field));
        let flags = ulong(4);
        let utc_time = if flags & CKF_CLOCK_ON_TOKEN as u64 != 0 {
            decode_utc_time(&buf[record.offset(17)..record.offset(17) + 16])?
        } else {
            None
        };
        Ok(Self {
            label: padded(buf, record.offset(0), 32)?,
            manufacturer_id: padded(buf, record.offset(1), 32)?,
            model: padded(buf, record.offset(2), 16)?,
            serial_number: padded(buf, record.offset(3), 16)?,
            flags,
            max_session_count: ulong(5),
            session_count: ulong(6),
            max_rw_session_count: ulong(7),
            rw_session_count: ulong(8),
            max_pin_len: ulong(9),
            min_pin_len: ulong(10),
            total_public_memory: ulong(11),
            free_public_memory: ulong(12),
            total_private_memory: ulong(13),
            free_private_memory: ulong(14),
            hardware_version: Version::read(buf, record.offset(15)),
            firmware_version: Version::read(buf, record.offset(16)),
            utc_time,
        })
    }

    pub fn initialized(&self) -> bool {
        self.flags & CKF_TOKEN_INITIALIZED as u64 != 0
    }

    pub fn login_required(&self) -> bool {
        self.flags & CKF_LOGIN_REQUIRED as u64 != 0
    }

    pub fn user_pin_initialized(&self) -> bool {
        self.flags & CKF_USER_PIN_INITIALIZED as u64 != 0
    }
}

/// `CK_MECHANISM_INFO`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: u64,
    pub max_key_size: u64,
    pub flags: u64,
}

impl MechanismInfo {
    pub fn size(layout: &Layout) -> usize {
        layout.record(MECHANISM_INFO).size()
    }

    pub fn decode(layout: &Layout, buf: &[u8]) -> Self {
        let record = layout.record(MECHANISM_INFO);
        Self {
            min_key_size: read_ulong(layout, buf, record.offset(0)),
            max_key_size: read_ulong(layout, buf, record.offset(1)),
            flags: read_ulong(layout, buf, record.offset(2)),
        }
    }
}

/// `CK_SESSION_INFO`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: u64,
    pub state: u64,
    pub flags: u64,
    pub device_error: u64,
}

impl SessionInfo {
    pub fn size(layout: &Layout) -> usize {
        layout.record(SESSION_INFO).size()
    }

    pub fn decode(layout: &Layout, buf: &[u8]) -> Self {
        let record = layout.record(SESSION_INFO);
        Self {
            slot_id: read_ulong(layout, buf, record.offset(0)),
            state: read_ulong(layout, buf, record.offset(1)),
            flags: read_ulong(layout, buf, record.offset(2)),
            device_error: read_ulong(layout, buf, record.offset(3)),
        }
    }

    pub fn read_write(&self) -> bool {
        self.flags & CKF_RW_SESSION as u64 != 0
    }
}

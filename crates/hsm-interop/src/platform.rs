//! Detection of the native integer width and structure packing a module uses.

use std::ffi::c_ulong;
use std::fmt;
use std::mem::size_of;

use serde::{Deserialize, Serialize};

use crate::error::{Pkcs11Error, Pkcs11Result};

/// Width of `CK_ULONG` as compiled into the native module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum UlongWidth {
    Four,
    Eight,
}

impl UlongWidth {
    pub const fn bytes(self) -> usize {
        match self {
            UlongWidth::Four => 4,
            UlongWidth::Eight => 8,
        }
    }

    pub fn from_bytes(bytes: usize) -> Pkcs11Result<Self> {
        match bytes {
            4 => Ok(UlongWidth::Four),
            8 => Ok(UlongWidth::Eight),
            other => Err(Pkcs11Error::UnsupportedPlatform(format!(
                "{other}-byte CK_ULONG"
            ))),
        }
    }

    /// Width of the host C `unsigned long`.
    pub fn host() -> Self {
        if size_of::<c_ulong>() == 4 {
            UlongWidth::Four
        } else {
            UlongWidth::Eight
        }
    }
}

impl TryFrom<u8> for UlongWidth {
    type Error = Pkcs11Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        UlongWidth::from_bytes(value as usize)
    }
}

impl From<UlongWidth> for u8 {
    fn from(value: UlongWidth) -> Self {
        value.bytes() as u8
    }
}

/// Structure packing convention of the module's headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Packing {
    /// Fields aligned to their natural size, as most Unix builds do.
    #[default]
    Natural,
    /// `#pragma pack(1)`: no padding between or after fields.
    Packed,
}

/// Binary shape of one loaded module. Fixed for the lifetime of the module
/// handle that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlatformProfile {
    ulong_width: UlongWidth,
    packing: Packing,
    pointer_width: usize,
}

impl PlatformProfile {
    /// Profile of the running process. Packing is natural unless the caller
    /// asks for packed structures.
    pub fn detect(packing: Option<Packing>) -> Self {
        Self {
            ulong_width: UlongWidth::host(),
            packing: packing.unwrap_or_default(),
            pointer_width: size_of::<usize>(),
        }
    }

    pub fn new(ulong_bytes: usize, packing: Packing) -> Pkcs11Result<Self> {
        Ok(Self {
            ulong_width: UlongWidth::from_bytes(ulong_bytes)?,
            packing,
            pointer_width: size_of::<usize>(),
        })
    }

    pub fn with_ulong_width(mut self, width: UlongWidth) -> Self {
        self.ulong_width = width;
        self
    }

    pub fn ulong_width(&self) -> UlongWidth {
        self.ulong_width
    }

    pub fn ulong_bytes(&self) -> usize {
        self.ulong_width.bytes()
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    pub fn pointer_width(&self) -> usize {
        self.pointer_width
    }

    /// A module whose `CK_ULONG` is wider than a pointer cannot be loaded
    /// into this process.
    pub fn fits_host(&self) -> bool {
        self.ulong_bytes() <= self.pointer_width
    }
}

impl fmt::Display for PlatformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let packing = match self.packing {
            Packing::Natural => "natural",
            Packing::Packed => "packed",
        };
        write!(
            f,
            "{{{}, {packing}, {}-byte pointers}}",
            self.ulong_bytes(),
            self.pointer_width
        )
    }
}

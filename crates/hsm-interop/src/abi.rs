//! The four ABI variants a module can be built with.
//!
//! Each variant is a zero-sized marker implementing [`Abi`]. Entities are
//! generic over the marker, so a handle obtained through one variant cannot be
//! passed to an entity of another without an explicit conversion.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::layout::Layout;
use crate::platform::{Packing, PlatformProfile, UlongWidth};

/// Native `CK_ULONG` representation for one width.
pub trait NativeUlong:
    Copy + Default + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    const WIDTH: UlongWidth;

    /// Narrowing conversion; fails with [`Pkcs11Error::Range`] when the value
    /// does not fit.
    fn from_u64(value: u64) -> Pkcs11Result<Self>;

    /// Zero-extending conversion.
    fn to_u64(self) -> u64;

    fn from_usize(value: usize) -> Pkcs11Result<Self> {
        Self::from_u64(value as u64)
    }

    fn to_usize(self) -> Pkcs11Result<usize> {
        let value = self.to_u64();
        usize::try_from(value).map_err(|_| Pkcs11Error::Range {
            value,
            width: std::mem::size_of::<usize>(),
        })
    }
}

impl NativeUlong for u32 {
    const WIDTH: UlongWidth = UlongWidth::Four;

    fn from_u64(value: u64) -> Pkcs11Result<Self> {
        u32::try_from(value).map_err(|_| Pkcs11Error::Range { value, width: 4 })
    }

    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl NativeUlong for u64 {
    const WIDTH: UlongWidth = UlongWidth::Eight;

    fn from_u64(value: u64) -> Pkcs11Result<Self> {
        Ok(value)
    }

    fn to_u64(self) -> u64 {
        self
    }
}

/// Runtime tag naming one of the four variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiVariant {
    Ulong32Natural,
    Ulong32Packed,
    Ulong64Natural,
    Ulong64Packed,
}

impl AbiVariant {
    pub const ALL: [AbiVariant; 4] = [
        AbiVariant::Ulong32Natural,
        AbiVariant::Ulong32Packed,
        AbiVariant::Ulong64Natural,
        AbiVariant::Ulong64Packed,
    ];

    /// Pick the variant for a profile. Profiles whose `CK_ULONG` is wider
    /// than a host pointer have no variant in this process.
    pub fn select(profile: &PlatformProfile) -> Pkcs11Result<Self> {
        if !profile.fits_host() {
            return Err(Pkcs11Error::UnsupportedPlatform(profile.to_string()));
        }
        Ok(match (profile.ulong_width(), profile.packing()) {
            (UlongWidth::Four, Packing::Natural) => AbiVariant::Ulong32Natural,
            (UlongWidth::Four, Packing::Packed) => AbiVariant::Ulong32Packed,
            (UlongWidth::Eight, Packing::Natural) => AbiVariant::Ulong64Natural,
            (UlongWidth::Eight, Packing::Packed) => AbiVariant::Ulong64Packed,
        })
    }

    pub fn ulong_width(self) -> UlongWidth {
        match self {
            AbiVariant::Ulong32Natural | AbiVariant::Ulong32Packed => UlongWidth::Four,
            AbiVariant::Ulong64Natural | AbiVariant::Ulong64Packed => UlongWidth::Eight,
        }
    }

    pub fn packing(self) -> Packing {
        match self {
            AbiVariant::Ulong32Natural | AbiVariant::Ulong64Natural => Packing::Natural,
            AbiVariant::Ulong32Packed | AbiVariant::Ulong64Packed => Packing::Packed,
        }
    }

    pub fn profile(self) -> PlatformProfile {
        PlatformProfile::detect(Some(self.packing())).with_ulong_width(self.ulong_width())
    }

    pub fn layout(self) -> Layout {
        Layout::new(&self.profile())
    }
}

impl fmt::Display for AbiVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbiVariant::Ulong32Natural => "ulong32-natural",
            AbiVariant::Ulong32Packed => "ulong32-packed",
            AbiVariant::Ulong64Natural => "ulong64-natural",
            AbiVariant::Ulong64Packed => "ulong64-packed",
        };
        f.write_str(name)
    }
}

/// Compile-time description of one variant.
pub trait Abi: Copy + fmt::Debug + Eq + Hash + Send + Sync + 'static {
    type Ulong: NativeUlong;
    const VARIANT: AbiVariant;

    fn layout() -> Layout {
        Self::VARIANT.layout()
    }
}

macro_rules! abi_marker {
    ($(#[$meta:meta])* $name:ident, $ulong:ty, $variant:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name;

        impl Abi for $name {
            type Ulong = $ulong;
            const VARIANT: AbiVariant = AbiVariant::$variant;
        }
    };
}

abi_marker!(
    /// 4-byte `CK_ULONG`, natural alignment (32-bit Unix builds).
    Ulong32Natural, u32, Ulong32Natural
);
abi_marker!(
    /// 4-byte `CK_ULONG`, packed structures (Windows builds).
    Ulong32Packed, u32, Ulong32Packed
);
abi_marker!(
    /// 8-byte `CK_ULONG`, natural alignment (64-bit Unix builds).
    Ulong64Natural, u64, Ulong64Natural
);
abi_marker!(
    /// 8-byte `CK_ULONG`, packed structures.
    Ulong64Packed, u64, Ulong64Packed
);

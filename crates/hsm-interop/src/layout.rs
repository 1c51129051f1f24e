//! Structure layout descriptor shared by all four ABI variants.
//!
//! Every native structure the bridge exchanges is described once as a list of
//! [`Field`]s. A [`Layout`] built from a [`PlatformProfile`] turns that list
//! into byte offsets and a total size, applying either natural alignment or
//! one-byte packing. This replaces per-variant hand-written `#[repr(C)]`
//! definitions.

use crate::platform::{Packing, PlatformProfile};

/// Shape of a single structure member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    /// `CK_ULONG` and every typedef of it.
    Ulong,
    /// Data or function pointer.
    Pointer,
    /// `CK_BYTE` / `CK_BBOOL`.
    Byte,
    /// Fixed-size character or byte array.
    Bytes(usize),
    /// `CK_VERSION` (two bytes).
    Version,
}

/// Offsets and size of one structure under a given layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    offsets: Vec<usize>,
    size: usize,
}

impl Record {
    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> usize {
        self.offsets.len()
    }
}

/// Layout rules for one platform profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    ulong: usize,
    pointer: usize,
    packing: Packing,
}

impl Layout {
    pub fn new(profile: &PlatformProfile) -> Self {
        Self {
            ulong: profile.ulong_bytes(),
            pointer: profile.pointer_width(),
            packing: profile.packing(),
        }
    }

    pub fn ulong_size(&self) -> usize {
        self.ulong
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    /// `CK_UNAVAILABLE_INFORMATION` at the active width.
    pub fn unavailable(&self) -> u64 {
        if self.ulong == 4 {
            u32::MAX as u64
        } else {
            u64::MAX
        }
    }

    fn size_and_align(&self, field: Field) -> (usize, usize) {
        let (size, natural) = match field {
            Field::Ulong => (self.ulong, self.ulong),
            Field::Pointer => (self.pointer, self.pointer),
            Field::Byte => (1, 1),
            Field::Bytes(len) => (len, 1),
            Field::Version => (2, 1),
        };
        match self.packing {
            Packing::Natural => (size, natural),
            Packing::Packed => (size, 1),
        }
    }

    pub fn record(&self, fields: &[Field]) -> Record {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut cursor = 0usize;
        let mut max_align = 1usize;
        for field in fields {
            let (size, align) = self.size_and_align(*field);
            cursor = cursor.next_multiple_of(align);
            offsets.push(cursor);
            cursor += size;
            max_align = max_align.max(align);
        }
        Record {
            offsets,
            size: cursor.next_multiple_of(max_align),
        }
    }

    pub fn attribute(&self) -> Record {
        self.record(ATTRIBUTE)
    }

    pub fn mechanism(&self) -> Record {
        self.record(MECHANISM)
    }

    pub fn function_list(&self) -> Record {
        let mut fields = Vec::with_capacity(FUNCTION_LIST_ENTRIES + 1);
        fields.push(Field::Version);
        fields.extend(std::iter::repeat_n(Field::Pointer, FUNCTION_LIST_ENTRIES));
        self.record(&fields)
    }
}

/// Number of entry points in a v2.40 `CK_FUNCTION_LIST`.
pub const FUNCTION_LIST_ENTRIES: usize = 68;

/// Width of the token label field passed to `C_InitToken`.
pub const LABEL_LEN: usize = 32;

/// `CK_ATTRIBUTE { type, pValue, ulValueLen }`
pub const ATTRIBUTE: &[Field] = &[Field::Ulong, Field::Pointer, Field::Ulong];

/// `CK_MECHANISM { mechanism, pParameter, ulParameterLen }`
pub const MECHANISM: &[Field] = &[Field::Ulong, Field::Pointer, Field::Ulong];

pub const INFO: &[Field] = &[
    Field::Version,
    Field::Bytes(32),
    Field::Ulong,
    Field::Bytes(32),
    Field::Version,
];

pub const SLOT_INFO: &[Field] = &[
    Field::Bytes(64),
    Field::Bytes(32),
    Field::Ulong,
    Field::Version,
    Field::Version,
];

pub const TOKEN_INFO: &[Field] = &[
    Field::Bytes(32),
    Field::Bytes(32),
    Field::Bytes(16),
    Field::Bytes(16),
    // flags, then the ten counters from ulMaxSessionCount to ulFreePrivateMemory
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Version,
    Field::Version,
    Field::Bytes(16),
];

pub const MECHANISM_INFO: &[Field] = &[Field::Ulong, Field::Ulong, Field::Ulong];

pub const SESSION_INFO: &[Field] = &[Field::Ulong, Field::Ulong, Field::Ulong, Field::Ulong];

/// `CK_C_INITIALIZE_ARGS`: four mutex callbacks, flags, reserved.
pub const INITIALIZE_ARGS: &[Field] = &[
    Field::Pointer,
    Field::Pointer,
    Field::Pointer,
    Field::Pointer,
    Field::Ulong,
    Field::Pointer,
];

/// `CK_KEY_DERIVATION_STRING_DATA { pData, ulLen }`
pub const KEY_DERIVATION_STRING_DATA: &[Field] = &[Field::Pointer, Field::Ulong];

/// `CK_ECDH1_DERIVE_PARAMS`
pub const ECDH1_DERIVE_PARAMS: &[Field] = &[
    Field::Ulong,
    Field::Ulong,
    Field::Pointer,
    Field::Ulong,
    Field::Pointer,
];

/// `CK_SSL3_KEY_MAT_PARAMS` with its embedded `CK_SSL3_RANDOM_DATA` flattened.
/// The embedded struct starts with a pointer, so flattening yields the same
/// offsets as nesting under both packings.
pub const SSL3_KEY_MAT_PARAMS: &[Field] = &[
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Byte,
    Field::Pointer,
    Field::Ulong,
    Field::Pointer,
    Field::Ulong,
    Field::Pointer,
];

/// `CK_SSL3_KEY_MAT_OUT`
pub const SSL3_KEY_MAT_OUT: &[Field] = &[
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Ulong,
    Field::Pointer,
    Field::Pointer,
];

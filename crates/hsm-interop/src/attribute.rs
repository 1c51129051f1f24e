//! Object attributes and their native `CK_ATTRIBUTE` templates.
//!
//! [`ObjectAttribute`] is the owned, layout-independent form. A
//! [`NativeTemplate`] is the same list laid out for one profile, together with
//! every value buffer its records point into; it must outlive the native call
//! it is passed to.

use std::ffi::c_void;
use std::fmt;

use cryptoki_sys::{
    CKA_ALLOWED_MECHANISMS, CKA_APPLICATION, CKA_CLASS, CKA_DECRYPT, CKA_DERIVE,
    CKA_DERIVE_TEMPLATE, CKA_ENCRYPT, CKA_END_DATE, CKA_EXTRACTABLE, CKA_ID, CKA_KEY_TYPE,
    CKA_LABEL, CKA_MODIFIABLE, CKA_PRIVATE, CKA_SENSITIVE, CKA_SIGN, CKA_START_DATE, CKA_TOKEN,
    CKA_UNWRAP, CKA_UNWRAP_TEMPLATE, CKA_VALUE, CKA_VALUE_LEN, CKA_VERIFY, CKA_WRAP,
    CKA_WRAP_TEMPLATE, CKF_ARRAY_ATTRIBUTE,
};
use time::Date;

use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::layout::{Layout, Record};
use crate::marshal::{
    NativeBuffer, decode_bool, decode_date, decode_ulong, decode_ulong_list, decode_utf8,
    encode_bool, encode_date, encode_padded, encode_ulong, encode_ulong_list, read_ulong,
    write_pointer, write_ulong,
};
use crate::mechanism::MechanismType;

/// `CK_ATTRIBUTE_TYPE`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeType(u64);

impl AttributeType {
    pub const CLASS: Self = Self(CKA_CLASS as u64);
    pub const TOKEN: Self = Self(CKA_TOKEN as u64);
    pub const PRIVATE: Self = Self(CKA_PRIVATE as u64);
    pub const LABEL: Self = Self(CKA_LABEL as u64);
    pub const APPLICATION: Self = Self(CKA_APPLICATION as u64);
    pub const VALUE: Self = Self(CKA_VALUE as u64);
    pub const KEY_TYPE: Self = Self(CKA_KEY_TYPE as u64);
    pub const ID: Self = Self(CKA_ID as u64);
    pub const SENSITIVE: Self = Self(CKA_SENSITIVE as u64);
    pub const ENCRYPT: Self = Self(CKA_ENCRYPT as u64);
    pub const DECRYPT: Self = Self(CKA_DECRYPT as u64);
    pub const WRAP: Self = Self(CKA_WRAP as u64);
    pub const UNWRAP: Self = Self(CKA_UNWRAP as u64);
    pub const SIGN: Self = Self(CKA_SIGN as u64);
    pub const VERIFY: Self = Self(CKA_VERIFY as u64);
    pub const DERIVE: Self = Self(CKA_DERIVE as u64);
    pub const START_DATE: Self = Self(CKA_START_DATE as u64);
    pub const END_DATE: Self = Self(CKA_END_DATE as u64);
    pub const VALUE_LEN: Self = Self(CKA_VALUE_LEN as u64);
    pub const EXTRACTABLE: Self = Self(CKA_EXTRACTABLE as u64);
    pub const MODIFIABLE: Self = Self(CKA_MODIFIABLE as u64);
    pub const WRAP_TEMPLATE: Self = Self(CKA_WRAP_TEMPLATE as u64);
    pub const UNWRAP_TEMPLATE: Self = Self(CKA_UNWRAP_TEMPLATE as u64);
    pub const DERIVE_TEMPLATE: Self = Self(CKA_DERIVE_TEMPLATE as u64);
    pub const ALLOWED_MECHANISMS: Self = Self(CKA_ALLOWED_MECHANISMS as u64);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Attributes whose value is itself an attribute template.
    /// `CKA_ALLOWED_MECHANISMS` carries the array flag but holds mechanism
    /// types.
    pub fn is_array(self) -> bool {
        self.0 & CKF_ARRAY_ATTRIBUTE as u64 != 0 && self != Self::ALLOWED_MECHANISMS
    }
}

impl From<u64> for AttributeType {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Typed attribute value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    Empty,
    Ulong(u64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Date(Date),
    AttributeArray(Vec<ObjectAttribute>),
    UlongArray(Vec<u64>),
    MechanismArray(Vec<MechanismType>),
}

/// How to interpret the bytes of an attribute being read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeKind {
    Ulong,
    Bool,
    String,
    Bytes,
    Date,
    AttributeArray,
    UlongArray,
    MechanismArray,
}

impl AttributeKind {
    /// Kind of the standard attributes this crate names. Anything else reads
    /// back as raw bytes.
    pub fn of(attribute_type: AttributeType) -> Self {
        match attribute_type {
            AttributeType::CLASS | AttributeType::KEY_TYPE | AttributeType::VALUE_LEN => {
                AttributeKind::Ulong
            }
            AttributeType::TOKEN
            | AttributeType::PRIVATE
            | AttributeType::SENSITIVE
            | AttributeType::ENCRYPT
            | AttributeType::DECRYPT
            | AttributeType::WRAP
            | AttributeType::UNWRAP
            | AttributeType::SIGN
            | AttributeType::VERIFY
            | AttributeType::DERIVE
            | AttributeType::EXTRACTABLE
            | AttributeType::MODIFIABLE => AttributeKind::Bool,
            AttributeType::LABEL | AttributeType::APPLICATION => AttributeKind::String,
            AttributeType::START_DATE | AttributeType::END_DATE => AttributeKind::Date,
            AttributeType::ALLOWED_MECHANISMS => AttributeKind::MechanismArray,
            other if other.is_array() => AttributeKind::AttributeArray,
            _ => AttributeKind::Bytes,
        }
    }

    /// Kind of an element inside a nested template. Only one level of
    /// nesting is read, so a template inside a template stays raw bytes.
    fn of_element(attribute_type: AttributeType) -> Self {
        match Self::of(attribute_type) {
            AttributeKind::AttributeArray => AttributeKind::Bytes,
            kind => kind,
        }
    }
}

/// One `(type, value)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectAttribute {
    attribute_type: AttributeType,
    value: AttributeValue,
    cannot_be_read: bool,
}

impl ObjectAttribute {
    pub fn new(attribute_type: AttributeType, value: AttributeValue) -> Self {
        Self {
            attribute_type,
            value,
            cannot_be_read: false,
        }
    }

    pub fn empty(attribute_type: AttributeType) -> Self {
        Self::new(attribute_type, AttributeValue::Empty)
    }

    pub fn ulong(attribute_type: AttributeType, value: u64) -> Self {
        Self::new(attribute_type, AttributeValue::Ulong(value))
    }

    pub fn bool(attribute_type: AttributeType, value: bool) -> Self {
        Self::new(attribute_type, AttributeValue::Bool(value))
    }

    pub fn string(attribute_type: AttributeType, value: impl Into<String>) -> Self {
        Self::new(attribute_type, AttributeValue::String(value.into()))
    }

    /// String value right-padded with blanks to `width` bytes.
    pub fn padded_string(
        attribute_type: AttributeType,
        value: &str,
        width: usize,
    ) -> Pkcs11Result<Self> {
        let padded = encode_padded(value, width)?;
        Ok(Self::new(attribute_type, AttributeValue::String(decode_utf8(&padded)?)))
    }

    pub fn bytes(attribute_type: AttributeType, value: impl Into<Vec<u8>>) -> Self {
        Self::new(attribute_type, AttributeValue::Bytes(value.into()))
    }

    pub fn date(attribute_type: AttributeType, value: Date) -> Self {
        Self::new(attribute_type, AttributeValue::Date(value))
    }

    pub fn attribute_array(attribute_type: AttributeType, value: Vec<ObjectAttribute>) -> Self {
        Self::new(attribute_type, AttributeValue::AttributeArray(value))
    }

    pub fn ulong_array(attribute_type: AttributeType, value: Vec<u64>) -> Self {
        Self::new(attribute_type, AttributeValue::UlongArray(value))
    }

    pub fn mechanism_array(attribute_type: AttributeType, value: Vec<MechanismType>) -> Self {
        Self::new(attribute_type, AttributeValue::MechanismArray(value))
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.attribute_type
    }

    pub fn value(&self) -> &AttributeValue {
        &self.value
    }

    pub fn into_value(self) -> AttributeValue {
        self.value
    }

    /// Set when the module reported the value as sensitive or the type as
    /// unknown to the object.
    pub fn cannot_be_read(&self) -> bool {
        self.cannot_be_read
    }

    pub fn as_ulong(&self) -> Option<u64> {
        match self.value {
            AttributeValue::Ulong(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            AttributeValue::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            AttributeValue::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self.value {
            AttributeValue::Date(value) => Some(value),
            _ => None,
        }
    }

    fn unreadable(attribute_type: AttributeType) -> Self {
        Self {
            attribute_type,
            value: AttributeValue::Empty,
            cannot_be_read: true,
        }
    }
}

fn decode_value(
    layout: &Layout,
    kind: AttributeKind,
    bytes: &[u8],
) -> Pkcs11Result<AttributeValue> {
    if bytes.is_empty() {
        return Ok(AttributeValue::Empty);
    }
    Ok(match kind {
        AttributeKind::Ulong => AttributeValue::Ulong(decode_ulong(layout, bytes)?),
        AttributeKind::Bool => AttributeValue::Bool(decode_bool(bytes)?),
        AttributeKind::String => AttributeValue::String(decode_utf8(bytes)?),
        AttributeKind::Bytes => AttributeValue::Bytes(bytes.to_vec()),
        AttributeKind::Date => AttributeValue::Date(decode_date(bytes)?),
        AttributeKind::UlongArray => AttributeValue::UlongArray(decode_ulong_list(layout, bytes)?),
        AttributeKind::MechanismArray => AttributeValue::MechanismArray(
            decode_ulong_list(layout, bytes)?
                .into_iter()
                .map(MechanismType::new)
                .collect(),
        ),
        AttributeKind::AttributeArray => {
            return Err(Pkcs11Error::invalid(
                "attribute arrays are decoded from their nested template",
            ));
        }
    })
}

/// A `CK_ATTRIBUTE` array laid out for one profile, owning every buffer its
/// records reference.
#[derive(Debug)]
pub struct NativeTemplate {
    layout: Layout,
    record: Record,
    records: NativeBuffer,
    values: Vec<NativeBuffer>,
    nested: Vec<Option<NativeTemplate>>,
    /// Buffer length handed to the module per entry; `None` while probing.
    supplied: Vec<Option<u64>>,
}

impl NativeTemplate {
    fn zeroed(layout: &Layout, count: usize) -> Self {
        let record = layout.attribute();
        Self {
            layout: *layout,
            records: NativeBuffer::zeroed(record.size() * count),
            record,
            values: vec![NativeBuffer::default(); count],
            nested: (0..count).map(|_| None).collect(),
            supplied: vec![None; count],
        }
    }

    /// Template for creating objects or setting values.
    pub fn encode(layout: &Layout, attributes: &[ObjectAttribute]) -> Pkcs11Result<Self> {
        let mut template = Self::zeroed(layout, attributes.len());
        for (index, attribute) in attributes.iter().enumerate() {
            template.set_type(index, attribute.attribute_type.value())?;
            let bytes = match &attribute.value {
                AttributeValue::Empty => Vec::new(),
                AttributeValue::Ulong(value) => encode_ulong(layout, *value)?,
                AttributeValue::Bool(value) => encode_bool(*value).to_vec(),
                AttributeValue::String(value) => value.as_bytes().to_vec(),
                AttributeValue::Bytes(value) => value.clone(),
                AttributeValue::Date(value) => encode_date(*value)?.to_vec(),
                AttributeValue::UlongArray(values) => encode_ulong_list(layout, values)?,
                AttributeValue::MechanismArray(values) => {
                    let raw: Vec<u64> = values.iter().map(|m| m.value()).collect();
                    encode_ulong_list(layout, &raw)?
                }
                AttributeValue::AttributeArray(items) => {
                    template.set_nested(index, Self::encode(layout, items)?)?;
                    continue;
                }
            };
            template.set_value(index, NativeBuffer::from_bytes(&bytes))?;
        }
        Ok(template)
    }

    /// Template with null values, used to ask the module for value lengths.
    pub fn probe(layout: &Layout, types: &[AttributeType]) -> Pkcs11Result<Self> {
        let mut template = Self::zeroed(layout, types.len());
        for (index, attribute_type) in types.iter().enumerate() {
            template.set_type(index, attribute_type.value())?;
        }
        Ok(template)
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.records.as_mut_ptr()
    }

    pub fn attribute_type(&self, index: usize) -> AttributeType {
        AttributeType(read_ulong(&self.layout, self.records.as_bytes(), self.offset(index, 0)))
    }

    pub fn value_len(&self, index: usize) -> u64 {
        read_ulong(&self.layout, self.records.as_bytes(), self.offset(index, 2))
    }

    fn offset(&self, index: usize, field: usize) -> usize {
        index * self.record.size() + self.record.offset(field)
    }

    fn set_type(&mut self, index: usize, value: u64) -> Pkcs11Result<()> {
        let offset = self.offset(index, 0);
        write_ulong(&self.layout, self.records.as_bytes_mut(), offset, value)
    }

    fn set_entry(&mut self, index: usize, pointer: *const c_void, len: usize) -> Pkcs11Result<()> {
        let pointer_offset = self.offset(index, 1);
        let len_offset = self.offset(index, 2);
        write_pointer(self.records.as_bytes_mut(), pointer_offset, pointer);
        write_ulong(&self.layout, self.records.as_bytes_mut(), len_offset, len as u64)?;
        self.supplied[index] = Some(len as u64);
        Ok(())
    }

    fn set_value(&mut self, index: usize, value: NativeBuffer) -> Pkcs11Result<()> {
        self.set_entry(index, value.as_ptr(), value.len())?;
        self.values[index] = value;
        Ok(())
    }

    fn set_nested(&mut self, index: usize, nested: NativeTemplate) -> Pkcs11Result<()> {
        self.set_entry(index, nested.records.as_ptr(), nested.records.len())?;
        self.nested[index] = Some(nested);
        Ok(())
    }

    fn is_unavailable(&self, index: usize) -> bool {
        self.value_len(index) == self.layout.unavailable()
    }

    /// Allocate value buffers of the lengths the module reported on the
    /// probe call. Array attributes receive a zeroed nested template of the
    /// reported element count. Returns whether any nested template was
    /// allocated and so needs [`Self::allocate_nested`] and another call.
    pub fn allocate(&mut self, kinds: &[AttributeKind]) -> Pkcs11Result<bool> {
        let layout = self.layout;
        let mut has_nested = false;
        for (index, kind) in kinds.iter().enumerate() {
            // left as probed: null pointer, unavailable length
            if self.is_unavailable(index) {
                continue;
            }
            let len = usize::try_from(self.value_len(index)).map_err(Pkcs11Error::invalid)?;
            if *kind == AttributeKind::AttributeArray && len > 0 {
                if len % self.record.size() != 0 {
                    return Err(Pkcs11Error::encoding(format!(
                        "nested template of {len} bytes is not a whole number of {}-byte records",
                        self.record.size()
                    )));
                }
                let elements = len / self.record.size();
                self.set_nested(index, Self::zeroed(&layout, elements))?;
                has_nested = true;
            } else {
                self.set_value(index, NativeBuffer::zeroed(len))?;
            }
        }
        Ok(has_nested)
    }

    /// Allocate the value buffers of nested templates once their element
    /// types and lengths are known.
    pub fn allocate_nested(&mut self) -> Pkcs11Result<()> {
        for nested in self.nested.iter_mut().flatten() {
            let kinds = nested.element_kinds();
            nested.allocate(&kinds)?;
        }
        Ok(())
    }

    /// Kinds of a nested template's elements, from the types the module
    /// wrote into its records.
    fn element_kinds(&self) -> Vec<AttributeKind> {
        (0..self.count())
            .map(|index| AttributeKind::of_element(self.attribute_type(index)))
            .collect()
    }

    /// First entry the module could not fit into the buffer it was given,
    /// with the length that was supplied for it.
    pub fn overflow(&self) -> Option<(AttributeType, u64)> {
        (0..self.count()).find_map(|index| {
            let supplied = self.supplied[index]?;
            let reported = self.value_len(index);
            (reported == self.layout.unavailable() || reported > supplied)
                .then(|| (self.attribute_type(index), supplied))
        })
    }

    fn value_bytes(&self, index: usize) -> &[u8] {
        let reported = self.value_len(index) as usize;
        let buffer = self.values[index].as_bytes();
        &buffer[..reported.min(buffer.len())]
    }

    /// Read the filled template back. `kinds` must line up with the types the
    /// template was built from.
    pub fn decode(&self, kinds: &[AttributeKind]) -> Pkcs11Result<Vec<ObjectAttribute>> {
        let mut out = Vec::with_capacity(self.count());
        for (index, kind) in kinds.iter().enumerate() {
            let attribute_type = self.attribute_type(index);
            if self.is_unavailable(index) {
                out.push(ObjectAttribute::unreadable(attribute_type));
                continue;
            }
            let value = match (&self.nested[index], kind) {
                (Some(nested), AttributeKind::AttributeArray) => {
                    AttributeValue::AttributeArray(nested.decode(&nested.element_kinds())?)
                }
                _ => decode_value(&self.layout, *kind, self.value_bytes(index))?,
            };
            out.push(ObjectAttribute::new(attribute_type, value));
        }
        Ok(out)
    }

    /// Pointer stored in a record, for inspection in tests.
    #[cfg(test)]
    fn pointer_at(&self, index: usize) -> *mut c_void {
        crate::marshal::read_pointer(self.records.as_bytes(), self.offset(index, 1))
    }
}

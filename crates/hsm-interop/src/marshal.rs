//! Conversion of typed values to and from the native byte layout of the
//! active profile.
//!
//! Nothing here keeps state between calls. Functions that depend on the
//! `CK_ULONG` width take the [`Layout`] of the module they marshal for.

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use cryptoki_sys::CKR_BUFFER_TOO_SMALL;
use time::{Date, Month, PrimitiveDateTime, Time};

use crate::error::{Pkcs11Error, Pkcs11Result, check_rv};
use crate::layout::Layout;

/// Heap buffer handed to native code.
///
/// Backed by `u64` words so any structure placed at offset zero is suitably
/// aligned for natural layouts. The heap allocation never moves once created,
/// which keeps pointers into it valid while the owning value is moved around.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NativeBuffer {
    words: Vec<u64>,
    len: usize,
}

impl NativeBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(size_of::<u64>())],
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.as_bytes_mut().copy_from_slice(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the borrow is unique.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    /// Pointer for native input parameters; null when empty.
    pub fn as_ptr(&self) -> *const c_void {
        if self.is_empty() {
            ptr::null()
        } else {
            self.words.as_ptr().cast()
        }
    }

    /// Pointer for native output parameters; null when empty.
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        if self.is_empty() {
            ptr::null_mut()
        } else {
            self.words.as_mut_ptr().cast()
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

fn check_ulong(layout: &Layout, value: u64) -> Pkcs11Result<()> {
    if layout.ulong_size() == 4 && value > u32::MAX as u64 {
        return Err(Pkcs11Error::Range { value, width: 4 });
    }
    Ok(())
}

/// Store `value` at `offset` using the profile's `CK_ULONG` width.
pub fn write_ulong(layout: &Layout, buf: &mut [u8], offset: usize, value: u64) -> Pkcs11Result<()> {
    check_ulong(layout, value)?;
    match layout.ulong_size() {
        4 => buf[offset..offset + 4].copy_from_slice(&(value as u32).to_ne_bytes()),
        _ => buf[offset..offset + 8].copy_from_slice(&value.to_ne_bytes()),
    }
    Ok(())
}

pub fn read_ulong(layout: &Layout, buf: &[u8], offset: usize) -> u64 {
    match layout.ulong_size() {
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&buf[offset..offset + 4]);
            u32::from_ne_bytes(raw) as u64
        }
        _ => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[offset..offset + 8]);
            u64::from_ne_bytes(raw)
        }
    }
}

/// Pointers always have the host width.
pub fn write_pointer(buf: &mut [u8], offset: usize, value: *const c_void) {
    let raw = (value as usize).to_ne_bytes();
    buf[offset..offset + raw.len()].copy_from_slice(&raw);
}

pub fn read_pointer(buf: &[u8], offset: usize) -> *mut c_void {
    let mut raw = [0u8; size_of::<usize>()];
    raw.copy_from_slice(&buf[offset..offset + size_of::<usize>()]);
    usize::from_ne_bytes(raw) as *mut c_void
}

pub fn encode_ulong(layout: &Layout, value: u64) -> Pkcs11Result<Vec<u8>> {
    let mut out = vec![0u8; layout.ulong_size()];
    write_ulong(layout, &mut out, 0, value)?;
    Ok(out)
}

pub fn decode_ulong(layout: &Layout, bytes: &[u8]) -> Pkcs11Result<u64> {
    if bytes.len() != layout.ulong_size() {
        return Err(Pkcs11Error::encoding(format!(
            "expected {} bytes for CK_ULONG, got {}",
            layout.ulong_size(),
            bytes.len()
        )));
    }
    Ok(read_ulong(layout, bytes, 0))
}

pub fn encode_bool(value: bool) -> [u8; 1] {
    [value as u8]
}

pub fn decode_bool(bytes: &[u8]) -> Pkcs11Result<bool> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        [other] => Err(Pkcs11Error::encoding(format!("CK_BBOOL byte {other:#04x}"))),
        _ => Err(Pkcs11Error::encoding(format!(
            "expected 1 byte for CK_BBOOL, got {}",
            bytes.len()
        ))),
    }
}

pub fn decode_utf8(bytes: &[u8]) -> Pkcs11Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(Pkcs11Error::encoding)
}

/// Right-pad `value` with blanks to exactly `width` bytes.
pub fn encode_padded(value: &str, width: usize) -> Pkcs11Result<Vec<u8>> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(Pkcs11Error::ValueTooLarge {
            length: bytes.len(),
            limit: width,
        });
    }
    let mut out = vec![b' '; width];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Decode a blank-padded field. Trailing blanks are dropped, so a value that
/// ended in spaces before encoding does not survive the round trip.
pub fn decode_padded(bytes: &[u8]) -> Pkcs11Result<String> {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ')
        .map_or(0, |pos| pos + 1);
    decode_utf8(&bytes[..end])
}

fn digits(bytes: &[u8]) -> Pkcs11Result<u32> {
    bytes.iter().try_fold(0u32, |acc, &b| {
        if b.is_ascii_digit() {
            Ok(acc * 10 + (b - b'0') as u32)
        } else {
            Err(Pkcs11Error::encoding(format!("non-digit byte {b:#04x} in date")))
        }
    })
}

fn calendar_date(bytes: &[u8]) -> Pkcs11Result<Date> {
    let year = digits(&bytes[0..4])? as i32;
    let month = Month::try_from(digits(&bytes[4..6])? as u8).map_err(Pkcs11Error::encoding)?;
    let day = digits(&bytes[6..8])? as u8;
    Date::from_calendar_date(year, month, day).map_err(Pkcs11Error::encoding)
}

/// `CK_DATE`: eight ASCII digits, `YYYYMMDD`.
pub fn encode_date(date: Date) -> Pkcs11Result<[u8; 8]> {
    let year = date.year();
    if !(0..=9999).contains(&year) {
        return Err(Pkcs11Error::ValueTooLarge {
            length: format!("{year:+05}").len(),
            limit: 4,
        });
    }
    let text = format!("{year:04}{:02}{:02}", u8::from(date.month()), date.day());
    let mut out = [0u8; 8];
    out.copy_from_slice(text.as_bytes());
    Ok(out)
}

pub fn decode_date(bytes: &[u8]) -> Pkcs11Result<Date> {
    if bytes.len() != 8 {
        return Err(Pkcs11Error::encoding(format!(
            "expected 8 bytes for CK_DATE, got {}",
            bytes.len()
        )));
    }
    calendar_date(bytes)
}

/// Token `utcTime`: `YYYYMMDDhhmmss` followed by two reserved characters.
/// An all-blank or all-zero field means the token has no clock value.
pub fn decode_utc_time(bytes: &[u8]) -> Pkcs11Result<Option<PrimitiveDateTime>> {
    if bytes.len() < 14 {
        return Err(Pkcs11Error::encoding("utcTime shorter than 14 bytes"));
    }
    if bytes.iter().all(|&b| b == b' ' || b == 0 || b == b'0') {
        return Ok(None);
    }
    let date = calendar_date(&bytes[0..8])?;
    let time = Time::from_hms(
        digits(&bytes[8..10])? as u8,
        digits(&bytes[10..12])? as u8,
        digits(&bytes[12..14])? as u8,
    )
    .map_err(Pkcs11Error::encoding)?;
    Ok(Some(PrimitiveDateTime::new(date, time)))
}

/// Contiguous array of `CK_ULONG`.
pub fn encode_ulong_list(layout: &Layout, values: &[u64]) -> Pkcs11Result<Vec<u8>> {
    let width = layout.ulong_size();
    let mut out = vec![0u8; values.len() * width];
    for (index, value) in values.iter().enumerate() {
        write_ulong(layout, &mut out, index * width, *value)?;
    }
    Ok(out)
}

pub fn decode_ulong_list(layout: &Layout, bytes: &[u8]) -> Pkcs11Result<Vec<u64>> {
    let width = layout.ulong_size();
    if bytes.len() % width != 0 {
        return Err(Pkcs11Error::encoding(format!(
            "{} bytes is not a whole number of {width}-byte elements",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(width)
        .map(|chunk| read_ulong(layout, chunk, 0))
        .collect())
}

/// Two-call length protocol for variable-length outputs.
///
/// `call` receives `None` and a zeroed length to report the required element
/// count, then a buffer of exactly that many elements with the length set to
/// its capacity. A module that returns fewer elements on the second call has
/// its output truncated to the returned count.
pub fn probe_then_fetch<T, F>(operation: &'static str, mut call: F) -> Pkcs11Result<Vec<T>>
where
    T: Clone + Default,
    F: FnMut(Option<&mut [T]>, &mut u64) -> Pkcs11Result<u64>,
{
    let mut required = 0u64;
    let rv = call(None, &mut required)?;
    check_rv(operation, rv)?;
    if required == 0 {
        return Ok(Vec::new());
    }

    let capacity = usize::try_from(required).map_err(|_| Pkcs11Error::Range {
        value: required,
        width: size_of::<usize>(),
    })?;
    let mut buf = vec![T::default(); capacity];
    let mut returned = required;
    let rv = call(Some(&mut buf), &mut returned)?;
    if rv == CKR_BUFFER_TOO_SMALL as u64 || returned > required {
        return Err(Pkcs11Error::LengthMismatch {
            operation,
            required: returned,
            supplied: required,
        });
    }
    check_rv(operation, rv)?;
    buf.truncate(returned as usize);
    Ok(buf)
}

//! Typed view of a module's `CK_FUNCTION_LIST`.
//!
//! The table is read once at load time from the raw bytes at the offsets of
//! the active layout. Entry points take every `CK_ULONG` (handles, counts,
//! flags, return values) as the variant's native integer `U`; pointer and
//! byte arguments are layout independent.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use crate::abi::NativeUlong;
use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::info::Version;
use crate::layout::{FUNCTION_LIST_ENTRIES, Layout};

/// Entry point names in `CK_FUNCTION_LIST` order.
pub const ENTRY_POINTS: [&str; FUNCTION_LIST_ENTRIES] = [
    "C_Initialize",
    "C_Finalize",
    "C_GetInfo",
    "C_GetFunctionList",
    "C_GetSlotList",
    "C_GetSlotInfo",
    "C_GetTokenInfo",
    "C_GetMechanismList",
    "C_GetMechanismInfo",
    "C_InitToken",
    "C_InitPIN",
    "C_SetPIN",
    "C_OpenSession",
    "C_CloseSession",
    "C_CloseAllSessions",
    "C_GetSessionInfo",
    "C_GetOperationState",
    "C_SetOperationState",
    "C_Login",
    "C_Logout",
    "C_CreateObject",
    "C_CopyObject",
    "C_DestroyObject",
    "C_GetObjectSize",
    "C_GetAttributeValue",
    "C_SetAttributeValue",
    "C_FindObjectsInit",
    "C_FindObjects",
    "C_FindObjectsFinal",
    "C_EncryptInit",
    "C_Encrypt",
    "C_EncryptUpdate",
    "C_EncryptFinal",
    "C_DecryptInit",
    "C_Decrypt",
    "C_DecryptUpdate",
    "C_DecryptFinal",
    "C_DigestInit",
    "C_Digest",
    "C_DigestUpdate",
    "C_DigestKey",
    "C_DigestFinal",
    "C_SignInit",
    "C_Sign",
    "C_SignUpdate",
    "C_SignFinal",
    "C_SignRecoverInit",
    "C_SignRecover",
    "C_VerifyInit",
    "C_Verify",
    "C_VerifyUpdate",
    "C_VerifyFinal",
    "C_VerifyRecoverInit",
    "C_VerifyRecover",
    "C_DigestEncryptUpdate",
    "C_DecryptDigestUpdate",
    "C_SignEncryptUpdate",
    "C_DecryptVerifyUpdate",
    "C_GenerateKey",
    "C_GenerateKeyPair",
    "C_WrapKey",
    "C_UnwrapKey",
    "C_DeriveKey",
    "C_SeedRandom",
    "C_GenerateRandom",
    "C_GetFunctionStatus",
    "C_CancelFunction",
    "C_WaitForSlotEvent",
];

/// Position of `name` in the function list.
pub fn entry_index(name: &str) -> Option<usize> {
    ENTRY_POINTS.iter().position(|entry| *entry == name)
}

/// Raw entry points of one module, interpreted with `CK_ULONG = U`.
pub struct FunctionList<U> {
    version: Version,
    entries: [*const c_void; FUNCTION_LIST_ENTRIES],
    _ulong: PhantomData<fn() -> U>,
}

// SAFETY: the entries are addresses of code in a loaded library and are never
// written after construction.
unsafe impl<U> Send for FunctionList<U> {}
unsafe impl<U> Sync for FunctionList<U> {}

impl<U> std::fmt::Debug for FunctionList<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = self.entries.iter().filter(|entry| !entry.is_null()).count();
        f.debug_struct("FunctionList")
            .field("version", &self.version)
            .field("entries", &present)
            .finish()
    }
}

impl<U: NativeUlong> FunctionList<U> {
    /// Read a `CK_FUNCTION_LIST` laid out according to `layout`.
    ///
    /// # Safety
    /// `list` must point to a function list of at least
    /// `layout.function_list().size()` readable bytes.
    pub unsafe fn read(list: *const u8, layout: &Layout) -> Self {
        let record = layout.function_list();
        // SAFETY: the caller guarantees the whole record is readable.
        let (major, minor) = unsafe { (*list, *list.add(1)) };
        let mut entries = [ptr::null(); FUNCTION_LIST_ENTRIES];
        for (index, entry) in entries.iter_mut().enumerate() {
            let offset = record.offset(index + 1);
            // SAFETY: within the record; packed layouts may leave the pointer
            // unaligned.
            *entry = unsafe { ptr::read_unaligned(list.add(offset).cast::<*const c_void>()) };
        }
        Self::from_entries(Version { major, minor }, entries)
    }

    pub fn from_entries(version: Version, entries: [*const c_void; FUNCTION_LIST_ENTRIES]) -> Self {
        Self {
            version,
            entries,
            _ulong: PhantomData,
        }
    }

    /// Cryptoki version the module reports in its function list.
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_present(&self, name: &str) -> bool {
        entry_index(name).is_some_and(|index| !self.entries[index].is_null())
    }

    fn entry<F: Copy>(&self, index: usize) -> Pkcs11Result<F> {
        let raw = self.entries[index];
        if raw.is_null() {
            return Err(Pkcs11Error::not_supported(ENTRY_POINTS[index]));
        }
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*const c_void>());
        // SAFETY: `F` is always an `extern "C"` function pointer type matching
        // the Cryptoki prototype of the entry at `index`.
        Ok(unsafe { mem::transmute_copy::<*const c_void, F>(&raw) })
    }
}

macro_rules! typed_entries {
    ($( $method:ident = $index:literal : fn($($arg:ty),* $(,)?); )*) => {
        impl<U: NativeUlong> FunctionList<U> {
            $(
                pub fn $method(&self) -> Pkcs11Result<unsafe extern "C" fn($($arg),*) -> U> {
                    self.entry($index)
                }
            )*
        }
    };
}

typed_entries! {
    initialize = 0: fn(*mut c_void);
    finalize = 1: fn(*mut c_void);
    get_info = 2: fn(*mut c_void);
    get_slot_list = 4: fn(u8, *mut U, *mut U);
    get_slot_info = 5: fn(U, *mut c_void);
    get_token_info = 6: fn(U, *mut c_void);
    get_mechanism_list = 7: fn(U, *mut U, *mut U);
    get_mechanism_info = 8: fn(U, U, *mut c_void);
    init_token = 9: fn(U, *const u8, U, *const u8);
    init_pin = 10: fn(U, *const u8, U);
    set_pin = 11: fn(U, *const u8, U, *const u8, U);
    open_session = 12: fn(U, U, *mut c_void, *const c_void, *mut U);
    close_session = 13: fn(U);
    close_all_sessions = 14: fn(U);
    get_session_info = 15: fn(U, *mut c_void);
    login = 18: fn(U, U, *const u8, U);
    logout = 19: fn(U);
    create_object = 20: fn(U, *mut c_void, U, *mut U);
    destroy_object = 22: fn(U, U);
    get_attribute_value = 24: fn(U, U, *mut c_void, U);
    set_attribute_value = 25: fn(U, U, *mut c_void, U);
    find_objects_init = 26: fn(U, *mut c_void, U);
    find_objects = 27: fn(U, *mut U, U, *mut U);
    find_objects_final = 28: fn(U);
    generate_key = 58: fn(U, *mut c_void, *mut c_void, U, *mut U);
    generate_key_pair = 59: fn(U, *mut c_void, *mut c_void, U, *mut c_void, U, *mut U, *mut U);
    derive_key = 62: fn(U, *mut c_void, U, *mut c_void, U, *mut U);
    seed_random = 63: fn(U, *const u8, U);
    generate_random = 64: fn(U, *mut u8, U);
}

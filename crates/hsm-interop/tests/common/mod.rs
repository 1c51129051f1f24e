//! In-process Cryptoki module for the integration tests.
//!
//! Entry points are generic over the native `CK_ULONG` and the packing, so a
//! single implementation backs all four variants. The token state is global;
//! every test takes [`lock`] first, which serializes the tests of one binary
//! and resets the token.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::slice;

use cryptoki_sys::{
    CK_RV, CKA_CLASS, CKA_ID, CKA_SENSITIVE, CKA_VALUE, CKA_VALUE_LEN, CKD_NULL, CKD_SHA1_KDF,
    CKF_CLOCK_ON_TOKEN, CKF_DERIVE, CKF_DIGEST, CKF_GENERATE, CKF_GENERATE_KEY_PAIR, CKF_HW_SLOT,
    CKF_LOGIN_REQUIRED, CKF_REMOVABLE_DEVICE, CKF_RW_SESSION, CKF_SERIAL_SESSION,
    CKF_TOKEN_INITIALIZED, CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED, CKM_AES_KEY_GEN,
    CKM_CONCATENATE_BASE_AND_DATA, CKM_EC_KEY_PAIR_GEN, CKM_ECDH1_DERIVE,
    CKM_GENERIC_SECRET_KEY_GEN, CKM_SHA256, CKM_SSL3_KEY_AND_MAC_DERIVE, CKM_XOR_BASE_AND_DATA,
    CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_SENSITIVE,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_GENERAL_ERROR, CKR_KEY_HANDLE_INVALID,
    CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OK,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT,
    CKR_SESSION_EXISTS, CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED,
    CKR_SESSION_READ_ONLY, CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN, CKS_RO_PUBLIC_SESSION,
    CKS_RO_USER_FUNCTIONS, CKS_RW_PUBLIC_SESSION, CKS_RW_SO_FUNCTIONS, CKS_RW_USER_FUNCTIONS,
    CKU_SO,
};
use hsm_interop::layout::{
    ECDH1_DERIVE_PARAMS, INFO, INITIALIZE_ARGS, KEY_DERIVATION_STRING_DATA, Layout,
    MECHANISM_INFO, SESSION_INFO, SLOT_INFO, SSL3_KEY_MAT_OUT, SSL3_KEY_MAT_PARAMS, TOKEN_INFO,
};
use hsm_interop::marshal::{encode_ulong, read_pointer, read_ulong, write_pointer, write_ulong};
use hsm_interop::{
    AbiVariant, AttributeType, ModuleConfig, NativeUlong, Packing, Pkcs11, Pkcs11Factory,
    PlatformProfile,
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

pub const TOKEN_SLOT: u64 = 1;
pub const EMPTY_SLOT: u64 = 7;
pub const USER_PIN: &[u8] = b"1234";
pub const SO_PIN: &[u8] = b"0000";
pub const UTC_TIME: &[u8; 16] = b"2024061512300000";

pub const MECHANISMS: [u64; 6] = [
    CKM_SHA256 as u64,
    CKM_AES_KEY_GEN as u64,
    CKM_EC_KEY_PAIR_GEN as u64,
    CKM_XOR_BASE_AND_DATA as u64,
    CKM_ECDH1_DERIVE as u64,
    CKM_SSL3_KEY_AND_MAC_DERIVE as u64,
];

/// How `C_GetMechanismList` misbehaves between the probe and the fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListChange {
    #[default]
    Stable,
    Shrink,
    Grow,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Stored {
    Value(Vec<u8>),
    Template(Vec<(u64, Vec<u8>)>),
}

#[derive(Debug)]
struct FakeSession {
    slot: u64,
    read_write: bool,
    search: Option<Vec<u64>>,
}

#[derive(Debug)]
pub struct FakeState {
    pub initialized: bool,
    /// Flags of `CK_C_INITIALIZE_ARGS`, `None` when null was passed.
    pub init_flags: Option<u64>,
    pub finalize_calls: usize,
    pub token_label: Vec<u8>,
    pub user_pin: Vec<u8>,
    pub logged_in: Option<u64>,
    pub mechanism_list: ListChange,
    /// Every plain value grows by one byte after its length is queried.
    pub growing_values: bool,
    pub seed: Vec<u8>,
    sessions: BTreeMap<u64, FakeSession>,
    objects: BTreeMap<u64, Vec<(u64, Stored)>>,
    next_handle: u64,
}

impl FakeState {
    fn fresh() -> Self {
        Self {
            initialized: false,
            init_flags: None,
            finalize_calls: 0,
            token_label: padded("Fake token", 32),
            user_pin: USER_PIN.to_vec(),
            logged_in: None,
            mechanism_list: ListChange::Stable,
            growing_values: false,
            seed: Vec::new(),
            sessions: BTreeMap::new(),
            objects: BTreeMap::new(),
            next_handle: 1,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn next(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn add_object(&mut self, attributes: Vec<(u64, Stored)>) -> u64 {
        let handle = self.next();
        self.objects.insert(handle, attributes);
        handle
    }

    fn session(&mut self, handle: u64) -> Result<&mut FakeSession, CK_RV> {
        self.sessions
            .get_mut(&handle)
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }
}

static STATE: Lazy<Mutex<FakeState>> = Lazy::new(|| Mutex::new(FakeState::fresh()));
static SERIAL: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialize against other tests and reset the token. Hold the guard for
/// the whole test, declared before any module.
pub fn lock() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock();
    *STATE.lock() = FakeState::fresh();
    guard
}

/// Inspect or tweak the token. Release the guard before calling the module.
pub fn state() -> MutexGuard<'static, FakeState> {
    STATE.lock()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hsm_interop=debug")
        .with_test_writer()
        .try_init();
}

pub fn config(variant: AbiVariant) -> ModuleConfig {
    ModuleConfig::supplied()
        .with_ulong_width(variant.ulong_width())
        .with_packing(variant.packing())
}

/// Load the fake through the factory for `variant`.
pub fn open(variant: AbiVariant) -> Pkcs11 {
    open_with(&config(variant), &[])
}

/// Load the fake with the listed entry points left null.
pub fn open_with(config: &ModuleConfig, omit: &[&str]) -> Pkcs11 {
    let variant = Pkcs11Factory::select(config).expect("profile has a variant");
    let table = table_for(variant, omit);
    // SAFETY: the table is leaked and every entry is a plain function.
    unsafe { Pkcs11Factory::create_with_function_list(config, table) }
        .expect("fake module initializes")
}

pub fn table_for(variant: AbiVariant, omit: &[&str]) -> *const c_void {
    match variant {
        AbiVariant::Ulong32Natural => function_table::<u32, false>(omit),
        AbiVariant::Ulong32Packed => function_table::<u32, true>(omit),
        AbiVariant::Ulong64Natural => function_table::<u64, false>(omit),
        AbiVariant::Ulong64Packed => function_table::<u64, true>(omit),
    }
}

/// Build a `CK_FUNCTION_LIST` for one variant and leak it.
pub fn function_table<U: NativeUlong, const PACKED: bool>(omit: &[&str]) -> *const c_void {
    let layout = layout::<U, PACKED>().expect("variant fits the host");
    let record = layout.function_list();
    let entries: [(usize, *const c_void); 29] = [
        (0, c_initialize::<U, PACKED> as *const c_void),
        (1, c_finalize::<U, PACKED> as *const c_void),
        (2, c_get_info::<U, PACKED> as *const c_void),
        (4, c_get_slot_list::<U, PACKED> as *const c_void),
        (5, c_get_slot_info::<U, PACKED> as *const c_void),
        (6, c_get_token_info::<U, PACKED> as *const c_void),
        (7, c_get_mechanism_list::<U, PACKED> as *const c_void),
        (8, c_get_mechanism_info::<U, PACKED> as *const c_void),
        (9, c_init_token::<U, PACKED> as *const c_void),
        (10, c_init_pin::<U, PACKED> as *const c_void),
        (11, c_set_pin::<U, PACKED> as *const c_void),
        (12, c_open_session::<U, PACKED> as *const c_void),
        (13, c_close_session::<U, PACKED> as *const c_void),
        (14, c_close_all_sessions::<U, PACKED> as *const c_void),
        (15, c_get_session_info::<U, PACKED> as *const c_void),
        (18, c_login::<U, PACKED> as *const c_void),
        (19, c_logout::<U, PACKED> as *const c_void),
        (20, c_create_object::<U, PACKED> as *const c_void),
        (22, c_destroy_object::<U, PACKED> as *const c_void),
        (24, c_get_attribute_value::<U, PACKED> as *const c_void),
        (25, c_set_attribute_value::<U, PACKED> as *const c_void),
        (26, c_find_objects_init::<U, PACKED> as *const c_void),
        (27, c_find_objects::<U, PACKED> as *const c_void),
        (28, c_find_objects_final::<U, PACKED> as *const c_void),
        (58, c_generate_key::<U, PACKED> as *const c_void),
        (59, c_generate_key_pair::<U, PACKED> as *const c_void),
        (62, c_derive_key::<U, PACKED> as *const c_void),
        (63, c_seed_random::<U, PACKED> as *const c_void),
        (64, c_generate_random::<U, PACKED> as *const c_void),
    ];

    let mut words = vec![0u64; record.size().div_ceil(8)];
    {
        // SAFETY: `words` spans at least `record.size()` bytes.
        let raw = unsafe { slice::from_raw_parts_mut(words.as_mut_ptr().cast::<u8>(), record.size()) };
        raw[0] = 2;
        raw[1] = 40;
        for (index, entry) in entries {
            if omit.contains(&hsm_interop::functions::ENTRY_POINTS[index]) {
                continue;
            }
            write_pointer(raw, record.offset(index + 1), entry);
        }
    }
    Box::leak(words.into_boxed_slice()).as_ptr().cast()
}

fn layout<U: NativeUlong, const PACKED: bool>() -> Option<Layout> {
    let packing = if PACKED { Packing::Packed } else { Packing::Natural };
    PlatformProfile::new(U::WIDTH.bytes(), packing)
        .ok()
        .map(|profile| Layout::new(&profile))
}

fn status<U: NativeUlong>(rv: CK_RV) -> U {
    U::from_u64(rv as u64).unwrap_or_default()
}

/// Run `body` against an initialized token.
fn entered<U, const PACKED: bool>(body: impl FnOnce(&mut FakeState, &Layout) -> CK_RV) -> U
where
    U: NativeUlong,
{
    let Some(layout) = layout::<U, PACKED>() else {
        return status(CKR_GENERAL_ERROR);
    };
    let mut state = STATE.lock();
    if !state.initialized {
        return status(CKR_CRYPTOKI_NOT_INITIALIZED);
    }
    status(body(&mut state, &layout))
}

fn padded(text: &str, width: usize) -> Vec<u8> {
    let mut out = text.as_bytes().to_vec();
    out.resize(width, b' ');
    out
}

fn ulong_bytes(layout: &Layout, value: u64) -> Vec<u8> {
    encode_ulong(layout, value).unwrap_or_default()
}

fn put(layout: &Layout, buf: &mut [u8], offset: usize, value: u64) {
    let _ = write_ulong(layout, buf, offset, value);
}

unsafe fn view<'a>(ptr: *const c_void, len: usize) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        return &[];
    }
    // SAFETY: the caller passed a buffer of `len` bytes.
    unsafe { slice::from_raw_parts(ptr.cast(), len) }
}

unsafe fn view_mut<'a>(ptr: *mut c_void, len: usize) -> &'a mut [u8] {
    if ptr.is_null() || len == 0 {
        return &mut [];
    }
    // SAFETY: the caller passed a writable buffer of `len` bytes.
    unsafe { slice::from_raw_parts_mut(ptr.cast(), len) }
}

unsafe fn read_template(layout: &Layout, template: *const c_void, count: usize) -> Vec<(u64, Stored)> {
    let record = layout.attribute();
    // SAFETY: `count` records were passed.
    let records = unsafe { view(template, record.size() * count) };
    (0..count)
        .map(|index| {
            let base = index * record.size();
            let kind = read_ulong(layout, records, base + record.offset(0));
            let value = read_pointer(records, base + record.offset(1));
            let len = read_ulong(layout, records, base + record.offset(2)) as usize;
            let stored = if AttributeType::new(kind).is_array() {
                // SAFETY: array values are nested attribute records.
                let nested = unsafe { read_template(layout, value, len / record.size()) };
                Stored::Template(
                    nested
                        .into_iter()
                        .map(|(kind, stored)| match stored {
                            Stored::Value(bytes) => (kind, bytes),
                            Stored::Template(_) => (kind, Vec::new()),
                        })
                        .collect(),
                )
            } else {
                // SAFETY: each value holds `len` bytes.
                Stored::Value(unsafe { view(value, len) }.to_vec())
            };
            (kind, stored)
        })
        .collect()
}

fn value_of(attributes: &[(u64, Stored)], kind: u64) -> Option<&[u8]> {
    attributes.iter().find_map(|(t, stored)| match stored {
        Stored::Value(bytes) if *t == kind => Some(bytes.as_slice()),
        _ => None,
    })
}

fn merge(attributes: &mut Vec<(u64, Stored)>, updates: Vec<(u64, Stored)>) {
    for (kind, stored) in updates {
        match attributes.iter_mut().find(|(t, _)| *t == kind) {
            Some(entry) => entry.1 = stored,
            None => attributes.push((kind, stored)),
        }
    }
}

/// Copy `data` to `target` per the length protocol: a null target only
/// reports the length.
unsafe fn fill(target: *mut c_void, capacity: u64, data: &[u8]) -> Result<u64, CK_RV> {
    if target.is_null() {
        return Ok(data.len() as u64);
    }
    if capacity < data.len() as u64 {
        return Err(CKR_BUFFER_TOO_SMALL);
    }
    // SAFETY: the target holds `capacity` bytes.
    unsafe { view_mut(target, data.len()) }.copy_from_slice(data);
    Ok(data.len() as u64)
}

unsafe fn fill_template(
    layout: &Layout,
    target: *mut c_void,
    capacity: u64,
    items: &[(u64, Vec<u8>)],
) -> Result<u64, CK_RV> {
    let record = layout.attribute();
    let required = (items.len() * record.size()) as u64;
    if target.is_null() {
        return Ok(required);
    }
    if capacity < required {
        return Err(CKR_BUFFER_TOO_SMALL);
    }
    // SAFETY: the target holds `required` bytes of nested records.
    let records = unsafe { view_mut(target, required as usize) };
    for (index, (kind, data)) in items.iter().enumerate() {
        let base = index * record.size();
        put(layout, records, base + record.offset(0), *kind);
        let value = read_pointer(records, base + record.offset(1));
        let capacity = read_ulong(layout, records, base + record.offset(2));
        // SAFETY: nested values follow the same protocol.
        let len = unsafe { fill(value, capacity, data) }?;
        put(layout, records, base + record.offset(2), len);
    }
    Ok(required)
}

/// Mechanism type plus its parameter pointer and length.
unsafe fn read_mechanism(layout: &Layout, mechanism: *const c_void) -> (u64, *mut c_void, usize) {
    let record = layout.mechanism();
    // SAFETY: a full CK_MECHANISM was passed.
    let raw = unsafe { view(mechanism, record.size()) };
    (
        read_ulong(layout, raw, record.offset(0)),
        read_pointer(raw, record.offset(1)),
        read_ulong(layout, raw, record.offset(2)) as usize,
    )
}

unsafe fn write_out<U: NativeUlong>(out: *mut U, value: u64) -> CK_RV {
    if out.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // SAFETY: non-null out pointers refer to a single `U`.
    unsafe { *out = U::from_u64(value).unwrap_or_default() };
    CKR_OK
}

extern "C" fn c_initialize<U: NativeUlong, const PACKED: bool>(args: *mut c_void) -> U {
    let Some(layout) = layout::<U, PACKED>() else {
        return status(CKR_GENERAL_ERROR);
    };
    let mut state = STATE.lock();
    if state.initialized {
        return status(CKR_CRYPTOKI_ALREADY_INITIALIZED);
    }
    state.init_flags = (!args.is_null()).then(|| {
        let record = layout.record(INITIALIZE_ARGS);
        // SAFETY: a non-null argument is a full CK_C_INITIALIZE_ARGS.
        let raw = unsafe { view(args, record.size()) };
        read_ulong(&layout, raw, record.offset(4))
    });
    state.initialized = true;
    status(CKR_OK)
}

extern "C" fn c_finalize<U: NativeUlong, const PACKED: bool>(_reserved: *mut c_void) -> U {
    entered::<U, PACKED>(|state, _| {
        state.initialized = false;
        state.finalize_calls += 1;
        state.sessions.clear();
        state.logged_in = None;
        CKR_OK
    })
}

extern "C" fn c_get_info<U: NativeUlong, const PACKED: bool>(info: *mut c_void) -> U {
    entered::<U, PACKED>(|_, layout| {
        let record = layout.record(INFO);
        // SAFETY: the caller passed a full CK_INFO.
        let raw = unsafe { view_mut(info, record.size()) };
        raw[record.offset(0)..record.offset(0) + 2].copy_from_slice(&[2, 40]);
        raw[record.offset(1)..record.offset(1) + 32].copy_from_slice(&padded("FerroHSM Test", 32));
        put(layout, raw, record.offset(2), 0);
        raw[record.offset(3)..record.offset(3) + 32]
            .copy_from_slice(&padded("In-process fake module", 32));
        raw[record.offset(4)..record.offset(4) + 2].copy_from_slice(&[1, 2]);
        CKR_OK
    })
}

extern "C" fn c_get_slot_list<U: NativeUlong, const PACKED: bool>(
    token_present: u8,
    list: *mut U,
    count: *mut U,
) -> U {
    entered::<U, PACKED>(|_, _| {
        let slots: &[u64] = if token_present != 0 {
            &[TOKEN_SLOT]
        } else {
            &[TOKEN_SLOT, EMPTY_SLOT]
        };
        // SAFETY: `count` is a valid in/out length.
        let capacity = unsafe { (*count).to_u64() } as usize;
        unsafe { *count = U::from_u64(slots.len() as u64).unwrap_or_default() };
        if list.is_null() {
            return CKR_OK;
        }
        if capacity < slots.len() {
            return CKR_BUFFER_TOO_SMALL;
        }
        for (index, slot) in slots.iter().enumerate() {
            // SAFETY: `list` holds `capacity` elements.
            unsafe { *list.add(index) = U::from_u64(*slot).unwrap_or_default() };
        }
        CKR_OK
    })
}

extern "C" fn c_get_slot_info<U: NativeUlong, const PACKED: bool>(slot: U, info: *mut c_void) -> U {
    entered::<U, PACKED>(|_, layout| {
        let flags = match slot.to_u64() {
            TOKEN_SLOT => CKF_TOKEN_PRESENT | CKF_HW_SLOT,
            EMPTY_SLOT => CKF_REMOVABLE_DEVICE | CKF_HW_SLOT,
            _ => return CKR_SLOT_ID_INVALID,
        };
        let record = layout.record(SLOT_INFO);
        // SAFETY: the caller passed a full CK_SLOT_INFO.
        let raw = unsafe { view_mut(info, record.size()) };
        let description = format!("Fake slot {}", slot.to_u64());
        raw[record.offset(0)..record.offset(0) + 64].copy_from_slice(&padded(&description, 64));
        raw[record.offset(1)..record.offset(1) + 32].copy_from_slice(&padded("FerroHSM Test", 32));
        put(layout, raw, record.offset(2), flags as u64);
        raw[record.offset(3)..record.offset(3) + 2].copy_from_slice(&[3, 1]);
        raw[record.offset(4)..record.offset(4) + 2].copy_from_slice(&[0, 9]);
        CKR_OK
    })
}

extern "C" fn c_get_token_info<U: NativeUlong, const PACKED: bool>(slot: U, info: *mut c_void) -> U {
    entered::<U, PACKED>(|state, layout| {
        match slot.to_u64() {
            TOKEN_SLOT => {}
            EMPTY_SLOT => return CKR_TOKEN_NOT_PRESENT,
            _ => return CKR_SLOT_ID_INVALID,
        }
        let record = layout.record(TOKEN_INFO);
        // SAFETY: the caller passed a full CK_TOKEN_INFO.
        let raw = unsafe { view_mut(info, record.size()) };
        raw[record.offset(0)..record.offset(0) + 32].copy_from_slice(&state.token_label);
        raw[record.offset(1)..record.offset(1) + 32].copy_from_slice(&padded("FerroHSM Test", 32));
        raw[record.offset(2)..record.offset(2) + 16].copy_from_slice(&padded("Fake", 16));
        raw[record.offset(3)..record.offset(3) + 16].copy_from_slice(&padded("0001", 16));
        let flags = CKF_TOKEN_INITIALIZED
            | CKF_LOGIN_REQUIRED
            | CKF_USER_PIN_INITIALIZED
            | CKF_CLOCK_ON_TOKEN;
        let rw_sessions = state.sessions.values().filter(|s| s.read_write).count();
        let counters = [
            flags as u64,
            16,
            state.sessions.len() as u64,
            8,
            rw_sessions as u64,
            64,
            4,
            1 << 20,
            1 << 19,
            1 << 21,
            1 << 18,
        ];
        for (field, value) in counters.into_iter().enumerate() {
            put(layout, raw, record.offset(4 + field), value);
        }
        raw[record.offset(15)..record.offset(15) + 2].copy_from_slice(&[1, 0]);
        raw[record.offset(16)..record.offset(16) + 2].copy_from_slice(&[2, 5]);
        raw[record.offset(17)..record.offset(17) + 16].copy_from_slice(UTC_TIME);
        CKR_OK
    })
}

extern "C" fn c_get_mechanism_list<U: NativeUlong, const PACKED: bool>(
    slot: U,
    list: *mut U,
    count: *mut U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        if slot.to_u64() != TOKEN_SLOT {
            return CKR_TOKEN_NOT_PRESENT;
        }
        // SAFETY: `count` is a valid in/out length.
        let capacity = unsafe { (*count).to_u64() } as usize;
        let available = match (state.mechanism_list, list.is_null()) {
            (_, true) | (ListChange::Stable, false) => MECHANISMS.len(),
            (ListChange::Shrink, false) => 2,
            (ListChange::Grow, false) => MECHANISMS.len() + 1,
        };
        unsafe { *count = U::from_u64(available as u64).unwrap_or_default() };
        if list.is_null() {
            return CKR_OK;
        }
        if capacity < available {
            return CKR_BUFFER_TOO_SMALL;
        }
        for (index, mechanism) in MECHANISMS.iter().take(available).enumerate() {
            // SAFETY: `list` holds `capacity` elements.
            unsafe { *list.add(index) = U::from_u64(*mechanism).unwrap_or_default() };
        }
        CKR_OK
    })
}

extern "C" fn c_get_mechanism_info<U: NativeUlong, const PACKED: bool>(
    slot: U,
    mechanism: U,
    info: *mut c_void,
) -> U {
    entered::<U, PACKED>(|_, layout| {
        if slot.to_u64() != TOKEN_SLOT {
            return CKR_TOKEN_NOT_PRESENT;
        }
        let mechanism = mechanism.to_u64();
        let (min, max, flags) = if mechanism == CKM_AES_KEY_GEN as u64 {
            (16, 32, CKF_GENERATE)
        } else if mechanism == CKM_SHA256 as u64 {
            (0, 0, CKF_DIGEST)
        } else if mechanism == CKM_EC_KEY_PAIR_GEN as u64 {
            (256, 521, CKF_GENERATE_KEY_PAIR)
        } else if MECHANISMS.contains(&mechanism) {
            (0, 0, CKF_DERIVE)
        } else {
            return CKR_MECHANISM_INVALID;
        };
        let record = layout.record(MECHANISM_INFO);
        // SAFETY: the caller passed a full CK_MECHANISM_INFO.
        let raw = unsafe { view_mut(info, record.size()) };
        put(layout, raw, record.offset(0), min);
        put(layout, raw, record.offset(1), max);
        put(layout, raw, record.offset(2), flags as u64);
        CKR_OK
    })
}

extern "C" fn c_init_token<U: NativeUlong, const PACKED: bool>(
    slot: U,
    pin: *const u8,
    pin_len: U,
    label: *const u8,
) -> U {
    entered::<U, PACKED>(|state, _| {
        if slot.to_u64() != TOKEN_SLOT {
            return CKR_TOKEN_NOT_PRESENT;
        }
        // SAFETY: the PIN holds `pin_len` bytes and the label 32.
        let (pin, label) = unsafe {
            (
                view(pin.cast(), pin_len.to_u64() as usize),
                view(label.cast(), 32),
            )
        };
        if pin != SO_PIN {
            return CKR_PIN_INCORRECT;
        }
        if !state.sessions.is_empty() {
            return CKR_SESSION_EXISTS;
        }
        state.token_label = label.to_vec();
        state.objects.clear();
        CKR_OK
    })
}

extern "C" fn c_init_pin<U: NativeUlong, const PACKED: bool>(session: U, pin: *const u8, len: U) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        if state.logged_in != Some(CKU_SO as u64) {
            return CKR_USER_NOT_LOGGED_IN;
        }
        // SAFETY: the PIN holds `len` bytes.
        state.user_pin = unsafe { view(pin.cast(), len.to_u64() as usize) }.to_vec();
        CKR_OK
    })
}

extern "C" fn c_set_pin<U: NativeUlong, const PACKED: bool>(
    session: U,
    old: *const u8,
    old_len: U,
    new: *const u8,
    new_len: U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        // SAFETY: each PIN holds its stated length.
        let (old, new) = unsafe {
            (
                view(old.cast(), old_len.to_u64() as usize),
                view(new.cast(), new_len.to_u64() as usize),
            )
        };
        if old != state.user_pin.as_slice() {
            return CKR_PIN_INCORRECT;
        }
        state.user_pin = new.to_vec();
        CKR_OK
    })
}

extern "C" fn c_open_session<U: NativeUlong, const PACKED: bool>(
    slot: U,
    flags: U,
    _application: *mut c_void,
    _notify: *const c_void,
    out: *mut U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        match slot.to_u64() {
            TOKEN_SLOT => {}
            EMPTY_SLOT => return CKR_TOKEN_NOT_PRESENT,
            _ => return CKR_SLOT_ID_INVALID,
        }
        let flags = flags.to_u64();
        if flags & CKF_SERIAL_SESSION as u64 == 0 {
            return CKR_SESSION_PARALLEL_NOT_SUPPORTED;
        }
        let handle = state.next();
        state.sessions.insert(
            handle,
            FakeSession {
                slot: TOKEN_SLOT,
                read_write: flags & CKF_RW_SESSION as u64 != 0,
                search: None,
            },
        );
        // SAFETY: `out` is the caller's handle location.
        unsafe { write_out(out, handle) }
    })
}

extern "C" fn c_close_session<U: NativeUlong, const PACKED: bool>(session: U) -> U {
    entered::<U, PACKED>(|state, _| match state.sessions.remove(&session.to_u64()) {
        Some(_) => {
            if state.sessions.is_empty() {
                state.logged_in = None;
            }
            CKR_OK
        }
        None => CKR_SESSION_HANDLE_INVALID,
    })
}

extern "C" fn c_close_all_sessions<U: NativeUlong, const PACKED: bool>(slot: U) -> U {
    entered::<U, PACKED>(|state, _| {
        if slot.to_u64() != TOKEN_SLOT {
            return CKR_SLOT_ID_INVALID;
        }
        state.sessions.retain(|_, session| session.slot != TOKEN_SLOT);
        state.logged_in = None;
        CKR_OK
    })
}

extern "C" fn c_get_session_info<U: NativeUlong, const PACKED: bool>(
    session: U,
    info: *mut c_void,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        let logged_in = state.logged_in;
        let (slot, read_write) = match state.session(session.to_u64()) {
            Ok(session) => (session.slot, session.read_write),
            Err(rv) => return rv,
        };
        let session_state = match (read_write, logged_in) {
            (false, None) => CKS_RO_PUBLIC_SESSION,
            (false, Some(_)) => CKS_RO_USER_FUNCTIONS,
            (true, None) => CKS_RW_PUBLIC_SESSION,
            (true, Some(user)) if user == CKU_SO as u64 => CKS_RW_SO_FUNCTIONS,
            (true, Some(_)) => CKS_RW_USER_FUNCTIONS,
        };
        let mut flags = CKF_SERIAL_SESSION as u64;
        if read_write {
            flags |= CKF_RW_SESSION as u64;
        }
        let record = layout.record(SESSION_INFO);
        // SAFETY: the caller passed a full CK_SESSION_INFO.
        let raw = unsafe { view_mut(info, record.size()) };
        put(layout, raw, record.offset(0), slot);
        put(layout, raw, record.offset(1), session_state as u64);
        put(layout, raw, record.offset(2), flags);
        put(layout, raw, record.offset(3), 0);
        CKR_OK
    })
}

extern "C" fn c_login<U: NativeUlong, const PACKED: bool>(
    session: U,
    user: U,
    pin: *const u8,
    len: U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        if state.logged_in.is_some() {
            return CKR_USER_ALREADY_LOGGED_IN;
        }
        let user = user.to_u64();
        // a null PIN stands for the protected authentication path
        if !pin.is_null() {
            // SAFETY: the PIN holds `len` bytes.
            let pin = unsafe { view(pin.cast(), len.to_u64() as usize) };
            let expected = if user == CKU_SO as u64 {
                SO_PIN
            } else {
                state.user_pin.as_slice()
            };
            if pin != expected {
                return CKR_PIN_INCORRECT;
            }
        }
        state.logged_in = Some(user);
        CKR_OK
    })
}

extern "C" fn c_logout<U: NativeUlong, const PACKED: bool>(session: U) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        if state.logged_in.take().is_none() {
            return CKR_USER_NOT_LOGGED_IN;
        }
        CKR_OK
    })
}

extern "C" fn c_create_object<U: NativeUlong, const PACKED: bool>(
    session: U,
    template: *mut c_void,
    count: U,
    out: *mut U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        let read_write = match state.session(session.to_u64()) {
            Ok(session) => session.read_write,
            Err(rv) => return rv,
        };
        // SAFETY: `count` records were passed.
        let attributes = unsafe { read_template(layout, template, count.to_u64() as usize) };
        if !read_write {
            return CKR_SESSION_READ_ONLY;
        }
        let handle = state.add_object(attributes);
        // SAFETY: `out` is the caller's handle location.
        unsafe { write_out(out, handle) }
    })
}

extern "C" fn c_destroy_object<U: NativeUlong, const PACKED: bool>(session: U, object: U) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        match state.objects.remove(&object.to_u64()) {
            Some(_) => CKR_OK,
            None => CKR_OBJECT_HANDLE_INVALID,
        }
    })
}

extern "C" fn c_get_attribute_value<U: NativeUlong, const PACKED: bool>(
    session: U,
    object: U,
    template: *mut c_void,
    count: U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        let Some(attributes) = state.objects.get(&object.to_u64()) else {
            return CKR_OBJECT_HANDLE_INVALID;
        };
        let sensitive = value_of(attributes, CKA_SENSITIVE as u64) == Some(&[1u8][..]);
        let record = layout.attribute();
        let count = count.to_u64() as usize;
        // SAFETY: `count` records were passed.
        let records = unsafe { view_mut(template, record.size() * count) };
        let mut rv = CKR_OK;
        let mut queried = Vec::new();
        for index in 0..count {
            let base = index * record.size();
            let kind = read_ulong(layout, records, base + record.offset(0));
            let value = read_pointer(records, base + record.offset(1));
            if value.is_null() {
                queried.push(kind);
            }
            let len_offset = base + record.offset(2);
            let capacity = read_ulong(layout, records, len_offset);
            let stored = attributes.iter().find(|(t, _)| *t == kind).map(|(_, s)| s);
            // SAFETY: values point at buffers of their stated capacity or are null.
            let outcome = match stored {
                _ if sensitive && kind == CKA_VALUE as u64 => Err(CKR_ATTRIBUTE_SENSITIVE),
                None => Err(CKR_ATTRIBUTE_TYPE_INVALID),
                Some(Stored::Value(data)) => unsafe { fill(value, capacity, data) },
                Some(Stored::Template(items)) => unsafe {
                    fill_template(layout, value, capacity, items)
                },
            };
            match outcome {
                Ok(len) => put(layout, records, len_offset, len),
                Err(code) => {
                    put(layout, records, len_offset, layout.unavailable());
                    if rv != CKR_BUFFER_TOO_SMALL {
                        rv = code;
                    }
                }
            }
        }
        if state.growing_values {
            if let Some(attributes) = state.objects.get_mut(&object.to_u64()) {
                for (kind, stored) in attributes.iter_mut() {
                    if let Stored::Value(data) = stored {
                        if queried.contains(kind) {
                            data.push(0x5a);
                        }
                    }
                }
            }
        }
        rv
    })
}

extern "C" fn c_set_attribute_value<U: NativeUlong, const PACKED: bool>(
    session: U,
    object: U,
    template: *mut c_void,
    count: U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        // SAFETY: `count` records were passed.
        let updates = unsafe { read_template(layout, template, count.to_u64() as usize) };
        match state.objects.get_mut(&object.to_u64()) {
            Some(attributes) => {
                merge(attributes, updates);
                CKR_OK
            }
            None => CKR_OBJECT_HANDLE_INVALID,
        }
    })
}

extern "C" fn c_find_objects_init<U: NativeUlong, const PACKED: bool>(
    session: U,
    template: *mut c_void,
    count: U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        // SAFETY: `count` records were passed.
        let filter = unsafe { read_template(layout, template, count.to_u64() as usize) };
        let matches: Vec<u64> = state
            .objects
            .iter()
            .filter(|(_, attributes)| {
                filter
                    .iter()
                    .all(|(kind, wanted)| attributes.iter().any(|(t, s)| t == kind && s == wanted))
            })
            .map(|(handle, _)| *handle)
            .collect();
        let session = match state.session(session.to_u64()) {
            Ok(session) => session,
            Err(rv) => return rv,
        };
        if session.search.is_some() {
            return CKR_OPERATION_ACTIVE;
        }
        session.search = Some(matches);
        CKR_OK
    })
}

extern "C" fn c_find_objects<U: NativeUlong, const PACKED: bool>(
    session: U,
    out: *mut U,
    max: U,
    returned: *mut U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        let session = match state.session(session.to_u64()) {
            Ok(session) => session,
            Err(rv) => return rv,
        };
        let Some(search) = session.search.as_mut() else {
            return CKR_OPERATION_NOT_INITIALIZED;
        };
        let take = search.len().min(max.to_u64() as usize);
        let batch: Vec<u64> = search.drain(..take).collect();
        for (index, handle) in batch.iter().enumerate() {
            // SAFETY: `out` holds `max` elements.
            unsafe { *out.add(index) = U::from_u64(*handle).unwrap_or_default() };
        }
        // SAFETY: `returned` is the caller's count location.
        unsafe { write_out(returned, batch.len() as u64) }
    })
}

extern "C" fn c_find_objects_final<U: NativeUlong, const PACKED: bool>(session: U) -> U {
    entered::<U, PACKED>(|state, _| match state.session(session.to_u64()) {
        Ok(session) => match session.search.take() {
            Some(_) => CKR_OK,
            None => CKR_OPERATION_NOT_INITIALIZED,
        },
        Err(rv) => rv,
    })
}

extern "C" fn c_generate_key<U: NativeUlong, const PACKED: bool>(
    session: U,
    mechanism: *mut c_void,
    template: *mut c_void,
    count: U,
    out: *mut U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        // SAFETY: a full CK_MECHANISM and `count` records were passed.
        let (kind, _, _) = unsafe { read_mechanism(layout, mechanism) };
        let template = unsafe { read_template(layout, template, count.to_u64() as usize) };
        if kind != CKM_AES_KEY_GEN as u64 && kind != CKM_GENERIC_SECRET_KEY_GEN as u64 {
            return CKR_MECHANISM_INVALID;
        }
        let len = value_of(&template, CKA_VALUE_LEN as u64)
            .map(|raw| read_ulong(layout, raw, 0) as usize)
            .unwrap_or(16);
        let mut attributes = vec![
            (CKA_CLASS as u64, Stored::Value(ulong_bytes(layout, CKO_SECRET_KEY as u64))),
            (CKA_VALUE as u64, Stored::Value(vec![0x42; len])),
        ];
        merge(&mut attributes, template);
        let handle = state.add_object(attributes);
        // SAFETY: `out` is the caller's handle location.
        unsafe { write_out(out, handle) }
    })
}

#[allow(clippy::too_many_arguments)]
extern "C" fn c_generate_key_pair<U: NativeUlong, const PACKED: bool>(
    session: U,
    mechanism: *mut c_void,
    public_template: *mut c_void,
    public_count: U,
    private_template: *mut c_void,
    private_count: U,
    public_out: *mut U,
    private_out: *mut U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        // SAFETY: a full CK_MECHANISM and both templates were passed.
        let (kind, _, _) = unsafe { read_mechanism(layout, mechanism) };
        let public_template =
            unsafe { read_template(layout, public_template, public_count.to_u64() as usize) };
        let private_template =
            unsafe { read_template(layout, private_template, private_count.to_u64() as usize) };
        if kind != CKM_EC_KEY_PAIR_GEN as u64 {
            return CKR_MECHANISM_INVALID;
        }
        let mut public = vec![(
            CKA_CLASS as u64,
            Stored::Value(ulong_bytes(layout, CKO_PUBLIC_KEY as u64)),
        )];
        merge(&mut public, public_template);
        let mut private = vec![
            (CKA_CLASS as u64, Stored::Value(ulong_bytes(layout, CKO_PRIVATE_KEY as u64))),
            (CKA_VALUE as u64, Stored::Value(vec![0x99; 32])),
        ];
        merge(&mut private, private_template);
        let public = state.add_object(public);
        let private = state.add_object(private);
        // SAFETY: both outs are the caller's handle locations.
        match unsafe { write_out(public_out, public) } {
            CKR_OK => unsafe { write_out(private_out, private) },
            rv => rv,
        }
    })
}

extern "C" fn c_derive_key<U: NativeUlong, const PACKED: bool>(
    session: U,
    mechanism: *mut c_void,
    base: U,
    template: *mut c_void,
    count: U,
    out: *mut U,
) -> U {
    entered::<U, PACKED>(|state, layout| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        let Some(base) = state.objects.get(&base.to_u64()) else {
            return CKR_KEY_HANDLE_INVALID;
        };
        let base_value = value_of(base, CKA_VALUE as u64).unwrap_or_default().to_vec();
        // SAFETY: a full CK_MECHANISM and `count` records were passed.
        let (kind, param, param_len) = unsafe { read_mechanism(layout, mechanism) };
        let template = unsafe { read_template(layout, template, count.to_u64() as usize) };

        if kind == CKM_SSL3_KEY_AND_MAC_DERIVE as u64 {
            if !out.is_null() {
                return CKR_ARGUMENTS_BAD;
            }
            // SAFETY: the parameter is a CK_SSL3_KEY_MAT_PARAMS.
            return unsafe { derive_key_material(state, layout, param, param_len, &template) };
        }

        let mut attributes = vec![(
            CKA_CLASS as u64,
            Stored::Value(ulong_bytes(layout, CKO_SECRET_KEY as u64)),
        )];
        if kind == CKM_XOR_BASE_AND_DATA as u64 || kind == CKM_CONCATENATE_BASE_AND_DATA as u64 {
            let record = layout.record(KEY_DERIVATION_STRING_DATA);
            if param_len != record.size() {
                return CKR_MECHANISM_PARAM_INVALID;
            }
            // SAFETY: the parameter and its data were passed with their lengths.
            let raw = unsafe { view(param, record.size()) };
            let data = unsafe {
                view(
                    read_pointer(raw, record.offset(0)),
                    read_ulong(layout, raw, record.offset(1)) as usize,
                )
            };
            let value: Vec<u8> = if kind == CKM_XOR_BASE_AND_DATA as u64 {
                base_value.iter().zip(data).map(|(a, b)| a ^ b).collect()
            } else {
                [base_value.as_slice(), data].concat()
            };
            attributes.push((CKA_VALUE as u64, Stored::Value(value)));
        } else if kind == CKM_ECDH1_DERIVE as u64 {
            let record = layout.record(ECDH1_DERIVE_PARAMS);
            if param_len != record.size() {
                return CKR_MECHANISM_PARAM_INVALID;
            }
            // SAFETY: the parameter and both data buffers were passed.
            let raw = unsafe { view(param, record.size()) };
            let kdf = read_ulong(layout, raw, record.offset(0));
            if kdf != CKD_NULL as u64 && kdf != CKD_SHA1_KDF as u64 {
                return CKR_MECHANISM_PARAM_INVALID;
            }
            let shared = unsafe {
                view(
                    read_pointer(raw, record.offset(2)),
                    read_ulong(layout, raw, record.offset(1)) as usize,
                )
            };
            let public = unsafe {
                view(
                    read_pointer(raw, record.offset(4)),
                    read_ulong(layout, raw, record.offset(3)) as usize,
                )
            };
            attributes.push((CKA_VALUE as u64, Stored::Value(public.to_vec())));
            attributes.push((CKA_ID as u64, Stored::Value(shared.to_vec())));
        } else {
            return CKR_MECHANISM_INVALID;
        }
        merge(&mut attributes, template);
        let handle = state.add_object(attributes);
        // SAFETY: `out` is the caller's handle location.
        unsafe { write_out(out, handle) }
    })
}

/// Four keys sized from the parameters, reported through the output
/// structure. The IVs repeat the client and server randoms.
unsafe fn derive_key_material(
    state: &mut FakeState,
    layout: &Layout,
    param: *mut c_void,
    param_len: usize,
    template: &[(u64, Stored)],
) -> CK_RV {
    let record = layout.record(SSL3_KEY_MAT_PARAMS);
    if param_len != record.size() {
        return CKR_MECHANISM_PARAM_INVALID;
    }
    // SAFETY: the caller passed a full CK_SSL3_KEY_MAT_PARAMS.
    let raw = unsafe { view(param, record.size()) };
    let mac_bytes = read_ulong(layout, raw, record.offset(0)) as usize / 8;
    let key_bytes = read_ulong(layout, raw, record.offset(1)) as usize / 8;
    let iv_bytes = read_ulong(layout, raw, record.offset(2)) as usize / 8;
    // SAFETY: both randoms were passed with their lengths.
    let (client_random, server_random) = unsafe {
        (
            view(
                read_pointer(raw, record.offset(4)),
                read_ulong(layout, raw, record.offset(5)) as usize,
            ),
            view(
                read_pointer(raw, record.offset(6)),
                read_ulong(layout, raw, record.offset(7)) as usize,
            ),
        )
    };
    let out_ptr = read_pointer(raw, record.offset(8));
    if out_ptr.is_null() {
        return CKR_ARGUMENTS_BAD;
    }

    let out_record = layout.record(SSL3_KEY_MAT_OUT);
    // SAFETY: the output structure belongs to the caller.
    let out = unsafe { view_mut(out_ptr, out_record.size()) };
    let sizes = [mac_bytes, mac_bytes, key_bytes, key_bytes];
    for (field, size) in sizes.into_iter().enumerate() {
        let mut attributes = vec![(CKA_VALUE as u64, Stored::Value(vec![field as u8; size]))];
        merge(&mut attributes, template.to_vec());
        let handle = state.add_object(attributes);
        put(layout, out, out_record.offset(field), handle);
    }
    let ivs = [(4, client_random), (5, server_random)];
    for (field, random) in ivs {
        let iv = read_pointer(out, out_record.offset(field));
        let bytes: Vec<u8> = random.iter().copied().cycle().take(iv_bytes).collect();
        // SAFETY: the caller allocated `iv_bytes` for each IV.
        unsafe { view_mut(iv, iv_bytes) }.copy_from_slice(&bytes);
    }
    CKR_OK
}

extern "C" fn c_seed_random<U: NativeUlong, const PACKED: bool>(
    session: U,
    seed: *const u8,
    len: U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        // SAFETY: the seed holds `len` bytes.
        state.seed = unsafe { view(seed.cast(), len.to_u64() as usize) }.to_vec();
        CKR_OK
    })
}

extern "C" fn c_generate_random<U: NativeUlong, const PACKED: bool>(
    session: U,
    out: *mut u8,
    len: U,
) -> U {
    entered::<U, PACKED>(|state, _| {
        if let Err(rv) = state.session(session.to_u64()) {
            return rv;
        }
        let start = state.seed.first().copied().unwrap_or(0);
        // SAFETY: the output holds `len` bytes.
        let out = unsafe { view_mut(out.cast(), len.to_u64() as usize) };
        for (index, byte) in out.iter_mut().enumerate() {
            *byte = start.wrapping_add(index as u8);
        }
        CKR_OK
    })
}

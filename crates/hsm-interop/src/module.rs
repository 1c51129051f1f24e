//! Loaded modules and their slots.
//!
//! A [`Cryptoki`] owns the library, the function table read at its variant's
//! layout and the module state. Every [`Slot`] and [`Session`] derived from it
//! shares the same state through an `Arc`, so finalizing the module makes all
//! of them fail with [`Pkcs11Error::UseAfterClose`].

use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use cryptoki_sys::{CKF_OS_LOCKING_OK, CKF_RW_SESSION, CKF_SERIAL_SESSION};
use libloading::{Library, Symbol};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::abi::{Abi, AbiVariant, NativeUlong};
use crate::config::{AppType, InitSource, ModuleConfig};
use crate::error::{Pkcs11Error, Pkcs11Result, check_rv};
use crate::functions::{ENTRY_POINTS, FunctionList};
use crate::info::{LibraryInfo, MechanismInfo, SlotInfo, TokenInfo, Version};
use crate::layout::{INITIALIZE_ARGS, LABEL_LEN, Layout};
use crate::marshal::{NativeBuffer, encode_padded, probe_then_fetch, write_ulong};
use crate::mechanism::MechanismType;
use crate::platform::PlatformProfile;
use crate::session::{Session, SessionType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModuleState {
    Loaded,
    Finalized,
}

pub(crate) struct ModuleInner<A: Abi> {
    functions: FunctionList<A::Ulong>,
    layout: Layout,
    profile: PlatformProfile,
    state: RwLock<ModuleState>,
    origin: String,
    // dropped last, after the module has been finalized
    _library: Option<Library>,
}

impl<A: Abi> fmt::Debug for ModuleInner<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInner")
            .field("variant", &A::VARIANT)
            .field("origin", &self.origin)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl<A: Abi> ModuleInner<A> {
    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run one native call and return its raw status. The module cannot be
    /// finalized while the call is in flight.
    pub(crate) fn call<F>(&self, operation: &'static str, call: F) -> Pkcs11Result<u64>
    where
        F: FnOnce(&FunctionList<A::Ulong>) -> Pkcs11Result<A::Ulong>,
    {
        let state = self.state.read();
        if *state == ModuleState::Finalized {
            return Err(Pkcs11Error::UseAfterClose { operation });
        }
        debug!(operation, variant = %A::VARIANT, "native call");
        let rv = call(&self.functions)?;
        Ok(rv.to_u64())
    }

    /// Like [`Self::call`], translating any status other than `CKR_OK`.
    pub(crate) fn invoke<F>(&self, operation: &'static str, call: F) -> Pkcs11Result<()>
    where
        F: FnOnce(&FunctionList<A::Ulong>) -> Pkcs11Result<A::Ulong>,
    {
        let rv = self.call(operation, call)?;
        check_rv(operation, rv)
    }

    fn finalize(&self) -> Pkcs11Result<()> {
        let mut state = self.state.write();
        if *state == ModuleState::Finalized {
            return Err(Pkcs11Error::UseAfterClose {
                operation: "C_Finalize",
            });
        }
        let finalize = self.functions.finalize()?;
        // SAFETY: C_Finalize takes a reserved pointer that must be null.
        let rv = unsafe { finalize(ptr::null_mut()) };
        check_rv("C_Finalize", rv.to_u64())?;
        *state = ModuleState::Finalized;
        info!(origin = %self.origin, "cryptoki module finalized");
        Ok(())
    }
}

impl<A: Abi> Drop for ModuleInner<A> {
    fn drop(&mut self) {
        if *self.state.get_mut() == ModuleState::Loaded {
            if let Err(err) = self.finalize() {
                warn!(origin = %self.origin, error = %err, "failed to finalize module on drop");
            }
        }
    }
}

/// Convert a PIN into the pointer and length pair native calls expect. A
/// missing PIN is passed as null for protected authentication paths.
pub(crate) fn pin_parts<U: NativeUlong>(pin: Option<&[u8]>) -> Pkcs11Result<(*const u8, U)> {
    match pin {
        Some(pin) => Ok((pin.as_ptr(), U::from_usize(pin.len())?)),
        None => Ok((ptr::null(), U::default())),
    }
}

fn load_library(path: &Path) -> Pkcs11Result<Library> {
    // SAFETY: loading runs the library's initializers; the path comes from
    // trusted configuration.
    unsafe { Library::new(path) }.map_err(|err| Pkcs11Error::LibraryLoad {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn function_list_from_module<A: Abi>(
    library: &Library,
    path: &Path,
    layout: &Layout,
) -> Pkcs11Result<FunctionList<A::Ulong>> {
    // SAFETY: C_GetFunctionList has this prototype in every Cryptoki module.
    let get_function_list: Symbol<unsafe extern "C" fn(*mut *const u8) -> A::Ulong> =
        unsafe { library.get(b"C_GetFunctionList\0") }.map_err(|err| Pkcs11Error::LibraryLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    let mut list = ptr::null();
    // SAFETY: the out pointer refers to a local.
    let rv = unsafe { get_function_list(&mut list) };
    check_rv("C_GetFunctionList", rv.to_u64())?;
    if list.is_null() {
        return Err(Pkcs11Error::LibraryLoad {
            path: path.to_path_buf(),
            reason: "C_GetFunctionList returned a null table".to_string(),
        });
    }
    // SAFETY: the module owns a complete table at the address it returned.
    Ok(unsafe { FunctionList::read(list, layout) })
}

fn function_list_from_exports<A: Abi>(library: &Library) -> FunctionList<A::Ulong> {
    let mut entries = [ptr::null(); ENTRY_POINTS.len()];
    for (entry, name) in entries.iter_mut().zip(ENTRY_POINTS) {
        let symbol = format!("{name}\0");
        // SAFETY: only the symbol address is read.
        if let Ok(address) = unsafe { library.get::<*const c_void>(symbol.as_bytes()) } {
            *entry = *address;
        }
    }
    // exports carry no table version
    FunctionList::from_entries(Version::default(), entries)
}

fn initialize<A: Abi>(
    functions: &FunctionList<A::Ulong>,
    layout: &Layout,
    application_type: AppType,
) -> Pkcs11Result<()> {
    let initialize = functions.initialize()?;
    let mut args = match application_type {
        AppType::SingleThreaded => NativeBuffer::default(),
        AppType::MultiThreaded => {
            let record = layout.record(INITIALIZE_ARGS);
            let mut args = NativeBuffer::zeroed(record.size());
            write_ulong(layout, args.as_bytes_mut(), record.offset(4), CKF_OS_LOCKING_OK as u64)?;
            args
        }
    };
    // SAFETY: `args` is null or a complete CK_C_INITIALIZE_ARGS for this layout.
    let rv = unsafe { initialize(args.as_mut_ptr()) };
    check_rv("C_Initialize", rv.to_u64())
}

/// A loaded and initialized Cryptoki module using variant `A`.
#[derive(Debug)]
pub struct Cryptoki<A: Abi> {
    inner: Arc<ModuleInner<A>>,
}

impl<A: Abi> Clone for Cryptoki<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Abi> Cryptoki<A> {
    /// Load the library named in `config` and initialize it. The structure
    /// layout is fixed by `A`; [`crate::Pkcs11Factory`] picks `A` from the
    /// profile fields of the configuration.
    pub fn load(config: &ModuleConfig) -> Pkcs11Result<Self> {
        let profile = Self::check_profile()?;
        let layout = Layout::new(&profile);
        let path = config.require_library_path()?;
        let library = load_library(path)?;
        let functions = match config.initialization_source {
            InitSource::Module => function_list_from_module::<A>(&library, path, &layout)?,
            InitSource::Exports => function_list_from_exports::<A>(&library),
            InitSource::Supplied => {
                return Err(Pkcs11Error::config(
                    "a supplied function table must be passed to create_with_function_list",
                ));
            }
        };
        info!(path = %path.display(), variant = %A::VARIANT, "cryptoki library loaded");
        Self::open(
            functions,
            profile,
            config.application_type,
            path.display().to_string(),
            Some(library),
        )
    }

    /// Initialize a module from a function table the caller already holds.
    ///
    /// # Safety
    /// `list` must point to a `CK_FUNCTION_LIST` laid out for variant `A`
    /// whose entry points stay valid for the lifetime of the returned value
    /// and everything derived from it.
    pub unsafe fn from_function_list(
        config: &ModuleConfig,
        list: *const c_void,
    ) -> Pkcs11Result<Self> {
        if list.is_null() {
            return Err(Pkcs11Error::invalid("function list pointer is null"));
        }
        let profile = Self::check_profile()?;
        let layout = Layout::new(&profile);
        // SAFETY: guaranteed by the caller.
        let functions = unsafe { FunctionList::read(list.cast(), &layout) };
        Self::open(
            functions,
            profile,
            config.application_type,
            "supplied function list".to_string(),
            None,
        )
    }

    fn check_profile() -> Pkcs11Result<PlatformProfile> {
        let profile = A::VARIANT.profile();
        if !profile.fits_host() {
            return Err(Pkcs11Error::UnsupportedPlatform(profile.to_string()));
        }
        Ok(profile)
    }

    fn open(
        functions: FunctionList<A::Ulong>,
        profile: PlatformProfile,
        application_type: AppType,
        origin: String,
        library: Option<Library>,
    ) -> Pkcs11Result<Self> {
        let layout = Layout::new(&profile);
        initialize::<A>(&functions, &layout, application_type)?;
        info!(%origin, ?application_type, profile = %profile, "cryptoki module initialized");
        Ok(Self {
            inner: Arc::new(ModuleInner {
                functions,
                layout,
                profile,
                state: RwLock::new(ModuleState::Loaded),
                origin,
                _library: library,
            }),
        })
    }

    pub fn variant(&self) -> AbiVariant {
        A::VARIANT
    }

    pub fn profile(&self) -> PlatformProfile {
        self.inner.profile
    }

    /// Version stored at the head of the module's function list.
    pub fn function_list_version(&self) -> Version {
        self.inner.functions.version()
    }

    pub fn is_finalized(&self) -> bool {
        *self.inner.state.read() == ModuleState::Finalized
    }

    /// Finalize the module. Every later call through this module or anything
    /// derived from it fails with [`Pkcs11Error::UseAfterClose`].
    pub fn finalize(&self) -> Pkcs11Result<()> {
        self.inner.finalize()
    }

    pub fn info(&self) -> Pkcs11Result<LibraryInfo> {
        let layout = *self.inner.layout();
        let mut buf = NativeBuffer::zeroed(LibraryInfo::size(&layout));
        self.inner.invoke("C_GetInfo", |f| {
            let get_info = f.get_info()?;
            // SAFETY: `buf` is a full CK_INFO for this layout.
            Ok(unsafe { get_info(buf.as_mut_ptr()) })
        })?;
        LibraryInfo::decode(&layout, buf.as_bytes())
    }

    /// Slots known to the module, optionally only those with a token.
    pub fn slots(&self, token_present: bool) -> Pkcs11Result<Vec<Slot<A>>> {
        let present = token_present as u8;
        let ids = probe_then_fetch::<A::Ulong, _>("C_GetSlotList", |buf, len| {
            self.inner.call("C_GetSlotList", |f| {
                let get_slot_list = f.get_slot_list()?;
                let mut count = A::Ulong::from_u64(*len)?;
                let list = buf.map_or(ptr::null_mut(), |buf| buf.as_mut_ptr());
                // SAFETY: `list` is null or holds `count` elements.
                let rv = unsafe { get_slot_list(present, list, &mut count) };
                *len = count.to_u64();
                Ok(rv)
            })
        })?;
        Ok(ids
            .into_iter()
            .map(|id| Slot::new(Arc::clone(&self.inner), id))
            .collect())
    }

    /// Slot with a known id. No native call is made.
    pub fn slot(&self, id: u64) -> Pkcs11Result<Slot<A>> {
        Ok(Slot::new(Arc::clone(&self.inner), A::Ulong::from_u64(id)?))
    }
}

/// A slot of a loaded module.
#[derive(Clone, Debug)]
pub struct Slot<A: Abi> {
    module: Arc<ModuleInner<A>>,
    id: A::Ulong,
}

impl<A: Abi> Slot<A> {
    fn new(module: Arc<ModuleInner<A>>, id: A::Ulong) -> Self {
        Self { module, id }
    }

    pub fn id(&self) -> u64 {
        self.id.to_u64()
    }

    pub fn info(&self) -> Pkcs11Result<SlotInfo> {
        let layout = *self.module.layout();
        let mut buf = NativeBuffer::zeroed(SlotInfo::size(&layout));
        self.module.invoke("C_GetSlotInfo", |f| {
            let get_slot_info = f.get_slot_info()?;
            // SAFETY: `buf` is a full CK_SLOT_INFO for this layout.
            Ok(unsafe { get_slot_info(self.id, buf.as_mut_ptr()) })
        })?;
        SlotInfo::decode(&layout, buf.as_bytes())
    }

    pub fn token_info(&self) -> Pkcs11Result<TokenInfo> {
        let layout = *self.module.layout();
        let mut buf = NativeBuffer::zeroed(TokenInfo::size(&layout));
        self.module.invoke("C_GetTokenInfo", |f| {
            let get_token_info = f.get_token_info()?;
            // SAFETY: `buf` is a full CK_TOKEN_INFO for this layout.
            Ok(unsafe { get_token_info(self.id, buf.as_mut_ptr()) })
        })?;
        TokenInfo::decode(&layout, buf.as_bytes())
    }

    pub fn mechanisms(&self) -> Pkcs11Result<Vec<MechanismType>> {
        let types = probe_then_fetch::<A::Ulong, _>("C_GetMechanismList", |buf, len| {
            self.module.call("C_GetMechanismList", |f| {
                let get_mechanism_list = f.get_mechanism_list()?;
                let mut count = A::Ulong::from_u64(*len)?;
                let list = buf.map_or(ptr::null_mut(), |buf| buf.as_mut_ptr());
                // SAFETY: `list` is null or holds `count` elements.
                let rv = unsafe { get_mechanism_list(self.id, list, &mut count) };
                *len = count.to_u64();
                Ok(rv)
            })
        })?;
        Ok(types
            .into_iter()
            .map(|value| MechanismType::new(value.to_u64()))
            .collect())
    }

    pub fn mechanism_info(&self, mechanism: MechanismType) -> Pkcs11Result<MechanismInfo> {
        let layout = *self.module.layout();
        let mechanism = A::Ulong::from_u64(mechanism.value())?;
        let mut buf = NativeBuffer::zeroed(MechanismInfo::size(&layout));
        self.module.invoke("C_GetMechanismInfo", |f| {
            let get_mechanism_info = f.get_mechanism_info()?;
            // SAFETY: `buf` is a full CK_MECHANISM_INFO for this layout.
            Ok(unsafe { get_mechanism_info(self.id, mechanism, buf.as_mut_ptr()) })
        })?;
        Ok(MechanismInfo::decode(&layout, buf.as_bytes()))
    }

    /// Initialize the token. The label is blank padded to 32 bytes and longer
    /// labels are rejected before any native call.
    pub fn init_token(&self, so_pin: Option<&[u8]>, label: &str) -> Pkcs11Result<()> {
        let label = encode_padded(label, LABEL_LEN)?;
        let (pin, pin_len) = pin_parts::<A::Ulong>(so_pin)?;
        self.module.invoke("C_InitToken", |f| {
            let init_token = f.init_token()?;
            // SAFETY: the PIN is null or `pin_len` bytes, the label 32 bytes.
            Ok(unsafe { init_token(self.id, pin, pin_len, label.as_ptr()) })
        })?;
        info!(slot = self.id(), "token initialized");
        Ok(())
    }

    pub fn open_session(&self, session_type: SessionType) -> Pkcs11Result<Session<A>> {
        let mut flags = CKF_SERIAL_SESSION as u64;
        if session_type == SessionType::ReadWrite {
            flags |= CKF_RW_SESSION as u64;
        }
        let flags = A::Ulong::from_u64(flags)?;
        let mut handle = A::Ulong::default();
        self.module.invoke("C_OpenSession", |f| {
            let open_session = f.open_session()?;
            // SAFETY: no application callback; the handle is a local.
            Ok(unsafe {
                open_session(self.id, flags, ptr::null_mut(), ptr::null(), &mut handle)
            })
        })?;
        info!(slot = self.id(), session = handle.to_u64(), ?session_type, "session opened");
        Ok(Session::new(Arc::clone(&self.module), handle))
    }

    pub fn close_all_sessions(&self) -> Pkcs11Result<()> {
        self.module.invoke("C_CloseAllSessions", |f| {
            let close_all_sessions = f.close_all_sessions()?;
            // SAFETY: scalar argument only.
            Ok(unsafe { close_all_sessions(self.id) })
        })?;
        info!(slot = self.id(), "all sessions closed");
        Ok(())
    }
}

//! Sessions and the object handles they produce.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cryptoki_sys::{
    CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL,
    CKU_CONTEXT_SPECIFIC, CKU_SO, CKU_USER,
};
use tracing::{debug, info, warn};

use crate::abi::{Abi, NativeUlong};
use crate::attribute::{AttributeKind, AttributeType, NativeTemplate, ObjectAttribute};
use crate::error::{Pkcs11Error, Pkcs11Result, check_rv};
use crate::info::SessionInfo;
use crate::marshal::NativeBuffer;
use crate::mechanism::{Mechanism, MechanismParams, NativeMechanism, Ssl3KeyMaterial};
use crate::module::{ModuleInner, pin_parts};

/// Handles fetched per `C_FindObjects` call.
const FIND_BATCH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionType {
    ReadOnly,
    ReadWrite,
}

/// `CK_USER_TYPE`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserType {
    SecurityOfficer,
    User,
    ContextSpecific,
}

impl UserType {
    pub fn value(self) -> u64 {
        match self {
            UserType::SecurityOfficer => CKU_SO as u64,
            UserType::User => CKU_USER as u64,
            UserType::ContextSpecific => CKU_CONTEXT_SPECIFIC as u64,
        }
    }
}

/// Handle of an object, only usable with sessions of the same variant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle<A: Abi> {
    handle: A::Ulong,
    _abi: PhantomData<A>,
}

impl<A: Abi> ObjectHandle<A> {
    /// Rebuild a handle from its raw value.
    pub fn from_raw(value: u64) -> Pkcs11Result<Self> {
        Ok(Self::new(A::Ulong::from_u64(value)?))
    }

    fn new(handle: A::Ulong) -> Self {
        Self {
            handle,
            _abi: PhantomData,
        }
    }

    pub fn value(&self) -> u64 {
        self.handle.to_u64()
    }
}

impl<A: Abi> fmt::Debug for ObjectHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle<{}>({})", A::VARIANT, self.handle)
    }
}

/// An open session. Dropping it closes the session unless it was closed
/// explicitly.
pub struct Session<A: Abi> {
    module: Arc<ModuleInner<A>>,
    handle: A::Ulong,
    closed: AtomicBool,
}

impl<A: Abi> fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("variant", &A::VARIANT)
            .field("handle", &self.handle)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<A: Abi> Session<A> {
    pub(crate) fn new(module: Arc<ModuleInner<A>>, handle: A::Ulong) -> Self {
        Self {
            module,
            handle,
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle.to_u64()
    }

    fn count(len: usize) -> Pkcs11Result<A::Ulong> {
        A::Ulong::from_usize(len)
    }

    /// Close the session. The native call is made every time, so closing an
    /// already closed session reports the module's invalid-handle status.
    pub fn close(&self) -> Pkcs11Result<()> {
        self.module.invoke("C_CloseSession", |f| {
            let close_session = f.close_session()?;
            // SAFETY: scalar argument only.
            Ok(unsafe { close_session(self.handle) })
        })?;
        self.closed.store(true, Ordering::Release);
        info!(session = self.handle(), "session closed");
        Ok(())
    }

    pub fn info(&self) -> Pkcs11Result<SessionInfo> {
        let layout = *self.module.layout();
        let mut buf = NativeBuffer::zeroed(SessionInfo::size(&layout));
        self.module.invoke("C_GetSessionInfo", |f| {
            let get_session_info = f.get_session_info()?;
            // SAFETY: `buf` is a full CK_SESSION_INFO for this layout.
            Ok(unsafe { get_session_info(self.handle, buf.as_mut_ptr()) })
        })?;
        Ok(SessionInfo::decode(&layout, buf.as_bytes()))
    }

    pub fn login(&self, user_type: UserType, pin: Option<&[u8]>) -> Pkcs11Result<()> {
        let user = A::Ulong::from_u64(user_type.value())?;
        let (pin, pin_len) = pin_parts::<A::Ulong>(pin)?;
        self.module.invoke("C_Login", |f| {
            let login = f.login()?;
            // SAFETY: the PIN is null or `pin_len` bytes.
            Ok(unsafe { login(self.handle, user, pin, pin_len) })
        })?;
        info!(session = self.handle(), ?user_type, "logged in");
        Ok(())
    }

    pub fn logout(&self) -> Pkcs11Result<()> {
        self.module.invoke("C_Logout", |f| {
            let logout = f.logout()?;
            // SAFETY: scalar argument only.
            Ok(unsafe { logout(self.handle) })
        })
    }

    pub fn init_pin(&self, pin: Option<&[u8]>) -> Pkcs11Result<()> {
        let (pin, pin_len) = pin_parts::<A::Ulong>(pin)?;
        self.module.invoke("C_InitPIN", |f| {
            let init_pin = f.init_pin()?;
            // SAFETY: the PIN is null or `pin_len` bytes.
            Ok(unsafe { init_pin(self.handle, pin, pin_len) })
        })
    }

    pub fn set_pin(&self, old_pin: Option<&[u8]>, new_pin: Option<&[u8]>) -> Pkcs11Result<()> {
        let (old, old_len) = pin_parts::<A::Ulong>(old_pin)?;
        let (new, new_len) = pin_parts::<A::Ulong>(new_pin)?;
        self.module.invoke("C_SetPIN", |f| {
            let set_pin = f.set_pin()?;
            // SAFETY: each PIN is null or its stated length.
            Ok(unsafe { set_pin(self.handle, old, old_len, new, new_len) })
        })
    }

    pub fn create_object(&self, attributes: &[ObjectAttribute]) -> Pkcs11Result<ObjectHandle<A>> {
        let mut template = NativeTemplate::encode(self.module.layout(), attributes)?;
        let count = Self::count(template.count())?;
        let mut object = A::Ulong::default();
        self.module.invoke("C_CreateObject", |f| {
            let create_object = f.create_object()?;
            // SAFETY: the template and its values live until the call returns.
            Ok(unsafe { create_object(self.handle, template.as_mut_ptr(), count, &mut object) })
        })?;
        Ok(ObjectHandle::new(object))
    }

    pub fn destroy_object(&self, object: ObjectHandle<A>) -> Pkcs11Result<()> {
        self.module.invoke("C_DestroyObject", |f| {
            let destroy_object = f.destroy_object()?;
            // SAFETY: scalar arguments only.
            Ok(unsafe { destroy_object(self.handle, object.handle) })
        })
    }

    /// One `C_GetAttributeValue` round. Sensitive and unknown attributes are
    /// reported per entry, so those statuses do not fail the call. A value
    /// that grew past the length probed for it fails with
    /// [`Pkcs11Error::LengthMismatch`].
    fn fetch_attributes(
        &self,
        object: ObjectHandle<A>,
        template: &mut NativeTemplate,
    ) -> Pkcs11Result<()> {
        let count = Self::count(template.count())?;
        let rv = self.module.call("C_GetAttributeValue", |f| {
            let get_attribute_value = f.get_attribute_value()?;
            // SAFETY: every record points at a buffer of its stated length or null.
            Ok(unsafe {
                get_attribute_value(self.handle, object.handle, template.as_mut_ptr(), count)
            })
        })?;
        if rv == CKR_ATTRIBUTE_SENSITIVE as u64 || rv == CKR_ATTRIBUTE_TYPE_INVALID as u64 {
            debug!(status = rv, "some attributes cannot be read");
            return Ok(());
        }
        if rv == CKR_BUFFER_TOO_SMALL as u64 {
            if let Some((attribute_type, supplied)) = template.overflow() {
                let required = self.value_length(object, attribute_type)?;
                return Err(Pkcs11Error::LengthMismatch {
                    operation: "C_GetAttributeValue",
                    required,
                    supplied,
                });
            }
        }
        check_rv("C_GetAttributeValue", rv)
    }

    /// Length the module currently reports for one attribute.
    fn value_length(
        &self,
        object: ObjectHandle<A>,
        attribute_type: AttributeType,
    ) -> Pkcs11Result<u64> {
        let mut probe = NativeTemplate::probe(self.module.layout(), &[attribute_type])?;
        self.fetch_attributes(object, &mut probe)?;
        Ok(probe.value_len(0))
    }

    /// Read attribute values, decoding each as the given kind. Values that
    /// cannot be revealed come back empty with `cannot_be_read` set.
    pub fn get_attribute_values(
        &self,
        object: ObjectHandle<A>,
        attributes: &[(AttributeType, AttributeKind)],
    ) -> Pkcs11Result<Vec<ObjectAttribute>> {
        let types: Vec<AttributeType> = attributes.iter().map(|(t, _)| *t).collect();
        let kinds: Vec<AttributeKind> = attributes.iter().map(|(_, k)| *k).collect();
        let mut template = NativeTemplate::probe(self.module.layout(), &types)?;
        self.fetch_attributes(object, &mut template)?;
        if template.allocate(&kinds)? {
            self.fetch_attributes(object, &mut template)?;
            template.allocate_nested()?;
        }
        self.fetch_attributes(object, &mut template)?;
        template.decode(&kinds)
    }

    pub fn get_attribute_value(
        &self,
        object: ObjectHandle<A>,
        attribute_type: AttributeType,
        kind: AttributeKind,
    ) -> Pkcs11Result<ObjectAttribute> {
        self.get_attribute_values(object, &[(attribute_type, kind)])?
            .pop()
            .ok_or_else(|| Pkcs11Error::encoding("module returned no attribute"))
    }

    pub fn set_attribute_values(
        &self,
        object: ObjectHandle<A>,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<()> {
        let mut template = NativeTemplate::encode(self.module.layout(), attributes)?;
        let count = Self::count(template.count())?;
        self.module.invoke("C_SetAttributeValue", |f| {
            let set_attribute_value = f.set_attribute_value()?;
            // SAFETY: the template and its values live until the call returns.
            Ok(unsafe {
                set_attribute_value(self.handle, object.handle, template.as_mut_ptr(), count)
            })
        })
    }

    /// All objects matching `attributes`. The search is always finished, even
    /// when fetching results fails.
    pub fn find_objects(
        &self,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<Vec<ObjectHandle<A>>> {
        let mut template = NativeTemplate::encode(self.module.layout(), attributes)?;
        let count = Self::count(template.count())?;
        self.module.invoke("C_FindObjectsInit", |f| {
            let find_objects_init = f.find_objects_init()?;
            // SAFETY: the template and its values live until the call returns.
            Ok(unsafe { find_objects_init(self.handle, template.as_mut_ptr(), count) })
        })?;

        let found = self.collect_found();
        let finished = self.module.invoke("C_FindObjectsFinal", |f| {
            let find_objects_final = f.find_objects_final()?;
            // SAFETY: scalar argument only.
            Ok(unsafe { find_objects_final(self.handle) })
        });
        let found = found?;
        finished?;
        Ok(found)
    }

    fn collect_found(&self) -> Pkcs11Result<Vec<ObjectHandle<A>>> {
        let batch_len = Self::count(FIND_BATCH)?;
        let mut found = Vec::new();
        loop {
            let mut batch = vec![A::Ulong::default(); FIND_BATCH];
            let mut returned = A::Ulong::default();
            self.module.invoke("C_FindObjects", |f| {
                let find_objects = f.find_objects()?;
                // SAFETY: `batch` holds `batch_len` elements.
                Ok(unsafe {
                    find_objects(self.handle, batch.as_mut_ptr(), batch_len, &mut returned)
                })
            })?;
            let returned = returned.to_usize()?;
            if returned > FIND_BATCH {
                return Err(Pkcs11Error::LengthMismatch {
                    operation: "C_FindObjects",
                    required: returned as u64,
                    supplied: FIND_BATCH as u64,
                });
            }
            found.extend(batch[..returned].iter().copied().map(ObjectHandle::new));
            if returned < FIND_BATCH {
                return Ok(found);
            }
        }
    }

    pub fn generate_key(
        &self,
        mechanism: &Mechanism,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<ObjectHandle<A>> {
        let layout = self.module.layout();
        let mut mechanism = NativeMechanism::encode(layout, mechanism)?;
        let mut template = NativeTemplate::encode(layout, attributes)?;
        let count = Self::count(template.count())?;
        let mut key = A::Ulong::default();
        self.module.invoke("C_GenerateKey", |f| {
            let generate_key = f.generate_key()?;
            // SAFETY: mechanism and template outlive the call.
            Ok(unsafe {
                generate_key(
                    self.handle,
                    mechanism.as_mut_ptr(),
                    template.as_mut_ptr(),
                    count,
                    &mut key,
                )
            })
        })?;
        Ok(ObjectHandle::new(key))
    }

    /// Returns the public and private key handles.
    pub fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_attributes: &[ObjectAttribute],
        private_attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<(ObjectHandle<A>, ObjectHandle<A>)> {
        let layout = self.module.layout();
        let mut mechanism = NativeMechanism::encode(layout, mechanism)?;
        let mut public = NativeTemplate::encode(layout, public_attributes)?;
        let mut private = NativeTemplate::encode(layout, private_attributes)?;
        let public_count = Self::count(public.count())?;
        let private_count = Self::count(private.count())?;
        let mut public_key = A::Ulong::default();
        let mut private_key = A::Ulong::default();
        self.module.invoke("C_GenerateKeyPair", |f| {
            let generate_key_pair = f.generate_key_pair()?;
            // SAFETY: mechanism and templates outlive the call.
            Ok(unsafe {
                generate_key_pair(
                    self.handle,
                    mechanism.as_mut_ptr(),
                    public.as_mut_ptr(),
                    public_count,
                    private.as_mut_ptr(),
                    private_count,
                    &mut public_key,
                    &mut private_key,
                )
            })
        })?;
        Ok((ObjectHandle::new(public_key), ObjectHandle::new(private_key)))
    }

    pub fn derive_key(
        &self,
        mechanism: &Mechanism,
        base_key: ObjectHandle<A>,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<ObjectHandle<A>> {
        let mut key = A::Ulong::default();
        self.derive(mechanism, base_key, attributes, &mut key)?;
        Ok(ObjectHandle::new(key))
    }

    /// Derive with SSL3 key-material parameters. The module creates several
    /// keys and reports them through the parameter structure instead of a
    /// single handle.
    pub fn derive_key_material(
        &self,
        mechanism: &Mechanism,
        base_key: ObjectHandle<A>,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<Ssl3KeyMaterial<ObjectHandle<A>>> {
        if !matches!(mechanism.params(), MechanismParams::Ssl3KeyMat(_)) {
            return Err(Pkcs11Error::invalid(format!(
                "mechanism {} has no SSL3 key-material parameters",
                mechanism.mechanism_type()
            )));
        }
        let native = self.derive(mechanism, base_key, attributes, ptr::null_mut())?;
        native
            .key_material()
            .ok_or_else(|| Pkcs11Error::invalid("mechanism carried no key-material output"))?
            .try_map(ObjectHandle::from_raw)
    }

    fn derive(
        &self,
        mechanism: &Mechanism,
        base_key: ObjectHandle<A>,
        attributes: &[ObjectAttribute],
        key: *mut A::Ulong,
    ) -> Pkcs11Result<NativeMechanism> {
        let layout = self.module.layout();
        let mut native = NativeMechanism::encode(layout, mechanism)?;
        let mut template = NativeTemplate::encode(layout, attributes)?;
        let count = Self::count(template.count())?;
        self.module.invoke("C_DeriveKey", |f| {
            let derive_key = f.derive_key()?;
            // SAFETY: mechanism and template outlive the call; `key` is null or
            // a valid out location.
            Ok(unsafe {
                derive_key(
                    self.handle,
                    native.as_mut_ptr(),
                    base_key.handle,
                    template.as_mut_ptr(),
                    count,
                    key,
                )
            })
        })?;
        Ok(native)
    }

    pub fn generate_random(&self, len: usize) -> Pkcs11Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let count = Self::count(len)?;
        self.module.invoke("C_GenerateRandom", |f| {
            let generate_random = f.generate_random()?;
            // SAFETY: `buf` holds `len` bytes.
            Ok(unsafe { generate_random(self.handle, buf.as_mut_ptr(), count) })
        })?;
        Ok(buf)
    }

    pub fn seed_random(&self, seed: &[u8]) -> Pkcs11Result<()> {
        let count = Self::count(seed.len())?;
        self.module.invoke("C_SeedRandom", |f| {
            let seed_random = f.seed_random()?;
            // SAFETY: `seed` holds `count` bytes.
            Ok(unsafe { seed_random(self.handle, seed.as_ptr(), count) })
        })
    }
}

impl<A: Abi> Drop for Session<A> {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let rv = self.module.call("C_CloseSession", |f| {
            let close_session = f.close_session()?;
            // SAFETY: scalar argument only.
            Ok(unsafe { close_session(self.handle) })
        });
        match rv.and_then(|rv| check_rv("C_CloseSession", rv)) {
            Ok(()) => debug!(session = self.handle(), "session closed on drop"),
            Err(Pkcs11Error::InvalidHandle { .. }) => {
                debug!(session = self.handle(), "session already closed by the module")
            }
            // the module is already finalized and the session gone with it
            Err(Pkcs11Error::UseAfterClose { .. }) => {}
            Err(err) => {
                warn!(session = self.handle(), error = %err, "failed to close session on drop")
            }
        }
    }
}

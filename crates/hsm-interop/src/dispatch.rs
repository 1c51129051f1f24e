//! Variant selection and the uniform, variant-erased entity types.
//!
//! [`Pkcs11Factory`] picks one of the four variants from the configured or
//! detected profile. The returned [`Pkcs11`] and everything reached from it
//! behave the same whichever variant backs them; mixing handles from
//! different variants fails with [`Pkcs11Error::InvalidArgument`].

use std::ffi::c_void;

use tracing::debug;

use crate::abi::{Abi, AbiVariant, Ulong32Natural, Ulong32Packed, Ulong64Natural, Ulong64Packed};
use crate::attribute::{AttributeKind, AttributeType, ObjectAttribute};
use crate::config::{InitSource, ModuleConfig};
use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::info::{LibraryInfo, MechanismInfo, SessionInfo, SlotInfo, TokenInfo, Version};
use crate::mechanism::{Mechanism, MechanismType, Ssl3KeyMaterial};
use crate::module::{Cryptoki, Slot};
use crate::platform::PlatformProfile;
use crate::session::{ObjectHandle, Session, SessionType, UserType};

/// Expands `$body` once per variant with `$inner` bound to the generic
/// entity inside.
macro_rules! dispatch {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            Self::Ulong32Natural($inner) => $body,
            Self::Ulong32Packed($inner) => $body,
            Self::Ulong64Natural($inner) => $body,
            Self::Ulong64Packed($inner) => $body,
        }
    };
}

macro_rules! uniform_enum {
    ($(#[$meta:meta])* $name:ident wraps $entity:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub enum $name {
            Ulong32Natural($entity<Ulong32Natural>),
            Ulong32Packed($entity<Ulong32Packed>),
            Ulong64Natural($entity<Ulong64Natural>),
            Ulong64Packed($entity<Ulong64Packed>),
        }

        impl $name {
            pub fn variant(&self) -> AbiVariant {
                match self {
                    Self::Ulong32Natural(_) => AbiVariant::Ulong32Natural,
                    Self::Ulong32Packed(_) => AbiVariant::Ulong32Packed,
                    Self::Ulong64Natural(_) => AbiVariant::Ulong64Natural,
                    Self::Ulong64Packed(_) => AbiVariant::Ulong64Packed,
                }
            }
        }

        impl From<$entity<Ulong32Natural>> for $name {
            fn from(value: $entity<Ulong32Natural>) -> Self {
                Self::Ulong32Natural(value)
            }
        }

        impl From<$entity<Ulong32Packed>> for $name {
            fn from(value: $entity<Ulong32Packed>) -> Self {
                Self::Ulong32Packed(value)
            }
        }

        impl From<$entity<Ulong64Natural>> for $name {
            fn from(value: $entity<Ulong64Natural>) -> Self {
                Self::Ulong64Natural(value)
            }
        }

        impl From<$entity<Ulong64Packed>> for $name {
            fn from(value: $entity<Ulong64Packed>) -> Self {
                Self::Ulong64Packed(value)
            }
        }
    };
}

uniform_enum!(
    /// A loaded module of any variant.
    Pkcs11 wraps Cryptoki
);
uniform_enum!(
    /// A slot of any variant.
    Pkcs11Slot wraps Slot
);
uniform_enum!(
    /// A session of any variant.
    Pkcs11Session wraps Session
);

/// An object handle tagged with the variant that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pkcs11Object {
    Ulong32Natural(ObjectHandle<Ulong32Natural>),
    Ulong32Packed(ObjectHandle<Ulong32Packed>),
    Ulong64Natural(ObjectHandle<Ulong64Natural>),
    Ulong64Packed(ObjectHandle<Ulong64Packed>),
}

impl Pkcs11Object {
    pub fn variant(&self) -> AbiVariant {
        match self {
            Self::Ulong32Natural(_) => AbiVariant::Ulong32Natural,
            Self::Ulong32Packed(_) => AbiVariant::Ulong32Packed,
            Self::Ulong64Natural(_) => AbiVariant::Ulong64Natural,
            Self::Ulong64Packed(_) => AbiVariant::Ulong64Packed,
        }
    }

    pub fn value(&self) -> u64 {
        dispatch!(self, handle => handle.value())
    }

    /// The handle as variant `A`, if that is the variant that produced it.
    fn narrow<A: Abi>(self) -> Pkcs11Result<ObjectHandle<A>> {
        if self.variant() != A::VARIANT {
            return Err(Pkcs11Error::invalid(format!(
                "object handle from {} used with a {} session",
                self.variant(),
                A::VARIANT
            )));
        }
        ObjectHandle::from_raw(self.value())
    }
}

/// Wrap a generic handle into the uniform one. The raw value already fits
/// the variant's width.
fn wrap_object<A: Abi>(handle: ObjectHandle<A>) -> Pkcs11Result<Pkcs11Object> {
    let value = handle.value();
    Ok(match A::VARIANT {
        AbiVariant::Ulong32Natural => Pkcs11Object::Ulong32Natural(ObjectHandle::from_raw(value)?),
        AbiVariant::Ulong32Packed => Pkcs11Object::Ulong32Packed(ObjectHandle::from_raw(value)?),
        AbiVariant::Ulong64Natural => Pkcs11Object::Ulong64Natural(ObjectHandle::from_raw(value)?),
        AbiVariant::Ulong64Packed => Pkcs11Object::Ulong64Packed(ObjectHandle::from_raw(value)?),
    })
}

fn wrap_objects<A: Abi>(handles: Vec<ObjectHandle<A>>) -> Pkcs11Result<Vec<Pkcs11Object>> {
    handles.into_iter().map(wrap_object).collect()
}

/// Entry point that picks the variant matching a module.
pub struct Pkcs11Factory;

impl Pkcs11Factory {
    /// Variant for the configured profile. Explicit `packing` and
    /// `ulong_width` override detection.
    pub fn select(config: &ModuleConfig) -> Pkcs11Result<AbiVariant> {
        let profile = config.profile();
        let variant = AbiVariant::select(&profile)?;
        debug!(profile = %profile, %variant, "selected ABI variant");
        Ok(variant)
    }

    /// Load and initialize the library named in `config`.
    pub fn create(config: &ModuleConfig) -> Pkcs11Result<Pkcs11> {
        if config.initialization_source == InitSource::Supplied {
            return Err(Pkcs11Error::config(
                "a supplied function table must be passed to create_with_function_list",
            ));
        }
        Ok(match Self::select(config)? {
            AbiVariant::Ulong32Natural => Cryptoki::<Ulong32Natural>::load(config)?.into(),
            AbiVariant::Ulong32Packed => Cryptoki::<Ulong32Packed>::load(config)?.into(),
            AbiVariant::Ulong64Natural => Cryptoki::<Ulong64Natural>::load(config)?.into(),
            AbiVariant::Ulong64Packed => Cryptoki::<Ulong64Packed>::load(config)?.into(),
        })
    }

    /// Initialize a module from a function table the caller already holds.
    ///
    /// # Safety
    /// `list` must point to a `CK_FUNCTION_LIST` laid out for the profile
    /// `config` describes, with entry points that stay valid for the
    /// lifetime of the returned module and everything derived from it.
    pub unsafe fn create_with_function_list(
        config: &ModuleConfig,
        list: *const c_void,
    ) -> Pkcs11Result<Pkcs11> {
        // SAFETY: forwarded from the caller.
        Ok(match Self::select(config)? {
            AbiVariant::Ulong32Natural => {
                unsafe { Cryptoki::<Ulong32Natural>::from_function_list(config, list) }?.into()
            }
            AbiVariant::Ulong32Packed => {
                unsafe { Cryptoki::<Ulong32Packed>::from_function_list(config, list) }?.into()
            }
            AbiVariant::Ulong64Natural => {
                unsafe { Cryptoki::<Ulong64Natural>::from_function_list(config, list) }?.into()
            }
            AbiVariant::Ulong64Packed => {
                unsafe { Cryptoki::<Ulong64Packed>::from_function_list(config, list) }?.into()
            }
        })
    }
}

impl Pkcs11 {
    pub fn profile(&self) -> PlatformProfile {
        dispatch!(self, module => module.profile())
    }

    pub fn function_list_version(&self) -> Version {
        dispatch!(self, module => module.function_list_version())
    }

    pub fn is_finalized(&self) -> bool {
        dispatch!(self, module => module.is_finalized())
    }

    pub fn finalize(&self) -> Pkcs11Result<()> {
        dispatch!(self, module => module.finalize())
    }

    pub fn info(&self) -> Pkcs11Result<LibraryInfo> {
        dispatch!(self, module => module.info())
    }

    pub fn slots(&self, token_present: bool) -> Pkcs11Result<Vec<Pkcs11Slot>> {
        dispatch!(self, module => Ok(module
            .slots(token_present)?
            .into_iter()
            .map(Pkcs11Slot::from)
            .collect()))
    }

    pub fn slot(&self, id: u64) -> Pkcs11Result<Pkcs11Slot> {
        dispatch!(self, module => module.slot(id).map(Pkcs11Slot::from))
    }
}

impl Pkcs11Slot {
    pub fn id(&self) -> u64 {
        dispatch!(self, slot => slot.id())
    }

    pub fn info(&self) -> Pkcs11Result<SlotInfo> {
        dispatch!(self, slot => slot.info())
    }

    pub fn token_info(&self) -> Pkcs11Result<TokenInfo> {
        dispatch!(self, slot => slot.token_info())
    }

    pub fn mechanisms(&self) -> Pkcs11Result<Vec<MechanismType>> {
        dispatch!(self, slot => slot.mechanisms())
    }

    pub fn mechanism_info(&self, mechanism: MechanismType) -> Pkcs11Result<MechanismInfo> {
        dispatch!(self, slot => slot.mechanism_info(mechanism))
    }

    pub fn init_token(&self, so_pin: Option<&[u8]>, label: &str) -> Pkcs11Result<()> {
        dispatch!(self, slot => slot.init_token(so_pin, label))
    }

    pub fn open_session(&self, session_type: SessionType) -> Pkcs11Result<Pkcs11Session> {
        dispatch!(self, slot => slot.open_session(session_type).map(Pkcs11Session::from))
    }

    pub fn close_all_sessions(&self) -> Pkcs11Result<()> {
        dispatch!(self, slot => slot.close_all_sessions())
    }
}

impl Pkcs11Session {
    pub fn handle(&self) -> u64 {
        dispatch!(self, session => session.handle())
    }

    pub fn close(&self) -> Pkcs11Result<()> {
        dispatch!(self, session => session.close())
    }

    pub fn info(&self) -> Pkcs11Result<SessionInfo> {
        dispatch!(self, session => session.info())
    }

    pub fn login(&self, user_type: UserType, pin: Option<&[u8]>) -> Pkcs11Result<()> {
        dispatch!(self, session => session.login(user_type, pin))
    }

    pub fn logout(&self) -> Pkcs11Result<()> {
        dispatch!(self, session => session.logout())
    }

    pub fn init_pin(&self, pin: Option<&[u8]>) -> Pkcs11Result<()> {
        dispatch!(self, session => session.init_pin(pin))
    }

    pub fn set_pin(&self, old_pin: Option<&[u8]>, new_pin: Option<&[u8]>) -> Pkcs11Result<()> {
        dispatch!(self, session => session.set_pin(old_pin, new_pin))
    }

    pub fn create_object(&self, attributes: &[ObjectAttribute]) -> Pkcs11Result<Pkcs11Object> {
        dispatch!(self, session => wrap_object(session.create_object(attributes)?))
    }

    pub fn destroy_object(&self, object: Pkcs11Object) -> Pkcs11Result<()> {
        dispatch!(self, session => session.destroy_object(object.narrow()?))
    }

    pub fn get_attribute_values(
        &self,
        object: Pkcs11Object,
        attributes: &[(AttributeType, AttributeKind)],
    ) -> Pkcs11Result<Vec<ObjectAttribute>> {
        dispatch!(self, session => session.get_attribute_values(object.narrow()?, attributes))
    }

    pub fn get_attribute_value(
        &self,
        object: Pkcs11Object,
        attribute_type: AttributeType,
        kind: AttributeKind,
    ) -> Pkcs11Result<ObjectAttribute> {
        dispatch!(self, session => {
            session.get_attribute_value(object.narrow()?, attribute_type, kind)
        })
    }

    pub fn set_attribute_values(
        &self,
        object: Pkcs11Object,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<()> {
        dispatch!(self, session => session.set_attribute_values(object.narrow()?, attributes))
    }

    pub fn find_objects(&self, attributes: &[ObjectAttribute]) -> Pkcs11Result<Vec<Pkcs11Object>> {
        dispatch!(self, session => wrap_objects(session.find_objects(attributes)?))
    }

    pub fn generate_key(
        &self,
        mechanism: &Mechanism,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<Pkcs11Object> {
        dispatch!(self, session => wrap_object(session.generate_key(mechanism, attributes)?))
    }

    pub fn generate_key_pair(
        &self,
        mechanism: &Mechanism,
        public_attributes: &[ObjectAttribute],
        private_attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<(Pkcs11Object, Pkcs11Object)> {
        dispatch!(self, session => {
            let (public, private) =
                session.generate_key_pair(mechanism, public_attributes, private_attributes)?;
            Ok((wrap_object(public)?, wrap_object(private)?))
        })
    }

    pub fn derive_key(
        &self,
        mechanism: &Mechanism,
        base_key: Pkcs11Object,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<Pkcs11Object> {
        dispatch!(self, session => wrap_object(
            session.derive_key(mechanism, base_key.narrow()?, attributes)?
        ))
    }

    pub fn derive_key_material(
        &self,
        mechanism: &Mechanism,
        base_key: Pkcs11Object,
        attributes: &[ObjectAttribute],
    ) -> Pkcs11Result<Ssl3KeyMaterial<Pkcs11Object>> {
        dispatch!(self, session => session
            .derive_key_material(mechanism, base_key.narrow()?, attributes)?
            .try_map(wrap_object))
    }

    pub fn generate_random(&self, len: usize) -> Pkcs11Result<Vec<u8>> {
        dispatch!(self, session => session.generate_random(len))
    }

    pub fn seed_random(&self, seed: &[u8]) -> Pkcs11Result<()> {
        dispatch!(self, session => session.seed_random(seed))
    }
}

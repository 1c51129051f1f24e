//! Platform-adaptive PKCS#11 client bridge for FerroHSM.
//!
//! Loads a native Cryptoki module and exposes its slots, tokens, sessions,
//! objects and mechanisms through one safe interface, whichever of the four
//! binary layouts the module was built with: a 4- or 8-byte `CK_ULONG`,
//! combined with natural or one-byte structure packing.
//!
//! Each layout is an [`abi::Abi`] marker. [`Cryptoki`], [`Slot`], [`Session`]
//! and [`ObjectHandle`] are generic over it, so handles of different layouts
//! cannot be mixed. [`Pkcs11Factory`] selects the layout from a
//! [`ModuleConfig`] and returns the variant-erased [`Pkcs11`] wrapper.
//!
//! ```no_run
//! use hsm_interop::{ModuleConfig, Pkcs11Factory, SessionType};
//!
//! # fn main() -> hsm_interop::Pkcs11Result<()> {
//! let module = Pkcs11Factory::create(&ModuleConfig::new("/usr/lib/softhsm/libsofthsm2.so"))?;
//! for slot in module.slots(true)? {
//!     let session = slot.open_session(SessionType::ReadOnly)?;
//!     println!("{:?}", session.info()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod attribute;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod functions;
pub mod info;
pub mod layout;
pub mod marshal;
pub mod mechanism;
pub mod module;
pub mod platform;
pub mod session;

pub use abi::{
    Abi, AbiVariant, NativeUlong, Ulong32Natural, Ulong32Packed, Ulong64Natural, Ulong64Packed,
};
pub use attribute::{AttributeKind, AttributeType, AttributeValue, ObjectAttribute};
pub use config::{AppType, InitSource, ModuleConfig};
pub use dispatch::{Pkcs11, Pkcs11Factory, Pkcs11Object, Pkcs11Session, Pkcs11Slot};
pub use error::{Pkcs11Error, Pkcs11Result, StatusCode, check_rv};
pub use info::{LibraryInfo, MechanismInfo, SessionInfo, SlotInfo, TokenInfo, Version};
pub use mechanism::{Mechanism, MechanismParams, MechanismType, Ssl3KeyMatParams, Ssl3KeyMaterial};
pub use module::{Cryptoki, Slot};
pub use platform::{Packing, PlatformProfile, UlongWidth};
pub use session::{ObjectHandle, Session, SessionType, UserType};

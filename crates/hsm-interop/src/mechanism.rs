//! Mechanisms and their profile-dependent parameter structures.

use std::ffi::c_void;
use std::fmt;

use cryptoki_sys::{
    CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_GCM, CKM_AES_KEY_GEN, CKM_CONCATENATE_BASE_AND_DATA,
    CKM_ECDH1_DERIVE, CKM_ECDSA, CKM_EC_KEY_PAIR_GEN, CKM_GENERIC_SECRET_KEY_GEN,
    CKM_RSA_PKCS, CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_SHA256, CKM_SHA256_RSA_PKCS,
    CKM_SSL3_KEY_AND_MAC_DERIVE, CKM_XOR_BASE_AND_DATA,
};

use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::layout::{
    ECDH1_DERIVE_PARAMS, KEY_DERIVATION_STRING_DATA, Layout, SSL3_KEY_MAT_OUT,
    SSL3_KEY_MAT_PARAMS,
};
use crate::marshal::{NativeBuffer, encode_ulong, read_ulong, write_pointer, write_ulong};

/// `CK_MECHANISM_TYPE`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MechanismType(u64);

impl MechanismType {
    pub const RSA_PKCS_KEY_PAIR_GEN: Self = Self(CKM_RSA_PKCS_KEY_PAIR_GEN as u64);
    pub const RSA_PKCS: Self = Self(CKM_RSA_PKCS as u64);
    pub const SHA256_RSA_PKCS: Self = Self(CKM_SHA256_RSA_PKCS as u64);
    pub const SHA256: Self = Self(CKM_SHA256 as u64);
    pub const EC_KEY_PAIR_GEN: Self = Self(CKM_EC_KEY_PAIR_GEN as u64);
    pub const ECDSA: Self = Self(CKM_ECDSA as u64);
    pub const ECDH1_DERIVE: Self = Self(CKM_ECDH1_DERIVE as u64);
    pub const AES_KEY_GEN: Self = Self(CKM_AES_KEY_GEN as u64);
    pub const AES_CBC: Self = Self(CKM_AES_CBC as u64);
    pub const AES_CBC_PAD: Self = Self(CKM_AES_CBC_PAD as u64);
    pub const AES_GCM: Self = Self(CKM_AES_GCM as u64);
    pub const GENERIC_SECRET_KEY_GEN: Self = Self(CKM_GENERIC_SECRET_KEY_GEN as u64);
    pub const CONCATENATE_BASE_AND_DATA: Self = Self(CKM_CONCATENATE_BASE_AND_DATA as u64);
    pub const XOR_BASE_AND_DATA: Self = Self(CKM_XOR_BASE_AND_DATA as u64);
    pub const SSL3_KEY_AND_MAC_DERIVE: Self = Self(CKM_SSL3_KEY_AND_MAC_DERIVE as u64);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for MechanismType {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Parameters of `CKM_SSL3_KEY_AND_MAC_DERIVE` and related mechanisms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ssl3KeyMatParams {
    pub mac_size_bits: u64,
    pub key_size_bits: u64,
    pub iv_size_bits: u64,
    pub is_export: bool,
    pub client_random: Vec<u8>,
    pub server_random: Vec<u8>,
}

/// Mechanism parameter, either raw or one of the structured kinds whose
/// layout depends on the profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MechanismParams {
    #[default]
    None,
    Bytes(Vec<u8>),
    Ulong(u64),
    /// `CK_KEY_DERIVATION_STRING_DATA`
    KeyDerivationString(Vec<u8>),
    /// `CK_ECDH1_DERIVE_PARAMS`
    Ecdh1Derive {
        kdf: u64,
        shared_data: Vec<u8>,
        public_data: Vec<u8>,
    },
    /// `CK_SSL3_KEY_MAT_PARAMS`
    Ssl3KeyMat(Ssl3KeyMatParams),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mechanism {
    mechanism_type: MechanismType,
    params: MechanismParams,
}

impl Mechanism {
    pub fn new(mechanism_type: MechanismType) -> Self {
        Self {
            mechanism_type,
            params: MechanismParams::None,
        }
    }

    pub fn with_params(mechanism_type: MechanismType, params: MechanismParams) -> Self {
        Self {
            mechanism_type,
            params,
        }
    }

    pub fn mechanism_type(&self) -> MechanismType {
        self.mechanism_type
    }

    pub fn params(&self) -> &MechanismParams {
        &self.params
    }
}

impl From<MechanismType> for Mechanism {
    fn from(mechanism_type: MechanismType) -> Self {
        Self::new(mechanism_type)
    }
}

/// Handles and IVs produced by an SSL3 key-material derivation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ssl3KeyMaterial<H> {
    pub client_mac_secret: H,
    pub server_mac_secret: H,
    pub client_key: H,
    pub server_key: H,
    pub client_iv: Vec<u8>,
    pub server_iv: Vec<u8>,
}

impl<H> Ssl3KeyMaterial<H> {
    pub fn map<T>(self, mut f: impl FnMut(H) -> T) -> Ssl3KeyMaterial<T> {
        Ssl3KeyMaterial {
            client_mac_secret: f(self.client_mac_secret),
            server_mac_secret: f(self.server_mac_secret),
            client_key: f(self.client_key),
            server_key: f(self.server_key),
            client_iv: self.client_iv,
            server_iv: self.server_iv,
        }
    }

    pub fn try_map<T, E>(
        self,
        mut f: impl FnMut(H) -> Result<T, E>,
    ) -> Result<Ssl3KeyMaterial<T>, E> {
        Ok(Ssl3KeyMaterial {
            client_mac_secret: f(self.client_mac_secret)?,
            server_mac_secret: f(self.server_mac_secret)?,
            client_key: f(self.client_key)?,
            server_key: f(self.server_key)?,
            client_iv: self.client_iv,
            server_iv: self.server_iv,
        })
    }
}

/// A `CK_MECHANISM` laid out for one profile with every buffer it points to.
#[derive(Debug)]
pub struct NativeMechanism {
    layout: Layout,
    record: NativeBuffer,
    param: NativeBuffer,
    data: Vec<NativeBuffer>,
    key_material: Option<KeyMaterialOut>,
}

#[derive(Debug)]
struct KeyMaterialOut {
    out: NativeBuffer,
    client_iv: NativeBuffer,
    server_iv: NativeBuffer,
}

impl NativeMechanism {
    pub fn encode(layout: &Layout, mechanism: &Mechanism) -> Pkcs11Result<Self> {
        let mut native = Self {
            layout: *layout,
            record: NativeBuffer::zeroed(layout.mechanism().size()),
            param: NativeBuffer::default(),
            data: Vec::new(),
            key_material: None,
        };
        native.param = match &mechanism.params {
            MechanismParams::None => NativeBuffer::default(),
            MechanismParams::Bytes(bytes) => NativeBuffer::from_bytes(bytes),
            MechanismParams::Ulong(value) => {
                NativeBuffer::from_bytes(&encode_ulong(layout, *value)?)
            }
            MechanismParams::KeyDerivationString(data) => {
                let record = layout.record(KEY_DERIVATION_STRING_DATA);
                let mut param = NativeBuffer::zeroed(record.size());
                let data = native.keep(data);
                write_pointer(param.as_bytes_mut(), record.offset(0), data.0);
                write_ulong(layout, param.as_bytes_mut(), record.offset(1), data.1)?;
                param
            }
            MechanismParams::Ecdh1Derive {
                kdf,
                shared_data,
                public_data,
            } => {
                let record = layout.record(ECDH1_DERIVE_PARAMS);
                let mut param = NativeBuffer::zeroed(record.size());
                let shared = native.keep(shared_data);
                let public = native.keep(public_data);
                let bytes = param.as_bytes_mut();
                write_ulong(layout, bytes, record.offset(0), *kdf)?;
                write_ulong(layout, bytes, record.offset(1), shared.1)?;
                write_pointer(bytes, record.offset(2), shared.0);
                write_ulong(layout, bytes, record.offset(3), public.1)?;
                write_pointer(bytes, record.offset(4), public.0);
                param
            }
            MechanismParams::Ssl3KeyMat(params) => native.encode_ssl3(params)?,
        };

        let record = layout.mechanism();
        let param_ptr = native.param.as_ptr();
        let param_len = native.param.len() as u64;
        let bytes = native.record.as_bytes_mut();
        write_ulong(layout, bytes, record.offset(0), mechanism.mechanism_type.value())?;
        write_pointer(bytes, record.offset(1), param_ptr);
        write_ulong(layout, bytes, record.offset(2), param_len)?;
        Ok(native)
    }

    /// Copy `data` into an owned buffer and return its pointer and length.
    fn keep(&mut self, data: &[u8]) -> (*const c_void, u64) {
        let buffer = NativeBuffer::from_bytes(data);
        let entry = (buffer.as_ptr(), buffer.len() as u64);
        self.data.push(buffer);
        entry
    }

    fn encode_ssl3(&mut self, params: &Ssl3KeyMatParams) -> Pkcs11Result<NativeBuffer> {
        let layout = self.layout;
        if params.iv_size_bits % 8 != 0 {
            return Err(Pkcs11Error::invalid(format!(
                "IV size of {} bits is not a whole number of bytes",
                params.iv_size_bits
            )));
        }
        let iv_len = usize::try_from(params.iv_size_bits / 8).map_err(Pkcs11Error::invalid)?;
        let mut material = KeyMaterialOut {
            out: NativeBuffer::zeroed(layout.record(SSL3_KEY_MAT_OUT).size()),
            client_iv: NativeBuffer::zeroed(iv_len),
            server_iv: NativeBuffer::zeroed(iv_len),
        };
        let out_record = layout.record(SSL3_KEY_MAT_OUT);
        let client_iv = material.client_iv.as_ptr();
        let server_iv = material.server_iv.as_ptr();
        write_pointer(material.out.as_bytes_mut(), out_record.offset(4), client_iv);
        write_pointer(material.out.as_bytes_mut(), out_record.offset(5), server_iv);

        let client = self.keep(&params.client_random);
        let server = self.keep(&params.server_random);
        let record = layout.record(SSL3_KEY_MAT_PARAMS);
        let mut param = NativeBuffer::zeroed(record.size());
        let bytes = param.as_bytes_mut();
        write_ulong(&layout, bytes, record.offset(0), params.mac_size_bits)?;
        write_ulong(&layout, bytes, record.offset(1), params.key_size_bits)?;
        write_ulong(&layout, bytes, record.offset(2), params.iv_size_bits)?;
        bytes[record.offset(3)] = params.is_export as u8;
        write_pointer(bytes, record.offset(4), client.0);
        write_ulong(&layout, bytes, record.offset(5), client.1)?;
        write_pointer(bytes, record.offset(6), server.0);
        write_ulong(&layout, bytes, record.offset(7), server.1)?;
        write_pointer(bytes, record.offset(8), material.out.as_ptr());
        self.key_material = Some(material);
        Ok(param)
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.record.as_mut_ptr()
    }

    /// Read the key-material output the module filled in during derivation.
    /// `None` unless the mechanism carried SSL3 key-material parameters.
    pub fn key_material(&self) -> Option<Ssl3KeyMaterial<u64>> {
        let material = self.key_material.as_ref()?;
        let record = self.layout.record(SSL3_KEY_MAT_OUT);
        let out = material.out.as_bytes();
        Some(Ssl3KeyMaterial {
            client_mac_secret: read_ulong(&self.layout, out, record.offset(0)),
            server_mac_secret: read_ulong(&self.layout, out, record.offset(1)),
            client_key: read_ulong(&self.layout, out, record.offset(2)),
            server_key: read_ulong(&self.layout, out, record.offset(3)),
            client_iv: material.client_iv.as_bytes().to_vec(),
            server_iv: material.server_iv.as_bytes().to_vec(),
        })
    }
}

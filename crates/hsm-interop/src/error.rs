//! Error taxonomy and translation of native `CK_RV` status codes.

use std::fmt;
use std::path::PathBuf;

use cryptoki_sys::{
    CKR_BUFFER_TOO_SMALL, CKR_FUNCTION_NOT_SUPPORTED, CKR_KEY_HANDLE_INVALID,
    CKR_OBJECT_HANDLE_INVALID, CKR_OK, CKR_SESSION_HANDLE_INVALID,
};
use thiserror::Error;

pub type Pkcs11Result<T> = Result<T, Pkcs11Error>;

/// Raw status value returned by a native Cryptoki function, widened to 64 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u64);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(CKR_OK as u64);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Symbolic `CKR_*` name when the code is a standard one.
    pub fn name(self) -> Option<&'static str> {
        status_name(self.0)
    }
}

impl From<u64> for StatusCode {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08x})", self.0),
            None => write!(f, "0x{:08x}", self.0),
        }
    }
}

macro_rules! known_statuses {
    ($($name:ident),* $(,)?) => {
        fn status_name(code: u64) -> Option<&'static str> {
            $(
                if code == cryptoki_sys::$name as u64 {
                    return Some(stringify!($name));
                }
            )*
            None
        }
    };
}

known_statuses! {
    CKR_OK,
    CKR_CANCEL,
    CKR_HOST_MEMORY,
    CKR_SLOT_ID_INVALID,
    CKR_GENERAL_ERROR,
    CKR_FUNCTION_FAILED,
    CKR_ARGUMENTS_BAD,
    CKR_NO_EVENT,
    CKR_NEED_TO_CREATE_THREADS,
    CKR_CANT_LOCK,
    CKR_ATTRIBUTE_READ_ONLY,
    CKR_ATTRIBUTE_SENSITIVE,
    CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_ATTRIBUTE_VALUE_INVALID,
    CKR_DATA_INVALID,
    CKR_DATA_LEN_RANGE,
    CKR_DEVICE_ERROR,
    CKR_DEVICE_MEMORY,
    CKR_DEVICE_REMOVED,
    CKR_FUNCTION_CANCELED,
    CKR_FUNCTION_NOT_PARALLEL,
    CKR_FUNCTION_NOT_SUPPORTED,
    CKR_KEY_HANDLE_INVALID,
    CKR_KEY_SIZE_RANGE,
    CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID,
    CKR_MECHANISM_PARAM_INVALID,
    CKR_OBJECT_HANDLE_INVALID,
    CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED,
    CKR_PIN_INCORRECT,
    CKR_PIN_INVALID,
    CKR_PIN_LEN_RANGE,
    CKR_PIN_EXPIRED,
    CKR_PIN_LOCKED,
    CKR_SESSION_CLOSED,
    CKR_SESSION_COUNT,
    CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED,
    CKR_SESSION_READ_ONLY,
    CKR_SESSION_EXISTS,
    CKR_SESSION_READ_ONLY_EXISTS,
    CKR_SESSION_READ_WRITE_SO_EXISTS,
    CKR_TEMPLATE_INCOMPLETE,
    CKR_TEMPLATE_INCONSISTENT,
    CKR_TOKEN_NOT_PRESENT,
    CKR_TOKEN_NOT_RECOGNIZED,
    CKR_TOKEN_WRITE_PROTECTED,
    CKR_USER_ALREADY_LOGGED_IN,
    CKR_USER_NOT_LOGGED_IN,
    CKR_USER_PIN_NOT_INITIALIZED,
    CKR_USER_TYPE_INVALID,
    CKR_USER_ANOTHER_ALREADY_LOGGED_IN,
    CKR_USER_TOO_MANY_TYPES,
    CKR_RANDOM_SEED_NOT_SUPPORTED,
    CKR_RANDOM_NO_RNG,
    CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_NOT_INITIALIZED,
    CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_MUTEX_BAD,
    CKR_MUTEX_NOT_LOCKED,
    CKR_VENDOR_DEFINED,
}

/// Failures surfaced by the bridge. Every variant is returned synchronously
/// to the immediate caller; nothing is retried.
#[derive(Debug, Error)]
pub enum Pkcs11Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("value {value:#x} does not fit in a {width}-byte native integer")]
    Range { value: u64, width: usize },
    #[error("value of {length} bytes exceeds the {limit}-byte field")]
    ValueTooLarge { length: usize, limit: usize },
    #[error("invalid native encoding: {0}")]
    InvalidEncoding(String),
    #[error("no ABI variant matches platform profile {0}")]
    UnsupportedPlatform(String),
    #[error("{operation} failed: {status}")]
    NativeOperation {
        operation: &'static str,
        status: StatusCode,
    },
    #[error("{operation} called after the module was finalized")]
    UseAfterClose { operation: &'static str },
    #[error("{operation} rejected a handle: {status}")]
    InvalidHandle {
        operation: &'static str,
        status: StatusCode,
    },
    #[error("{operation} needs room for {required} but {supplied} was supplied")]
    LengthMismatch {
        operation: &'static str,
        required: u64,
        supplied: u64,
    },
    #[error("failed to load {}: {reason}", path.display())]
    LibraryLoad { path: PathBuf, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl Pkcs11Error {
    pub fn invalid<E: fmt::Display>(err: E) -> Self {
        Self::InvalidArgument(err.to_string())
    }

    pub fn encoding<E: fmt::Display>(err: E) -> Self {
        Self::InvalidEncoding(err.to_string())
    }

    pub fn config<E: fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }

    pub(crate) fn not_supported(operation: &'static str) -> Self {
        Self::NativeOperation {
            operation,
            status: StatusCode::new(CKR_FUNCTION_NOT_SUPPORTED as u64),
        }
    }

    /// Native status carried by the error, if it came from the module.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::NativeOperation { status, .. } | Self::InvalidHandle { status, .. } => {
                Some(*status)
            }
            Self::LengthMismatch { .. } => Some(StatusCode::new(CKR_BUFFER_TOO_SMALL as u64)),
            _ => None,
        }
    }

    /// Name of the native function that failed, if any.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::NativeOperation { operation, .. }
            | Self::InvalidHandle { operation, .. }
            | Self::UseAfterClose { operation }
            | Self::LengthMismatch { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

/// Translate a raw return value into `Ok(())` or a structured failure.
pub fn check_rv(operation: &'static str, rv: u64) -> Pkcs11Result<()> {
    let status = StatusCode::new(rv);
    if status.is_ok() {
        return Ok(());
    }
    if rv == CKR_SESSION_HANDLE_INVALID as u64
        || rv == CKR_OBJECT_HANDLE_INVALID as u64
        || rv == CKR_KEY_HANDLE_INVALID as u64
    {
        return Err(Pkcs11Error::InvalidHandle { operation, status });
    }
    Err(Pkcs11Error::NativeOperation { operation, status })
}

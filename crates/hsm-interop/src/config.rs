//! Module loading configuration.
//!
//! Can be built in code or read from TOML:
//!
//! ```toml
//! library_path = "/usr/lib/softhsm/libsofthsm2.so"
//! application_type = "multi_threaded"
//! initialization_source = "module"
//! packing = "natural"
//! ulong_width = 8
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::platform::{Packing, PlatformProfile, UlongWidth};

/// Locking model requested from the module at initialization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    /// No locking flags; the caller serializes access.
    #[default]
    SingleThreaded,
    /// The module may use operating-system locking primitives.
    MultiThreaded,
}

/// Where the function table comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitSource {
    /// `C_GetFunctionList` exported by the library.
    #[default]
    Module,
    /// Each `C_*` symbol resolved individually from the library exports.
    Exports,
    /// A function table supplied by the caller, see
    /// [`Pkcs11Factory::create_with_function_list`](crate::Pkcs11Factory::create_with_function_list).
    Supplied,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Path of the shared library. Not needed for a supplied function table.
    pub library_path: Option<PathBuf>,
    pub application_type: AppType,
    pub initialization_source: InitSource,
    /// Structure packing; natural when unset.
    pub packing: Option<Packing>,
    /// `CK_ULONG` width in bytes; the host `unsigned long` when unset.
    pub ulong_width: Option<UlongWidth>,
}

impl ModuleConfig {
    pub fn new(library_path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(library_path.into()),
            ..Self::default()
        }
    }

    /// Configuration for a caller-supplied function table.
    pub fn supplied() -> Self {
        Self {
            initialization_source: InitSource::Supplied,
            ..Self::default()
        }
    }

    pub fn with_application_type(mut self, application_type: AppType) -> Self {
        self.application_type = application_type;
        self
    }

    pub fn with_initialization_source(mut self, source: InitSource) -> Self {
        self.initialization_source = source;
        self
    }

    pub fn with_packing(mut self, packing: Packing) -> Self {
        self.packing = Some(packing);
        self
    }

    pub fn with_ulong_width(mut self, width: UlongWidth) -> Self {
        self.ulong_width = Some(width);
        self
    }

    pub fn from_toml_str(content: &str) -> Pkcs11Result<Self> {
        toml::from_str(content).map_err(Pkcs11Error::config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Pkcs11Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|err| Pkcs11Error::config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Pkcs11Result<String> {
        toml::to_string_pretty(self).map_err(Pkcs11Error::config)
    }

    /// Detected profile with any explicit overrides applied.
    pub fn profile(&self) -> PlatformProfile {
        let detected = PlatformProfile::detect(self.packing);
        match self.ulong_width {
            Some(width) => detected.with_ulong_width(width),
            None => detected,
        }
    }

    pub(crate) fn require_library_path(&self) -> Pkcs11Result<&Path> {
        self.library_path
            .as_deref()
            .ok_or_else(|| Pkcs11Error::config("library_path is required to load a module"))
    }
}

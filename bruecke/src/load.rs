//! Dynamic library loading and symbol resolution.
use std::ffi::CString;

use crate::error::FfiError;

pub const RTLD_NOW: i32 = 0x2;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const RTLD_GLOBAL: i32 = 0x8;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub const RTLD_GLOBAL: i32 = 0x100;

#[cfg(unix)]
mod sys {
    use std::ffi::{c_char, c_int, c_void};

    #[link(name = "dl")]
    unsafe extern "C" {
        pub fn dlopen(path: *const c_char, flags: c_int) -> *mut c_void;
        pub fn dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void;
        pub fn dlclose(handle: *mut c_void) -> c_int;
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::{c_char, c_void};

    unsafe extern "system" {
        pub fn LoadLibraryA(path: *const c_char) -> *mut c_void;
        pub fn GetProcAddress(handle: *mut c_void, name: *const c_char) -> *mut c_void;
        pub fn FreeLibrary(handle: *mut c_void) -> i32;
    }
}

/// An opened native library. Closed on drop; symbol addresses resolved
/// from it are only meaningful while it stays open.
#[derive(Debug)]
pub struct Library {
    handle: u64,
}

impl Library {
    #[cfg(unix)]
    pub fn open(path: &str, flags: i32) -> Result<Library, FfiError> {
        let c_path = CString::new(path).map_err(|_| FfiError::InvalidString {
            message: "library path contains interior NUL byte",
        })?;
        let handle = unsafe { sys::dlopen(c_path.as_ptr(), flags) };
        if handle.is_null() {
            return Err(FfiError::LibraryNotFound {
                path: path.to_string(),
            });
        }
        log::debug!("opened library {path}");
        Ok(Library {
            handle: handle as u64,
        })
    }

    /// Handle to the calling process itself; resolves symbols already
    /// linked into it.
    #[cfg(unix)]
    pub fn this() -> Result<Library, FfiError> {
        let handle = unsafe { sys::dlopen(std::ptr::null(), RTLD_NOW) };
        if handle.is_null() {
            return Err(FfiError::LibraryNotFound {
                path: "<self>".to_string(),
            });
        }
        Ok(Library {
            handle: handle as u64,
        })
    }

    #[cfg(unix)]
    pub fn sym(&self, name: &str) -> Result<u64, FfiError> {
        let c_name = CString::new(name).map_err(|_| FfiError::InvalidString {
            message: "symbol name contains interior NUL byte",
        })?;
        let address = unsafe { sys::dlsym(self.handle as *mut _, c_name.as_ptr()) };
        if address.is_null() {
            return Err(FfiError::SymbolNotFound {
                name: name.to_string(),
            });
        }
        Ok(address as u64)
    }

    #[cfg(unix)]
    pub fn close(&mut self) {
        if self.handle != 0 {
            unsafe { sys::dlclose(self.handle as *mut _) };
            self.handle = 0;
        }
    }

    #[cfg(windows)]
    pub fn open(path: &str, _flags: i32) -> Result<Library, FfiError> {
        let c_path = CString::new(path).map_err(|_| FfiError::InvalidString {
            message: "library path contains interior NUL byte",
        })?;
        let handle = unsafe { sys::LoadLibraryA(c_path.as_ptr()) };
        if handle.is_null() {
            return Err(FfiError::LibraryNotFound {
                path: path.to_string(),
            });
        }
        log::debug!("opened library {path}");
        Ok(Library {
            handle: handle as u64,
        })
    }

    #[cfg(windows)]
    pub fn sym(&self, name: &str) -> Result<u64, FfiError> {
        let c_name = CString::new(name).map_err(|_| FfiError::InvalidString {
            message: "symbol name contains interior NUL byte",
        })?;
        let address =
            unsafe { sys::GetProcAddress(self.handle as *mut _, c_name.as_ptr()) };
        if address.is_null() {
            return Err(FfiError::SymbolNotFound {
                name: name.to_string(),
            });
        }
        Ok(address as u64)
    }

    #[cfg(windows)]
    pub fn close(&mut self) {
        if self.handle != 0 {
            unsafe { sys::FreeLibrary(self.handle as *mut _) };
            self.handle = 0;
        }
    }

    #[cfg(not(any(unix, windows)))]
    pub fn open(_path: &str, _flags: i32) -> Result<Library, FfiError> {
        Err(FfiError::Unsupported {
            message: "dynamic loading is not available on this platform",
        })
    }

    #[cfg(not(any(unix, windows)))]
    pub fn sym(&self, _name: &str) -> Result<u64, FfiError> {
        Err(FfiError::Unsupported {
            message: "dynamic loading is not available on this platform",
        })
    }

    #[cfg(not(any(unix, windows)))]
    pub fn close(&mut self) {}
}

impl Drop for Library {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn the_process_exports_libc_symbols() {
        let lib = Library::this().unwrap();
        let address = lib.sym("strlen").unwrap();
        assert_ne!(address, 0);
    }

    #[test]
    fn missing_symbols_are_recoverable() {
        let lib = Library::this().unwrap();
        let err = lib.sym("definitely_not_a_symbol_xyz").unwrap_err();
        assert_eq!(
            err,
            FfiError::SymbolNotFound {
                name: "definitely_not_a_symbol_xyz".to_string()
            }
        );
    }

    #[test]
    fn missing_libraries_are_recoverable() {
        let err = Library::open("/no/such/library.so", RTLD_NOW).unwrap_err();
        assert!(matches!(err, FfiError::LibraryNotFound { .. }));
    }
}

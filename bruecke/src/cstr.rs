//! Bridging between managed strings and null-terminated native ones.
use std::ffi::{CStr, CString};

use crate::error::FfiError;

/// Copy a managed string into an owned, null-terminated allocation.
/// The caller parks the result on a keep-alive list so the pointer
/// stays valid for the duration of the native call.
pub(crate) fn to_native(s: &str) -> Result<CString, FfiError> {
    CString::new(s).map_err(|_| FfiError::InvalidString {
        message: "string contains interior NUL byte",
    })
}

/// Read a native `char*` back into an owned managed string.
///
/// # Safety
/// A non-zero `address` must point at a live, null-terminated buffer.
/// Zero is tolerated and decodes to the empty string.
pub(crate) unsafe fn from_native(address: u64) -> String {
    if address == 0 {
        return String::new();
    }
    let raw = unsafe { CStr::from_ptr(address as *const std::ffi::c_char) };
    raw.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_native_form() {
        let owned = to_native("hello ffi").unwrap();
        let back = unsafe { from_native(owned.as_ptr() as u64) };
        assert_eq!(back, "hello ffi");
    }

    #[test]
    fn interior_nul_is_recoverable() {
        let err = to_native("bad\0string").unwrap_err();
        assert!(matches!(err, FfiError::InvalidString { .. }));
    }

    #[test]
    fn null_pointer_reads_as_empty() {
        assert_eq!(unsafe { from_native(0) }, "");
    }
}

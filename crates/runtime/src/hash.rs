//! Minimal TempleOS-style hash lookup over the reflection registry.

use crate::reflect;
use std::os::raw::{c_char, c_void};

/// Find a symbol by name. The table/mask arguments exist for ABI
/// compatibility with TempleOS call sites; lookups resolve against the
/// reflection registry. Returns a stable handle or null.
///
/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn HashFind(name: *const c_char, _table: *mut c_void, _mask: i64) -> *mut c_void {
    reflect::hash_find_aggregate(name) as *mut c_void
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::ffi::CString;

    #[test]
    #[serial]
    fn test_hash_find_builtin_class() {
        let name = CString::new("FsCtx").unwrap();
        let found = unsafe { HashFind(name.as_ptr(), std::ptr::null_mut(), 0) };
        assert!(!found.is_null());
        let missing = CString::new("CNotAClass").unwrap();
        let nf = unsafe { HashFind(missing.as_ptr(), std::ptr::null_mut(), 0) };
        assert!(nf.is_null());
    }
}

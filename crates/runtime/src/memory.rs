//! Heap primitives over libc.

use std::os::raw::c_void;

#[no_mangle]
pub extern "C" fn hc_malloc(size: i64) -> *mut c_void {
    unsafe { libc::malloc(size.max(0) as libc::size_t) }
}

/// # Safety
/// `ptr` must come from `hc_malloc` (or be null).
#[no_mangle]
pub unsafe extern "C" fn hc_free(ptr: *mut c_void) {
    if !ptr.is_null() {
        libc::free(ptr);
    }
}

/// # Safety
/// Both regions must be valid for `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn hc_memcpy(dst: *mut c_void, src: *const c_void, count: i64) -> *mut c_void {
    if count > 0 {
        libc::memcpy(dst, src, count as libc::size_t);
    }
    dst
}

/// # Safety
/// `dst` must be valid for `count` bytes.
#[no_mangle]
pub unsafe extern "C" fn hc_memset(dst: *mut c_void, value: i64, count: i64) -> *mut c_void {
    if count > 0 {
        libc::memset(dst, value as libc::c_int, count as libc::size_t);
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_set_copy_free() {
        unsafe {
            let a = hc_malloc(16);
            let b = hc_malloc(16);
            assert!(!a.is_null() && !b.is_null());
            hc_memset(a, 0xAB, 16);
            hc_memcpy(b, a, 16);
            assert_eq!(*(b as *const u8).add(7), 0xAB);
            hc_free(a);
            hc_free(b);
        }
    }
}

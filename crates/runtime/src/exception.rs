//! setjmp/longjmp based exception support.
//!
//! Emitted code allocates one frame per try region, pushes it, calls
//! `_setjmp` on it, and branches to the catch arm when the second return
//! fires. `hc_throw_i64` pops the innermost frame before jumping so a
//! rethrow inside a catch lands in the next frame out. Frames are
//! thread-local; each spawned task has its own stack.

use std::cell::{Cell, RefCell};
use std::os::raw::{c_int, c_void};

extern "C" {
    fn longjmp(env: *mut c_void, val: c_int) -> !;
}

thread_local! {
    static FRAMES: RefCell<Vec<*mut c_void>> = const { RefCell::new(Vec::new()) };
    static PAYLOAD: Cell<i64> = const { Cell::new(0) };
    static ACTIVE: Cell<i64> = const { Cell::new(0) };
}

/// Push a caller-owned try frame (the buffer `_setjmp` fills).
#[no_mangle]
pub extern "C" fn hc_try_push(frame: *mut c_void) {
    FRAMES.with(|f| f.borrow_mut().push(frame));
}

/// Pop a frame on normal exit from a try body. Tolerates a frame that
/// was already consumed by a throw.
#[no_mangle]
pub extern "C" fn hc_try_pop(frame: *mut c_void) {
    FRAMES.with(|f| {
        let mut frames = f.borrow_mut();
        if frames.last().copied() == Some(frame) {
            frames.pop();
        }
    });
}

#[no_mangle]
pub extern "C" fn hc_try_depth() -> i64 {
    FRAMES.with(|f| f.borrow().len() as i64)
}

/// Throw: record the payload and jump to the innermost frame. Without a
/// frame the payload is reported and the process exits with code 1.
#[no_mangle]
pub extern "C" fn hc_throw_i64(payload: i64) {
    PAYLOAD.with(|p| p.set(payload));
    ACTIVE.with(|a| a.set(1));
    let frame = FRAMES.with(|f| f.borrow_mut().pop());
    match frame {
        Some(frame) => unsafe {
            longjmp(frame, 1);
        },
        None => {
            let msg = format!("unhandled HolyC exception: payload {}\n", payload);
            unsafe {
                libc::write(2, msg.as_ptr() as *const c_void, msg.len() as libc::size_t);
                libc::exit(1);
            }
        }
    }
}

/// Last thrown payload.
#[no_mangle]
pub extern "C" fn hc_exception_payload() -> i64 {
    PAYLOAD.with(|p| p.get())
}

/// Nonzero once any throw has fired on this thread.
#[no_mangle]
pub extern "C" fn hc_exception_active() -> i64 {
    ACTIVE.with(|a| a.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_stack_depth() {
        let mut a = 0u8;
        let mut b = 0u8;
        assert_eq!(hc_try_depth(), 0);
        hc_try_push(&mut a as *mut u8 as *mut c_void);
        hc_try_push(&mut b as *mut u8 as *mut c_void);
        assert_eq!(hc_try_depth(), 2);
        hc_try_pop(&mut b as *mut u8 as *mut c_void);
        assert_eq!(hc_try_depth(), 1);
        // Popping a non-top frame is ignored.
        hc_try_pop(&mut b as *mut u8 as *mut c_void);
        assert_eq!(hc_try_depth(), 1);
        hc_try_pop(&mut a as *mut u8 as *mut c_void);
        assert_eq!(hc_try_depth(), 0);
    }

    #[test]
    fn test_payload_readback() {
        PAYLOAD.with(|p| p.set(7));
        assert_eq!(hc_exception_payload(), 7);
    }
}

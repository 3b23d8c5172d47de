//! HolyC host runtime.
//!
//! Built as a static library and linked into every compiled or jitted
//! module; also built as an rlib so the compiler can share ABI constants
//! and the tests can call the runtime directly. Every exported symbol is
//! C ABI and part of the fixed contract the IR emitter targets.

pub mod abi;
pub mod exception;
pub mod hash;
pub mod memory;
pub mod print;
pub mod reflect;
pub mod task;

// Re-export the pieces the compiler consumes.
pub use abi::{hc_runtime_abi_version, ABI_MAJOR, ABI_MINOR, TRY_FRAME_BYTES};
pub use exception::{hc_exception_active, hc_exception_payload, hc_throw_i64, hc_try_depth, hc_try_pop, hc_try_push};
pub use print::{hc_print_fmt, hc_print_str, hc_put_char};
pub use reflect::{hc_reflection_field_count, hc_reflection_fields, hc_register_reflection_table, HcReflField};
pub use task::hc_task_wait_all;

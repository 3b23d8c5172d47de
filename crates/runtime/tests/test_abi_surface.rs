//! Exercise the exported C ABI the way emitted modules do: through the
//! extern symbols, with packed i64 argument arrays and raw C strings.

use holyc_runtime::print::format_holyc;
use holyc_runtime::reflect::{self, HcReflField};
use holyc_runtime::{hc_runtime_abi_version, hc_task_wait_all, ABI_MAJOR};
use serial_test::serial;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::sync::atomic::{AtomicI64, Ordering};

#[test]
fn abi_version_major_matches() {
    assert_eq!(hc_runtime_abi_version() >> 32, ABI_MAJOR);
}

#[test]
fn format_matches_print_scenario() {
    // The S6 conformance string, exactly as hc_print_fmt receives it.
    let s = CString::new("hi").unwrap();
    let out = format_holyc("%d %s\n", &[42, s.as_ptr() as i64]);
    assert_eq!(out, "42 hi\n");
}

#[test]
#[serial]
fn reflection_round_trip_through_raw_table() {
    let agg = CString::new("CJob").unwrap();
    let f = CString::new("prio").unwrap();
    let ty = CString::new("I64").unwrap();
    let ann = CString::new("fmt \"%d\"").unwrap();
    let rows = [HcReflField {
        aggregate: agg.as_ptr(),
        field: f.as_ptr(),
        ty: ty.as_ptr(),
        annotations: ann.as_ptr(),
    }];
    unsafe {
        reflect::hc_register_reflection_table(rows.as_ptr(), 1);
        assert_eq!(reflect::MemberMetaFind(agg.as_ptr(), f.as_ptr()), 1);
        let meta = reflect::MemberMetaData(agg.as_ptr(), f.as_ptr());
        assert_eq!(CStr::from_ptr(meta).to_str().unwrap(), "fmt \"%d\"");
    }
    assert_eq!(reflect::hc_reflection_field_count(), 1);
}

static SUM: AtomicI64 = AtomicI64::new(0);

extern "C" fn add_task(arg: i64) -> i64 {
    SUM.fetch_add(arg, Ordering::SeqCst);
    arg
}

#[test]
#[serial]
fn spawned_tasks_quiesce_before_wait_all_returns() {
    SUM.store(0, Ordering::SeqCst);
    unsafe {
        for i in 1..=4 {
            holyc_runtime::task::Spawn(add_task as *mut c_void, i, std::ptr::null());
        }
    }
    hc_task_wait_all();
    assert_eq!(SUM.load(Ordering::SeqCst), 10);
}

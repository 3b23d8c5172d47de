//! Reflection registry.
//!
//! The emitter bakes one `{aggregate, field, type, annotations}` row per
//! aggregate field into the module and registers the table before Main
//! runs. Rows are copied into owned storage on registration so lookups
//! stay valid after a jitted module is unloaded. The TempleOS-visible
//! runtime classes are pre-seeded.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Mutex;

use crate::print;

/// Row layout the emitter produces (four C string pointers).
#[repr(C)]
pub struct HcReflField {
    pub aggregate: *const c_char,
    pub field: *const c_char,
    pub ty: *const c_char,
    pub annotations: *const c_char,
}

struct Entry {
    aggregate: String,
    field: String,
    ty: String,
    annotations: CString,
}

struct Registry {
    entries: Vec<Entry>,
    /// Raw table from the most recent registration, for
    /// `hc_reflection_fields`.
    last_table: *const HcReflField,
    last_count: i64,
}

unsafe impl Send for Registry {}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

fn seed() -> Registry {
    let mut entries = Vec::new();
    for (agg, fields) in BUILTIN_ROWS {
        for (field, ty) in *fields {
            entries.push(Entry {
                aggregate: agg.to_string(),
                field: field.to_string(),
                ty: ty.to_string(),
                annotations: CString::new("").unwrap(),
            });
        }
    }
    Registry { entries, last_table: std::ptr::null(), last_count: 0 }
}

/// Runtime classes visible to HolyC programs without declaration.
const BUILTIN_ROWS: &[(&str, &[(&str, &str)])] = &[
    ("FsCtx", &[("task_name", "U8*"), ("hash_table", "CHashClass*"), ("except_ch", "I64")]),
    ("CHashClass", &[("str", "U8*"), ("next", "CHashClass*"), ("type", "I64"), ("member_lst", "CMemberLst*")]),
    ("CMemberLst", &[("str", "U8*"), ("next", "CMemberLst*"), ("member_class", "CHashClass*"), ("offset", "I64")]),
];

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut guard = REGISTRY.lock().unwrap();
    let registry = guard.get_or_insert_with(seed);
    f(registry)
}

/// Register a module's emitted table. Rows are copied; the raw pointer
/// is retained only for `hc_reflection_fields`.
///
/// # Safety
/// `table` must point to `count` valid rows of NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn hc_register_reflection_table(table: *const HcReflField, count: i64) {
    if table.is_null() || count <= 0 {
        return;
    }
    let rows = std::slice::from_raw_parts(table, count as usize);
    with_registry(|reg| {
        for row in rows {
            let aggregate = cstr_owned(row.aggregate);
            let field = cstr_owned(row.field);
            // Re-registration (a reloaded session image) replaces rows.
            reg.entries.retain(|e| !(e.aggregate == aggregate && e.field == field));
            reg.entries.push(Entry {
                aggregate,
                field,
                ty: cstr_owned(row.ty),
                annotations: CString::new(cstr_owned(row.annotations)).unwrap_or_default(),
            });
        }
        reg.last_table = table;
        reg.last_count = count;
    });
}

unsafe fn cstr_owned(p: *const c_char) -> String {
    if p.is_null() {
        String::new()
    } else {
        CStr::from_ptr(p).to_string_lossy().into_owned()
    }
}

/// Raw pointer to the most recently registered table.
#[no_mangle]
pub extern "C" fn hc_reflection_fields() -> *const HcReflField {
    with_registry(|reg| reg.last_table)
}

#[no_mangle]
pub extern "C" fn hc_reflection_field_count() -> i64 {
    with_registry(|reg| reg.last_count)
}

/// Annotation metadata for one member, or null.
///
/// # Safety
/// Arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn MemberMetaData(cls: *const c_char, member: *const c_char) -> *const c_char {
    let cls = cstr_owned(cls);
    let member = cstr_owned(member);
    with_registry(|reg| {
        reg.entries
            .iter()
            .find(|e| e.aggregate == cls && e.field == member)
            .map(|e| e.annotations.as_ptr())
            .unwrap_or(std::ptr::null())
    })
}

/// Nonzero when the member exists on the aggregate.
///
/// # Safety
/// Arguments must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn MemberMetaFind(cls: *const c_char, member: *const c_char) -> i64 {
    !MemberMetaData(cls, member).is_null() as i64
}

/// Print an aggregate's fields, TempleOS ClassRep style.
///
/// # Safety
/// `cls` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ClassRep(cls: *const c_char) {
    let cls = cstr_owned(cls);
    let mut out = format!("class {}\n", cls);
    with_registry(|reg| {
        for e in reg.entries.iter().filter(|e| e.aggregate == cls) {
            out.push_str(&format!("  {} {}\n", e.ty, e.field));
        }
    });
    hc_print_bytes(&out);
}

fn hc_print_bytes(s: &str) {
    let c = CString::new(s).unwrap_or_default();
    unsafe { print::hc_print_str(c.as_ptr()) };
}

/// Look up an aggregate name; seeds TempleOS `HashFind` callers. The
/// returned pointer is a stable C string naming the aggregate, or null.
///
/// # Safety
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hash_find_aggregate(name: *const c_char) -> *const c_char {
    let name = cstr_owned(name);
    with_registry(|reg| {
        reg.entries
            .iter()
            .find(|e| e.aggregate == name)
            .map(|e| e.annotations.as_ptr()) // stable per-entry storage
            .unwrap_or(std::ptr::null())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn make_row(agg: &CString, field: &CString, ty: &CString, ann: &CString) -> HcReflField {
        HcReflField {
            aggregate: agg.as_ptr(),
            field: field.as_ptr(),
            ty: ty.as_ptr(),
            annotations: ann.as_ptr(),
        }
    }

    #[test]
    #[serial]
    fn test_register_and_find() {
        let agg = CString::new("CPoint").unwrap();
        let f1 = CString::new("x").unwrap();
        let ty = CString::new("I64").unwrap();
        let ann = CString::new("fmt \"%x\"").unwrap();
        let rows = [make_row(&agg, &f1, &ty, &ann)];
        unsafe {
            hc_register_reflection_table(rows.as_ptr(), 1);
            assert_eq!(MemberMetaFind(agg.as_ptr(), f1.as_ptr()), 1);
            let meta = MemberMetaData(agg.as_ptr(), f1.as_ptr());
            assert_eq!(CStr::from_ptr(meta).to_str().unwrap(), "fmt \"%x\"");
            let missing = CString::new("zz").unwrap();
            assert_eq!(MemberMetaFind(agg.as_ptr(), missing.as_ptr()), 0);
        }
        assert_eq!(hc_reflection_field_count(), 1);
    }

    #[test]
    #[serial]
    fn test_builtin_classes_seeded() {
        let cls = CString::new("CHashClass").unwrap();
        let member = CString::new("member_lst").unwrap();
        unsafe {
            assert_eq!(MemberMetaFind(cls.as_ptr(), member.as_ptr()), 1);
        }
    }
}

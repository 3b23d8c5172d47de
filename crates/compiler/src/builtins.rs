//! Pre-seeded TempleOS-visible symbols.
//!
//! The semantic analyzer starts every program with these constants,
//! runtime classes, and runtime function signatures in scope; the lowerer
//! and emitter consult the same tables so call sites against the runtime
//! line up with the fixed ABI.

use std::collections::HashMap;
use std::sync::LazyLock;

/// A builtin constant visible to HolyC programs.
pub struct BuiltinConst {
    pub name: &'static str,
    pub ty: &'static str,
    /// Integer value, or the bit pattern for F64 constants.
    pub value: i64,
}

/// Builtin constants and their values. `Fs`/`Gs` stand in for the
/// TempleOS task segment registers and evaluate to null on the host.
pub static BUILTIN_CONSTS: &[BuiltinConst] = &[
    BuiltinConst { name: "TRUE", ty: "I64", value: 1 },
    BuiltinConst { name: "FALSE", ty: "I64", value: 0 },
    BuiltinConst { name: "NULL", ty: "U8*", value: 0 },
    BuiltinConst { name: "YorN", ty: "I64", value: 1 },
    BuiltinConst { name: "tS", ty: "F64", value: 0 },
    BuiltinConst { name: "RED", ty: "I64", value: 4 },
    BuiltinConst { name: "HTT_CLASS", ty: "I64", value: 2 },
    BuiltinConst { name: "Fs", ty: "FsCtx*", value: 0 },
    BuiltinConst { name: "Gs", ty: "FsCtx*", value: 0 },
];

/// `HolyC_Exception_Payload` reads as an I64 but lowers to a runtime
/// call; it is special-cased by the emitter.
pub const EXCEPTION_PAYLOAD_NAME: &str = "HolyC_Exception_Payload";

/// One parameter of a builtin function signature.
#[derive(Debug, Clone)]
pub struct BuiltinParam {
    pub ty: &'static str,
    pub name: &'static str,
    /// A defaulted parameter may be omitted at call sites; the default
    /// value is always 0 / NULL for builtins.
    pub has_default: bool,
}

/// Signature of a pre-seeded runtime function.
#[derive(Debug, Clone)]
pub struct BuiltinFn {
    pub name: &'static str,
    pub ret: &'static str,
    pub params: Vec<BuiltinParam>,
    /// Exported C symbol the emitter calls (differs from the HolyC name
    /// for the hc_-prefixed wrappers).
    pub symbol: &'static str,
}

fn p(ty: &'static str, name: &'static str) -> BuiltinParam {
    BuiltinParam { ty, name, has_default: false }
}

fn pd(ty: &'static str, name: &'static str) -> BuiltinParam {
    BuiltinParam { ty, name, has_default: true }
}

/// Runtime function signatures visible to HolyC programs.
pub static BUILTIN_FNS: LazyLock<HashMap<&'static str, BuiltinFn>> = LazyLock::new(|| {
    let fns = vec![
        BuiltinFn { name: "PressAKey", ret: "I64", params: vec![], symbol: "PressAKey" },
        BuiltinFn {
            name: "ClassRep",
            ret: "U0",
            params: vec![p("U8*", "cls")],
            symbol: "ClassRep",
        },
        BuiltinFn {
            name: "HashFind",
            ret: "U8*",
            params: vec![p("U8*", "name"), pd("CHashClass*", "table"), pd("I64", "mask")],
            symbol: "HashFind",
        },
        BuiltinFn {
            name: "JobQue",
            ret: "I64",
            params: vec![p("U0*", "fp"), pd("I64", "arg")],
            symbol: "JobQue",
        },
        BuiltinFn { name: "JobResGet", ret: "I64", params: vec![p("I64", "job")], symbol: "JobResGet" },
        BuiltinFn {
            name: "Spawn",
            ret: "I64",
            params: vec![p("U0*", "fp"), pd("I64", "arg"), pd("U8*", "name")],
            symbol: "Spawn",
        },
        BuiltinFn {
            name: "CallStkGrow",
            ret: "I64",
            params: vec![p("I64", "stk_size"), p("U0*", "fp"), pd("I64", "arg")],
            symbol: "CallStkGrow",
        },
        BuiltinFn {
            name: "MemberMetaFind",
            ret: "I64",
            params: vec![p("U8*", "cls"), p("U8*", "member")],
            symbol: "MemberMetaFind",
        },
        BuiltinFn {
            name: "MemberMetaData",
            ret: "U8*",
            params: vec![p("U8*", "cls"), p("U8*", "member")],
            symbol: "MemberMetaData",
        },
        BuiltinFn { name: "MAlloc", ret: "U8*", params: vec![p("I64", "size")], symbol: "hc_malloc" },
        BuiltinFn { name: "Free", ret: "U0", params: vec![p("U8*", "ptr")], symbol: "hc_free" },
        BuiltinFn {
            name: "MemCpy",
            ret: "U8*",
            params: vec![p("U8*", "dst"), p("U8*", "src"), p("I64", "count")],
            symbol: "hc_memcpy",
        },
        BuiltinFn {
            name: "MemSet",
            ret: "U8*",
            params: vec![p("U8*", "dst"), p("I64", "value"), p("I64", "count")],
            symbol: "hc_memset",
        },
        BuiltinFn { name: "PutChars", ret: "U0", params: vec![p("I64", "ch")], symbol: "hc_put_char" },
    ];
    fns.into_iter().map(|f| (f.name, f)).collect()
});

/// A field of a pre-seeded runtime class.
pub struct BuiltinField {
    pub name: &'static str,
    pub ty: &'static str,
}

/// Runtime classes with declared layouts; the reflection runtime reads
/// these through the same member tables as user aggregates.
pub static BUILTIN_CLASSES: &[(&str, &[BuiltinField])] = &[
    (
        "FsCtx",
        &[
            BuiltinField { name: "task_name", ty: "U8*" },
            BuiltinField { name: "hash_table", ty: "CHashClass*" },
            BuiltinField { name: "except_ch", ty: "I64" },
        ],
    ),
    (
        "CHashClass",
        &[
            BuiltinField { name: "str", ty: "U8*" },
            BuiltinField { name: "next", ty: "CHashClass*" },
            BuiltinField { name: "type", ty: "I64" },
            BuiltinField { name: "member_lst", ty: "CMemberLst*" },
        ],
    ),
    (
        "CMemberLst",
        &[
            BuiltinField { name: "str", ty: "U8*" },
            BuiltinField { name: "next", ty: "CMemberLst*" },
            BuiltinField { name: "member_class", ty: "CHashClass*" },
            BuiltinField { name: "offset", ty: "I64" },
        ],
    ),
];

pub fn builtin_const(name: &str) -> Option<&'static BuiltinConst> {
    BUILTIN_CONSTS.iter().find(|c| c.name == name)
}

pub fn builtin_fn(name: &str) -> Option<&'static BuiltinFn> {
    BUILTIN_FNS.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_present() {
        assert_eq!(builtin_const("TRUE").unwrap().value, 1);
        assert_eq!(builtin_const("NULL").unwrap().ty, "U8*");
        assert!(builtin_const("nope").is_none());
    }

    #[test]
    fn test_spawn_signature() {
        let f = builtin_fn("Spawn").unwrap();
        assert_eq!(f.ret, "I64");
        assert_eq!(f.params.len(), 3);
        assert!(f.params[1].has_default && f.params[2].has_default);
    }

    #[test]
    fn test_runtime_classes_have_fields() {
        for (name, fields) in BUILTIN_CLASSES {
            assert!(!fields.is_empty(), "{} must declare fields", name);
        }
    }
}

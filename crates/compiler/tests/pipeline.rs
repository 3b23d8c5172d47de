//! End-to-end pipeline scenarios.
//!
//! Everything down to IR text runs unconditionally; scenarios that need
//! object emission or in-process execution probe for a host clang and
//! the runtime static library first and skip (with a note) when absent.

use holycc::backend::{self, BuildOptions, OptLevel};
use holycc::emit::{self, EmitOptions};
use holycc::jit;
use holycc::lower::lower;
use holycc::parser::Parser;
use holycc::preprocess::{self, PpMode, PpOptions};
use holycc::sema::{analyze, SemaOptions};
use serial_test::serial;

fn compile_jit(source: &str, tag: &str, entry_index: Option<usize>) -> String {
    let opts = PpOptions { mode: PpMode::Jit, include_roots: vec![] };
    let processed = preprocess::preprocess_text(source, "test.HC", &opts).unwrap();
    let parsed = Parser::parse_source(&processed, "test.HC").unwrap();
    let typed = analyze(&parsed, "test.HC", SemaOptions::default()).unwrap();
    let module = lower(&typed, "test.HC").unwrap();
    let emit_opts = EmitOptions {
        module_name: format!("test_{}", tag),
        source_file: "test.HC".to_string(),
        jit: true,
        entry_wrap: entry_index.map(|n| ("Main".to_string(), n)),
        module_tag: tag.to_string(),
    };
    emit::emit(&module, &emit_opts).unwrap()
}

fn execution_ready() -> bool {
    if !backend::clang_available() {
        eprintln!("skipping: clang not found on PATH");
        return false;
    }
    if backend::find_runtime_lib().is_none() {
        eprintln!("skipping: libholyc_runtime.a not found (build the workspace first)");
        return false;
    }
    true
}

/// Run a source file's Main through a fresh JIT session.
fn jit_main(session: &str, source: &str) -> i64 {
    jit::reset(session);
    let tag = jit::next_module_tag(session).unwrap();
    let n = jit::next_entry_index(session).unwrap();
    let ir = compile_jit(source, &tag, Some(n));
    let code = jit::execute(session, &tag, &ir, &format!("__holyc_entry_{}", n), OptLevel::O2, true).unwrap();
    code
}

// ======================================================================
// Universal properties over accepted programs
// ======================================================================

#[test]
fn accepted_program_survives_every_dump() {
    let source = "class CPt { I64 x; }; I64 g = 2; U0 Helper(I64 a) { } I64 Main() { Helper(g); return 0; }";
    let opts = PpOptions { mode: PpMode::Aot, include_roots: vec![] };
    let processed = preprocess::preprocess_text(source, "t.HC", &opts).unwrap();
    let parsed = Parser::parse_source(&processed, "t.HC").unwrap();
    let typed = analyze(&parsed, "t.HC", SemaOptions::default()).unwrap();
    assert!(!holycc::ast::dump_typed(&typed).is_empty());
    let module = lower(&typed, "t.HC").unwrap();
    assert!(!holycc::hir::dump_module(&module).is_empty());
    let ir = emit::emit(&module, &EmitOptions::default()).unwrap();
    assert!(ir.contains("define"));
}

#[test]
fn emission_reproducible_byte_for_byte() {
    let source = "I64 g = 1; class CA { I64 v; }; I64 Main() { \"%d\\n\", g; return g; }";
    let a = holycc::compile_to_ir(source).unwrap();
    let b = holycc::compile_to_ir(source).unwrap();
    assert_eq!(a, b);
}

// ======================================================================
// Concrete scenarios
// ======================================================================

#[test]
#[serial]
fn s1_arithmetic_jit_round_trip() {
    if !execution_ready() {
        return;
    }
    let code = jit_main("s1", "I64 Main() { return 2 + 3 * 4; }");
    assert_eq!(code, 14);
}

#[test]
#[serial]
fn s1_built_executable_exit_code() {
    if !execution_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("s1.HC");
    std::fs::write(&src, "I64 Main() { return 2 + 3 * 4; }").unwrap();
    let ir = holycc::compile_to_ir_with(
        &std::fs::read_to_string(&src).unwrap(),
        "s1.HC",
        true,
        PpMode::Aot,
    )
    .unwrap();
    let opts = BuildOptions {
        artifact_dir: dir.path().join("artifacts"),
        output: Some(dir.path().join("s1")),
        ..Default::default()
    };
    let exe = backend::build_executable(&ir, &src, &opts).unwrap();
    let status = std::process::Command::new(&exe).status().unwrap();
    assert_eq!(status.code(), Some(14));
}

#[test]
#[serial]
fn s2_switch_null_case_chain() {
    if !execution_ready() {
        return;
    }
    let code = jit_main(
        "s2",
        "I64 Main() { I64 x = 1; switch (x) { case 0: return 10; case: return 20; default: return 99; } }",
    );
    assert_eq!(code, 20);
}

#[test]
#[serial]
fn s3_lane_write_read() {
    if !execution_ready() {
        return;
    }
    let code = jit_main("s3", "I64 Main() { I64 v = 0; v.u8[1] = 0xAB; return v.u8[1]; }");
    assert_eq!(code, 171);
}

#[test]
fn s4_lastclass_golden_ir() {
    let ir = compile_jit(
        "U0 Show(U8 *name, U8 *ty=lastclass) { } I64 Main() { I64 x = 0; Show(&x); return 0; }",
        "s4",
        None,
    );
    assert!(ir.contains("I64\\00"), "synthesized lastclass literal must name I64");
}

#[test]
#[serial]
fn s5_try_throw_region_nesting() {
    if !execution_ready() {
        return;
    }
    let code = jit_main(
        "s5",
        "I64 Main() { try { try { throw(7); } catch { throw(8); } } catch { return HolyC_Exception_Payload; } return 0; }",
    );
    assert_eq!(code, 8);
}

#[test]
#[serial]
fn s6_print_format_conformance() {
    if !execution_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("s6.HC");
    std::fs::write(&src, "U0 Main() { \"%d %s\\n\", 42, \"hi\"; }").unwrap();
    let ir = holycc::compile_to_ir_with(
        &std::fs::read_to_string(&src).unwrap(),
        "s6.HC",
        true,
        PpMode::Aot,
    )
    .unwrap();
    let opts = BuildOptions {
        artifact_dir: dir.path().join("artifacts"),
        output: Some(dir.path().join("s6")),
        ..Default::default()
    };
    let exe = backend::build_executable(&ir, &src, &opts).unwrap();
    let out = std::process::Command::new(&exe).output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout), "42 hi\n");
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn s7_include_cycle_rejected_with_trace() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.HC");
    let b = dir.path().join("b.HC");
    std::fs::write(&a, "#include \"b.HC\"\nI64 Main() { return 0; }\n").unwrap();
    std::fs::write(&b, "#include \"a.HC\"\n").unwrap();
    let err = preprocess::preprocess_file(&a, &PpOptions { mode: PpMode::Aot, include_roots: vec![] }).unwrap_err();
    assert_eq!(err.code, "HC1023");
    let help = err.help.unwrap();
    let a_pos = help.find("a.HC").unwrap();
    let b_pos = help.find("b.HC").unwrap();
    assert!(a_pos < b_pos, "remediation names the files in inclusion order");
}

#[test]
#[serial]
fn s8_jit_session_shadowing() {
    if !execution_ready() {
        return;
    }
    let session = "s8";
    jit::reset(session);

    let tag1 = jit::next_module_tag(session).unwrap();
    let ir1 = compile_jit("I64 Foo() { return 1; }", &tag1, None);
    jit::load(session, &tag1, &ir1).unwrap();

    let tag2 = jit::next_module_tag(session).unwrap();
    let ir2 = compile_jit("I64 Foo() { return 2; }", &tag2, None);
    jit::load(session, &tag2, &ir2).unwrap();

    let tag3 = jit::next_module_tag(session).unwrap();
    let n = jit::next_entry_index(session).unwrap();
    let ir3 = compile_jit("import I64 Foo(); I64 Main() { return Foo() + 40; }", &tag3, Some(n));
    let code = jit::execute(session, &tag3, &ir3, &format!("__holyc_entry_{}", n), OptLevel::O2, true).unwrap();
    assert_eq!(code, 42);
}

// ======================================================================
// Smaller cross-phase checks
// ======================================================================

#[test]
fn strict_and_permissive_modes_disagree_on_modifiers() {
    let source = "public I64 Main() { return 0; }";
    assert!(holycc::compile_to_ir_with(source, "t.HC", true, PpMode::Aot).is_err());
    assert!(holycc::compile_to_ir_with(source, "t.HC", false, PpMode::Aot).is_ok());
}

#[test]
fn goto_legality_enforced_through_pipeline() {
    let bad = "I64 Main() { goto skip; I64 v = 1; skip: return v; }";
    let err = holycc::compile_to_ir(bad).unwrap_err();
    assert!(err.contains("HC3032"));
}

#[test]
fn lock_block_produces_atomic_rmw() {
    let ir = holycc::compile_to_ir("I64 g; U0 Main() { lock { g += 1; } }").unwrap();
    assert!(ir.contains("atomicrmw add ptr @g, i64"));
    assert!(ir.contains("seq_cst"));
}

#[test]
fn reflection_table_lists_each_aggregate_once() {
    let ir = holycc::compile_to_ir(
        "class CA { I64 x; I64 y; }; union UB { I8 lo; I64 wide; }; I64 Main() { return 0; }",
    )
    .unwrap();
    assert!(ir.contains("[4 x %HcReflField]"));
    assert_eq!(ir.matches("c\"CA\\00\"").count(), 1);
    assert_eq!(ir.matches("c\"UB\\00\"").count(), 1);
}

#[test]
#[serial]
fn jit_artifacts_do_not_leak_outside_sessions() {
    // Loading into two sessions keeps their stacks independent.
    jit::reset("iso1");
    jit::reset("iso2");
    let ir = compile_jit("I64 Foo() { return 1; }", "m1", None);
    jit::load("iso1", "m1", &ir).unwrap();
    // iso2 cannot resolve Foo from iso1.
    let consumer = compile_jit("import I64 Foo(); I64 Bar() { return Foo(); }", "m2", None);
    assert!(jit::load("iso2", "m2", &consumer).is_err());
    jit::reset("iso1");
    jit::reset("iso2");
}

#[test]
fn build_artifacts_kept_with_keep_temps() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("k.HC");
    std::fs::write(&src, "I64 Main() { return 0; }").unwrap();
    if !execution_ready() {
        return;
    }
    let artifact_dir = dir.path().join("arts");
    let opts = BuildOptions {
        artifact_dir: artifact_dir.clone(),
        output: Some(dir.path().join("k")),
        keep_temps: true,
        ..Default::default()
    };
    let ir = holycc::compile_to_ir_with("I64 Main() { return 0; }", "k.HC", true, PpMode::Aot).unwrap();
    backend::build_executable(&ir, &src, &opts).unwrap();
    assert!(artifact_dir.join("k.ll").is_file());
    assert!(artifact_dir.join("k.o").is_file());

    // Without keep_temps both intermediates disappear again.
    let opts = BuildOptions {
        artifact_dir: artifact_dir.clone(),
        output: Some(dir.path().join("k2")),
        keep_temps: false,
        ..Default::default()
    };
    backend::build_executable(&ir, &src, &opts).unwrap();
    assert!(!artifact_dir.join("k.ll").exists());
    assert!(!artifact_dir.join("k.o").exists());
}

//! JIT session manager.
//!
//! A session owns an ordered stack of loaded IR modules plus monotonic
//! module/entry counters; the process-wide session map creates entries
//! on demand. Symbol policy is enforced per load: a module's undefined
//! symbols must resolve against module exports (newest first), the fixed
//! runtime symbol set, or the small host allow-list.
//!
//! Execution materializes the session image: modules merge at symbol
//! granularity (a newer definition shadows and drops older ones, so
//! every reference binds newest), the merged module is compiled against
//! the runtime static library into a per-execute shared object, loaded
//! in-process, and the synthesized entry is invoked. After the entry
//! returns the session blocks on the runtime's wait-all-tasks primitive
//! before the image is released.

use crate::backend::{self, OptLevel};
use crate::emit;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("jit: unresolved symbol '{0}' in module '{1}'")]
    Unresolved(String, String),
    #[error("jit: {0}")]
    Verify(String),
    #[error("jit: clang not found on PATH; the jit needs a host clang")]
    ClangMissing,
    #[error("jit: module compilation failed:\n{0}")]
    Compile(String),
    #[error("jit: cannot load image: {0}")]
    Load(String),
    #[error("jit: entry symbol '{0}' not found in session image")]
    EntryMissing(String),
    #[error("jit: {0}")]
    Internal(String),
}

/// Host process symbols modules may reference directly.
const HOST_ALLOWLIST: &[&str] = &["_setjmp", "setjmp", "__sigsetjmp"];

#[derive(Debug, Clone)]
struct JitModule {
    name: String,
    ir: String,
    defined: Vec<String>,
}

struct JitSession {
    modules: Vec<JitModule>,
    module_counter: usize,
    entry_counter: usize,
    scratch: tempfile::TempDir,
}

impl JitSession {
    fn new() -> Result<Self, JitError> {
        Ok(JitSession {
            modules: Vec::new(),
            module_counter: 0,
            entry_counter: 0,
            scratch: tempfile::tempdir().map_err(|e| JitError::Internal(e.to_string()))?,
        })
    }
}

static SESSIONS: OnceLock<Mutex<HashMap<String, JitSession>>> = OnceLock::new();

fn with_session<R>(name: &str, f: impl FnOnce(&mut JitSession) -> Result<R, JitError>) -> Result<R, JitError> {
    let mut map = SESSIONS.get_or_init(|| Mutex::new(HashMap::new())).lock().unwrap();
    if !map.contains_key(name) {
        map.insert(name.to_string(), JitSession::new()?);
    }
    f(map.get_mut(name).unwrap())
}

/// Allocate the tag the emitter uses to namespace the next module's
/// private globals.
pub fn next_module_tag(session: &str) -> Result<String, JitError> {
    with_session(session, |s| {
        s.module_counter += 1;
        Ok(format!("m{}", s.module_counter))
    })
}

/// Allocate the index for the next synthesized entry wrapper.
pub fn next_entry_index(session: &str) -> Result<usize, JitError> {
    with_session(session, |s| {
        s.entry_counter += 1;
        Ok(s.entry_counter)
    })
}

/// Verify and add a module to the session's layer stack.
pub fn load(session: &str, name: &str, ir: &str) -> Result<(), JitError> {
    with_session(session, |s| {
        let module = admit_module(s, name, ir)?;
        s.modules.push(module);
        Ok(())
    })
}

/// Load the module and run `entry` in the refreshed session image.
/// Returns the entry's return code. `reset_after_run` discards the
/// session afterwards; failures roll the load back.
pub fn execute(
    session: &str,
    name: &str,
    ir: &str,
    entry: &str,
    opt_level: OptLevel,
    reset_after_run: bool,
) -> Result<i64, JitError> {
    let result = with_session(session, |s| {
        let module = admit_module(s, name, ir)?;
        s.modules.push(module);
        let outcome = run_session_image(s, entry, opt_level);
        if outcome.is_err() {
            s.modules.pop();
        }
        outcome
    });
    if reset_after_run {
        reset(session);
    }
    result
}

/// Wait for task quiescence and discard the session. Quiescence for
/// already-finished images was handled at execute time, so dropping the
/// entry is sufficient.
pub fn reset(session: &str) {
    if let Some(map) = SESSIONS.get() {
        map.lock().unwrap().remove(session);
    }
}

/// Verification plus the symbol resolution policy.
fn admit_module(session: &JitSession, name: &str, ir: &str) -> Result<JitModule, JitError> {
    emit::verify_module(ir).map_err(|e| JitError::Verify(e.to_string()))?;
    let symbols = extract_symbols(ir);

    let runtime: HashSet<&str> = emit::runtime_symbols().into_iter().collect();
    for undef in &symbols.undefined {
        if symbols.defined.contains(undef) {
            continue;
        }
        if runtime.contains(undef.as_str()) || HOST_ALLOWLIST.contains(&undef.as_str()) {
            continue;
        }
        // Newest module first.
        if session.modules.iter().rev().any(|m| m.defined.contains(undef)) {
            continue;
        }
        return Err(JitError::Unresolved(undef.clone(), name.to_string()));
    }
    Ok(JitModule { name: name.to_string(), ir: ir.to_string(), defined: symbols.defined })
}

struct SymbolSet {
    defined: Vec<String>,
    undefined: Vec<String>,
}

/// Scan IR text for defined and referenced-but-undefined symbols. The
/// emitter's textual conventions make this exact for our own modules.
fn extract_symbols(ir: &str) -> SymbolSet {
    let mut defined = Vec::new();
    let mut undefined = Vec::new();
    for line in ir.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("define ") {
            if let Some(sym) = define_symbol(rest) {
                defined.push(sym.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("declare ") {
            if let Some(sym) = define_symbol(rest) {
                undefined.push(sym.to_string());
            }
        } else if let Some(rest) = line.strip_prefix('@') {
            if let Some(eq) = rest.find(" = ") {
                let sym = &rest[..eq];
                if rest[eq..].contains("external global") {
                    undefined.push(sym.to_string());
                } else {
                    defined.push(sym.to_string());
                }
            }
        }
    }
    SymbolSet { defined, undefined }
}

fn define_symbol(rest: &str) -> Option<&str> {
    let at = rest.find('@')?;
    let tail = &rest[at + 1..];
    let end = tail.find('(')?;
    Some(&tail[..end])
}

/// Merge the session's modules, newest shadowing oldest at symbol
/// granularity, into one compilable IR text.
fn merge_modules(modules: &[JitModule]) -> String {
    // Symbol -> index of the newest module defining it.
    let mut newest: HashMap<&str, usize> = HashMap::new();
    for (i, m) in modules.iter().enumerate() {
        for sym in &m.defined {
            newest.insert(sym.as_str(), i);
        }
    }

    let mut out = String::new();
    out.push_str("; holyc session image\n");
    let mut seen_lines: HashSet<String> = HashSet::new();

    for (i, m) in modules.iter().enumerate() {
        let mut skip_body = false;
        for line in m.ir.lines() {
            if skip_body {
                if line == "}" {
                    skip_body = false;
                }
                continue;
            }
            if line.starts_with("; ModuleID") || line.starts_with("source_filename") {
                continue;
            }
            // Declares drop when any module defines the symbol (a module
            // may not both declare and define); otherwise deduplicate.
            if let Some(rest) = line.strip_prefix("declare ") {
                if let Some(sym) = define_symbol(rest) {
                    if newest.contains_key(sym) {
                        continue;
                    }
                }
                if seen_lines.contains(line) {
                    continue;
                }
                seen_lines.insert(line.to_string());
                out.push_str(line);
                out.push('\n');
                continue;
            }
            if line.starts_with('%') && line.contains(" = type ") {
                if seen_lines.contains(line) {
                    continue;
                }
                seen_lines.insert(line.to_string());
                out.push_str(line);
                out.push('\n');
                continue;
            }
            if let Some(rest) = line.strip_prefix("define ") {
                if let Some(sym) = define_symbol(rest) {
                    if newest.get(sym).copied() != Some(i) {
                        // Shadowed by a newer module: drop the body.
                        skip_body = true;
                        continue;
                    }
                }
            }
            if let Some(rest) = line.strip_prefix('@') {
                if let Some(eq) = rest.find(" = ") {
                    let sym = &rest[..eq];
                    if rest[eq..].contains("external global") {
                        // Keep a single external declaration unless some
                        // module defines the symbol.
                        if newest.contains_key(sym) || seen_lines.contains(line) {
                            continue;
                        }
                        seen_lines.insert(line.to_string());
                    } else if newest.get(sym).copied() != Some(i) {
                        continue;
                    }
                }
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

fn run_session_image(session: &JitSession, entry: &str, opt_level: OptLevel) -> Result<i64, JitError> {
    if !backend::clang_available() {
        return Err(JitError::ClangMissing);
    }
    let runtime = backend::find_runtime_lib()
        .ok_or_else(|| JitError::Internal("runtime library not found".to_string()))?;

    let merged = merge_modules(&session.modules);
    let image_index = session.module_counter;
    let ll_path = session.scratch.path().join(format!("image_{}.ll", image_index));
    let so_path = session.scratch.path().join(format!("image_{}.so", image_index));
    std::fs::write(&ll_path, &merged).map_err(|e| JitError::Internal(e.to_string()))?;

    let mut cmd = std::process::Command::new("clang");
    cmd.arg(opt_level.as_flag())
        .arg("-shared")
        .arg("-fPIC")
        .arg(&ll_path)
        .arg(&runtime)
        .arg("-o")
        .arg(&so_path);
    if cfg!(target_os = "linux") {
        cmd.arg("-lpthread").arg("-ldl").arg("-lm");
    }
    let out = cmd.output().map_err(|e| JitError::Internal(e.to_string()))?;
    if !out.status.success() {
        return Err(JitError::Compile(String::from_utf8_lossy(&out.stderr).into_owned()));
    }

    invoke_entry(&so_path, entry)
}

/// dlopen the image, call the entry, wait for detached tasks, unload.
fn invoke_entry(so_path: &std::path::Path, entry: &str) -> Result<i64, JitError> {
    let c_path = CString::new(so_path.to_string_lossy().into_owned())
        .map_err(|e| JitError::Internal(e.to_string()))?;
    let c_entry = CString::new(entry).map_err(|e| JitError::Internal(e.to_string()))?;
    let c_wait = CString::new("hc_task_wait_all").unwrap();

    unsafe {
        let handle = libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL);
        if handle.is_null() {
            let err = dl_error().unwrap_or_else(|| "dlopen failed".to_string());
            return Err(JitError::Load(err));
        }
        let sym = libc::dlsym(handle, c_entry.as_ptr());
        if sym.is_null() {
            libc::dlclose(handle);
            return Err(JitError::EntryMissing(entry.to_string()));
        }
        let f: extern "C" fn() -> i32 = std::mem::transmute(sym);
        let code = f() as i64;

        // Task quiescence before the image can be unmapped.
        let wait = libc::dlsym(handle, c_wait.as_ptr());
        if !wait.is_null() {
            let w: extern "C" fn() = std::mem::transmute(wait);
            w();
        }
        libc::dlclose(handle);
        Ok(code)
    }
}

unsafe fn dl_error() -> Option<String> {
    let err = libc::dlerror();
    if err.is_null() {
        None
    } else {
        Some(CStr::from_ptr(err).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn module(name: &str, ir: &str) -> JitModule {
        let symbols = extract_symbols(ir);
        JitModule { name: name.to_string(), ir: ir.to_string(), defined: symbols.defined }
    }

    #[test]
    fn test_extract_symbols() {
        let ir = "define i64 @Foo() {\nentry:\n  ret i64 1\n}\ndeclare void @hc_print_fmt(ptr, ptr, i64)\n@g = global i64 0\n@e = external global i64\n";
        let syms = extract_symbols(ir);
        assert!(syms.defined.contains(&"Foo".to_string()));
        assert!(syms.defined.contains(&"g".to_string()));
        assert!(syms.undefined.contains(&"hc_print_fmt".to_string()));
        assert!(syms.undefined.contains(&"e".to_string()));
    }

    #[test]
    #[serial]
    fn test_policy_allows_runtime_and_host() {
        reset("polok");
        let ir = "declare void @hc_throw_i64(i64)\ndeclare i32 @_setjmp(ptr) returns_twice\ndefine i64 @F() {\nentry:\n  ret i64 0\n}\n";
        assert!(load("polok", "m1", ir).is_ok());
        reset("polok");
    }

    #[test]
    #[serial]
    fn test_policy_rejects_unknown_symbol() {
        reset("polbad");
        let ir = "declare i64 @mystery_host_symbol()\ndefine i64 @F() {\nentry:\n  ret i64 0\n}\n";
        let err = load("polbad", "m1", ir).unwrap_err();
        assert!(matches!(err, JitError::Unresolved(sym, _) if sym == "mystery_host_symbol"));
        reset("polbad");
    }

    #[test]
    #[serial]
    fn test_policy_resolves_against_older_modules() {
        reset("pollayer");
        let provider = "define i64 @Foo() {\nentry:\n  ret i64 1\n}\n";
        let consumer = "declare i64 @Foo()\ndefine i64 @Bar() {\nentry:\n  %t1 = call i64 @Foo()\n  ret i64 %t1\n}\n";
        assert!(load("pollayer", "m1", provider).is_ok());
        assert!(load("pollayer", "m2", consumer).is_ok());
        reset("pollayer");
    }

    #[test]
    fn test_merge_newest_shadows_oldest() {
        let old = module("m1", "define i64 @Foo() {\nentry:\n  ret i64 1\n}\n");
        let new = module("m2", "define i64 @Foo() {\nentry:\n  ret i64 2\n}\n");
        let user = module(
            "m3",
            "declare i64 @Foo()\ndefine i64 @Use() {\nentry:\n  %t1 = call i64 @Foo()\n  ret i64 %t1\n}\n",
        );
        let merged = merge_modules(&[old, new, user]);
        // Exactly one definition of Foo survives, the newer one, and the
        // consumer's declare drops because the image defines the symbol.
        assert_eq!(merged.matches("define i64 @Foo()").count(), 1);
        assert!(merged.contains("ret i64 2"));
        assert!(!merged.contains("ret i64 1\n}"));
        assert!(!merged.contains("declare i64 @Foo()"));
    }

    #[test]
    fn test_merge_dedupes_declares_and_types() {
        let a = module("m1", "%HcReflField = type { ptr, ptr, ptr, ptr }\ndeclare void @hc_print_str(ptr)\ndefine i64 @A() {\nentry:\n  ret i64 0\n}\n");
        let b = module("m2", "%HcReflField = type { ptr, ptr, ptr, ptr }\ndeclare void @hc_print_str(ptr)\ndefine i64 @B() {\nentry:\n  ret i64 0\n}\n");
        let merged = merge_modules(&[a, b]);
        assert_eq!(merged.matches("%HcReflField = type").count(), 1);
        assert_eq!(merged.matches("declare void @hc_print_str").count(), 1);
    }

    #[test]
    fn test_merge_shadows_globals() {
        let old = module("m1", "@g = global i64 1\n");
        let new = module("m2", "@g = global i64 2\n");
        let merged = merge_modules(&[old, new]);
        assert_eq!(merged.matches("@g = global").count(), 1);
        assert!(merged.contains("@g = global i64 2"));
    }

    #[test]
    fn test_merge_drops_external_when_defined() {
        let ext = module("m1", "@g = external global i64\n");
        let def = module("m2", "@g = global i64 5\n");
        let merged = merge_modules(&[ext, def]);
        assert!(!merged.contains("external global"));
        assert!(merged.contains("@g = global i64 5"));
    }

    #[test]
    #[serial]
    fn test_counters_are_monotonic() {
        reset("ctr");
        assert_eq!(next_module_tag("ctr").unwrap(), "m1");
        assert_eq!(next_module_tag("ctr").unwrap(), "m2");
        assert_eq!(next_entry_index("ctr").unwrap(), 1);
        assert_eq!(next_entry_index("ctr").unwrap(), 2);
        reset("ctr");
        assert_eq!(next_module_tag("ctr").unwrap(), "m1");
        reset("ctr");
    }

    #[test]
    #[serial]
    fn test_load_rejects_bad_ir() {
        reset("badir");
        let bad = "define i64 @F() {\nentry:\n  %t1 = add i64 1, 2\n}\n";
        assert!(matches!(load("badir", "m1", bad), Err(JitError::Verify(_))));
        reset("badir");
    }
}

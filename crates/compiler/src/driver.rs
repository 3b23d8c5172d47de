//! Per-command pipeline orchestration and phase timing.
//!
//! Each CLI subcommand maps to one `run_*` function returning the
//! process exit code: 0 on success, 1 on any pipeline error. The first
//! fatal diagnostic renders to stderr and stops the phase chain.

use crate::ast::{self, TypedNode};
use crate::backend::{self, BuildOptions, OptLevel};
use crate::emit::{self, EmitOptions};
use crate::hir::{self, HirModule};
use crate::jit;
use crate::lower;
use crate::parser::Parser;
use crate::preprocess::{self, PpMode, PpOptions};
use crate::repl::ReplEngine;
use crate::sema::{self, SemaOptions};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// Options shared by the inspection commands.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub mode: PpMode,
    pub strict: bool,
}

#[derive(Debug, Serialize)]
struct Phase {
    name: String,
    seconds: f64,
}

#[derive(Debug, Serialize)]
struct TimingReport<'a> {
    command: &'a str,
    phases: &'a [Phase],
}

/// Wall-clock accumulator for `--time-phases`.
pub struct PhaseTimer {
    enabled: bool,
    phases: Vec<Phase>,
}

impl PhaseTimer {
    pub fn new(enabled: bool) -> Self {
        PhaseTimer { enabled, phases: Vec::new() }
    }

    pub fn time<R>(&mut self, name: &str, f: impl FnOnce() -> R) -> R {
        if !self.enabled {
            return f();
        }
        let start = Instant::now();
        let result = f();
        let seconds = start.elapsed().as_secs_f64();
        debug!(phase = name, seconds, "phase finished");
        self.phases.push(Phase { name: name.to_string(), seconds });
        result
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for p in &self.phases {
            out.push_str(&format!("{:<12} {:.6}s\n", p.name, p.seconds));
        }
        out
    }

    pub fn write_json(&self, command: &str, path: &Path) -> std::io::Result<()> {
        let report = TimingReport { command, phases: &self.phases };
        let text = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, text)
    }

    /// Emit the requested timing outputs; failures to write the JSON
    /// surface as warnings only.
    pub fn finish(&self, command: &str, json_path: Option<&Path>) {
        if !self.enabled {
            return;
        }
        eprint!("{}", self.render_text());
        if let Some(path) = json_path {
            if let Err(e) = self.write_json(command, path) {
                eprintln!("warning: cannot write timing json: {}", e);
            }
        }
    }
}

// ======================================================================
// Pipeline phases
// ======================================================================

fn read_and_preprocess(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> Result<String, String> {
    let pp_opts = PpOptions { mode: opts.mode, include_roots: Vec::new() };
    timer
        .time("preprocess", || preprocess::preprocess_file(file, &pp_opts))
        .map_err(|d| d.render())
}

fn parse_phase(text: &str, file: &str, timer: &mut PhaseTimer) -> Result<ast::ParsedNode, String> {
    timer
        .time("parse", || Parser::parse_source(text, file))
        .map_err(|d| d.render())
}

fn sema_phase(
    parsed: &ast::ParsedNode,
    file: &str,
    opts: &PipelineOptions,
    timer: &mut PhaseTimer,
) -> Result<TypedNode, String> {
    timer
        .time("sema", || sema::analyze(parsed, file, SemaOptions { strict: opts.strict }))
        .map_err(|d| d.render())
}

fn lower_phase(typed: &TypedNode, file: &str, timer: &mut PhaseTimer) -> Result<HirModule, String> {
    timer.time("lower", || lower::lower(typed, file)).map_err(|d| d.render())
}

fn hir_for_file(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> Result<HirModule, String> {
    let name = file.display().to_string();
    let text = read_and_preprocess(file, opts, timer)?;
    let parsed = parse_phase(&text, &name, timer)?;
    let typed = sema_phase(&parsed, &name, opts, timer)?;
    lower_phase(&typed, &name, timer)
}

fn emit_for_file(
    file: &Path,
    opts: &PipelineOptions,
    emit_opts: &EmitOptions,
    timer: &mut PhaseTimer,
) -> Result<String, String> {
    let module = hir_for_file(file, opts, timer)?;
    timer
        .time("emit", || emit::emit(&module, emit_opts))
        .map_err(|e| e.to_string())
}

fn aot_emit_options(file: &Path, mode: PpMode) -> EmitOptions {
    EmitOptions {
        module_name: file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "holyc_module".to_string()),
        source_file: file.display().to_string(),
        jit: mode == PpMode::Jit,
        entry_wrap: None,
        module_tag: String::new(),
    }
}

fn fail(message: &str) -> i32 {
    eprintln!("{}", message);
    1
}

// ======================================================================
// Commands
// ======================================================================

pub fn run_check(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> i32 {
    match emit_for_file(file, opts, &aot_emit_options(file, opts.mode), timer) {
        Ok(_) => 0,
        Err(message) => fail(&message),
    }
}

pub fn run_preprocess(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> i32 {
    match read_and_preprocess(file, opts, timer) {
        Ok(text) => {
            print!("{}", text);
            0
        }
        Err(message) => fail(&message),
    }
}

pub fn run_ast_dump(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> i32 {
    let name = file.display().to_string();
    let result = read_and_preprocess(file, opts, timer)
        .and_then(|text| parse_phase(&text, &name, timer))
        .and_then(|parsed| sema_phase(&parsed, &name, opts, timer));
    match result {
        Ok(typed) => {
            print!("{}", ast::dump_typed(&typed));
            0
        }
        Err(message) => fail(&message),
    }
}

pub fn run_emit_hir(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> i32 {
    match hir_for_file(file, opts, timer) {
        Ok(module) => {
            print!("{}", hir::dump_module(&module));
            0
        }
        Err(message) => fail(&message),
    }
}

pub fn run_emit_llvm(file: &Path, opts: &PipelineOptions, timer: &mut PhaseTimer) -> i32 {
    match emit_for_file(file, opts, &aot_emit_options(file, opts.mode), timer) {
        Ok(ir) => {
            print!("{}", ir);
            0
        }
        Err(message) => fail(&message),
    }
}

pub struct JitCommand {
    pub session: String,
    pub reset_after_run: bool,
    pub opt_level: OptLevel,
}

pub fn run_jit(file: &Path, strict: bool, cmd: &JitCommand, timer: &mut PhaseTimer) -> i32 {
    let opts = PipelineOptions { mode: PpMode::Jit, strict };
    let result = (|| -> Result<i64, String> {
        let tag = jit::next_module_tag(&cmd.session).map_err(|e| e.to_string())?;
        let n = jit::next_entry_index(&cmd.session).map_err(|e| e.to_string())?;
        let emit_opts = EmitOptions {
            module_name: file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "holyc_module".to_string()),
            source_file: file.display().to_string(),
            jit: true,
            entry_wrap: Some(("Main".to_string(), n)),
            module_tag: tag.clone(),
        };
        let ir = emit_for_file(file, &opts, &emit_opts, timer)?;
        let entry = format!("__holyc_entry_{}", n);
        timer
            .time("jit", || {
                jit::execute(&cmd.session, &tag, &ir, &entry, cmd.opt_level, cmd.reset_after_run)
            })
            .map_err(|e| e.to_string())
    })();
    match result {
        Ok(code) => {
            println!("{}", code);
            0
        }
        Err(message) => fail(&message),
    }
}

pub struct BuildCommand {
    pub output: Option<PathBuf>,
    pub target: Option<String>,
    pub artifact_dir: PathBuf,
    pub keep_temps: bool,
    pub opt_level: OptLevel,
}

pub fn run_build(file: &Path, strict: bool, cmd: &BuildCommand, timer: &mut PhaseTimer) -> Result<PathBuf, i32> {
    let opts = PipelineOptions { mode: PpMode::Aot, strict };
    let ir = match emit_for_file(file, &opts, &aot_emit_options(file, PpMode::Aot), timer) {
        Ok(ir) => ir,
        Err(message) => return Err(fail(&message)),
    };
    let build_opts = BuildOptions {
        opt_level: cmd.opt_level,
        target: cmd.target.clone(),
        artifact_dir: cmd.artifact_dir.clone(),
        keep_temps: cmd.keep_temps,
        output: cmd.output.clone(),
    };
    let object = timer.time("object", || backend::build_executable(&ir, file, &build_opts));
    match object {
        Ok(path) => Ok(path),
        Err(e) => Err(fail(&e.to_string())),
    }
}

pub fn run_run(file: &Path, strict: bool, cmd: &BuildCommand, timer: &mut PhaseTimer) -> i32 {
    let output = match run_build(file, strict, cmd, timer) {
        Ok(path) => path,
        Err(code) => return code,
    };
    match backend::run_executable(&output, &[]) {
        Ok(code) => code,
        Err(e) => fail(&e.to_string()),
    }
}

/// One REPL input loop turn: feed a completed buffer to the engine and
/// render the outcome. Returns the text to show, if any.
pub fn repl_eval_line(engine: &mut ReplEngine, buffer: &str) -> Option<String> {
    match engine.eval(buffer) {
        Ok(Some(value)) => Some(value),
        Ok(None) => None,
        Err(message) => Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(source: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.HC");
        std::fs::write(&path, source).unwrap();
        (dir, path)
    }

    #[test]
    fn test_check_accepts_then_all_dumps_work() {
        let (_dir, path) = write_temp("I64 Main() { return 2 + 3 * 4; }");
        let opts = PipelineOptions { mode: PpMode::Aot, strict: true };
        let mut timer = PhaseTimer::new(false);
        assert_eq!(run_check(&path, &opts, &mut timer), 0);
        assert_eq!(run_ast_dump(&path, &opts, &mut timer), 0);
        assert_eq!(run_emit_hir(&path, &opts, &mut timer), 0);
        assert_eq!(run_emit_llvm(&path, &opts, &mut timer), 0);
    }

    #[test]
    fn test_check_rejects_bad_source() {
        let (_dir, path) = write_temp("I64 Main() { return continue; }");
        let opts = PipelineOptions { mode: PpMode::Aot, strict: true };
        let mut timer = PhaseTimer::new(false);
        assert_eq!(run_check(&path, &opts, &mut timer), 1);
    }

    #[test]
    fn test_timer_collects_phases() {
        let (_dir, path) = write_temp("I64 Main() { return 0; }");
        let opts = PipelineOptions { mode: PpMode::Aot, strict: true };
        let mut timer = PhaseTimer::new(true);
        assert_eq!(run_check(&path, &opts, &mut timer), 0);
        let text = timer.render_text();
        for phase in ["preprocess", "parse", "sema", "lower", "emit"] {
            assert!(text.contains(phase), "missing phase {}", phase);
        }
    }

    #[test]
    fn test_timer_json_shape() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("t.json");
        let mut timer = PhaseTimer::new(true);
        timer.time("parse", || {});
        timer.write_json("check", &json_path).unwrap();
        let text = std::fs::read_to_string(&json_path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["command"], "check");
        assert_eq!(value["phases"][0]["name"], "parse");
        assert!(value["phases"][0]["seconds"].is_number());
    }

    #[test]
    fn test_emit_llvm_deterministic_via_driver() {
        let (_dir, path) = write_temp("class CPt { I64 x; }; I64 Main() { return 1; }");
        let opts = PipelineOptions { mode: PpMode::Aot, strict: true };
        let mut t1 = PhaseTimer::new(false);
        let a = emit_for_file(&path, &opts, &aot_emit_options(&path, PpMode::Aot), &mut t1).unwrap();
        let mut t2 = PhaseTimer::new(false);
        let b = emit_for_file(&path, &opts, &aot_emit_options(&path, PpMode::Aot), &mut t2).unwrap();
        assert_eq!(a, b);
    }
}

//! HolyC toolchain CLI.
//!
//! Subcommands cover the whole pipeline: inspection (`check`,
//! `preprocess`, `ast-dump`, `emit-hir`, `emit-llvm`), the JIT and REPL,
//! and the AOT `build`/`run` path. Exit codes: 0 success, 1 pipeline
//! error, 2 usage error (clap's default).

use clap::{Args, Parser as ClapParser, Subcommand};
use holycc::backend::OptLevel;
use holycc::driver::{self, BuildCommand, JitCommand, PhaseTimer, PipelineOptions};
use holycc::preprocess::PpMode;
use holycc::repl::{Readiness, ReplEngine, ReplOptions};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "holycc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "HolyC compiler toolchain: AOT, JIT and REPL", long_about = None)]
struct Cli {
    /// Print the default analysis mode and exit
    #[arg(long)]
    print_strict_mode: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Preprocessor mode flag read by #ifjit / #ifaot
    #[arg(long, value_parser = ["jit", "aot"], default_value = "aot")]
    mode: String,

    /// Reject HolyC compatibility modifiers (the default)
    #[arg(long, conflicts_with = "permissive")]
    strict: bool,

    /// Accept and strip HolyC compatibility modifiers
    #[arg(long)]
    permissive: bool,

    /// Report per-phase wall-clock times on stderr
    #[arg(long)]
    time_phases: bool,

    /// Also write phase times as JSON to the given path
    #[arg(long, value_name = "PATH")]
    time_phases_json: Option<PathBuf>,
}

impl CommonArgs {
    fn pipeline(&self) -> PipelineOptions {
        PipelineOptions {
            mode: if self.mode == "jit" { PpMode::Jit } else { PpMode::Aot },
            strict: !self.permissive,
        }
    }

    fn timer(&self) -> PhaseTimer {
        PhaseTimer::new(self.time_phases || self.time_phases_json.is_some())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full front end and verify the module, producing nothing
    Check {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the preprocessed source text
    Preprocess {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the typed syntax tree
    AstDump {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the lowered HIR module
    EmitHir {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the emitted LLVM IR
    EmitLlvm {
        file: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Compile and run Main in an in-process JIT session
    Jit {
        file: PathBuf,

        /// Accept and strip HolyC compatibility modifiers
        #[arg(long, conflicts_with = "strict")]
        permissive: bool,
        #[arg(long)]
        strict: bool,

        /// JIT backend selection (llvm is the only backend)
        #[arg(long, value_parser = ["llvm"], default_value = "llvm")]
        jit_backend: String,

        /// Session name; layered modules share a session
        #[arg(long, default_value = "__default__")]
        jit_session: String,

        /// Discard the session after the run
        #[arg(long)]
        jit_reset: bool,

        /// Optimization level: 0|1|2|3|s|z
        #[arg(long, default_value = "2")]
        opt_level: String,

        #[arg(long)]
        time_phases: bool,
        #[arg(long, value_name = "PATH")]
        time_phases_json: Option<PathBuf>,
    },

    /// Interactive HolyC shell over a JIT session
    Repl {
        #[arg(long, conflicts_with = "strict")]
        permissive: bool,
        #[arg(long)]
        strict: bool,

        #[arg(long, default_value = "__repl__")]
        jit_session: String,

        /// Reset the session before the first cell
        #[arg(long)]
        jit_reset: bool,

        /// Optimization level: 0|1|2|3|s|z
        #[arg(long, default_value = "1")]
        opt_level: String,
    },

    /// Compile to an executable via the host linker
    Build {
        file: PathBuf,

        /// Output executable path (defaults to the input basename)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Cross-compilation target triple
        #[arg(long)]
        target: Option<String>,

        /// Directory for intermediate .ll/.o artifacts
        #[arg(long, default_value = ".holyc-artifacts")]
        artifact_dir: PathBuf,

        /// Keep intermediate artifacts after a successful build
        #[arg(long)]
        keep_temps: bool,

        #[arg(long, conflicts_with = "strict")]
        permissive: bool,
        #[arg(long)]
        strict: bool,

        /// Optimization level: 0|1|2|3|s|z
        #[arg(long, default_value = "2")]
        opt_level: String,

        #[arg(long)]
        time_phases: bool,
        #[arg(long, value_name = "PATH")]
        time_phases_json: Option<PathBuf>,
    },

    /// Build then execute
    Run {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        target: Option<String>,
        #[arg(long, default_value = ".holyc-artifacts")]
        artifact_dir: PathBuf,
        #[arg(long)]
        keep_temps: bool,
        #[arg(long, conflicts_with = "strict")]
        permissive: bool,
        #[arg(long)]
        strict: bool,
        #[arg(long, default_value = "2")]
        opt_level: String,
        #[arg(long)]
        time_phases: bool,
        #[arg(long, value_name = "PATH")]
        time_phases_json: Option<PathBuf>,
    },
}

fn parse_opt_level(text: &str) -> OptLevel {
    match OptLevel::parse(text) {
        Some(level) => level,
        None => {
            eprintln!("error: invalid optimization level '{}' (expected 0|1|2|3|s|z)", text);
            process::exit(2);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HOLYC_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.print_strict_mode {
        println!("strict");
        process::exit(0);
    }

    let command = match cli.command {
        Some(command) => command,
        None => {
            eprintln!("error: a subcommand is required (try --help)");
            process::exit(2);
        }
    };

    let code = match command {
        Commands::Check { file, common } => {
            let mut timer = common.timer();
            let code = driver::run_check(&file, &common.pipeline(), &mut timer);
            timer.finish("check", common.time_phases_json.as_deref());
            code
        }
        Commands::Preprocess { file, common } => {
            let mut timer = common.timer();
            let code = driver::run_preprocess(&file, &common.pipeline(), &mut timer);
            timer.finish("preprocess", common.time_phases_json.as_deref());
            code
        }
        Commands::AstDump { file, common } => {
            let mut timer = common.timer();
            let code = driver::run_ast_dump(&file, &common.pipeline(), &mut timer);
            timer.finish("ast-dump", common.time_phases_json.as_deref());
            code
        }
        Commands::EmitHir { file, common } => {
            let mut timer = common.timer();
            let code = driver::run_emit_hir(&file, &common.pipeline(), &mut timer);
            timer.finish("emit-hir", common.time_phases_json.as_deref());
            code
        }
        Commands::EmitLlvm { file, common } => {
            let mut timer = common.timer();
            let code = driver::run_emit_llvm(&file, &common.pipeline(), &mut timer);
            timer.finish("emit-llvm", common.time_phases_json.as_deref());
            code
        }
        Commands::Jit {
            file,
            permissive,
            strict: _,
            jit_backend: _,
            jit_session,
            jit_reset,
            opt_level,
            time_phases,
            time_phases_json,
        } => {
            let mut timer = PhaseTimer::new(time_phases || time_phases_json.is_some());
            let cmd = JitCommand {
                session: jit_session,
                reset_after_run: jit_reset,
                opt_level: parse_opt_level(&opt_level),
            };
            let code = driver::run_jit(&file, !permissive, &cmd, &mut timer);
            timer.finish("jit", time_phases_json.as_deref());
            code
        }
        Commands::Repl { permissive, strict: _, jit_session, jit_reset, opt_level } => {
            run_repl(!permissive, jit_session, jit_reset, parse_opt_level(&opt_level))
        }
        Commands::Build {
            file,
            output,
            target,
            artifact_dir,
            keep_temps,
            permissive,
            strict: _,
            opt_level,
            time_phases,
            time_phases_json,
        } => {
            let mut timer = PhaseTimer::new(time_phases || time_phases_json.is_some());
            let cmd = BuildCommand {
                output,
                target,
                artifact_dir,
                keep_temps,
                opt_level: parse_opt_level(&opt_level),
            };
            let code = match driver::run_build(&file, !permissive, &cmd, &mut timer) {
                Ok(path) => {
                    println!("Compiled {} -> {}", file.display(), path.display());
                    0
                }
                Err(code) => code,
            };
            timer.finish("build", time_phases_json.as_deref());
            code
        }
        Commands::Run {
            file,
            output,
            target,
            artifact_dir,
            keep_temps,
            permissive,
            strict: _,
            opt_level,
            time_phases,
            time_phases_json,
        } => {
            let mut timer = PhaseTimer::new(time_phases || time_phases_json.is_some());
            let cmd = BuildCommand {
                output,
                target,
                artifact_dir,
                keep_temps,
                opt_level: parse_opt_level(&opt_level),
            };
            let code = driver::run_run(&file, !permissive, &cmd, &mut timer);
            timer.finish("run", time_phases_json.as_deref());
            code
        }
    };
    process::exit(code);
}

// ======================================================================
// REPL loop
// ======================================================================

fn run_repl(strict: bool, session: String, reset_first: bool, opt_level: OptLevel) -> i32 {
    let mut engine = ReplEngine::new(ReplOptions { strict, session, opt_level });
    if reset_first {
        engine.reset();
    }

    let mut editor = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("repl: cannot initialize line editor: {}", e);
            return 1;
        }
    };

    println!("HolyC repl (session '{}'); :quit to exit, :reset to clear", engine.session_name());
    let mut buffer = String::new();
    let mut in_fence = false;

    loop {
        let prompt = if buffer.is_empty() && !in_fence { "holyc> " } else { "  ...> " };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted) => {
                buffer.clear();
                in_fence = false;
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("repl: input error: {}", e);
                return 1;
            }
        };

        let trimmed = line.trim();
        match trimmed {
            ":quit" | ":q" => break,
            ":reset" => {
                engine.reset();
                buffer.clear();
                in_fence = false;
                println!("session reset");
                continue;
            }
            ":{" => {
                in_fence = true;
                continue;
            }
            ":}" => {
                in_fence = false;
                // Fall through to evaluate the collected buffer.
            }
            _ => {
                buffer.push_str(&line);
                buffer.push('\n');
                if in_fence {
                    continue;
                }
                if ReplEngine::readiness(&buffer) == Readiness::Incomplete {
                    continue;
                }
            }
        }

        if buffer.trim().is_empty() {
            buffer.clear();
            continue;
        }
        let _ = editor.add_history_entry(buffer.trim());
        if let Some(output) = driver::repl_eval_line(&mut engine, &buffer) {
            println!("{}", output);
        }
        buffer.clear();
    }
    0
}

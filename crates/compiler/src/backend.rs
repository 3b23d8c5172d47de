//! AOT backend: drive clang over the emitted IR text.
//!
//! The `.ll` is compiled to an object at the requested optimization
//! level, then linked by the host C++ compiler together with the HolyC
//! runtime static library. Artifacts live under the configured artifact
//! directory and are removed on success unless `--keep-temps` is set.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("clang not found on PATH: {0}")]
    ClangMissing(String),
    #[error("object emission failed:\n{0}")]
    ObjectEmission(String),
    #[error("clang link step failed:\n{0}")]
    Link(String),
    #[error("runtime library not found; build the workspace or set HOLYC_RUNTIME_LIB")]
    RuntimeMissing,
    #[error("{0}")]
    Io(String),
}

/// Optimization presets mapped onto clang's flags; O0 bypasses
/// optimization entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
    Oz,
}

impl OptLevel {
    pub fn parse(text: &str) -> Option<OptLevel> {
        Some(match text {
            "0" => OptLevel::O0,
            "1" => OptLevel::O1,
            "2" => OptLevel::O2,
            "3" => OptLevel::O3,
            "s" => OptLevel::Os,
            "z" => OptLevel::Oz,
            _ => return None,
        })
    }

    pub fn as_flag(self) -> &'static str {
        match self {
            OptLevel::O0 => "-O0",
            OptLevel::O1 => "-O1",
            OptLevel::O2 => "-O2",
            OptLevel::O3 => "-O3",
            OptLevel::Os => "-Os",
            OptLevel::Oz => "-Oz",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub opt_level: OptLevel,
    pub target: Option<String>,
    pub artifact_dir: PathBuf,
    pub keep_temps: bool,
    pub output: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            opt_level: OptLevel::O2,
            target: None,
            artifact_dir: PathBuf::from(".holyc-artifacts"),
            keep_temps: false,
            output: None,
        }
    }
}

/// Is a usable clang on PATH? Callers gate object emission on this.
pub fn clang_available() -> bool {
    Command::new("clang")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Locate `libholyc_runtime.a`: explicit override first, then next to
/// the running executable, then the enclosing cargo target profile
/// directories (including `deps`).
pub fn find_runtime_lib() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("HOLYC_RUNTIME_LIB") {
        let p = PathBuf::from(path);
        if p.is_file() {
            return Some(p);
        }
    }
    let exe = std::env::current_exe().ok()?;
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut cur = exe.parent();
    for _ in 0..3 {
        match cur {
            Some(dir) => {
                dirs.push(dir.to_path_buf());
                dirs.push(dir.join("deps"));
                cur = dir.parent();
            }
            None => break,
        }
    }
    for dir in dirs {
        let direct = dir.join("libholyc_runtime.a");
        if direct.is_file() {
            return Some(direct);
        }
        if let Some(found) = find_runtime_in_dir(&dir) {
            return Some(found);
        }
    }
    None
}

fn find_runtime_in_dir(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries.filter_map(Result::ok).find_map(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("libholyc_runtime") && name.ends_with(".a") {
            Some(entry.path())
        } else {
            None
        }
    })
}

/// Build an executable from verified IR text. Returns the output path.
pub fn build_executable(ir: &str, source_path: &Path, opts: &BuildOptions) -> Result<PathBuf, BackendError> {
    let base = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let output = opts
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&base));

    std::fs::create_dir_all(&opts.artifact_dir)
        .map_err(|e| BackendError::Io(format!("cannot create artifact dir: {}", e)))?;
    let ll_path = opts.artifact_dir.join(format!("{}.ll", base));
    let obj_path = opts.artifact_dir.join(format!("{}.o", base));
    std::fs::write(&ll_path, ir).map_err(|e| BackendError::Io(format!("cannot write IR: {}", e)))?;

    if !clang_available() {
        return Err(BackendError::ClangMissing("install clang 15 or later".to_string()));
    }

    // Object emission; clang parses and verifies the module here.
    let mut compile = Command::new("clang");
    compile
        .arg(opts.opt_level.as_flag())
        .arg("-c")
        .arg(&ll_path)
        .arg("-o")
        .arg(&obj_path);
    if let Some(triple) = &opts.target {
        compile.arg(format!("--target={}", triple));
    }
    let out = compile
        .output()
        .map_err(|e| BackendError::ClangMissing(e.to_string()))?;
    if !out.status.success() {
        return Err(BackendError::ObjectEmission(String::from_utf8_lossy(&out.stderr).into_owned()));
    }

    // Link with the runtime; the C++ driver picks deterministic system
    // libraries on Linux.
    let runtime = find_runtime_lib().ok_or(BackendError::RuntimeMissing)?;
    let mut link = Command::new("clang++");
    link.arg(&obj_path).arg(&runtime).arg("-o").arg(&output);
    if let Some(triple) = &opts.target {
        link.arg(format!("--target={}", triple));
    }
    if cfg!(target_os = "linux") {
        link.arg("-lpthread").arg("-ldl").arg("-lm");
    }
    let out = link.output().map_err(|e| BackendError::ClangMissing(e.to_string()))?;
    if !out.status.success() {
        return Err(BackendError::Link(String::from_utf8_lossy(&out.stderr).into_owned()));
    }

    if !opts.keep_temps {
        let _ = std::fs::remove_file(&ll_path);
        let _ = std::fs::remove_file(&obj_path);
    }
    Ok(output)
}

/// Run a built executable, inheriting stdio. Returns its exit code.
pub fn run_executable(path: &Path, args: &[String]) -> Result<i32, BackendError> {
    let status = Command::new(path)
        .args(args)
        .status()
        .map_err(|e| BackendError::Io(format!("cannot run {}: {}", path.display(), e)))?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opt_level_parse() {
        assert_eq!(OptLevel::parse("0"), Some(OptLevel::O0));
        assert_eq!(OptLevel::parse("2"), Some(OptLevel::O2));
        assert_eq!(OptLevel::parse("s"), Some(OptLevel::Os));
        assert_eq!(OptLevel::parse("z"), Some(OptLevel::Oz));
        assert_eq!(OptLevel::parse("9"), None);
    }

    #[test]
    fn test_opt_level_flags() {
        assert_eq!(OptLevel::O0.as_flag(), "-O0");
        assert_eq!(OptLevel::Oz.as_flag(), "-Oz");
    }

    #[test]
    fn test_default_artifact_dir() {
        let opts = BuildOptions::default();
        assert_eq!(opts.artifact_dir, PathBuf::from(".holyc-artifacts"));
        assert_eq!(opts.opt_level, OptLevel::O2);
    }

    #[test]
    fn test_runtime_override_env_missing_path() {
        // A bogus override falls back to the search (which may or may
        // not find the workspace build; only the override is asserted).
        std::env::set_var("HOLYC_RUNTIME_LIB", "/definitely/not/here.a");
        let found = find_runtime_lib();
        if let Some(p) = found {
            assert_ne!(p, PathBuf::from("/definitely/not/here.a"));
        }
        std::env::remove_var("HOLYC_RUNTIME_LIB");
    }
}

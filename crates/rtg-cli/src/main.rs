//! rtg command-line driver.
//!
//! ```text
//! rtg [-o output] [-T os/arch | c[/16|32|64] | ir] [-tags t1,t2] [-run] file...
//! ```
//!
//! The scanner/parser/resolver frontend is an external collaborator: it
//! either drives the `rtg-compiler` library directly or hands this binary
//! a module in the textual IR form, which is what the `file` arguments
//! name. The driver verifies the module, prunes unreachable functions,
//! runs the selected backend, and writes the image only after full
//! success. Exit codes: 0 on success, 1 on any validation or
//! code-generation error, and the child's code under `-run`.

mod output;

use anyhow::{bail, Context, Result};
use clap::Parser;
use output::{resolve_color_choice, Diagnostics};
use rtg_ast::Target;
use rtg_codegen::{generate, EmitKind};
use rtg_ir::{eliminate_dead_funcs, emit_text, parse_text, verify_module, IrModule};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

#[derive(Parser)]
#[command(name = "rtg")]
#[command(about = "Ahead-of-time compiler for a garbage-free Go subset")]
#[command(version)]
struct Cli {
    /// Module to build, in textual IR form
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Output path
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Target: os/arch triple, `c[/16|32|64]`, or `ir`
    #[arg(short = 'T', default_value = "linux/amd64")]
    target: String,

    /// Build tags, comma-separated (consumed by the frontend)
    #[arg(long = "tags")]
    tags: Option<String>,

    /// Build into a temporary file, run it, propagate its exit code
    #[arg(long)]
    run: bool,

    /// Print per-function machine-code sizes after code generation
    #[arg(long)]
    sizes: bool,

    /// Emit the size report as JSON
    #[arg(long)]
    json: bool,
}

enum Mode {
    Native(Target),
    CSource(u8),
    IrText,
}

fn parse_mode(s: &str) -> Result<Mode> {
    match s {
        "ir" => Ok(Mode::IrText),
        "c" | "c/64" => Ok(Mode::CSource(64)),
        "c/32" => Ok(Mode::CSource(32)),
        "c/16" => Ok(Mode::CSource(16)),
        triple => Ok(Mode::Native(Target::parse(triple)?)),
    }
}

fn default_output(input: &Path, mode: &Mode) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default();
    let mut path = PathBuf::from(stem);
    match mode {
        Mode::Native(t) if t.is_windows() => {
            path.set_extension("exe");
        }
        Mode::Native(t) if t.triple() == "wasi/wasm32" => {
            path.set_extension("wasm");
        }
        Mode::Native(_) => {}
        Mode::CSource(_) => {
            path.set_extension("c");
        }
        Mode::IrText => {
            path.set_extension("ir");
        }
    }
    path
}

/// Write the image only after full success: temp file in the target
/// directory, then rename over the destination.
fn write_output(path: &Path, bytes: &[u8], executable: bool) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let tmp = match dir {
        Some(d) => d.join(format!(
            ".{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy()
        )),
        None => PathBuf::from(format!(
            ".{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy()
        )),
    };
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&tmp)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&tmp, perms)?;
    }
    #[cfg(not(unix))]
    let _ = executable;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

fn temp_dir() -> PathBuf {
    for var in ["TMPDIR", "TEMP", "TMP"] {
        if let Some(v) = std::env::var_os(var) {
            if !v.is_empty() {
                return PathBuf::from(v);
            }
        }
    }
    std::env::temp_dir()
}

fn load_module(files: &[PathBuf]) -> Result<IrModule> {
    if files.len() != 1 {
        bail!("expected exactly one IR module file, got {}", files.len());
    }
    let text = std::fs::read_to_string(&files[0])
        .with_context(|| format!("reading {}", files[0].display()))?;
    let module = parse_text(&text)?;
    Ok(module)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mode = parse_mode(&cli.target)?;
    let _ = &cli.tags; // build-tag filtering happens in the frontend

    let mut module = load_module(&cli.files)?;
    verify_module(&module)?;
    eliminate_dead_funcs(&mut module);
    verify_module(&module)?;

    let (bytes, sizes, executable) = match &mode {
        Mode::IrText => (emit_text(&module).into_bytes(), None, false),
        Mode::CSource(bits) => {
            let artifact = generate(&module, EmitKind::CSource(*bits))?;
            (artifact.bytes, None, false)
        }
        Mode::Native(target) => {
            let artifact = generate(&module, EmitKind::Native(*target))?;
            (artifact.bytes, Some(artifact.sizes), artifact.executable)
        }
    };

    if cli.sizes {
        if let Some(report) = &sizes {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(report)?);
            } else {
                print!("{}", report.render());
            }
        }
    }

    if cli.run {
        let out = temp_dir().join(format!("rtg-run-{}", std::process::id()));
        write_output(&out, &bytes, executable)?;
        let status = Command::new(&out)
            .status()
            .with_context(|| format!("running {}", out.display()))?;
        let _ = std::fs::remove_file(&out);
        let code = status.code().unwrap_or(1);
        return Ok(ExitCode::from(code.clamp(0, 255) as u8));
    }

    let out = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cli.files[0], &mode));
    write_output(&out, &bytes, executable)?;

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut diag = Diagnostics::new(resolve_color_choice());
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            // Compiler user errors carry one message per line; everything
            // else is a single diagnostic.
            let rendered = format!("{:#}", err);
            let lines: Vec<String> = rendered.lines().map(|l| l.to_string()).collect();
            diag.report_all(&lines);
            ExitCode::FAILURE
        }
    }
}

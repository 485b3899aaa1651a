use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const LAMBDA_BIN: &str = "lead_trigger_lambda";

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the lead pipeline workspace",
    long_about = "Local runs, CI checks and Lambda packaging for the lead\n\
                  ingestion and distribution pipeline."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once against local CSV tabs
    Run {
        /// Directory holding `<tab>.csv` files
        #[arg(long, env = "LEAD_DATA_DIR", default_value = "data")]
        data_dir: String,
        /// Directory of messages imported as email leads
        #[arg(long)]
        inbox_dir: Option<String>,
        /// Log formatter passed to the runner
        #[arg(long, default_value = "pretty")]
        log_format: String,
    },
    /// Run CI checks
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
    /// Build the trigger Lambda and package it as `bootstrap` in a zip
    LambdaPackage {
        /// Compilation target triple for the Lambda binary
        #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
        target: String,
        /// Build profile used for the binary
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
        /// Directory the zip is written to
        #[arg(long, default_value = "dist")]
        out_dir: String,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting and clippy
    Lint,
    /// Unit and integration tests
    Test,
    /// Lint + test
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }

    fn as_cargo_flag(self) -> Option<&'static str> {
        match self {
            Self::Debug => None,
            Self::Release => Some("--release"),
        }
    }
}

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .expect("failed to execute cargo")
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn package_lambda(target: &str, profile: BuildProfile, out_dir: &str) -> Result<PathBuf, String> {
    require_target(target)?;

    step("Build trigger lambda");
    let mut cargo_args = vec![
        "build",
        "-p",
        "lead_pipeline",
        "--target",
        target,
        "--bin",
        LAMBDA_BIN,
    ];
    if let Some(flag) = profile.as_cargo_flag() {
        cargo_args.push(flag);
    }
    run_cargo(&cargo_args);

    step("Package lambda zip");
    let binary = Path::new("target")
        .join(target)
        .join(profile.dir_name())
        .join(LAMBDA_BIN);
    fs::create_dir_all(out_dir).map_err(|error| format!("cannot create {out_dir}: {error}"))?;
    let zip_path = Path::new(out_dir).join(format!("{LAMBDA_BIN}.zip"));
    write_bootstrap_zip(&binary, &zip_path)?;
    Ok(zip_path)
}

/// Fails when rustup reports `target` missing. Without rustup the build
/// itself reports the problem, so the check is skipped.
fn require_target(target: &str) -> Result<(), String> {
    let Ok(output) = Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output()
    else {
        eprintln!("warning: rustup not found, skipping the {target} target check");
        return Ok(());
    };
    let installed = String::from_utf8_lossy(&output.stdout);
    if output.status.success() && !installed.lines().any(|line| line.trim() == target) {
        return Err(format!(
            "rust target `{target}` is missing; add it with `rustup target add {target}`"
        ));
    }
    Ok(())
}

/// The provided.al2 runtime executes a file named `bootstrap` at the zip root.
fn write_bootstrap_zip(binary_path: &Path, zip_path: &Path) -> Result<(), String> {
    let binary = fs::read(binary_path)
        .map_err(|error| format!("cannot read {}: {error}", binary_path.display()))?;
    let file = fs::File::create(zip_path)
        .map_err(|error| format!("cannot create {}: {error}", zip_path.display()))?;
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    let mut zip = ZipWriter::new(file);
    zip.start_file("bootstrap", options)
        .and_then(|()| zip.write_all(&binary).map_err(Into::into))
        .and_then(|()| zip.finish().map(drop))
        .map_err(|error| format!("cannot write {}: {error}", zip_path.display()))?;
    eprintln!(
        "bootstrap: {} bytes from {}",
        binary.len(),
        binary_path.display()
    );
    Ok(())
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_lint() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);
}

fn ci_test() {
    step("Test lead_core");
    run_cargo(&["test", "-p", "lead_core"]);

    step("Test lead_pipeline");
    run_cargo(&["test", "-p", "lead_pipeline"]);
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            inbox_dir,
            log_format,
        } => {
            let mut args = vec![
                "run",
                "-p",
                "lead_pipeline",
                "--bin",
                "lead_run",
                "--",
                "--data-dir",
                data_dir.as_str(),
                "--log-format",
                log_format.as_str(),
            ];
            if let Some(dir) = inbox_dir.as_deref() {
                args.extend(["--inbox-dir", dir]);
            }
            run_cargo(&args);
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Lint => ci_lint(),
                CiJob::Test => ci_test(),
                CiJob::Check => {
                    ci_lint();
                    ci_test();
                }
            }
            eprintln!("\nCI job passed.");
        }
        Commands::LambdaPackage {
            target,
            profile,
            out_dir,
        } => {
            match package_lambda(&target, profile, &out_dir) {
                Ok(zip_path) => eprintln!("\nPackaged artifact:\n- {}", zip_path.display()),
                Err(message) => {
                    eprintln!("error: {message}");
                    exit(1);
                }
            }
        }
    }
}

//! # Vigil Spec Lint - Source Spec Validator
//!
//! Statically checks source specification documents: required fields, valid
//! types, duplicate field names, constraint consistency, XML configuration,
//! and control-file shape. Run it in CI so a broken spec never reaches the
//! validator.
//!
//! ## Usage
//!
//! ```bash
//! vigil-spec-lint --specs-dir source_specs           # everything
//! vigil-spec-lint --source murex_trades              # one spec
//! vigil-spec-lint --strict                           # warnings fail too
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use vigil_core::spec::{spec_files, SourceSpec};

#[derive(Parser, Debug)]
#[command(name = "vigil-spec-lint")]
#[command(about = "Validate source specification YAML files")]
struct Args {
    /// Directory containing source specs
    #[arg(long, default_value = "source_specs")]
    specs_dir: PathBuf,

    /// Validate only this source (name without .yaml extension)
    #[arg(long)]
    source: Option<String>,

    /// Treat warnings as errors
    #[arg(long)]
    strict: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.specs_dir.exists() {
        eprintln!("source specs directory not found: {}", args.specs_dir.display());
        return ExitCode::FAILURE;
    }

    let mut files = match spec_files(&args.specs_dir) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("failed to list spec files: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(source) = &args.source {
        files.retain(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy() == source.as_str())
                .unwrap_or(false)
        });
        if files.is_empty() {
            eprintln!("source spec not found: {source}");
            return ExitCode::FAILURE;
        }
    }

    if files.is_empty() {
        eprintln!("no YAML files found in {}", args.specs_dir.display());
        return ExitCode::FAILURE;
    }

    println!("Validating {} source spec(s)...\n", files.len());

    let mut all_valid = true;
    for path in &files {
        let display = path
            .strip_prefix(&args.specs_dir)
            .unwrap_or(path)
            .display();

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                all_valid = false;
                println!("x {display}");
                println!("   - failed to read file: {e}");
                continue;
            }
        };

        let spec = match SourceSpec::from_yaml(path, &text) {
            Ok(spec) => spec,
            Err(e) => {
                all_valid = false;
                println!("x {display}");
                println!("   - {e}");
                continue;
            }
        };

        let report = spec.lint();
        for warning in &report.warnings {
            println!("   ! {warning}");
        }

        if report.is_clean(args.strict) {
            println!("ok {display}");
        } else {
            all_valid = false;
            println!("x {display}");
            for error in &report.errors {
                println!("   - {error}");
            }
            if args.strict {
                for warning in &report.warnings {
                    println!("   - (strict) {warning}");
                }
            }
        }
    }

    println!();
    if all_valid {
        println!("All source specs are valid");
        ExitCode::SUCCESS
    } else {
        println!("Some source specs have errors");
        ExitCode::FAILURE
    }
}

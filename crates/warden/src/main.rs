//! CLI host: run an untrusted script under explicit caps.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};
use warden::Sandbox;

#[derive(Parser)]
#[command(name = "warden", about = "Run a Lua script inside the warden sandbox")]
struct Args {
    /// Script file to execute.
    script: String,

    /// Instruction budget for the run (0 = unlimited).
    #[arg(long, default_value_t = 10_000_000)]
    max_instructions: u64,

    /// Cap on any intermediate string, in bytes.
    #[arg(long, default_value_t = 1_048_576)]
    max_string_size: usize,

    /// Cap on accepted source text, in bytes.
    #[arg(long, default_value_t = warden::DEFAULT_MAX_SOURCE_LEN)]
    max_source_len: usize,

    /// Print instruction and reachable-memory usage after the run.
    #[arg(long)]
    report: bool,
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();

    let source = match std::fs::read(&args.script) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("warden: cannot open {}: {}", args.script, e);
            return ExitCode::FAILURE;
        }
    };

    let sandbox = Sandbox::with_max_source_len(args.max_source_len);
    if args.max_instructions > 0 {
        sandbox.install_limit(args.max_instructions, args.max_string_size);
    }

    let chunk = match sandbox.load(&source, &format!("@{}", args.script)) {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("warden: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = sandbox.call(&chunk, &[]);

    // Scripts talk through the bounded console queue; drain it for them.
    while let Some(line) = sandbox.try_dequeue() {
        println!("{line}");
    }

    let code = match outcome {
        Ok(results) => {
            if !results.is_empty() {
                let rendered: Vec<String> =
                    results.iter().map(|v| format!("{v:?}")).collect();
                println!("{}", rendered.join("\t"));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("warden: {}", e);
            ExitCode::FAILURE
        }
    };

    if args.report {
        if let Some(limit) = sandbox.limit() {
            eprintln!(
                "instructions: {}/{}",
                limit.current(),
                limit.max()
            );
        }
        eprintln!("reachable bytes: {}", sandbox.used_memory());
    }

    code
}

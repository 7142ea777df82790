//! `rtmc` — compile RT-Micro-C sources to `.vmb` bytecode and optionally
//! run them on the virtual machine.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtmc_asm::{encoding, CompileMode};
use rtmc_compiler::{CompileOptions, parse_with_includes};
use rtmc_vm::Machine;

/// RT-Micro-C compiler for RTOS workloads.
#[derive(Debug, Parser)]
#[command(name = "rtmc", version, about)]
struct Args {
    /// Input RT-Micro-C source file.
    input: PathBuf,

    /// Output bytecode file (defaults to the input with a .vmb extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Print the parsed AST and continue.
    #[arg(long)]
    ast: bool,

    /// Print the token stream of the input file and continue.
    #[arg(long)]
    tokens: bool,

    /// Skip the optimization passes.
    #[arg(long)]
    no_optimize: bool,

    /// Skip semantic analysis.
    #[arg(long)]
    no_semantic: bool,

    /// Strip debug info from the produced bytecode.
    #[arg(long)]
    release: bool,

    /// Run the compiled program on the VM after writing it.
    #[arg(long)]
    run: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("vmb"));

    if args.tokens {
        let text = std::fs::read_to_string(&args.input)
            .with_context(|| format!("cannot read '{}'", args.input.display()))?;
        let tokens = rtmc_compiler::tokenize(&text, &args.input.to_string_lossy())?;
        println!("=== TOKENS ===");
        for token in &tokens {
            println!(
                "{:?}: '{}' at {}:{}:{}",
                token.kind, token.lexeme, token.file, token.line, token.column
            );
        }
        println!();
    }

    tracing::debug!("parsing with include resolution");
    let mut seen = Default::default();
    let ast = parse_with_includes(&args.input, &mut seen)?;

    if args.ast {
        println!("=== AST ===");
        println!("{ast:#?}");
        println!();
    }

    let options = CompileOptions {
        mode: if args.release {
            CompileMode::Release
        } else {
            CompileMode::Debug
        },
        run_semantic: !args.no_semantic,
        run_optimizer: !args.no_optimize,
    };

    let program = rtmc_compiler::compile_ast(ast, &options)?;
    tracing::debug!(
        instructions = program.instructions.len(),
        constants = program.constants.len(),
        "compiled"
    );

    let file = File::create(&output_path)
        .with_context(|| format!("cannot create '{}'", output_path.display()))?;
    encoding::write_program(&program, &mut BufWriter::new(file))
        .with_context(|| format!("cannot write '{}'", output_path.display()))?;
    tracing::info!(output = %output_path.display(), "compilation successful");

    if args.verbose {
        println!("{}", program.disassemble());
    }

    if args.run {
        let machine = Machine::new(program)?;
        machine.run();
    }

    Ok(())
}

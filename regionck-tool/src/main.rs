use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use regionck::{
    check_module, serialize::SerializableModule, testing::TestRegistry, CheckerOptions,
    ConcurrencyMode, Module,
};

#[derive(Parser)]
/// Tool for running regionck over a serialized module.
struct Args {
    /// Print every input function before checking it.
    #[clap(short = 'v')]
    verbose: bool,

    /// Report isolation findings as errors.
    #[clap(long)]
    strict: bool,

    /// Skip SSA validation of the input.
    #[clap(long)]
    no_validate: bool,

    /// Also run the tests embedded in each function.
    #[clap(long)]
    run_tests: bool,

    /// Input file containing a bincode-encoded SerializableModule.
    input: PathBuf,
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let args = Args::parse();

    let input = std::fs::read(&args.input).expect("could not read input file");
    let module: SerializableModule =
        bincode::deserialize(&input).expect("could not deserialize input file");
    let module = match module.into_module() {
        Ok(module) => module,
        Err(e) => {
            eprintln!("Malformed input module: {e:#?}");
            return ExitCode::FAILURE;
        }
    };

    if args.verbose {
        for func in &module.functions {
            println!("Input function: {func}");
        }
    }

    let options = CheckerOptions {
        verbose_log: args.verbose,
        validate_ssa: !args.no_validate,
        mode: if args.strict {
            ConcurrencyMode::Strict
        } else {
            ConcurrencyMode::Compat
        },
    };

    let mut failed = false;
    for (func, result) in module.functions.iter().zip(check_module(&module, &options)) {
        match result {
            Ok(output) => {
                for diag in &output.diagnostics {
                    println!("{}: {diag}", output.function);
                }
                failed |= output.has_errors();
            }
            Err(e) => {
                eprintln!("{}: checking failed: {e:#?}", func.name);
                failed = true;
            }
        }
    }

    if args.run_tests {
        failed |= !run_tests(&module, &options);
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_tests(module: &Module, options: &CheckerOptions) -> bool {
    let registry = TestRegistry::with_default_tests();
    let mut ok = true;
    for func in module.functions.iter().filter(|f| !f.test_specs.is_empty()) {
        match registry.run_all(func, &module.types, *options) {
            Ok(out) => print!("{out}"),
            Err(e) => {
                eprintln!("{}: test failed: {e}", func.name);
                ok = false;
            }
        }
    }
    ok
}

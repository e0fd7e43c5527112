use clap::Parser;
use rexx_relay::{Config, Interpreter, RexxDiagnostic, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rexx")]
#[command(about = "A REXX dialect interpreter with pluggable ADDRESS targets")]
#[command(version)]
struct Cli {
    /// REXX source file to execute
    source: Option<PathBuf>,

    /// Execute REXX source given on the command line
    #[arg(short = 'e', long)]
    eval: Option<String>,

    /// Start interactive REPL
    #[arg(short, long)]
    interactive: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Treat ADDRESS dispatch errors as fatal
    #[arg(long)]
    fail_fast: bool,

    /// Maximum INTERPRET nesting
    #[arg(long)]
    max_interpret_depth: Option<usize>,

    /// Extra directory searched by REQUIRE (repeatable)
    #[arg(short = 'L', long = "lib")]
    library_path: Vec<PathBuf>,

    /// More logging on stderr (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Arguments passed to the REXX program (accessible via ARG)
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("rexx: {message}");
            return ExitCode::from(2);
        }
    };

    let code = run(&cli, config);
    // Statuses outside 0..=255 wrap the way a shell reports them.
    ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1))
}

fn install_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "rexx_relay=debug",
        _ => "rexx_relay=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Defaults, then the config file, then the environment, then flags.
fn load_config(cli: &Cli) -> Result<Config, String> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string())?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    if cli.fail_fast {
        config.fail_fast = true;
    }
    if let Some(depth) = cli.max_interpret_depth {
        config.max_interpret_depth = depth;
    }
    config.library_path.extend(cli.library_path.iter().cloned());
    Ok(config)
}

fn run(cli: &Cli, config: Config) -> i32 {
    let mut rt = Interpreter::new(config);
    if !cli.args.is_empty() {
        rt.set_args(vec![Value::from(cli.args.join(" "))]);
    }

    if let Some(source) = &cli.eval {
        return finish(rt.run_source(source).map(|o| o.exit_status));
    }
    if let Some(path) = &cli.source {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("rexx: cannot read {}: {e}", path.display());
                return 1;
            }
        };
        let path = path.canonicalize().unwrap_or_else(|_| path.clone());
        let status = finish(rt.run_script(&source, Some(path)).map(|o| o.exit_status));
        if !cli.interactive {
            return status;
        }
    }
    run_repl(&mut rt)
}

fn finish(result: Result<i32, RexxDiagnostic>) -> i32 {
    match result {
        Ok(status) => status,
        Err(diag) => {
            eprintln!("{diag}");
            diag.category().exit_code()
        }
    }
}

fn run_repl(rt: &mut Interpreter) -> i32 {
    println!("rexx-relay {} — interactive mode", env!("CARGO_PKG_VERSION"));
    println!("Type REXX statements. Use EXIT to quit.\n");

    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("rexx: cannot initialize line editor: {e}");
            return 1;
        }
    };

    loop {
        match rl.readline("rexx> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                if trimmed.eq_ignore_ascii_case("exit") {
                    break;
                }
                if let Err(e) = rt.run_source(trimmed) {
                    eprintln!("{e}");
                }
                // Each line starts uncancelled.
                rt.cancel_flag().reset();
            }
            Err(
                rustyline::error::ReadlineError::Interrupted | rustyline::error::ReadlineError::Eof,
            ) => {
                break;
            }
            Err(e) => {
                eprintln!("rexx: {e}");
                break;
            }
        }
    }
    0
}

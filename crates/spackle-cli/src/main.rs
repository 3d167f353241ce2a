mod commands;

use clap::{Parser, Subcommand};
use commands::{EXIT_FAILURE, EXIT_PARSE_ERROR, EXIT_STORE_ERROR};
use spackle_core::Config;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "spackle",
    version,
    about = "Parse package specs and look them up by hash"
)]
struct Cli {
    /// Config file (default: $SPACKLE_CONFIG or ~/.config/spackle/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse specs and print their canonical form.
    Parse {
        /// Spec text; multiple arguments are joined with spaces.
        #[arg(required = true)]
        specs: Vec<String>,
        /// Print the token stream instead of the parsed specs.
        #[arg(long, default_value_t = false)]
        tokens: bool,
    },
    /// Find the single spec whose hash starts with a prefix.
    Lookup {
        /// Hash prefix, with or without a leading '/'.
        hash: String,
        /// Where to look: local, remote, or all.
        #[arg(long, default_value = "all")]
        location: String,
    },
    /// List specs matching query specs.
    Find {
        /// Query specs; all specs are listed when omitted.
        specs: Vec<String>,
        /// Install statuses to include, comma separated (installed, deprecated, missing, any).
        #[arg(long, default_value = "installed")]
        installed: String,
        /// Only explicitly installed specs.
        #[arg(long, default_value_t = false, conflicts_with = "implicit")]
        explicit: bool,
        /// Only specs installed as dependencies.
        #[arg(long, default_value_t = false)]
        implicit: bool,
        /// Include build-cache specs for every architecture, not only the host.
        #[arg(long, default_value_t = false)]
        all_architectures: bool,
        /// Where to look: local, remote, or all.
        #[arg(long, default_value = "local")]
        location: String,
    },
    /// Drop unreferenced records that are not installed.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Check ref counts and install prefixes of the local database.
    Verify,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
    .map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SPACKLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let config_path = cli.config.as_ref();

    let result = match cli.command {
        Commands::Parse { specs, tokens } => commands::parse::run(&specs, tokens, json_output),
        Commands::Lookup { hash, location } => load_config(config_path)
            .and_then(|config| commands::lookup::run(&config, &hash, &location, json_output)),
        Commands::Find {
            specs,
            installed,
            explicit,
            implicit,
            all_architectures,
            location,
        } => {
            let args = commands::find::FindArgs {
                specs: &specs,
                installed: &installed,
                explicit: match (explicit, implicit) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                all_architectures,
                location: &location,
            };
            load_config(config_path)
                .and_then(|config| commands::find::run(&config, &args, json_output))
        }
        Commands::Gc { dry_run } => load_config(config_path)
            .and_then(|config| commands::gc::run(&config, dry_run, json_output)),
        Commands::Verify => {
            load_config(config_path).and_then(|config| commands::verify::run(&config, json_output))
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("parse error:") {
                EXIT_PARSE_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

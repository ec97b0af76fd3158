mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::{CliError, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::{install_signal_handler, parse_size, CancelToken, Engine, StrataConfig};

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Reproducible layered Python environment builds"
)]
struct Cli {
    /// Path to the strata store directory (overrides config and STRATA_STORE).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Path to a config file (default: ~/.config/strata/config.toml).
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

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum BackendKind {
    /// Install with the host's `python3 -m pip` into each layer's overlay.
    #[default]
    Pip,
    /// Deterministic fake installs, for tests and dry runs.
    Mock,
}

impl BackendKind {
    fn name(self) -> &'static str {
        match self {
            Self::Pip => "pip",
            Self::Mock => "mock",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build an image from a base and an ordered list of requirement manifests.
    Build {
        /// Base image reference, e.g. python:3.11-slim.
        #[arg(long)]
        base: String,
        /// Requirement manifest; repeat for one layer per manifest, in order.
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,
        /// Also write the image descriptor JSON to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Installer backend.
        #[arg(long, value_enum, default_value_t = BackendKind::Pip)]
        backend: BackendKind,
        /// Directory of base root filesystems (overrides config and STRATA_BASES).
        #[arg(long)]
        bases: Option<PathBuf>,
    },
    /// List recorded images.
    Images,
    /// Show an image's layers by digest or unique digest prefix.
    Inspect {
        digest: String,
        /// Walk the layer chain through the cache and check every parent link.
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
    /// Forget a recorded image so its layers become evictable.
    Rmi { digest: String },
    /// Evict least-recently-used layers and remove unreferenced archives.
    Gc {
        /// Size budget such as 512M or 2G (default: configured cache_budget).
        #[arg(long)]
        budget: Option<String>,
        /// Report what would be removed without removing anything.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Re-hash every object, layer, binding, and image in the store.
    VerifyStore,
    /// Generate shell completions.
    Completions { shell: Shell },
    /// Generate man pages into a directory.
    ManPages {
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
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
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<u8, CliError> {
    match cli.command {
        Commands::Completions { shell } => return commands::completions::run::<Cli>(shell),
        Commands::ManPages { ref dir } => return commands::man_pages::run::<Cli>(dir),
        _ => {}
    }

    let mut config = StrataConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store = store;
    }

    let cancel = CancelToken::new();
    install_signal_handler(&cancel);

    let needs_pip = matches!(
        cli.command,
        Commands::Build {
            backend: BackendKind::Pip,
            ..
        }
    );
    if needs_pip && std::env::var("STRATA_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = strata_runtime::check_pip_prereqs("python3");
        if !missing.is_empty() {
            eprintln!("error: {}", strata_runtime::format_missing(&missing));
            return Ok(EXIT_FAILURE);
        }
    }

    tracing::debug!(
        "store {} (cache budget {:?}, bases {})",
        config.store.display(),
        config.cache_budget,
        config.bases.display()
    );
    let engine = Engine::open(&config.store)?.with_cache_budget(config.cache_budget);
    let json = cli.json;

    match cli.command {
        Commands::Build {
            base,
            manifests,
            output,
            backend,
            bases,
        } => {
            let bases = bases.unwrap_or(config.bases);
            let backend = strata_runtime::select_backend(backend.name(), &bases)
                .map_err(strata_core::CoreError::from)?;
            commands::build::run(
                &engine,
                backend,
                &base,
                &manifests,
                output.as_deref(),
                &cancel,
                json,
            )
        }
        Commands::Images => commands::images::run(&engine, json),
        Commands::Inspect { digest, verify } => {
            commands::inspect::run(&engine, &digest, verify, json)
        }
        Commands::Rmi { digest } => commands::rmi::run(&engine, &digest, json),
        Commands::Gc { budget, dry_run } => {
            let budget = match budget {
                Some(raw) => Some(parse_size(&raw)?),
                None => config.cache_budget,
            };
            commands::gc::run(&engine, budget, dry_run, &cancel, json)
        }
        Commands::VerifyStore => commands::verify_store::run(&engine, json),
        Commands::Completions { .. } | Commands::ManPages { .. } => Ok(commands::EXIT_SUCCESS),
    }
}

mod commands;
mod config;
mod prompt;

use clap::{Parser, Subcommand};
use commands::{Context, RunArgs, EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_STATE_ERROR};
use config::CliConfig;
use stackhub_core::{install_signal_handler, CancellationToken};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stackhub",
    version,
    about = "Lifecycle orchestrator for multi-component stacks"
)]
struct Cli {
    /// Directory holding the stack state, its lock and backup bundles.
    #[arg(long, global = true)]
    state_dir: Option<String>,

    /// Read defaults from this file instead of ~/.config/stackhub/config.json.
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
    /// Deploy the stack's components in dependency order.
    Deploy(RunArgs),
    /// Undeploy the stack's components in reverse order.
    Undeploy(RunArgs),
    /// Back up the deployed components into a bundle.
    Backup {
        #[command(flatten)]
        run: RunArgs,
        /// Bundle name; defaults to `<stack>-<operation>`.
        #[arg(long)]
        bundle: Option<String>,
    },
    /// Show the recorded state of the stack.
    Show,
    /// Print the resolved lifecycle order of a manifest.
    Order {
        #[arg(default_value = "stack.toml")]
        manifest: PathBuf,
    },
}

const DEFAULT_STATE_DIR: &str = ".stackhub";

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
            tracing_subscriber::EnvFilter::try_from_env("STACKHUB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let config = match &cli.config {
        Some(path) => CliConfig::load(path),
        None => CliConfig::load_default(),
    };
    let config = match config {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let token = CancellationToken::new();
    install_signal_handler(&token);

    let state_dir = cli
        .state_dir
        .as_deref()
        .or(config.state_dir.as_deref())
        .map_or_else(|| PathBuf::from(DEFAULT_STATE_DIR), expand_tilde);
    let ctx = Context {
        state_dir,
        json: cli.json,
        config,
        token,
    };

    let result = match &cli.command {
        Commands::Deploy(args) => commands::deploy::run(&ctx, args),
        Commands::Undeploy(args) => commands::undeploy::run(&ctx, args),
        Commands::Backup { run, bundle } => commands::backup::run(&ctx, run, bundle.as_deref()),
        Commands::Show => commands::show::run(&ctx),
        Commands::Order { manifest } => commands::order::run(manifest, ctx.json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:") {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("state error:") {
                EXIT_STATE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn components_split_on_commas() {
        let cli = Cli::parse_from(["stackhub", "deploy", "s.toml", "-c", "a,b", "--force"]);
        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(args.components, vec!["a", "b"]);
        assert!(args.force);
        assert_eq!(args.manifest, PathBuf::from("s.toml"));
    }

    #[test]
    fn backup_takes_bundle_and_run_args() {
        let cli = Cli::parse_from([
            "stackhub",
            "--json",
            "backup",
            "--bundle",
            "nightly",
            "--optional-requires",
            "vault",
            "--optional-requires",
            "db:kubernetes",
        ]);
        assert!(cli.json);
        let Commands::Backup { run, bundle } = cli.command else {
            panic!("expected backup");
        };
        assert_eq!(bundle.as_deref(), Some("nightly"));
        assert_eq!(run.optional_requires, vec!["vault", "db:kubernetes"]);
        assert_eq!(run.manifest, PathBuf::from("stack.toml"));
    }

    #[test]
    fn expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/var/lib/x"), PathBuf::from("/var/lib/x"));
        assert_eq!(expand_tilde(".stackhub"), PathBuf::from(".stackhub"));
    }
}

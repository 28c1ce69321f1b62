mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, queue::QueueSubcommand, registry::RegistrySubcommand,
    sanitize::SanitizeSubcommand, step::StepSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "vfq",
    about = "Step-gated VF task queues, the NAME_ID registry and input sanitization",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .vf/ or .git/)
    #[arg(long, global = true, env = "VF_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .vf/config.yaml, the task queue and the NAME_ID registry
    Init {
        /// Theme named in the queue annotations (default: root directory name)
        #[arg(long)]
        theme: Option<String>,
    },

    /// Insert, pop and inspect task queue items
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Run or look up steps
    Step {
        #[command(subcommand)]
        subcommand: StepSubcommand,
    },

    /// Manage the NAME_ID registry
    Registry {
        #[command(subcommand)]
        subcommand: RegistrySubcommand,
    },

    /// Check untrusted input
    Sanitize {
        #[command(subcommand)]
        subcommand: SanitizeSubcommand,
    },

    /// Show or validate .vf/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { theme } => cmd::init::run(&root, theme.as_deref(), cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Step { subcommand } => cmd::step::run(&root, subcommand, cli.json),
        Commands::Registry { subcommand } => cmd::registry::run(&root, subcommand, cli.json),
        Commands::Sanitize { subcommand } => cmd::sanitize::run(subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::once::OnceArgs;
use opts::GlobalOpts;

#[derive(Parser, Debug)]
#[command(name = "dbsync", version, about = "Per-server database maintenance controller")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the maintenance daemon until Ctrl-C or SIGTERM
    Run,

    /// Run a single reconciliation cycle and print its outcome
    Once(OnceArgs),

    /// Print the actions and report the next cycle would produce, without applying them
    Diff,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();
    let opts = &cli.opts;

    match cli.command {
        Command::Run => commands::run::cmd_run(opts).await,
        Command::Once(args) => commands::once::cmd_once(opts, &args).await,
        Command::Diff => commands::diff::cmd_diff(opts).await,
    }
}

/// Logs go to stderr so command output on stdout stays machine readable.
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

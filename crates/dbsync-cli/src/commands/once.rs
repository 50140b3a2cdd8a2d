//! `dbsync once` command.

use anyhow::Result;
use clap::Args;

use crate::opts::GlobalOpts;
use crate::output::print_json;

use super::create_engine;

#[derive(Args, Debug)]
pub struct OnceArgs {
    /// Exit right after the report instead of waiting for enqueued actions
    #[arg(long)]
    pub no_wait: bool,
}

pub async fn cmd_once(opts: &GlobalOpts, args: &OnceArgs) -> Result<()> {
    let config = opts.resolve_config()?;
    let engine = create_engine(&config).await?;

    let result = engine.run_once().await;
    if result.is_ok() && !args.no_wait {
        engine.scheduler().wait_idle().await;
    }
    engine.scheduler().shutdown().await;

    let outcome = result?;
    let failures = engine.scheduler().failures();
    if !failures.is_empty() {
        tracing::warn!(count = failures.len(), "actions failed terminally");
    }
    print_json(opts, &outcome)
}

//! `dbsync diff` command: a dry run of the next cycle.

use anyhow::Result;

use crate::opts::GlobalOpts;
use crate::output::print_json;

use super::create_engine;

pub async fn cmd_diff(opts: &GlobalOpts) -> Result<()> {
    let config = opts.resolve_config()?;
    let engine = create_engine(&config).await?;
    let preview = engine.preview().await;
    engine.scheduler().shutdown().await;
    print_json(opts, &preview?)
}

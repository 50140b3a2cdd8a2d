use anyhow::Result;
use serde::Serialize;

use crate::opts::GlobalOpts;

pub fn print_json<T: Serialize>(opts: &GlobalOpts, value: &T) -> Result<()> {
    if opts.pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

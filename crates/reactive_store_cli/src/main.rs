use std::fs::read_to_string;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use reactive_store::StoreConfig;
use tracing::{debug, info};

use crate::opts::{Command, Opts};

mod logging;
mod opts;
mod scenarios;

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    logging::configure_tracing(opts.trace.clone(), opts.verbose.clone())?;

    let config = load_config(opts.config.as_deref())?;
    debug!("Store configuration. config: {:?}", config);

    match opts.command {
        Command::Scenario => scenarios::scenario(&config),
        Command::Stress {
            threads,
            iterations,
            mode,
        } => {
            let config = match mode {
                Some(mode) => config.with_lock_mode(mode.into()),
                None => config,
            };
            scenarios::stress(&config, threads, iterations)
        }
        Command::Scopes => scenarios::scopes(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StoreConfig> {
    let Some(path) = path else {
        return Ok(StoreConfig::default());
    };

    info!("Loading configuration. path: {:?}", path);
    let content = read_to_string(path).with_context(|| format!("Unable to read configuration. path: {:?}", path))?;
    let config = StoreConfig::from_json_str(&content)
        .with_context(|| format!("Invalid configuration. path: {:?}", path))?;

    Ok(config)
}

//! natpmpd - NAT-PMP port mapping daemon

use anyhow::Context;
use clap::Parser;
use natpmpd::config::{Config, DEFAULT_CONFIG_PATH};
use natpmpd::daemon;
use natpmpd::telemetry::init_logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "natpmpd")]
#[command(about = "NAT-PMP port mapping daemon", version)]
struct Cli {
    /// Configuration file
    #[arg(short = 'f', long = "file", default_value = DEFAULT_CONFIG_PATH)]
    file: PathBuf,

    /// Only check the configuration
    #[arg(short = 'n', long = "no-action")]
    no_action: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.file)
        .with_context(|| format!("unable to load {}", cli.file.display()))?;

    if cli.no_action {
        println!("configuration ok");
        return Ok(());
    }

    let log = if cli.verbose {
        config.log.verbose()
    } else {
        config.log.clone()
    };
    init_logging(Some(&log));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("unable to start runtime")?;

    runtime.block_on(daemon::run(config)).context("natpmpd failed")?;
    Ok(())
}

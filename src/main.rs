mod cli;
mod config;
mod ops;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut settings = config::settings::load_settings(cli.config.as_deref())?;
    if let Some(level) = cli.verbosity {
        settings.verbosity = level.into();
    }
    if let Some(secs) = cli.timeout {
        settings.wait_timeout_secs = Some(secs);
    }

    match cli.command {
        Commands::Run { source, device, simulate, command } => {
            settings.simulate |= simulate;
            ops::do_run(&settings, &source, &device, &command)
        }
        Commands::Writers { json } => {
            ops::do_writers(&settings, json)?;
            Ok(0)
        }
        Commands::Version => {
            ops::do_version();
            Ok(0)
        }
    }
}

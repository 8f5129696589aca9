use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shadowspawn::Verbosity;

/// shadowspawn: run a command against a consistent shadow copy of a live directory
#[derive(Parser, Debug)]
#[command(name = "shadowspawn", version, about = "Run a command against a point-in-time shadow copy of a directory.", long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Settings file (defaults to the per-user config.json)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// How much to print
    #[arg(short = 'v', long = "verbosity", value_enum, global = true)]
    pub verbosity: Option<VerbosityArg>,

    /// Give up on any shadow copy phase that takes longer than this
    #[arg(long = "timeout", value_name = "secs", global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Shadow SOURCE, expose it at DEVICE and run COMMAND while it is mounted
    Run {
        /// Existing directory to shadow
        source: PathBuf,
        /// Device name to mount the shadow copy at (e.g. Q:)
        device: String,
        /// Prepare the snapshot but do not create, mount, or run anything
        #[arg(long)]
        simulate: bool,
        /// Command line to run; its exit code becomes ours
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List registered writers, their component trees and what would be added
    Writers {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print CLI version
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum VerbosityArg {
    Silent,
    Terse,
    Normal,
    Verbose,
}

impl From<VerbosityArg> for Verbosity {
    fn from(arg: VerbosityArg) -> Self {
        match arg {
            VerbosityArg::Silent => Verbosity::Silent,
            VerbosityArg::Terse => Verbosity::Terse,
            VerbosityArg::Normal => Verbosity::Normal,
            VerbosityArg::Verbose => Verbosity::Verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_keeps_command_flags() {
        let cli = Cli::parse_from([
            "shadowspawn", "-v", "verbose", "run", "--simulate", r"D:\Data", "Q:", "robocopy", "Q:\\", "E:\\", "/MIR",
        ]);
        assert!(matches!(cli.verbosity, Some(VerbosityArg::Verbose)));
        match cli.command {
            Commands::Run { source, device, simulate, command } => {
                assert_eq!(source, PathBuf::from(r"D:\Data"));
                assert_eq!(device, "Q:");
                assert!(simulate);
                assert_eq!(command, vec!["robocopy", "Q:\\", "E:\\", "/MIR"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["shadowspawn", "run", "C:\\", "Q:"]).is_err());
    }

    #[test]
    fn test_global_timeout_after_subcommand() {
        let cli = Cli::parse_from(["shadowspawn", "writers", "--json", "--timeout", "30"]);
        assert_eq!(cli.timeout, Some(30));
        assert!(matches!(cli.command, Commands::Writers { json: true }));
    }
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "class-enhancer")]
#[command(about = "Enhance compiled Java classes in place, ahead of time or on load")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Base config file (default: <conf-dir>/enhance.toml when present)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", global = true)]
    pub conf_dir: Option<PathBuf>,

    /// Configuration id layered on top of the base file, in order
    #[arg(long = "id", value_name = "ID", global = true)]
    pub ids: Vec<String>,

    #[arg(long, value_name = "DIR", global = true)]
    pub source: Option<PathBuf>,

    #[arg(long, value_name = "DIR", global = true)]
    pub destination: Option<PathBuf>,

    #[arg(long, value_name = "FILE", global = true, conflicts_with = "no_ledger")]
    pub ledger: Option<PathBuf>,

    #[arg(long, global = true)]
    pub no_ledger: bool,

    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Enhance every eligible class under the source directory
    Enhance {
        #[arg(long)]
        no_recurse: bool,

        #[arg(long)]
        parallel: bool,

        /// Exit successfully even when some units failed
        #[arg(long)]
        keep_going: bool,
    },
    /// Load classes through the reloading loader, enhancing on first load
    Resolve {
        #[arg(required = true, value_name = "NAME")]
        names: Vec<String>,

        #[arg(long = "classpath", value_name = "ENTRY")]
        classpath: Vec<PathBuf>,
    },
    /// Show the parsed header and eligibility verdict of one class file
    Inspect { file: PathBuf },
    Stats,
    Clear,
}

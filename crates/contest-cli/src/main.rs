//! contest - distributed scenario runner for consensus-node integration tests

use clap::{Parser, Subcommand};
use contest_cli::RunArgs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "contest")]
#[command(author, version, about = "Distributed scenario runner for consensus-node integration tests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario against one or more hosts
    Run {
        /// Local directory for rendered configs, logs, and result tarballs
        base_dir: PathBuf,

        /// Scenario YAML file
        scenario: PathBuf,

        /// One or more host flags (localhost, 127.0.*, unix://, tcp://)
        #[arg(required = true)]
        hosts: Vec<String>,

        /// Node binary to upload, optionally tagged `<arch>=<path>` (repeatable)
        #[arg(long = "node-binary")]
        node_binary: Vec<String>,

        /// MongoDB connection URI; in-memory store is used when omitted
        #[arg(long)]
        mongodb: Option<String>,

        /// Overall run timeout, e.g. "5m"
        #[arg(long)]
        timeout: Option<String>,

        /// Seconds of pprof profiling requested from each node
        #[arg(long, default_value_t = 30)]
        pprof_seconds: u32,

        /// Extra argument appended to every node's command line (repeatable)
        #[arg(long = "node-arg")]
        node_arg: Vec<String>,

        /// Enable debug-level logging
        #[arg(short, long)]
        verbose: bool,

        /// Node log format
        #[arg(long, default_value = "text")]
        log_format: String,
    },

    /// Print build info
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("contest {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Run {
            base_dir,
            scenario,
            hosts,
            node_binary,
            mongodb,
            timeout,
            pprof_seconds,
            node_arg,
            verbose,
            log_format,
        } => {
            let filter = if verbose {
                EnvFilter::new("debug")
            } else {
                EnvFilter::new("info")
            };
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();

            let args = RunArgs {
                base_dir,
                scenario_path: scenario,
                hosts,
                node_binaries: node_binary,
                mongodb,
                timeout,
                pprof_seconds,
                node_args: node_arg,
                log_level: if verbose { "debug" } else { "info" }.to_string(),
                log_format,
            };

            match contest_cli::run(args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

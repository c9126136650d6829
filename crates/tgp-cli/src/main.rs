//! tgp - CLI scaffolding for the TGP kernel
//!
//! Thin collaborator: `tgp init` lays down a project skeleton, `tgp help`
//! prints usage. The kernel itself is hosted by an embedding agent
//! runtime, not by this binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};

mod config;
mod init;

/// TGP - Tool Generation Protocol
#[derive(Parser)]
#[command(name = "tgp")]
#[command(about = "Scaffold and inspect TGP tool projects", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold tgp.config.json, .gitignore, .tgp/, and an empty meta.json
    Init {
        /// Project directory (defaults to the current directory)
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Commands::Init { dir }) => init::run(&dir),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().map_err(Into::into)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

mod cli;
mod cron;
mod docker;
mod fs;
mod scheduler;

use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version land on stdout and exit clean; everything
            // else is an initialization failure.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = cli::init_logger() {
        eprintln!("mobycron: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = cli::run(args).await {
        error!(error = %format!("{e:#}"), "mobycron failed to start");
        std::process::exit(1);
    }
}

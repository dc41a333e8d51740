mod auth;
mod cli;
mod config;
mod error;
mod model;
mod output;
mod pipeline;
mod providers;
mod retry;
mod triage;

use clap::Parser;
use cli::Cli;
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting citriage - CI failure triage");

    let code = match cli.execute().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{} {e:#}", output::dim("error:"));
            1
        }
    };

    std::process::exit(code);
}

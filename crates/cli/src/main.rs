mod cli;
mod commands;
mod context;
mod error;
mod output;

use clap::Parser;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = cli::Cli::parse();
    if let Err(e) = commands::dispatch(cli).await {
        error::display_error(&e);
        std::process::exit(1);
    }
}

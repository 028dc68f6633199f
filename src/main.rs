//! mnrun CLI: compile and run MikeNet scripts.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "mnrun",
    version,
    about = "Run compiler and multi-run orchestrator for MikeNet scripts"
)]
struct Cli {
    #[command(subcommand)]
    command: mnrun::cli::Commands,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = mnrun::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

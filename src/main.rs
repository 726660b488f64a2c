use clap::Parser;

use translateable::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The daemon installs its own subscriber; client commands only log with --verbose.
    let serving = matches!(cli.command, Some(cli::Commands::Serve { .. }));
    if cli.verbose && !serving {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    }

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

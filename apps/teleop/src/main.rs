use clap::Parser;
use teleop_core::telemetry::logging;
use teleop_core::terminal::app;
use teleop_core::terminal::cli::Cli;
use teleop_core::terminal::error::CliError;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("❌ {}", CliError::Logging(err.to_string()));
        std::process::exit(1);
    }

    if let Err(err) = app::run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(err.exit_code());
    }
}

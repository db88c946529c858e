mod cli;
mod data;
mod datetime;
mod functions;
mod gateway;
mod log;
mod resolve;
mod settings;
mod tags;
mod types;

use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run()
}

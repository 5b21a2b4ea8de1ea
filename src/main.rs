use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = movievote::cli::Cli::parse();
    if let Err(err) = movievote::run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

//! Elrond: forensic image mounting and tool execution.
//!
//! Thin binary entry point. All logic lives in the `elrond-core` and
//! `elrond-cli` crates.
use elrond_cli::Parser;

fn main() -> anyhow::Result<()> {
    let cli = elrond_cli::Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_max_level(elrond_cli::log_level(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Elrond {} starting", env!("CARGO_PKG_VERSION"));
    elrond_cli::run(cli)
}

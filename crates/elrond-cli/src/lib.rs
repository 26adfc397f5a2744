//! Elrond CLI: command-line front-end over `elrond-core`.
//!
//! Parsing lives in [`args`], wiring of configuration and executor in
//! [`session`], and one handler per subcommand in [`commands`].
pub mod args;
pub mod commands;
pub mod session;

pub use args::{log_level, Cli, Command};
pub use clap::Parser;

use session::Session;

/// Run the parsed command line to completion.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let session = Session::open(cli.config.as_deref())?;
    let mut stdout = std::io::stdout().lock();

    match cli.command {
        Command::Identify { images, json } => commands::identify(&images, json, &mut stdout),
        Command::Deps {
            required_only,
            versions,
            json,
        } => commands::deps(&session, required_only, versions, json, &mut stdout),
        Command::Tools => commands::tools(&session, &mut stdout),
        Command::Mount {
            image,
            mount_point,
            read_write,
        } => {
            drop(stdout);
            commands::mount(&session, &image, mount_point, read_write)
        }
        Command::Exec {
            tool,
            timeout,
            args,
        } => {
            drop(stdout);
            commands::exec(&session, &tool, &args, timeout)
        }
    }
}

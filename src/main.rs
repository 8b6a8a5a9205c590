use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use agent_persist::app::{self, TokenMode};
use agent_persist::cli::{Cli, Commands};
use agent_persist::config::{Paths, PersistSettings};
use agent_persist::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("agent-persist error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let paths = Paths::resolve();
    let settings = PersistSettings::load_or_default(&paths);

    match cli.command {
        Commands::Token { status, force } => {
            let mode = if status {
                TokenMode::Status
            } else if force {
                TokenMode::Force
            } else {
                TokenMode::Auto
            };
            app::run_token(&paths, &settings, mode)
        }
        Commands::Menu { flags } => app::run_menu(&paths, &settings, flags),
        Commands::Sessions { limit } => app::print_sessions(&paths, &settings, limit),
        Commands::Install { skip_binaries } => app::run_install(&paths, &settings, skip_binaries),
        Commands::ShellInit => app::print_shell_init(&paths),
        Commands::Status => {
            app::print_status(&paths, &settings)?;
            Ok(0)
        }
        Commands::Doctor => app::doctor(&paths, &settings),
    }
}

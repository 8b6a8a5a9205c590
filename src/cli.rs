use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "agent-persist",
    version,
    about = "Keep Claude and Codex CLI state alive across ephemeral containers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the OAuth token and refresh it when it is close to expiry.
    Token {
        /// Only report the current token status.
        #[arg(long, conflicts_with = "force")]
        status: bool,
        /// Refresh now, regardless of remaining validity.
        #[arg(long)]
        force: bool,
    },
    /// Show the session picker for this terminal.
    #[command(trailing_var_arg = true)]
    Menu {
        #[arg(
            value_name = "CLAUDE_ARGS",
            help = "Extra flags passed to `claude` on launch",
            allow_hyphen_values = true
        )]
        flags: Vec<String>,
    },
    /// List the most recent sessions from the prompt log.
    Sessions {
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },
    /// Provision the persistent layout, CLI binaries and shell hook.
    Install {
        #[arg(long)]
        skip_binaries: bool,
    },
    /// Print the shell snippet evaluated on every shell start.
    ShellInit,
    /// Print a one-shot status snapshot.
    Status,
    /// Run health diagnostics for the persistent setup.
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_forwards_hyphenated_flags() {
        let cli = Cli::try_parse_from(["agent-persist", "menu", "--model", "opus", "-c"])
            .expect("parse");
        match cli.command {
            Commands::Menu { flags } => assert_eq!(flags, ["--model", "opus", "-c"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn token_status_and_force_are_exclusive() {
        assert!(Cli::try_parse_from(["agent-persist", "token", "--status", "--force"]).is_err());
        let cli = Cli::try_parse_from(["agent-persist", "token"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Token {
                status: false,
                force: false
            }
        ));
    }
}

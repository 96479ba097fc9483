mod commands;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Drive a desktop browser from your phone, by hand or through an AI assistant", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.relay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server (web client, REST API and WebSocket hub)
    Serve {
        /// Port to listen on (overrides config server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config server.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Run the desktop agent: launch Chrome and connect it to a server
    Agent {
        /// Server WebSocket URL (overrides config agent.serverUrl)
        #[arg(short, long)]
        server: Option<String>,

        /// Show the browser window instead of running headless
        #[arg(long)]
        headed: bool,
    },

    /// Manage login accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create an account
    Add {
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Change an account's password
    Passwd {
        username: String,
        #[arg(short, long)]
        password: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration with secrets masked
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, host } => {
            commands::serve::run(cli.config, host, port).await?;
        }
        Commands::Agent { server, headed } => {
            commands::agent::run(cli.config, server, headed).await?;
        }
        Commands::User { command } => match command {
            UserCommands::Add { username, password } => {
                commands::user::add(cli.config, &username, &password).await?;
            }
            UserCommands::Passwd { username, password } => {
                commands::user::passwd(cli.config, &username, &password).await?;
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show(cli.config).await?;
            }
        },
    }

    Ok(())
}

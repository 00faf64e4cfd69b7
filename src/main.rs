//! cause-chat - group chat client for the Social Cause platform
//!
//! Sign in, browse groups, send messages with attachments and follow a
//! group's feed from the terminal.

mod auth;
mod backend;
mod chat;
mod commands;
mod config;
mod demo;
mod error;
mod models;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cause-chat")]
#[command(about = "Group chat client for the Social Cause platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store backend settings
    Config {
        /// Web API key of the project
        #[arg(long)]
        api_key: Option<String>,

        /// Project ID
        #[arg(long)]
        project_id: Option<String>,

        /// Storage bucket for attachments (defaults to <project>.appspot.com)
        #[arg(long)]
        bucket: Option<String>,

        /// Live-query polling interval in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },

    /// Create an account
    Signup {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,

        /// Display name shown to other members
        #[arg(long)]
        name: String,
    },

    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,
    },

    /// Go offline and clear cached credentials
    Logout,

    /// Show current configuration and authentication status
    Status,

    /// List known users and who is online
    Users,

    /// List groups you belong to
    Groups,

    /// Create a group
    CreateGroup {
        name: String,

        /// Member user ID (repeatable); you are always added
        #[arg(short, long = "member")]
        members: Vec<String>,
    },

    /// Send a message
    Send {
        /// Group ID (from `groups` output)
        group_id: String,

        /// Message text
        #[arg(default_value = "")]
        text: String,

        /// File to attach (repeatable)
        #[arg(short, long)]
        attach: Vec<PathBuf>,
    },

    /// Follow a group's messages until Ctrl-C
    Watch {
        /// Group ID (from `groups` output)
        group_id: String,

        /// Print one JSON object per message
        #[arg(long)]
        json: bool,
    },

    /// Run an offline walkthrough on the in-memory backend
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Config {
            api_key,
            project_id,
            bucket,
            poll_ms,
        } => {
            commands::configure(api_key, project_id, bucket, poll_ms)?;
        }
        Commands::Signup {
            email,
            password,
            name,
        } => {
            commands::signup(&email, &password, &name).await?;
        }
        Commands::Login { email, password } => {
            tracing::info!("Signing in...");
            commands::login(&email, &password).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            commands::logout().await?;
        }
        Commands::Status => {
            commands::status()?;
        }
        Commands::Users => {
            commands::users().await?;
        }
        Commands::Groups => {
            commands::groups().await?;
        }
        Commands::CreateGroup { name, members } => {
            commands::create_group(&name, members).await?;
        }
        Commands::Send {
            group_id,
            text,
            attach,
        } => {
            commands::send(&group_id, &text, attach).await?;
        }
        Commands::Watch { group_id, json } => {
            commands::watch(&group_id, json).await?;
        }
        Commands::Demo => {
            demo::run().await?;
        }
    }

    Ok(())
}

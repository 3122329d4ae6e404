#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

use clap::{Parser, Subcommand};
use tether_config::Config;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod command;

use command::{
    CommandStrategy, HistoryInput, HistoryStrategy, InfoStrategy, InitStrategy, KeyInput,
    KeyStrategy, VersionStrategy,
};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Conversation continuity engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,
    /// Show version
    Version,
    /// Show configuration and store status
    Info,
    /// Print the reconciled history of a conversation
    History {
        /// Conversation to read
        #[arg(short = 'c', long)]
        conversation: String,

        /// Checkpoint thread to annotate messages from
        #[arg(short = 't', long)]
        thread: Option<String>,
    },
    /// Encode or decode checkpoint keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Build a key from its parts
    Format {
        #[arg(short = 't', long)]
        thread: String,

        #[arg(short = 'n', long, default_value = "")]
        ns: String,

        #[arg(short = 'c', long)]
        checkpoint: String,
    },
    /// Split a key into its parts
    Parse { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let level = config
        .as_ref()
        .map_or("info", |config| config.logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => InitStrategy.execute(()).await,
        Commands::Version => VersionStrategy.execute(()).await,
        Commands::Info => InfoStrategy.execute(config?).await,
        Commands::History {
            conversation,
            thread,
        } => {
            HistoryStrategy
                .execute(HistoryInput {
                    config: config?,
                    conversation_id: conversation,
                    thread_id: thread,
                })
                .await
        }
        Commands::Key { command } => {
            let input = match command {
                KeyCommands::Format {
                    thread,
                    ns,
                    checkpoint,
                } => KeyInput::Format {
                    thread_id: thread,
                    checkpoint_ns: ns,
                    checkpoint_id: checkpoint,
                },
                KeyCommands::Parse { key } => KeyInput::Parse { key },
            };
            KeyStrategy.execute(input).await
        }
    }
}

//! # Connector CLI (`dbic`)
//!
//! Starts the database connector and inspects the local index.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dbic init` | Create the index database and run schema migrations |
//! | `dbic run` | Run full and incremental traversals until interrupted |
//! | `dbic run --once` | Run a single full traversal and exit |
//! | `dbic get <id>` | Print an indexed item by id or key |
//! | `dbic stats` | Summarize the index |
//!
//! ## Examples
//!
//! ```bash
//! dbic init --config ./config/connector.toml
//! dbic run --once --config ./config/connector.toml
//! dbic get x1 --config ./config/connector.toml
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use db_index_connector::{config, get, index::SqliteIndex, logging, schedule, stats};

/// Index rows of a relational database into a search index.
#[derive(Parser)]
#[command(name = "dbic", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/connector.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run the connector.
    ///
    /// Starts the full traversal loop and, when `db.incremental_update_sql`
    /// is set, the incremental loop. Stops on Ctrl-C.
    Run {
        /// Run one full traversal and exit (overrides `connector.run_once`).
        #[arg(long)]
        once: bool,
    },

    /// Print an indexed item.
    Get {
        /// Full item id or bare item key.
        id: String,

        /// Print the stored document as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            let index = SqliteIndex::open(&cfg.index).await?;
            index.close().await;
            println!("Index initialized successfully.");
        }
        Commands::Run { once } => {
            if once {
                cfg.connector.run_once = true;
            }
            schedule::run_connector(&cfg).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

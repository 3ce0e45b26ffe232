use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use sqlgate_lib::commands::{self, ExecuteOptions};
use sqlgate_lib::models::ConnectionRecord;
use sqlgate_lib::storage::JsonFileStore;
use sqlgate_lib::validator;
use sqlgate_lib::vault::Vault;
use sqlgate_lib::{AppState, Config};

#[derive(Parser)]
#[command(name = "sqlgate")]
#[command(about = "Read-only SQL gateway for PostgreSQL connections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a connection string with AES_ENCRYPTION_KEY
    Encrypt { plaintext: String },

    /// Check a statement against the read-only rules
    Validate { sql: String },

    /// Pull a SQL statement out of model text read from stdin
    Extract,

    /// Encrypt a DSN and store it under a connection id
    Add {
        id: String,
        dsn: String,
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Remove a stored connection
    Remove { id: String },

    /// Check that a stored connection can be reached
    Ping { id: String },

    /// Print the (cached) schema of a connection
    Schema {
        id: String,
        /// Render as model prompt text instead of JSON
        #[arg(long)]
        prompt: bool,
    },

    /// Validate and run a SELECT against a connection
    Query {
        id: String,
        sql: String,
        /// Overrides SQLGATE_QUERY_TIMEOUT_SECS
        #[arg(short, long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    sqlgate_lib::init_tracing("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { sql } => {
            print_json(&validator::validate(&sql))?;
        }
        Commands::Extract => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading stdin")?;
            print_json(&validator::extract_sql(&text))?;
        }
        Commands::Encrypt { plaintext } => {
            let config = load_config()?;
            println!("{}", Vault::new(&config.encryption_key).encrypt(&plaintext));
        }
        Commands::Add { id, dsn, name } => {
            let config = load_config()?;
            let sealed = Vault::new(&config.encryption_key).encrypt(&dsn);
            let mut record = ConnectionRecord::encrypted(id, sealed);
            record.name = name;
            JsonFileStore::new(config.connections_file.clone())
                .add_connection(record)
                .await?;
        }
        Commands::Remove { id } => {
            let config = load_config()?;
            JsonFileStore::new(config.connections_file.clone())
                .delete_connection(&id)
                .await?;
        }
        Commands::Ping { id } => {
            let state = AppState::new(&load_config()?);
            let result = commands::test_connection(&state, &id).await;
            state.shutdown().await;
            result?;
            println!("ok");
        }
        Commands::Schema { id, prompt } => {
            let state = AppState::new(&load_config()?);
            if prompt {
                println!("{}", commands::get_schema_prompt(&state, &id).await?);
            } else {
                let schema = commands::get_schema(&state, &id).await?;
                print_json(&*schema)?;
            }
            state.shutdown().await;
        }
        Commands::Query {
            id,
            sql,
            timeout_secs,
        } => {
            let state = AppState::new(&load_config()?);
            let options = ExecuteOptions {
                timeout: timeout_secs.map(Duration::from_secs),
                cancel: CancellationToken::new(),
            };

            let cancel = options.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let result = commands::execute_query(&state, &id, &sql, &options).await;
            state.shutdown().await;
            print_json(&result?)?;
        }
    }

    Ok(())
}

fn load_config() -> Result<Config> {
    Config::from_env().context("loading configuration")
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

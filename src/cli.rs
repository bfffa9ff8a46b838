//! Operator commands for managing stimulus pools and recorded data.

use std::path::{Path, PathBuf};

use clap::Subcommand;

use crate::storage::{NewStimulus, PoolFilter, SqliteStorage, Storage};

/// Maintenance subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the experiment server (default)
    Serve,

    /// Load stimulus records from a JSON file into a pool
    Seed {
        /// Pool to add the stimuli to
        #[arg(long)]
        pool: String,

        /// JSON array of stimulus records
        #[arg(long)]
        file: PathBuf,
    },

    /// Show per-item usage counters of a pool
    Status {
        /// Pool to inspect
        #[arg(long)]
        pool: String,
    },

    /// Print stored trial documents as JSON lines
    Export {
        /// Database (experiment) name
        #[arg(long)]
        database: String,

        /// Collection name
        #[arg(long)]
        collection: String,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a maintenance command. `Serve` is handled by the binary.
pub async fn execute_command(command: Commands, storage: &SqliteStorage) -> CliResult {
    match command {
        Commands::Serve => CliResult::error("serve is not a maintenance command"),
        Commands::Seed { pool, file } => execute_seed(storage, &pool, &file).await,
        Commands::Status { pool } => execute_status(storage, &pool).await,
        Commands::Export {
            database,
            collection,
        } => execute_export(storage, &database, &collection).await,
    }
}

async fn execute_seed(storage: &SqliteStorage, pool: &str, file: &Path) -> CliResult {
    let raw = match std::fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(e) => return CliResult::error(format!("Failed to read {}: {}", file.display(), e)),
    };

    let records: Vec<NewStimulus> = match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(e) => {
            return CliResult::error(format!("Invalid stimulus file {}: {}", file.display(), e))
        }
    };

    let total = records.len();
    for (i, record) in records.into_iter().enumerate() {
        let item = record.into_item(pool);
        if let Err(e) = storage.insert_stimulus(&item).await {
            return CliResult::error(format!(
                "Stopped after {} of {} stimuli: {} ({})",
                i, total, e, item.id
            ));
        }
    }

    CliResult::success(format!("Seeded {} stimuli into pool '{}'", total, pool))
}

async fn execute_status(storage: &SqliteStorage, pool: &str) -> CliResult {
    let items = match storage.load(&PoolFilter::pool(pool)).await {
        Ok(items) => items,
        Err(e) => return CliResult::error(format!("Failed to load pool '{}': {}", pool, e)),
    };

    if items.is_empty() {
        return CliResult::success(format!("Pool '{}' is empty", pool));
    }

    let mut output = String::new();
    output.push_str(&format!("\nPool '{}' ({} items)\n", pool, items.len()));
    output.push_str("─────────────────────────────────────────────────────────────\n");
    output.push_str(&format!("{:<40} {:>8}\n", "ID", "USAGE"));

    let mut total = 0;
    for item in &items {
        total += item.usage_count;
        output.push_str(&format!("{:<40} {:>8}\n", item.id, item.usage_count));
    }

    let min = items.iter().map(|i| i.usage_count).min().unwrap_or(0);
    let max = items.iter().map(|i| i.usage_count).max().unwrap_or(0);
    output.push_str("─────────────────────────────────────────────────────────────\n");
    output.push_str(&format!(
        "Total claims: {}  (min {}, max {}, spread {})\n",
        total,
        min,
        max,
        max - min
    ));

    CliResult::success(output)
}

async fn execute_export(storage: &SqliteStorage, database: &str, collection: &str) -> CliResult {
    let documents = match storage.get_documents(database, collection).await {
        Ok(documents) => documents,
        Err(e) => return CliResult::error(format!("Failed to read documents: {}", e)),
    };

    let mut lines = Vec::with_capacity(documents.len());
    for document in documents {
        match serde_json::to_string(&document.body) {
            Ok(line) => lines.push(line),
            Err(e) => return CliResult::error(format!("Failed to encode {}: {}", document.id, e)),
        }
    }

    CliResult::success(lines.join("\n"))
}

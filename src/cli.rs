use clap::{Parser, Subcommand};

/// pgmcp: multi-tenant MCP server for PostgreSQL
#[derive(Parser)]
#[command(name = "pgmcp-server", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the MCP server
    Serve {
        /// Port to bind (overrides PGMCP_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage API tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Manage saved database connections (per-token mode)
    Connection {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Create a token. The plaintext is printed once and never again.
    Create {
        /// Free-text note, e.g. who the token is for
        #[arg(long, default_value = "")]
        annotation: String,
        /// Lifetime such as 30d, 12h, 1w, or "never"
        #[arg(long, default_value = "never")]
        expires: String,
        /// Choose the token id instead of generating one
        #[arg(long)]
        id: Option<String>,
    },
    /// List tokens (hash prefixes only)
    List,
    /// Remove a token by id or hash prefix (at least 8 hex characters)
    Remove { id_or_prefix: String },
    /// Remove every expired token
    Prune,
}

#[derive(Subcommand)]
pub enum ConnectionCommands {
    /// Save a connection profile on a token
    Add {
        #[arg(long)]
        token: String,
        #[arg(long)]
        alias: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value = "5432")]
        port: u16,
        #[arg(long)]
        user: String,
        #[arg(long, env = "PGMCP_CONNECTION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Defaults to the user name
        #[arg(long)]
        dbname: Option<String>,
        /// disable, allow, prefer, require, verify-ca or verify-full
        #[arg(long, default_value = "prefer")]
        sslmode: String,
        #[arg(long)]
        application_name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Also make this the token's default connection
        #[arg(long)]
        default: bool,
    },
    /// Delete a saved connection
    Remove {
        #[arg(long)]
        token: String,
        #[arg(long)]
        alias: String,
    },
    /// Choose which saved connection backs the token's pool
    Default {
        #[arg(long)]
        token: String,
        #[arg(long)]
        alias: String,
    },
    /// Show a token's saved connections
    List {
        #[arg(long)]
        token: String,
    },
}

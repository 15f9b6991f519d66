use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "keygate")]
#[command(about = "Local credential broker for agent HTTP traffic")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the loopback HTTP broker.
    Proxy {
        #[arg(long, default_value_t = 9090)]
        port: u16,
    },
    /// Serve the MCP tool interface over stdio.
    Mcp,
    /// Ask for a one-shot authorization decision on a scope.
    Issue {
        scope: String,
        #[arg(long, default_value = "cli")]
        reason: String,
        #[arg(long, default_value = "localhost")]
        host: String,
    },
    /// List configured scopes with priorities and credential health.
    List,
    /// Show requests waiting for operator approval.
    Pending,
    /// Print recent audit entries as JSON.
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

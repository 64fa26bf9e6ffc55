//! tether - command line client for MCP servers.
//!
//! ```text
//! tether tools --url https://example.com/mcp
//! tether call echo --args '{"text":"hi"}' -- npx -y my-mcp-server
//! tether ping --config servers.json --server local
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::Target;

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Talk to Model Context Protocol servers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools a server exposes
    Tools {
        #[command(flatten)]
        target: Target,

        /// Print the raw tool list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Call a tool
    Call {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        #[command(flatten)]
        target: Target,

        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that a server responds
    Ping {
        #[command(flatten)]
        target: Target,
    },

    /// List the servers in a servers file
    Servers {
        /// Servers file with an `mcpServers` map
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::init_logging(cli.verbose);

    match cli.command {
        Commands::Tools { target, json } => commands::list_tools(&target, json).await,
        Commands::Call {
            tool,
            args,
            target,
            json,
        } => commands::call_tool(&target, &tool, &args, json).await,
        Commands::Ping { target } => commands::ping(&target).await,
        Commands::Servers { config } => commands::list_servers(&config).await,
    }
}

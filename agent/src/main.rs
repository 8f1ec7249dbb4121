use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use toolrelay::config::{DiscoveryRequest, McpConfig, RelayConfig, ServerStore, StoredServer};
use toolrelay::mcp::ConnectionManager;
use toolrelay::streaming::{ReplayEngine, RunRequest, StreamingDriver};

#[derive(Parser)]
#[command(name = "toolrelay")]
#[command(about = "Connect agents to MCP tool servers and stream their events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover tools for a discovery request and list them
    Tools {
        /// Discovery request (JSON with mcp_servers / custom_mcp_servers)
        #[arg(long)]
        request: PathBuf,
        /// Only list tools from a specific server
        #[arg(long)]
        server: Option<String>,
    },
    /// Discover tools and call one of them
    Call {
        /// Tool name
        tool: String,
        /// Discovery request (JSON with mcp_servers / custom_mcp_servers)
        #[arg(long)]
        request: PathBuf,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
    },
    /// Replay a recorded event log through the streaming driver
    Replay {
        /// NDJSON file of engine events
        events: PathBuf,
        /// Pause before each event
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Override the debounce window
        #[arg(long)]
        debounce_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mcp_common::init_tracing("toolrelay", cli.verbose)?;

    let config = RelayConfig::load()?;
    let manager = Arc::new(ConnectionManager::new(load_store()?, &config));

    match cli.command {
        Commands::Tools { request, server } => {
            run_tools(&manager, &request, server).await?;
        }
        Commands::Call { tool, request, args } => {
            run_call_tool(&manager, &request, &tool, args).await?;
        }
        Commands::Replay {
            events,
            delay_ms,
            debounce_ms,
        } => {
            run_replay(manager, &config, &events, delay_ms, debounce_ms).await?;
        }
    }

    Ok(())
}

/// Stored servers come from .mcp.json when one is found
fn load_store() -> Result<Arc<dyn ServerStore>> {
    match McpConfig::load()? {
        Some(config) => Ok(Arc::new(config)),
        None => {
            tracing::info!("No .mcp.json found, only custom servers can be used");
            Ok(Arc::new(HashMap::<String, StoredServer>::new()))
        }
    }
}

async fn run_tools(
    manager: &ConnectionManager,
    request: &Path,
    server_filter: Option<String>,
) -> Result<()> {
    let discovery = DiscoveryRequest::load_from_path(request)?;
    if discovery.is_empty() {
        println!("Discovery request lists no servers.");
        return Ok(());
    }

    let toolset = manager.build_tools(&discovery, &CancellationToken::new()).await?;

    if toolset.is_empty() {
        println!("No tools found.");
    } else {
        let mut by_server: Vec<_> = toolset.tools_by_server().into_iter().collect();
        by_server.sort_by_key(|(server, _)| *server);

        for (server, tools) in by_server {
            if server_filter.as_deref().is_some_and(|s| s != server) {
                continue;
            }
            println!("=== {} ({} tools) ===", server, tools.len());
            for tool in tools {
                let desc = tool
                    .description
                    .as_deref()
                    .unwrap_or("No description")
                    .lines()
                    .next()
                    .unwrap_or("");
                println!("  {} - {}", tool.name, desc);
            }
            println!();
        }
    }

    toolset.release_all().await;
    Ok(())
}

async fn run_call_tool(
    manager: &ConnectionManager,
    request: &Path,
    tool_name: &str,
    args: Option<String>,
) -> Result<()> {
    let discovery = DiscoveryRequest::load_from_path(request)?;

    let arguments = match args {
        Some(json) => Some(serde_json::from_str(&json).context("Invalid --args JSON")?),
        None => None,
    };

    let toolset = manager.build_tools(&discovery, &CancellationToken::new()).await?;

    println!("Calling tool: {}", tool_name);
    if let Some(ref a) = arguments {
        println!("Arguments: {}", serde_json::to_string_pretty(a)?);
    }
    println!();

    let result = toolset.call_tool(tool_name, arguments).await;
    toolset.release_all().await;
    let result = result?;

    println!("Result:");
    for content in &result.content {
        match &content.raw {
            rmcp::model::RawContent::Text(text) => {
                println!("{}", text.text);
            }
            _ => {
                println!("{:?}", content);
            }
        }
    }

    Ok(())
}

async fn run_replay(
    manager: Arc<ConnectionManager>,
    config: &RelayConfig,
    events: &Path,
    delay_ms: u64,
    debounce_ms: Option<u64>,
) -> Result<()> {
    let engine = ReplayEngine::from_path(events)?.with_delay(Duration::from_millis(delay_ms));

    let mut driver = StreamingDriver::new(manager, Arc::new(engine), &config.streaming);
    if let Some(ms) = debounce_ms {
        driver = driver.with_debounce(Duration::from_millis(ms));
    }

    // Ctrl-C cancels the run; the driver releases its connections before the stream ends
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut stream = driver.stream(DiscoveryRequest::default(), RunRequest::new("replay"), cancel);
    while let Some(line) = stream.next().await {
        println!("{}", line);
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shopscout_mcp::rpc::RpcClient;
use shopscout_mcp::server::{self, ServerState};
use shopscout_mcp::tools::{default_registry, Toolbox};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shopscout")]
#[command(about = "Agentic product-research tool runtime (MCP over SSE)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MCP tool server (SSE session endpoint + POST messages).
    Serve(ServeCmd),
    /// Call a tool on a running server through the SSE transport.
    Call(CallCmd),
    /// Run the research orchestrator locally and print the report as JSON.
    Research(ResearchCmd),
    /// Print version info.
    Version,
}

#[derive(clap::Args, Debug)]
struct ServeCmd {
    /// Bind host. Defaults to MCP_HOST, then 127.0.0.1.
    #[arg(long)]
    host: Option<String>,
    /// Bind port. Defaults to MCP_PORT, then 8787.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(clap::Args, Debug)]
struct CallCmd {
    /// Tool name, e.g. web_search or list_cart.
    tool: String,
    /// Tool arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
    /// Server base URL. Defaults to http://MCP_HOST:MCP_PORT.
    #[arg(long)]
    url: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ResearchCmd {
    /// Free-form shopping request, e.g. "mechanical keyboard under $100".
    prompt: String,
    /// Attach the driven browser as a fallback for blocked pages.
    #[arg(long, default_value_t = false)]
    with_browser: bool,
}

fn host_from_env() -> String {
    std::env::var("MCP_HOST")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn port_from_env() -> u16 {
    std::env::var("MCP_PORT")
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .unwrap_or(8787)
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Serve(cmd) => run_serve(cmd).await,
        Commands::Call(cmd) => run_call(cmd).await,
        Commands::Research(cmd) => run_research(cmd).await,
        Commands::Version => {
            println!("shopscout {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_serve(cmd: ServeCmd) -> Result<()> {
    let host = cmd.host.unwrap_or_else(host_from_env);
    let port = cmd.port.unwrap_or_else(port_from_env);

    let toolbox = Toolbox::new();
    let registry = Arc::new(default_registry());
    let state = ServerState::new(toolbox.clone(), registry);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;

    tokio::select! {
        served = server::serve(listener, state.clone()) => {
            served.context("server terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            state.teardown_session();
            toolbox.browser.close().await;
        }
    }
    Ok(())
}

async fn run_call(cmd: CallCmd) -> Result<()> {
    let base_url = cmd
        .url
        .unwrap_or_else(|| format!("http://{}:{}", host_from_env(), port_from_env()));
    let args: serde_json::Value =
        serde_json::from_str(&cmd.args).context("parsing --args as JSON")?;

    let client = RpcClient::connect(&base_url)
        .await
        .with_context(|| format!("connecting to {base_url}"))?;
    tracing::debug!(session_id = client.session_id(), "connected");

    let result = match cmd.tool.as_str() {
        "tools/list" => client.list_tools().await,
        tool => client.call_tool(tool, args).await,
    };
    let value = result.map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run_research(cmd: ResearchCmd) -> Result<()> {
    use shopscout_local::browser::DrivenBrowser;
    use shopscout_local::fetch::PageFetcher;
    use shopscout_local::research::Researcher;
    use shopscout_local::search::SearchEngine;

    let client = shopscout_local::http_client();
    let search = Arc::new(SearchEngine::new(client.clone()));
    let fetcher = Arc::new(PageFetcher::new(client));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let progress = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            eprintln!("research-update: {line}");
        }
    });

    let mut researcher = Researcher::new(search, fetcher).with_updates(tx);
    let browser = if cmd.with_browser {
        let browser = Arc::new(DrivenBrowser::new());
        researcher = researcher.with_browser(browser.clone());
        Some(browser)
    } else {
        None
    };

    let report = researcher.research(&cmd.prompt).await;
    // Dropping the researcher closes the updates channel so the progress
    // task can drain and exit.
    drop(researcher);
    if let Some(browser) = browser {
        browser.close().await;
    }
    let _ = progress.await;

    let report = report.map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

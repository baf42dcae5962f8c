//! agent-mcp - MCP server for launching and tracking agent tasks.
//!
//! # Usage
//!
//! ```bash
//! # Serve over stdin/stdout (default)
//! agent-mcp --project-root ./my-project
//!
//! # Serve over SSE/HTTP
//! agent-mcp --transport sse --host 0.0.0.0 --port 3000
//!
//! # Layer a config file under the flags
//! agent-mcp --config agent-mcp.toml --log-level debug
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use agent_mcp::config::ServerConfig;
use agent_mcp::logging::init_logging;
use agent_mcp::server::ServerBuilder;
use agent_mcp::transport::create_transport;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "agent-mcp")]
#[command(about = "MCP server that runs agent tasks as tracked executions", long_about = None)]
#[command(version)]
struct Cli {
    /// Transport to serve on
    #[arg(long, env = "AGENT_MCP_TRANSPORT")]
    transport: Option<TransportArg>,

    /// Port for the SSE/HTTP transport
    #[arg(long, env = "AGENT_MCP_PORT")]
    port: Option<u16>,

    /// Address for the SSE/HTTP transport to bind
    #[arg(long, env = "AGENT_MCP_HOST")]
    host: Option<String>,

    /// Directory agent tasks run in
    #[arg(long, env = "AGENT_MCP_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Log verbosity
    #[arg(long, env = "AGENT_MCP_LOG_LEVEL")]
    log_level: Option<LogLevelArg>,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "AGENT_MCP_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Command that carries out agent tasks
    #[arg(long, env = "AGENT_MCP_RUNNER_COMMAND")]
    runner: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportArg {
    Stdio,
    Http,
    Sse,
}

impl TransportArg {
    fn as_str(self) -> &'static str {
        match self {
            TransportArg::Stdio => "stdio",
            TransportArg::Http => "http",
            TransportArg::Sse => "sse",
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevelArg {
    fn as_str(self) -> &'static str {
        match self {
            LogLevelArg::Debug => "debug",
            LogLevelArg::Info => "info",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Error => "error",
        }
    }
}

impl Cli {
    /// Flags win over the file and the environment.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(transport) = self.transport {
            config.transport.kind = transport.as_str().to_string();
        }
        if let Some(port) = self.port {
            config.transport.port = port;
        }
        if let Some(host) = &self.host {
            config.transport.host = host.clone();
        }
        if let Some(root) = &self.project_root {
            config.project_root = root.clone();
        }
        if let Some(level) = self.log_level {
            config.log.level = level.as_str().to_string();
        }
        if let Some(file) = &self.log_file {
            config.log.file = Some(file.clone());
        }
        if let Some(command) = &self.runner {
            config.execution.runner.command = Some(command.clone());
        }
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    // Stdin is read on a blocking thread that runtime shutdown would wait for.
    process::exit(code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let _guard = init_logging(&config.log)?;

    let transport = create_transport(Some(&config.transport))?;
    let server = ServerBuilder::from_config(&config).build();
    info!(
        version = agent_mcp::VERSION,
        transport = transport.kind(),
        project_root = %config.project_root.display(),
        "Starting agent-mcp"
    );

    let stopper = Arc::clone(&transport);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            if let Err(e) = stopper.stop().await {
                warn!("Error stopping transport: {}", e);
            }
        }
    });

    server.serve(transport).await.context("server failed")?;

    let cancelled = server.adapter().cancel_all();
    if cancelled > 0 {
        info!(cancelled, "Cancelled running executions");
    }
    Ok(())
}

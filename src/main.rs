use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use cellexec::client::ExecutorClient;
use cellexec::config::{ExecutorConfig, GatewayKind};
use cellexec::models::Tags;
use cellexec::server::rest::run_rest_server;
use cellexec::shared::logging;

#[derive(Parser)]
#[command(name = "cellexec")]
#[command(about = "cellexec - Node-local executor for sandboxed containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the executor and its REST API
    Serve(ServeArgs),

    /// Check that an executor and its sandbox runtime are reachable
    Ping(ClientArgs),

    /// Show total and remaining capacity
    Resources(ClientArgs),

    /// List containers, optionally filtered by tag
    List {
        #[command(flatten)]
        client: ClientArgs,

        /// Tag filter as KEY=VALUE; repeat to require several
        #[arg(short, long, value_parser = parse_tag)]
        tag: Vec<(String, String)>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// YAML configuration file
    #[arg(short, long, env = "CELLEXEC_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the REST API
    #[arg(short, long)]
    listen: Option<String>,

    /// Sandbox runtime
    #[arg(long, value_enum)]
    gateway: Option<GatewayKind>,

    /// Memory capacity override
    #[arg(long)]
    memory_mb: Option<i64>,

    /// Disk capacity override
    #[arg(long)]
    disk_mb: Option<i64>,

    /// Container slot override
    #[arg(long)]
    max_containers: Option<i64>,

    /// File to persist container records in
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Export INSTANCE_* addressing variables to processes
    #[arg(long)]
    export_network_env_vars: bool,

    /// Log filter directives (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args)]
struct ClientArgs {
    /// Executor base URL
    #[arg(long, env = "CELLEXEC_URL", default_value = "http://127.0.0.1:1700")]
    url: String,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

impl ServeArgs {
    fn into_config(self) -> Result<ExecutorConfig> {
        let mut config = ExecutorConfig::load(self.config.as_deref())?;

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(gateway) = self.gateway {
            config.gateway = gateway;
        }
        if self.memory_mb.is_some() {
            config.memory_mb = self.memory_mb;
        }
        if self.disk_mb.is_some() {
            config.disk_mb = self.disk_mb;
        }
        if self.max_containers.is_some() {
            config.max_containers = self.max_containers;
        }
        if self.snapshot.is_some() {
            config.snapshot_path = self.snapshot;
        }
        if self.export_network_env_vars {
            config.export_network_env_vars = true;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.into_config()?;
            logging::init_logging(&config).context("Failed to initialize logging")?;
            run_rest_server(config).await
        }
        Commands::Ping(args) => {
            logging::init_cli_logging();
            ExecutorClient::new(&args.url).ping().await?;
            println!("ok");
            Ok(())
        }
        Commands::Resources(args) => {
            logging::init_cli_logging();
            let client = ExecutorClient::new(&args.url);
            let total = client.total_resources().await?;
            let remaining = client.remaining_resources().await?;
            println!("{:<12} {:>10} {:>10}", "", "total", "remaining");
            println!("{:<12} {:>10} {:>10}", "memory_mb", total.memory_mb, remaining.memory_mb);
            println!("{:<12} {:>10} {:>10}", "disk_mb", total.disk_mb, remaining.disk_mb);
            println!("{:<12} {:>10} {:>10}", "containers", total.containers, remaining.containers);
            Ok(())
        }
        Commands::List { client, tag } => {
            logging::init_cli_logging();
            let tags: Tags = tag.into_iter().collect();
            let containers = ExecutorClient::new(&client.url).list_containers(&tags).await?;
            println!("{}", serde_json::to_string_pretty(&containers)?);
            Ok(())
        }
    }
}

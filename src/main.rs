use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use pubsub_rpc::{
    ConnectionRegistry, ConnectionSettings,
    config::{EnvSettings, SettingsSource},
    logger::{LogConfig, LogLevel, init_tracing},
    node::{ListenerNode, RequestNode, RequestNodeConfig, ResponseNode},
    schema::write_schema,
};
use rpc_transport::MemoryTransport;
use serde_json::{Value, json};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "pubsub-rpc",
    about = "JSON-RPC calls over publish/subscribe topics",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error, critical)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write rolling logs and call events into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a provider and a caller of `sum` over the in-memory broker
    Demo(DemoArgs),

    /// Emit JSON-Schema for the wire and configuration types
    Schema(SchemaArgs),

    /// Print the connection settings resolved from the environment
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, default_value = "calc")]
    namespace: String,

    #[arg(long, default_value_t = 5)]
    a: i64,

    #[arg(long, default_value_t = 3)]
    b: i64,

    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level: LogLevel = cli.log_level.parse().unwrap_or(LogLevel::Info);
    let _guard = init_tracing(&LogConfig::new(level, cli.log_dir.clone()))?;

    let result = match cli.command {
        Commands::Demo(args) => demo(args).await,
        Commands::Schema(args) => {
            let written = write_schema(&args.out)?;
            println!("{} schemas written to {}", written.len(), args.out.display());
            Ok(())
        }
        Commands::Config(args) => {
            let source = SettingsSource::new(EnvSettings::load(args.env_file));
            let settings = ConnectionSettings::from_source(&source).await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    };
    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}

async fn demo(args: DemoArgs) -> anyhow::Result<()> {
    let registry = ConnectionRegistry::new(Arc::new(MemoryTransport::new()));
    let settings = ConnectionSettings::new(args.namespace.as_str());

    let (listener, mut calls) = ListenerNode::open(&registry, &settings, "sum-listener", "sum").await?;
    let responder = ResponseNode::new("sum-response");
    let provider = tokio::spawn(async move {
        while let Some(mut msg) = calls.recv().await {
            let total: i64 = msg
                .payload
                .as_array()
                .map(|nums| nums.iter().filter_map(Value::as_i64).sum())
                .unwrap_or_default();
            msg.payload = json!(total);
            responder.input(msg);
        }
    });

    let requester = RequestNode::open(
        &registry,
        &settings,
        RequestNodeConfig {
            id: "sum-request".to_string(),
            method: Some("sum".to_string()),
            timeout_ms: args.timeout_ms,
        },
    )
    .await?;

    if let Some(connection) = registry.get(&settings.namespace) {
        connection
            .wait_for_state(pubsub_rpc::ConnectionState::Connected, Duration::from_secs(5))
            .await
            .context("connection did not come up")?;
    }

    let output = requester.input(json!({ "params": [args.a, args.b] })).await;
    info!(output = %output, "demo call finished");

    requester.close().await?;
    listener.close().await?;
    registry.shutdown().await;
    provider.abort();

    if let Some(error) = output.get("error") {
        bail!("sum({}, {}) failed: {error}", args.a, args.b);
    }
    println!("sum({}, {}) = {output}", args.a, args.b);
    Ok(())
}

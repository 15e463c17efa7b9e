use clap::Parser;
use exec_broker::{ExecConfig, OverflowPolicy};
use exec_broker_server::{create_app, run_server};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "EXEC_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    addr: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Number of executions allowed to run at once (overrides the config file)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Executions allowed to wait for a worker (overrides the config file)
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Processes one execution may have alive at once (overrides the config file)
    #[arg(long)]
    max_processes: Option<u64>,

    /// What to do when pool and queue are full (overrides the config file)
    #[arg(long, value_parser = parse_overflow)]
    overflow: Option<OverflowPolicy>,
}

fn parse_overflow(raw: &str) -> Result<OverflowPolicy, String> {
    match raw.to_ascii_lowercase().as_str() {
        "reject" => Ok(OverflowPolicy::Reject),
        "block" => Ok(OverflowPolicy::Block),
        other => Err(format!("unknown overflow policy {other}, expected reject or block")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ExecConfig::load(path)?,
        None => ExecConfig::default(),
    };
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(queue_depth) = args.queue_depth {
        config.queue_depth = queue_depth;
    }
    if let Some(max_processes) = args.max_processes {
        config.default_limits.max_processes = max_processes;
    }
    if let Some(overflow) = args.overflow {
        config.overflow = overflow;
    }
    info!(
        "Work root {}, default timeout {:?}",
        config.work_root.display(),
        config.default_limits.wall_clock_timeout
    );

    let app = create_app(config)?;
    run_server(app, SocketAddr::new(args.addr, args.port)).await?;

    Ok(())
}

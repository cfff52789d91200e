use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::config::ServerConfig;
use server::gateway::GatewayConfig;
use server::network::Server;
use server::session::SessionLimits;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "3001")]
    port: u16,

    /// Directory with the browser client's static files
    #[arg(short, long, default_value = "public")]
    assets: PathBuf,

    /// Seconds between speed regeneration ticks
    #[arg(long, default_value = "6")]
    regen_interval_secs: u64,

    /// Maximum number of simultaneous connections
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Largest accepted grid dimension
    #[arg(long, default_value = "100")]
    max_grid_size: u32,

    /// Largest accepted image payload in bytes
    #[arg(long, default_value = "5242880")]
    max_image_bytes: usize,

    /// Tell clients when one of their commands is rejected
    #[arg(long)]
    ack_rejections: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            assets_dir: args.assets,
            regen_interval: Duration::from_secs(args.regen_interval_secs.max(1)),
            gateway: GatewayConfig {
                max_clients: args.max_clients,
                max_image_bytes: args.max_image_bytes,
                acknowledge_rejections: args.ack_rejections,
                limits: SessionLimits {
                    max_grid_size: args.max_grid_size,
                },
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig::from(args);

    info!("Starting server...");
    info!("Serving assets from {}", config.assets_dir.display());
    info!(
        "Speed regenerates every {}s, up to {} clients",
        config.regen_interval.as_secs(),
        config.gateway.max_clients
    );

    let mut server = Server::new(config).await?;
    let handle = server.handle();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped with error: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            handle.shutdown();
        }
    }

    Ok(())
}

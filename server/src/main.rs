mod config;
mod office_server;
mod registry;
mod room;
mod room_actor;
mod tcp_command_handler;
mod tcp_handler;

use std::time::Duration;

use log::{error, info};
use shared::{
    DEFAULT_ROOM_HEIGHT, DEFAULT_ROOM_WIDTH, IDLE_TIMEOUT_SECS, TCP_PORT, types::RoomBounds,
};

use clap::Parser;

use crate::{config::ServerConfig, office_server::OfficeServer};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    tcp: String,

    #[arg(short, long, default_value_t = TCP_PORT)]
    port: u16,

    #[arg(long, default_value_t = DEFAULT_ROOM_WIDTH)]
    width: f64,

    #[arg(long, default_value_t = DEFAULT_ROOM_HEIGHT)]
    height: f64,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value_t = IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    #[arg(long, default_value_t = 64)]
    outbox_capacity: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !(args.width > 0.0 && args.height > 0.0) {
        error!("Room dimensions must be positive");
        return;
    }

    let config = ServerConfig {
        tcp_addr: format!("{}:{}", args.tcp, args.port),
        bounds: RoomBounds::new(args.width, args.height),
        idle_timeout: Duration::from_secs(args.idle_timeout.max(1)),
        outbox_capacity: args.outbox_capacity.max(1),
    };

    let server = match OfficeServer::bind(config).await {
        Ok(office_server) => office_server,
        Err(e) => {
            error!("Error binding: {}", e);
            return;
        }
    };

    match server.local_addr() {
        Ok(addr) => info!("Office server listening on TCP: {}", addr),
        Err(e) => error!("Error reading listener address: {}", e),
    }

    tokio::select! {
        result = server.listen() => {
            if let Err(e) = result {
                error!("{}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}

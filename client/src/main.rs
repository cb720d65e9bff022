mod call_mesh;
mod chat_router;
mod cli_display;
mod client;
mod command_interface;
mod config;
mod media;
mod position_sync;
mod room_mirror;
mod signaling;
mod transport;

use std::time::Duration;

use clap::Parser;
use rand::{Rng, rng, seq::IndexedRandom};
use shared::{DEFAULT_GRACE_MS, DEFAULT_TICK_MS, PROXIMITY_THRESHOLD, TCP_PORT, types::Position};

use crate::{client::OfficeClient, config::ClientConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(short, long)]
    username: Option<String>,

    /// Name shown to others; defaults to the username
    #[arg(short, long)]
    display_name: Option<String>,

    #[arg(short, long, default_value = "127.0.0.1")]
    server_address: String,

    #[arg(short, long, default_value_t = TCP_PORT)]
    port: u16,

    #[arg(short, long, default_value = "lobby")]
    room: String,

    #[arg(short, default_value_t = 100.0)]
    x: f64,

    #[arg(short, default_value_t = 100.0)]
    y: f64,

    #[arg(long, default_value_t = DEFAULT_TICK_MS)]
    tick_ms: u64,

    #[arg(long, default_value_t = DEFAULT_GRACE_MS)]
    grace_ms: u64,

    #[arg(long, default_value_t = PROXIMITY_THRESHOLD)]
    threshold: f64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // The terminal is the user interface, so only problems are logged by default.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let username = match args.username {
        Some(username) => username,
        None => generate_username(),
    };

    let mut config = ClientConfig::new(&username);
    config.server_addr = format!("{}:{}", args.server_address, args.port);
    config.room = args.room;
    config.display_name = args.display_name.unwrap_or(username);
    config.start = Position::new(args.x, args.y);
    config.tick = Duration::from_millis(args.tick_ms.max(1));
    config.threshold = args.threshold;
    config.mesh.grace = Duration::from_millis(args.grace_ms);

    if let Err(e) = OfficeClient::run(config).await {
        eprintln!("{}", e);
    }
}

fn generate_username() -> String {
    let adjectives = ["fast", "lazy", "cool", "smart", "brave"];
    let nouns = ["tiger", "eagle", "lion", "panda", "wolf"];

    let mut rng = rng();

    let adjective = adjectives.choose(&mut rng).unwrap_or(&"quiet");
    let noun = nouns.choose(&mut rng).unwrap_or(&"owl");
    let number: u16 = rng.random_range(1..9999);

    format!("{}-{}{}", adjective, noun, number)
}

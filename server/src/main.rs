use clap::Parser;
use log::{error, info};
use server::network::Server;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// UDP port for game traffic
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// TCP port for the HTTP stats surface
    #[arg(long, default_value = "8081")]
    http_port: u16,

    /// Tick rate (snapshots per second)
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Players per race room
    #[arg(short, long, default_value = "4")]
    room_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let address = format!("{}:{}", args.host, args.port);
    let tick_duration = Duration::from_secs_f32(1.0 / args.tick_rate as f32);

    info!("Starting server on {} ({} ticks/s)", address, args.tick_rate);
    let mut server = Server::new(&address, tick_duration, args.room_capacity).await?;

    let http_addr: SocketAddr = format!("{}:{}", args.host, args.http_port).parse()?;
    let api_state = server.api_state();
    tokio::spawn(async move {
        if let Err(e) = server::http::serve(http_addr, api_state).await {
            error!("HTTP surface failed: {}", e);
        }
    });

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

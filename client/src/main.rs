use clap::Parser;
use log::info;
use shared::GameMode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name to register with
    #[arg(short, long, default_value = "racer")]
    username: String,

    /// Queue for ranked races instead of casual
    #[arg(long)]
    ranked: bool,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "5")]
    max_reconnect_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mode = if args.ranked {
        GameMode::Ranked
    } else {
        GameMode::Casual
    };

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut client = client::network::Client::new(
        &args.server,
        &args.username,
        mode,
        args.max_reconnect_attempts,
    )
    .await?;

    client.run().await?;

    Ok(())
}

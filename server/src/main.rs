use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::warn;
use tokio::sync::mpsc;

use server::config::ServerConfig;
use server::extensions::{ExtensionInfo, WelcomeExtension};
use server::moderation::Moderation;
use server::network::{spawn_sender, Outbox, Transport, UdpTransport};
use server::world_points::WorldPoints;
use server::Server;

/// Main-method of the application.
/// Loads the consumed surfaces (config, rosters, scene points), wires the
/// transport to the server loop and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to bind the transport to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[clap(short, long, default_value = "5278")]
        port: u16,
        /// Server configuration file (key=value lines)
        #[clap(short, long, default_value = "server.cfg")]
        config: PathBuf,
        /// Banned peer identifiers, one per line (appended on ban)
        #[clap(long, default_value = "bans.txt")]
        bans: PathBuf,
        /// Admin peer identifiers, one per line
        #[clap(long, default_value = "admins.txt")]
        admins: PathBuf,
        /// Scene description to scan for spawn points
        #[clap(long, default_value = "main_zone.tscn")]
        scene: PathBuf,
    }

    let args = Args::parse();

    let config = match std::fs::read_to_string(&args.config) {
        Ok(text) => ServerConfig::parse(&text),
        Err(e) => {
            warn!(
                "config {} not readable ({}), using defaults",
                args.config.display(),
                e
            );
            ServerConfig::default()
        }
    };
    let moderation = Moderation::load(&args.bans, &args.admins);
    let points = match std::fs::read_to_string(&args.scene) {
        Ok(text) => WorldPoints::from_scene_text(&text),
        Err(e) => {
            warn!(
                "scene {} not readable ({}), world population disabled",
                args.scene.display(),
                e
            );
            WorldPoints::default()
        }
    };

    // Transport tasks feed the server loop; the sender task drains its outbox
    let address = format!("{}:{}", args.host, args.port);
    let transport = UdpTransport::bind(&address).await?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    transport.spawn_tasks(events_tx);

    let (outbox, outbound_rx) = Outbox::new();
    let sender = spawn_sender(Arc::clone(&transport) as Arc<dyn Transport>, outbound_rx);

    let mut game_server = Server::new(config, moderation, points, outbox);
    game_server.register_extension(
        ExtensionInfo::new("welcome", "core.welcome", "driftline"),
        Box::new(WelcomeExtension::new("Tight lines out there.")),
    );

    game_server
        .run(events_rx, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    // let the sender flush the closing broadcast before exiting
    let _ = sender.await;

    Ok(())
}

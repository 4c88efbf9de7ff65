//! Tandem sync server.
//!
//! Hosts collaborative text sessions over WebSocket. Configuration comes
//! from flags or `TANDEM_*` environment variables; logging from
//! `RUST_LOG`.

mod cli;

use clap::Parser;
use log::info;

use cli::Cli;
use tandem_collab::SyncServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.server_config();
    info!(
        "Starting Tandem sync server on {} (max {} per session)",
        config.bind_addr, config.max_peers_per_room
    );

    SyncServer::new(config).run().await
}

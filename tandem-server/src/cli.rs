//! Command-line arguments for the sync server.

use clap::Parser;
use tandem_collab::ServerConfig;

/// Collaborative text sync server
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Relays edits, cursors and comments between session participants")]
#[command(version)]
pub struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090", env = "TANDEM_BIND")]
    pub bind: String,

    /// Maximum participants per session
    #[arg(long, default_value_t = 100, env = "TANDEM_MAX_PEERS")]
    pub max_peers: usize,

    /// Fan-out queue length per session before slow participants lag
    #[arg(long, default_value_t = 256, env = "TANDEM_BROADCAST_CAPACITY")]
    pub broadcast_capacity: usize,

    /// Ask other participants for the document instead of answering
    /// late joiners from the server replica
    #[arg(long, env = "TANDEM_PEER_CATCH_UP")]
    pub peer_catch_up: bool,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_peers_per_room: self.max_peers,
            broadcast_capacity: self.broadcast_capacity,
            serve_document_state: !self.peer_catch_up,
        }
    }
}

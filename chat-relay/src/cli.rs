use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    hub::HubConfig,
    server::{DEFAULT_OUTBOX_CAPACITY, RelayConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, broadcasting every message to every connected client.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub listen: SocketAddr,

    /// How long one slow recipient may hold up a broadcast, in milliseconds.
    #[arg(long, default_value_t = 250)]
    pub send_timeout_ms: u64,

    /// Messages buffered per connection before deliveries start to wait.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Drop a client whose socket accepts nothing for this long, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            hub: HubConfig {
                send_timeout: Duration::from_millis(self.send_timeout_ms),
            },
            outbox_capacity: self.outbox_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Your name in the chat.
    #[arg(long)]
    pub username: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub server: SocketAddr,

    /// Recipient used when a line does not start with `@name`.
    #[arg(long, default_value = "all")]
    pub to: String,
}

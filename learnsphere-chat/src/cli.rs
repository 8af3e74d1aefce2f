use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{
    broker::{BrokerConfig, DEFAULT_OUTBOUND_CAPACITY, SenderPolicy, SlowConsumerPolicy},
    server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the course chat server, accepting WebSocket connections.
    Serve(ServeArgs),
    /// Join a course room and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "LEARNSPHERE_LISTEN", default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Do not echo a published message back to its sender.
    #[arg(long, env = "LEARNSPHERE_EXCLUDE_SENDER")]
    pub exclude_sender: bool,

    /// Messages buffered per connection before it counts as a slow consumer.
    #[arg(long, env = "LEARNSPHERE_OUTBOUND_CAPACITY", default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Disconnect slow consumers instead of dropping messages for them.
    #[arg(long, env = "LEARNSPHERE_DISCONNECT_SLOW_CONSUMERS")]
    pub disconnect_slow_consumers: bool,

    /// Browser origin allowed to reach the server. Repeat for several origins.
    #[arg(
        long = "allowed-origin",
        env = "LEARNSPHERE_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        let sender_policy = if self.exclude_sender {
            SenderPolicy::Exclude
        } else {
            SenderPolicy::Include
        };
        let slow_consumer = if self.disconnect_slow_consumers {
            SlowConsumerPolicy::Disconnect
        } else {
            SlowConsumerPolicy::Drop
        };

        ServerConfig {
            broker: BrokerConfig {
                sender_policy,
                slow_consumer,
                outbound_capacity: self.outbound_capacity,
            },
            allowed_origins: self.allowed_origins.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Course room to join.
    #[arg(long)]
    pub room: String,

    /// Identifier sent as the message sender.
    #[arg(long)]
    pub user_id: String,

    /// Display name shown to other members.
    #[arg(long)]
    pub name: String,

    /// Avatar URL sent with every message.
    #[arg(long, default_value = "")]
    pub avatar: String,

    /// WebSocket URL of the chat server.
    #[arg(long, default_value = "ws://127.0.0.1:5000/ws")]
    pub server: String,
}

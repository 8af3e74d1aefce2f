use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use learnsphere_chat::{
    cli::{Cli, Command, ServeArgs},
    client,
    server::Server,
};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Client(args) => client::run(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let server = Server::new(listener, args.server_config())?;

    // The end-to-end test reads the bound address off this line.
    info!("server listening on {}", server.local_addr()?);
    server
        .run_until_ctrl_c()
        .await
        .inspect_err(|err| error!("server stopped: {err:#}"))
}

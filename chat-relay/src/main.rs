use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use chat_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    server::Relay,
};

/// Logs go to stderr so they never interleave with chat lines on stdout.
/// `RUST_LOG` wins over `default_level`.
fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn serve(args: ServerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let relay = Relay::new(listener, args.relay_config());
    let addr = relay.local_addr()?;
    info!(%addr, send_timeout_ms = args.send_timeout_ms, "relay listening");

    relay.run_until_ctrl_c().await.context("relay stopped")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            init_tracing("info");
            serve(args).await
        }
        Command::Client(args) => {
            init_tracing("warn");
            client::run(args).await
        }
    }
}

mod broker;
mod cli;
mod client;
mod ipc;
mod session;
#[cfg(test)]
mod testing;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Broker(args) => {
            if let Err(e) = broker::run(args.into_config()).await {
                tracing::error!(error = %e, "broker failed");
                eprintln!("relayd broker: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { socket, action } => {
            if let Err(e) = client::run(socket, action).await {
                tracing::error!(error = %e, "client failed");
                eprintln!("relayd client: {e}");
                std::process::exit(1);
            }
        }
    }
}

use anyhow::Result;
use clap::{Parser, error::ErrorKind};
use tracing::warn;

use peer_ledger::{
    cli::{Cli, Command, USAGE},
    client,
    config::ServerConfig,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.print()?;
            return Ok(());
        }
        Err(_) => {
            println!("{USAGE}");
            return Ok(());
        }
    };

    match cli.command {
        Command::Server(args) => {
            let server = Server::bind(ServerConfig::from_args(&args)).await?;
            let addr = server.local_addr()?;
            println!("Waiting for peer connections on port {}", addr.port());
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

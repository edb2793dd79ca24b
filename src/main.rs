use clap::Parser;
use sshdeck_lib::{cli::Cli, commands, init_logging};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = commands::dispatch(cli).await {
        error!("command failed: {:#}", err);
        std::process::exit(1);
    }
}

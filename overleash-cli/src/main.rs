mod server;

use std::process;

use clap::{Parser, Subcommand};
use tracing::error;

use self::server::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "Overleash")]
#[command(version)]
#[command(about = "Caching mirror of an upstream feature-flag service with local overrides", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror upstream and serve the client, frontend and override APIs
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    let cli = Args::parse();
    match cli.cmd {
        Command::Serve(args) => {
            if let Err(e) = server::run_serve(args).await {
                error!(error = %e, "overleash stopped");
                eprintln!("{}", e);
                process::exit(1);
            }
        }
    }
}

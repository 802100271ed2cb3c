mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};

use serve::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "vmgate", version, about = "Request gateway backed by a WebAssembly VM")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway and its control socket until interrupted
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve::cmd_serve(&args).await,
    }
}

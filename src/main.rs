use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "distore")]
#[command(about = "Peer-to-peer content-addressed file store", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        listen: String,

        /// Peer addresses to dial at startup
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Storage root directory (derived from the listen address if omitted)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Hex-encoded 32-byte encryption key (generated if omitted)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Run a three-node demonstration on localhost
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            listen,
            bootstrap,
            root,
            key,
        } => {
            distore::commands::serve::run(listen, bootstrap, root, key).await?;
        }
        Commands::Demo => {
            distore::commands::demo::run().await?;
        }
    }

    Ok(())
}

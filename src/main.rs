use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use reify::config::EngineConfig;
use reify::engine::Engine;
use reify::{logging, server};

#[derive(Parser)]
#[command(name = "reify")]
#[command(version, about = "Iterative design-to-code refinement engine")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the engine: run control and the subscribe WebSocket
    Serve {
        /// Storage root (projects, artifacts, snapshots)
        #[arg(long, default_value = ".")]
        storage_dir: PathBuf,

        /// Port to listen on (overrides reify.toml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces and allow any origin
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Serve {
            storage_dir,
            port,
            dev,
        } => {
            let mut config = EngineConfig::load(&storage_dir)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if dev {
                config.server.dev_mode = true;
            }

            let engine = Engine::new(config);
            let _reaper = engine.sandbox().spawn_reaper();
            server::start_server(engine).await
        }
    }
}

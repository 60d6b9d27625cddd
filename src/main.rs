use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use slidegate::comms::local_api;
use slidegate::config::Config;
use slidegate::security::csrf::generate_token;
use slidegate::utils::logging;

#[derive(Parser)]
#[command(name = "slidegate", version, about = "Slide translation gateway")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print a freshly generated CSRF token
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let args = AppCli::parse();
    match args.command.unwrap_or(Commands::Serve { port: 8080 }) {
        Commands::Serve { port } => {
            let config = Config::load(&args.config)?;
            info!("Starting slidegate {} on port {port}", slidegate::VERSION);
            local_api::serve(config, port).await?;
        }
        Commands::Token => println!("{}", generate_token()),
    }

    Ok(())
}

// ABOUTME: Entry point for the coderun binary
// ABOUTME: Parses commands, installs logging and runs the server or lists languages

use clap::{Parser, Subcommand};
use coderun_cli::{load_languages, run_server, Config};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Table};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coderun")]
#[command(about = "Coderun - run untrusted code in sandboxed containers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind (overrides CODERUN_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// List the supported languages and their images
    Languages,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;

    match command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            run_server(config).await
        }
        Commands::Languages => {
            let registry = load_languages(&config)?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Language", "Name", "Aliases", "Image"]);
            for runtime in registry.list() {
                table.add_row(vec![
                    runtime.id.clone(),
                    runtime.display_name.clone(),
                    runtime.aliases.join(", "),
                    runtime.image.clone(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

// pairchat-server — signalling relay for two-party browser chat

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use pairchat_server::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pairchat-server")]
#[command(about = "Signalling relay for peer-to-peer browser chat", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (JSON); defaults to <config dir>/pairchat/relay.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Origin allowed by CORS
        #[arg(long)]
        frontend_origin: Option<String>,
        /// Emit logs as JSON lines
        #[arg(long)]
        log_json: bool,
    },
    /// Inspect or change the config file
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    Get { key: String },
    Set { key: String, value: String },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            frontend_origin,
            log_json,
        } => {
            init_tracing(log_json);
            cmd_serve(cli.config, port, frontend_origin).await
        }
        Commands::Config { action } => {
            init_tracing(false);
            cmd_config(cli.config, action.unwrap_or(ConfigAction::Show))
        }
    }
}

fn effective_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = Config::load(path.map(PathBuf::as_path))?;
    config.apply_env()?;
    Ok(config)
}

async fn cmd_serve(
    path: Option<PathBuf>,
    port: Option<u16>,
    frontend_origin: Option<String>,
) -> Result<()> {
    let mut config = effective_config(path.as_ref())?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(origin) = frontend_origin {
        config.frontend_origin = origin;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Starting pairchat relay v{} (origin {})",
        env!("CARGO_PKG_VERSION"),
        config.frontend_origin
    );
    pairchat_server::serve(&config).await
}

fn cmd_config(path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = effective_config(path.as_ref())?;
            println!("{}", "Effective configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<18} {}", key.bright_cyan(), value);
            }
            if let Err(e) = config.validate() {
                println!();
                println!("{} {}", "⚠".yellow(), e);
            }
        }
        ConfigAction::Get { key } => {
            let config = effective_config(path.as_ref())?;
            match config.get(&key) {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        ConfigAction::Set { key, value } => {
            // Writes the file only; environment overrides are not persisted
            let file = match path {
                Some(path) => path,
                None => Config::config_file()?,
            };
            let mut config = if file.exists() {
                Config::load_from(&file)?
            } else {
                Config::default()
            };
            config.set(&key, &value)?;
            config.save_to(&file)?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
    }
    Ok(())
}

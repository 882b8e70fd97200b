use clap::Parser;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use pdubridge::{Config, Manager, Result, logging};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// YAML configuration file; the default search paths are used when absent
    #[clap(short = 'c', long, env = "PDUBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `log_level` from the configuration
    #[clap(short = 'l', long)]
    log_level: Option<String>,

    /// Check the configuration and exit
    #[clap(long)]
    validate: bool,

    /// Print a configuration file with every default filled in and exit
    #[clap(long)]
    print_default: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("pdubridge: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    if args.print_default {
        print!("{}", serde_yaml::to_string(&Config::default())?);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    logging::init(&config.log_level)?;
    config.validate()?;

    if args.validate {
        println!(
            "Configuration OK: GWGJ server {}, {} Changsui PDU(s)",
            if config.server.enabled { "enabled" } else { "disabled" },
            config.changsui.len()
        );
        return Ok(());
    }

    if let Err(e) = Manager::maximize_fd_limit() {
        warn!("Could not raise file descriptor limit: {}", e);
    }

    info!("pdubridge {} starting", pdubridge::version());
    let manager = Manager::start(config).await?;

    let events = manager.events();
    futures_util::pin_mut!(events);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.next() => match event {
                Some(event) => debug!("{}", serde_json::to_string(&event)?),
                None => break,
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

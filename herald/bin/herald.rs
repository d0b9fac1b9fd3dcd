#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use herald::{
    config::{CampaignFile, HeraldConfig},
    controller::{Herald, SHUTDOWN_BROADCAST, shutdown},
};
use herald_common::{audit, logging};

#[derive(Parser)]
#[command(name = "herald", version, about = "Bulk campaign email sender")]
struct Cli {
    /// Configuration file (defaults to HERALD_CONFIG, ./herald.config.ron,
    /// /etc/herald/herald.config.ron)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a campaign to every recipient in its file
    Run {
        /// Campaign file (RON)
        #[arg(long)]
        campaign: PathBuf,

        /// Write the attempt log here, overriding the configuration
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Send one rendered message of a campaign to a single address
    TestSend {
        #[arg(long)]
        campaign: PathBuf,

        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init();

    let mut config = HeraldConfig::resolve(cli.config.as_deref())?;
    audit::init(config.engine.audit.clone());

    match cli.command {
        Command::Run { campaign, log } => {
            if log.is_some() {
                config.log_path = log;
            }
            let file = CampaignFile::load(&campaign)?;
            let herald = Herald::new(config);

            tokio::spawn(async {
                if let Err(e) = shutdown().await {
                    tracing::error!("Failed to install signal handlers: {e}");
                }
            });

            let snapshot = herald.run(file, SHUTDOWN_BROADCAST.subscribe()).await?;

            println!(
                "Run {} {}: {} sent, {} failed, {} retried, {} not attempted ({:.1}% in {:.1}s)",
                snapshot.run_id,
                snapshot.status,
                snapshot.counters.sent,
                snapshot.counters.failed,
                snapshot.counters.retried,
                snapshot.counters.queued,
                snapshot.progress(),
                snapshot.elapsed().as_secs_f64()
            );
            if let Some(reason) = snapshot.reason {
                println!("Reason: {reason}");
            }
        }
        Command::TestSend { campaign, to } => {
            let file = CampaignFile::load(&campaign)?;
            let accepted = Herald::new(config).send_test(file, &to).await?;
            println!(
                "Test message accepted for {to} ({})",
                accepted.provider_id.as_deref().unwrap_or("no provider id")
            );
        }
    }

    Ok(())
}

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use setu_ballot::{BallotBox, BallotStore, Candidate, MasterKey, SqliteRepository};
use setu_liveness::synthetic::scripted_pair;
use setu_liveness::{LivenessConfig, Outcome, SessionController};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod script;

use script::Script;

#[derive(Parser)]
#[command(name = "setu", version, about = "Liveness verification and ballot store")]
struct Cli {
    /// Liveness config (TOML). SETU_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a liveness session against a scripted camera feed
    Simulate {
        /// JSON feed script; a cooperative feed is used when omitted
        #[arg(long)]
        script: Option<PathBuf>,
        /// Present challenges in fixed order instead of shuffling
        #[arg(long)]
        in_order: bool,
    },
    /// Print the effective liveness config, or write it to a file
    Config {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Ballot store operations
    Vote {
        #[arg(long, env = "SETU_DB", default_value = "setu.db")]
        db: PathBuf,
        /// Master key, 64 hex characters
        #[arg(long, env = "SETU_MASTER_KEY", hide_env_values = true)]
        key: String,
        #[command(subcommand)]
        action: VoteCommand,
    },
}

#[derive(Subcommand)]
enum VoteCommand {
    /// Verify liveness, then cast one ballot
    Cast {
        #[arg(long)]
        citizen: String,
        #[arg(long)]
        candidate_id: u32,
        #[arg(long, default_value = "")]
        candidate_name: String,
        /// Feed script for the liveness check
        #[arg(long)]
        script: Option<PathBuf>,
    },
    /// Per-candidate counts
    Tally,
    /// Ballot totals and votes per hour
    Stats,
    /// Sealed ballots with truncated ciphertext
    List,
    /// Decrypt one ballot
    Open { id: i64 },
    /// Delete all sealed ballots
    Clear {
        /// Also delete tallies and anonymized entries
        #[arg(long)]
        tallies: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "setu_liveness=info,setu_ballot=info,setu=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = LivenessConfig::load_layered(cli.config.as_deref())?;

    match cli.cmd {
        Commands::Simulate { script, in_order } => {
            if in_order {
                config.timing.shuffle = false;
            }
            let outcome = run_liveness(config, load_script(script.as_deref())?).await?;
            report(&outcome);
            if !outcome.is_verified() {
                std::process::exit(1);
            }
        }
        Commands::Config { output } => match output {
            Some(path) => {
                config.save_to_file(&path)?;
                println!("Wrote config to {}", path.display());
            }
            None => print!("{}", config.to_toml_string()?),
        },
        Commands::Vote { db, key, action } => {
            let key = MasterKey::from_hex(&key)?;
            vote(&db, key, config, action).await?;
        }
    }
    Ok(())
}

async fn vote(
    db: &Path,
    key: MasterKey,
    config: LivenessConfig,
    action: VoteCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ballots = BallotBox::new(BallotStore::open(db, key)?, SqliteRepository::open(db)?);

    match action {
        VoteCommand::Cast {
            citizen,
            candidate_id,
            candidate_name,
            script,
        } => {
            if ballots.has_voted(&citizen)? {
                return Err(format!("citizen {} has already voted", citizen).into());
            }
            let outcome = run_liveness(config, load_script(script.as_deref())?).await?;
            report(&outcome);

            let candidate = Candidate {
                id: candidate_id,
                name: candidate_name,
            };
            let receipt = ballots.cast_with_outcome(&citizen, &candidate, &outcome)?;
            println!("Ballot {} recorded", receipt.ballot_id);
            println!("Receipt: {}", receipt.receipt);
        }
        VoteCommand::Tally => {
            println!("{}", serde_json::to_string_pretty(&ballots.store().tallies()?)?);
        }
        VoteCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&ballots.store().stats()?)?);
        }
        VoteCommand::List => {
            println!(
                "{}",
                serde_json::to_string_pretty(&ballots.store().list_redacted()?)?
            );
        }
        VoteCommand::Open { id } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&ballots.store().open_ballot(id)?)?
            );
        }
        VoteCommand::Clear { tallies } => {
            let removed = ballots.store_mut().clear_ballots()?;
            if tallies {
                ballots.store_mut().clear_all()?;
            }
            println!("Cleared {} ballots", removed);
        }
    }
    Ok(())
}

fn load_script(path: Option<&Path>) -> Result<Script, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Script::from_file(p),
        None => Ok(Script::cooperative()),
    }
}

/// Run one session over the scripted feed. Ctrl-C cancels it.
async fn run_liveness(
    config: LivenessConfig,
    script: Script,
) -> Result<Outcome, Box<dyn std::error::Error>> {
    let (source, detector) = scripted_pair(script.faces(), script.frame_interval());
    let mut session = SessionController::new(source, detector, config)
        .on_outcome(|outcome| info!(verified = outcome.is_verified(), "liveness session ended"));

    for (i, challenge) in session.plan().iter().enumerate() {
        println!("Challenge {}: {}", i + 1, challenge.instruction);
    }

    let handle = session.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling liveness session");
            handle.cancel().await;
        }
    });

    let result = session.run().await;
    interrupt.abort();
    Ok(result?)
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Verified { captured_image } => match captured_image {
            Some(image) => println!(
                "Liveness verified (captured {}x{} {}, {} bytes)",
                image.width,
                image.height,
                image.mime_type,
                image.data.len()
            ),
            None => println!("Liveness verified (no image captured)"),
        },
        Outcome::Failed { reason } => println!("Verification failed: {}", reason),
        Outcome::Cancelled => println!("Verification cancelled"),
    }
}

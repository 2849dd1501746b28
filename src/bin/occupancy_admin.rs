//! occupancy_admin - inspect or reset the occupancy session log

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use occupancy_kernel::{now_ms, EpochMillis, SessionStore, SqliteSessionStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the occupancy database.
    #[arg(long, env = "OCCUPANCY_DB_PATH", default_value = "occupancy.db")]
    db_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// All-time entered/exited counts and open sessions.
    Stats,
    /// Per-track dwell totals, including sessions still open.
    Durations,
    /// Logged events in [since, until), epoch milliseconds.
    Events {
        #[arg(long, default_value_t = 0)]
        since: EpochMillis,
        #[arg(long)]
        until: Option<EpochMillis>,
    },
    /// Delete every logged event and open session.
    Reset {
        /// Confirm the reset; nothing is deleted without it.
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut store = SqliteSessionStore::open(&args.db_path)?;

    match args.command {
        Command::Stats => {
            let counts = store.occupancy_counts()?;
            let open = store.open_session_count()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "entered": counts.entered,
                    "exited": counts.exited,
                    "open_sessions": open,
                }))?
            );
        }
        Command::Durations => {
            let durations = store.durations(now_ms()?)?;
            println!("{}", serde_json::to_string_pretty(&durations)?);
        }
        Command::Events { since, until } => {
            let until = until.unwrap_or(EpochMillis::MAX);
            if since > until {
                return Err(anyhow!("--since must not be after --until"));
            }
            let events = store.events_between(since, until)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Command::Reset { yes } => {
            if !yes {
                return Err(anyhow!(
                    "refusing to reset {} without --yes",
                    args.db_path
                ));
            }
            store.reset()?;
            log::warn!("occupancy log at {} reset", args.db_path);
        }
    }
    Ok(())
}

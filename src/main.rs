use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use plantkeeper_lib::config::SyncConfig;
use plantkeeper_lib::id::new_uuid_v7;
use plantkeeper_lib::logging::init_logging;
use plantkeeper_lib::time::now_ms;
use plantkeeper_lib::{db, AppState, ChangeOp, EntityKind, UserId};

/// Exit code for writes that need the user to pick a side.
const MANUAL_RESOLUTION_EXIT_CODE: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "plantkeeper", about = "Plant-care sync engine", version)]
struct Cli {
    /// JSON configuration file. Environment variables override its values.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or upgrade both databases.
    Migrate,
    /// Plant mutations, queued locally.
    #[command(subcommand)]
    Plant(PlantCommand),
    /// Log a care activity for a plant, queued locally.
    Care {
        #[arg(long)]
        plant: String,
        #[arg(long)]
        user: String,
        /// watering, fertilizing, pruning, repotting or observation.
        #[arg(long = "type")]
        activity_type: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Watering statistics for a user, from the local snapshot.
    Stats {
        #[arg(long)]
        user: String,
        /// Pull the user's plants from the authoritative store first.
        #[arg(long)]
        refresh: bool,
    },
    /// Inspect or resolve queued writes.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Push queued writes to the authoritative store.
    Reconcile,
    /// Run handlers until no event is deliverable.
    Settle,
    /// Reconcile, then settle.
    Sync,
    /// Run the handler engine until interrupted.
    Run,
    /// List events that exhausted their deliveries.
    DeadLetters,
}

#[derive(Debug, Subcommand)]
enum PlantCommand {
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        nickname: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        watering_days: Option<u32>,
    },
    Rename {
        id: String,
        nickname: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    List,
    /// Give a failed write a fresh retry budget.
    Retry { seq: i64 },
    /// Drop a queued write.
    Discard { seq: i64 },
}

fn main() {
    let cli = Cli::parse();
    let config = match SyncConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(2);
        }
    };
    if let Err(err) = init_logging(config.log_dir.as_deref()) {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };
    match runtime.block_on(handle_cli(cli.command, config)) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{serialized}");
    Ok(())
}

async fn handle_cli(command: Commands, config: SyncConfig) -> Result<i32> {
    if let Commands::Migrate = command {
        for path in [config.authority_db_path(), config.client_db_path()] {
            let pool = db::open_and_migrate(&path).await?;
            pool.close().await;
            println!("Migrated {}", path.display());
        }
        return Ok(0);
    }

    let state = AppState::open(config).await?;
    match command {
        Commands::Migrate => Ok(0),
        Commands::Plant(plant) => handle_plant(&state, plant).await,
        Commands::Care {
            plant,
            user,
            activity_type,
            notes,
        } => {
            let payload = json!({
                "plant_id": plant,
                "user_id": user,
                "activity_type": activity_type,
                "performed_at": now_ms(),
                "notes": notes,
            });
            mutate(&state, EntityKind::CareActivity, &new_uuid_v7(), ChangeOp::Create, payload).await
        }
        Commands::Stats { user, refresh } => {
            let user = UserId::new(user);
            if refresh {
                state
                    .client
                    .refresh_plants(&state.authority, &user)
                    .await?;
            }
            let stats = state.client.get_statistics(&user).await?;
            print_json(&stats)?;
            Ok(0)
        }
        Commands::Queue(queue) => handle_queue(&state, queue).await,
        Commands::Reconcile => {
            let report = state.reconcile().await?;
            print_json(&report)?;
            Ok(if report.manual.is_empty() {
                0
            } else {
                MANUAL_RESOLUTION_EXIT_CODE
            })
        }
        Commands::Settle => {
            let report = state.engine.run_until_idle().await?;
            print_json(&report)?;
            Ok(0)
        }
        Commands::Sync => {
            let (reconciled, settled) = state.sync().await?;
            print_json(&json!({ "reconcile": reconciled, "settle": settled }))?;
            Ok(if reconciled.manual.is_empty() {
                0
            } else {
                MANUAL_RESOLUTION_EXIT_CODE
            })
        }
        Commands::Run => {
            let (tx, rx) = watch::channel(false);
            let engine = state.engine.clone();
            let worker = tokio::spawn(async move { engine.run(rx).await });
            tokio::signal::ctrl_c().await.context("wait for interrupt")?;
            let _ = tx.send(true);
            worker.await.context("join engine task")??;
            Ok(0)
        }
        Commands::DeadLetters => {
            print_json(&state.bus.dead_letters().await?)?;
            Ok(0)
        }
    }
}

async fn mutate(state: &AppState, kind: EntityKind, id: &str, op: ChangeOp, payload: Value) -> Result<i32> {
    let result = state
        .client
        .apply_local_mutation(kind, id, op, payload)
        .await?;
    print_json(&result)?;
    Ok(0)
}

async fn handle_plant(state: &AppState, command: PlantCommand) -> Result<i32> {
    match command {
        PlantCommand::Add {
            user,
            nickname,
            location,
            watering_days,
        } => {
            let payload = json!({
                "owner_id": user,
                "nickname": nickname,
                "location": location,
                "watering_frequency_days": watering_days,
            });
            mutate(state, EntityKind::Plant, &new_uuid_v7(), ChangeOp::Create, payload).await
        }
        PlantCommand::Rename { id, nickname } => {
            mutate(state, EntityKind::Plant, &id, ChangeOp::Update, json!({ "nickname": nickname })).await
        }
        PlantCommand::Delete { id } => {
            mutate(state, EntityKind::Plant, &id, ChangeOp::Delete, Value::Null).await
        }
    }
}

async fn handle_queue(state: &AppState, command: QueueCommand) -> Result<i32> {
    let queue = state.client.queue();
    match command {
        QueueCommand::List => {
            print_json(&queue.list().await?)?;
            Ok(0)
        }
        QueueCommand::Retry { seq } => {
            if queue.retry_failed(seq).await? {
                println!("Write #{seq} scheduled for retry.");
                Ok(0)
            } else {
                eprintln!("Write #{seq} is not in the failed state.");
                Ok(1)
            }
        }
        QueueCommand::Discard { seq } => match queue.discard(seq).await? {
            Some(write) => {
                print_json(&write)?;
                Ok(0)
            }
            None => {
                eprintln!("No queued write #{seq}.");
                Ok(1)
            }
        },
    }
}

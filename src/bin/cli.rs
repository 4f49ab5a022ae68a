//! refsync CLI
//!
//! Local-first driver for the sync engine: registry setup, edits, locks,
//! conflict handling, and sync passes against a scripted remote.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use refsync::events::SubscriptionFilter;
use refsync::permissions::StaticPermissions;
use refsync::sync::{PassOutcome, ScriptedAdapter};
use refsync::types::*;
use refsync::SyncEngine;

#[derive(Parser)]
#[command(name = "refsync")]
#[command(about = "Reference library sync engine CLI")]
#[command(version)]
struct Cli {
    /// Database path (defaults to the platform data directory)
    #[arg(long, env = "REFSYNC_DB_PATH")]
    db_path: Option<String>,

    /// Actor name recorded on edits and resolutions
    #[arg(long, env = "REFSYNC_ACTOR", default_value = "local")]
    actor: String,

    /// Quiet period after an edit before the worker schedules a pass
    #[arg(long, env = "REFSYNC_DEBOUNCE_MS", default_value = "5000")]
    debounce_ms: u64,

    /// Periodic background pass interval in ms (0 disables)
    #[arg(long, env = "REFSYNC_INTERVAL_MS", default_value = "0")]
    interval_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a remote account connection
    Connect {
        /// Local user name
        user_id: String,
        /// Account identifier on the remote service
        account_id: String,
        /// Human-readable label
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Register a library under a connection
    AddLibrary {
        connection_id: i64,
        /// Library identifier on the remote service
        remote_id: String,
        name: String,
        /// personal or group
        #[arg(short, long, default_value = "personal")]
        kind: String,
        /// manual, latest_wins, auto_merge, admin_decides, owner_decides
        #[arg(short, long, default_value = "manual")]
        strategy: String,
    },
    /// List registered libraries
    Libraries,
    /// Change a library's conflict resolution strategy
    SetStrategy {
        library_id: i64,
        strategy: String,
    },
    /// Create an item
    Add {
        library_id: i64,
        /// 8-character external key (A-Z0-9)
        key: String,
        title: String,
        /// Extra fields as name=value (value parsed as JSON when possible)
        #[arg(short, long)]
        field: Vec<String>,
    },
    /// Edit an item; unlisted fields keep their stored values
    Edit {
        library_id: i64,
        key: String,
        /// Fields as name=value
        #[arg(short, long)]
        field: Vec<String>,
        /// Base version to write against (defaults to the current version)
        #[arg(short, long)]
        base: Option<i64>,
        /// Wait this long for a held hard lock before giving up
        #[arg(short, long)]
        wait_ms: Option<u64>,
    },
    /// Delete an item
    Rm {
        library_id: i64,
        key: String,
    },
    /// Show one item
    Show {
        library_id: i64,
        key: String,
    },
    /// List items in a library
    Items {
        library_id: i64,
        /// Include tombstones
        #[arg(short, long)]
        deleted: bool,
    },
    /// Show an item's modification history
    History {
        library_id: i64,
        key: String,
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// List conflicts awaiting action
    Conflicts {
        #[arg(short, long)]
        library: Option<i64>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: i64,
    },
    /// Resolve a pending conflict
    Resolve {
        conflict_id: String,
        /// Take the incoming side
        #[arg(long)]
        mine: bool,
        /// Keep the committed side
        #[arg(long)]
        theirs: bool,
        /// Explicit final payload as JSON
        #[arg(long)]
        json: Option<String>,
        /// Resolve to a deletion
        #[arg(long)]
        delete: bool,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Take a lock on an item
    Lock {
        library_id: i64,
        key: String,
        #[arg(short, long, default_value = "hard")]
        mode: String,
        /// Lock time-to-live in seconds
        #[arg(short, long)]
        ttl: Option<i64>,
    },
    /// Release a held lock
    Unlock {
        library_id: i64,
        key: String,
        #[arg(short, long, default_value = "hard")]
        mode: String,
    },
    /// Show who holds locks on an item
    Locks {
        library_id: i64,
        key: String,
    },
    /// Run a sync pass now
    Sync {
        library_id: Option<i64>,
        /// Sync every registered library
        #[arg(long)]
        all: bool,
    },
    /// Show recent sync passes for a library
    Passes {
        library_id: i64,
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },
    /// Per-library pending work and last pass
    Status,
    /// Print engine events as they happen
    Watch {
        #[arg(short, long)]
        library: Option<i64>,
    },
    /// Self-contained walkthrough against a scripted remote
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let db_path = match &cli.db_path {
        Some(path) => shellexpand::tilde(path).to_string(),
        None => default_db_path(),
    };
    let config = EngineConfig {
        db_path,
        sync_debounce_ms: cli.debounce_ms,
        sync_interval_ms: cli.interval_ms,
        ..EngineConfig::default()
    };

    let adapter = Arc::new(ScriptedAdapter::new());
    let engine = SyncEngine::start(
        config,
        adapter.clone(),
        Arc::new(StaticPermissions::permissive()),
    )?;

    match cli.command {
        Commands::Connect {
            user_id,
            account_id,
            label,
        } => {
            let connection = engine.register_connection(&user_id, &account_id, label.as_deref())?;
            println!(
                "Connection #{} ({} on {})",
                connection.id, connection.user_id, connection.account_id
            );
        }

        Commands::AddLibrary {
            connection_id,
            remote_id,
            name,
            kind,
            strategy,
        } => {
            let kind: LibraryKind = kind.parse().map_err(anyhow::Error::msg)?;
            let strategy: ResolutionStrategy = strategy.parse().map_err(anyhow::Error::msg)?;
            let library =
                engine.register_library(connection_id, &remote_id, &name, kind, strategy)?;
            println!("Library #{} \"{}\" [{}]", library.id, library.name, library.strategy);
        }

        Commands::Libraries => {
            for library in engine.list_libraries()? {
                println!(
                    "#{} \"{}\" remote {} [{}] cursor {}/{}",
                    library.id,
                    library.name,
                    library.remote_id,
                    library.strategy,
                    library.sync_cursor,
                    library.remote_version,
                );
            }
        }

        Commands::SetStrategy {
            library_id,
            strategy,
        } => {
            let strategy: ResolutionStrategy = strategy.parse().map_err(anyhow::Error::msg)?;
            engine.set_library_strategy(library_id, strategy)?;
            println!("Library #{} now resolves by {}", library_id, strategy);
        }

        Commands::Add {
            library_id,
            key,
            title,
            field,
        } => {
            let mut payload = parse_fields(&field)?;
            payload.insert("title".to_string(), serde_json::json!(title));
            let write = ProposedWrite::create(
                ItemKey::new(library_id, key),
                ItemKind::Record,
                payload,
                &cli.actor,
            );
            let outcome = engine.propose_local_edit(write, None).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Edit {
            library_id,
            key,
            field,
            base,
            wait_ms,
        } => {
            let item_key = ItemKey::new(library_id, key);
            let current = engine
                .get_item(&item_key)?
                .ok_or_else(|| anyhow::anyhow!("no item {}", item_key))?;
            let mut payload = current.payload.clone();
            payload.extend(parse_fields(&field)?);

            let write = ProposedWrite::update(
                item_key,
                base.unwrap_or(current.version),
                payload,
                &cli.actor,
            );
            let wait = wait_ms.map(std::time::Duration::from_millis);
            let outcome = engine.propose_local_edit(write, wait).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Rm { library_id, key } => {
            let item_key = ItemKey::new(library_id, key);
            let current = engine
                .get_item(&item_key)?
                .ok_or_else(|| anyhow::anyhow!("no item {}", item_key))?;
            let write = ProposedWrite::delete(
                item_key,
                current.version,
                current.payload.clone(),
                &cli.actor,
            );
            let outcome = engine.propose_local_edit(write, None).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Show { library_id, key } => {
            match engine.get_item(&ItemKey::new(library_id, key))? {
                Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                None => println!("not found"),
            }
        }

        Commands::Items {
            library_id,
            deleted,
        } => {
            for item in engine.list_items(library_id, deleted)? {
                let title = item
                    .payload
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(untitled)");
                println!(
                    "{} v{}{}{} {}",
                    item.external_key,
                    item.version,
                    if item.synced { "" } else { " *pending" },
                    if item.deleted { " (deleted)" } else { "" },
                    truncate(title, 60),
                );
            }
        }

        Commands::History {
            library_id,
            key,
            limit,
        } => {
            let records = engine.history(&ItemKey::new(library_id, key), limit, None)?;
            for record in records {
                let conflict_tag = if record.is_conflict {
                    match record.conflict_resolution.as_deref() {
                        Some(strategy) => format!(" [conflict: {}]", strategy),
                        None => " [conflict]".to_string(),
                    }
                } else {
                    String::new()
                };
                println!(
                    "v{} {} by {} ({}){}",
                    record.resulting_version,
                    record.operation.as_str(),
                    record.actor,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    conflict_tag,
                );
            }
        }

        Commands::Conflicts { library, limit } => {
            for conflict in engine.list_pending_conflicts(library, limit)? {
                println!(
                    "{} [{}] {}/{} v{} vs v{} by {}{} at {}",
                    conflict.id,
                    conflict.status.as_str(),
                    conflict.library_id,
                    conflict.external_key,
                    conflict.base_version,
                    conflict.current_version,
                    conflict.incoming_actor,
                    if conflict.strategy.requires_privilege() {
                        " (privileged)"
                    } else {
                        ""
                    },
                    conflict.detected_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }

        Commands::Resolve {
            conflict_id,
            mine,
            theirs,
            json,
            delete,
            notes,
        } => {
            let conflict = engine
                .get_conflict(&conflict_id)?
                .ok_or_else(|| anyhow::anyhow!("no conflict {}", conflict_id))?;

            let (payload, deleted) = if let Some(raw) = json {
                (serde_json::from_str(&raw)?, delete)
            } else if mine {
                (
                    conflict.incoming_payload.clone(),
                    delete || conflict.incoming_deleted,
                )
            } else if theirs {
                (conflict.current_payload.clone(), delete)
            } else {
                anyhow::bail!("pick a side: --mine, --theirs, or --json <payload>");
            };

            let outcome = engine
                .resolve_conflict(&conflict_id, payload, deleted, &cli.actor, notes)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Lock {
            library_id,
            key,
            mode,
            ttl,
        } => {
            let mode: LockMode = mode.parse().map_err(anyhow::Error::msg)?;
            let target = item_target(&engine, library_id, &key)?;
            let session = engine.acquire_lock(target, &cli.actor, mode, ttl)?;
            println!(
                "{} lock on {} held by {} until {}",
                session.mode.as_str(),
                key,
                session.holder,
                session.expires_at.format("%H:%M:%S"),
            );
        }

        Commands::Unlock {
            library_id,
            key,
            mode,
        } => {
            let mode: LockMode = mode.parse().map_err(anyhow::Error::msg)?;
            let target = item_target(&engine, library_id, &key)?;
            if engine.release_lock(target, &cli.actor, mode)? {
                println!("released");
            } else {
                println!("nothing held");
            }
        }

        Commands::Locks { library_id, key } => {
            let target = item_target(&engine, library_id, &key)?;
            match engine.lock_holder(target)? {
                Some(session) => println!(
                    "hard: {} until {}",
                    session.holder,
                    session.expires_at.format("%H:%M:%S")
                ),
                None => println!("hard: none"),
            }
            for session in engine.presence(target)? {
                println!(
                    "soft: {} until {}",
                    session.holder,
                    session.expires_at.format("%H:%M:%S")
                );
            }
        }

        Commands::Sync { library_id, all } => {
            if all {
                let libraries = engine.list_libraries()?;
                let passes = join_all(libraries.iter().map(|l| engine.sync_now(l.id))).await;
                for (library, outcome) in libraries.iter().zip(passes) {
                    print!("#{} \"{}\": ", library.id, library.name);
                    print_pass(&outcome?);
                }
            } else {
                let library_id =
                    library_id.ok_or_else(|| anyhow::anyhow!("give a library id or --all"))?;
                print_pass(&engine.sync_now(library_id).await?);
            }
        }

        Commands::Passes { library_id, limit } => {
            for summary in engine.pass_history(library_id, limit)? {
                print_pass(&PassOutcome::Ran(summary));
            }
        }

        Commands::Status => {
            for library in engine.list_libraries()? {
                let pending = engine.count_pending_changes(library.id)?;
                let open = engine.count_open_conflicts(Some(library.id))?;
                let last = engine
                    .last_pass(library.id)?
                    .map(|p| {
                        format!("{} at {}", p.state.as_str(), p.started_at.format("%H:%M:%S"))
                    })
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "#{} \"{}\": {} pending, {} conflicts, cursor {}, last pass {}",
                    library.id, library.name, pending, open, library.sync_cursor, last,
                );
            }
        }

        Commands::Watch { library } => {
            let filter = SubscriptionFilter {
                library_ids: library.map(|id| vec![id]),
                kinds: None,
            };
            let mut rx = engine.subscribe();
            println!("watching engine events (ctrl-c to stop)");
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if filter.matches(&event) {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("lagged, {} events dropped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        Commands::Demo => run_demo(&engine, &adapter).await?,
    }

    engine.stop().await?;
    Ok(())
}

/// Walk one library through pull, a field-level merge, and push
async fn run_demo(engine: &SyncEngine, adapter: &ScriptedAdapter) -> anyhow::Result<()> {
    let connection = engine.register_connection("demo", "demo-account", None)?;
    let library = engine.register_library(
        connection.id,
        "demo-library",
        "Demo Papers",
        LibraryKind::Personal,
        ResolutionStrategy::AutoMerge,
    )?;
    println!("Registered library #{} \"{}\"", library.id, library.name);

    adapter.stage_update(
        "demo-library",
        "AAAA0001",
        1,
        payload_of(&[("title", "Attention Is All You Need"), ("year", "2017")]),
    );
    adapter.stage_update(
        "demo-library",
        "BBBB0002",
        2,
        payload_of(&[("title", "The Annotated Transformer")]),
    );
    println!("\nPulling two staged remote changes:");
    print_pass(&engine.sync_now(library.id).await?);

    let key = ItemKey::new(library.id, "AAAA0001");
    let item = engine
        .get_item(&key)?
        .ok_or_else(|| anyhow::anyhow!("demo item vanished"))?;
    let mut edited = item.payload.clone();
    edited.insert("tags".to_string(), serde_json::json!(["to-read"]));
    engine
        .propose_local_edit(
            ProposedWrite::update(key.clone(), item.version, edited, "demo"),
            None,
        )
        .await?;
    println!("\nLocal edit added tags; remote meanwhile refines the year:");

    let mut remote_fix = item.payload.clone();
    remote_fix.insert("year".to_string(), serde_json::json!("2017-06"));
    adapter.stage_update("demo-library", "AAAA0001", 3, remote_fix);
    print_pass(&engine.sync_now(library.id).await?);

    let merged = engine
        .get_item(&key)?
        .ok_or_else(|| anyhow::anyhow!("demo item vanished"))?;
    println!("\nMerged item (both sides kept):");
    println!("{}", serde_json::to_string_pretty(&merged)?);

    for (library_remote_id, external_key, version) in adapter.pushed() {
        println!(
            "pushed {}/{} v{} back to the remote",
            library_remote_id, external_key, version
        );
    }
    Ok(())
}

fn print_pass(outcome: &PassOutcome) {
    match outcome {
        PassOutcome::Ran(summary) => println!(
            "pass #{} {}: processed {} (+{} ~{} -{}) conflicted {} pushed {} rejected {} cursor {} -> {}",
            summary.id,
            summary.state.as_str(),
            summary.processed,
            summary.added,
            summary.updated,
            summary.deleted,
            summary.conflicted,
            summary.pushed,
            summary.push_rejected,
            summary.cursor_before,
            summary.cursor_after,
        ),
        PassOutcome::AlreadyRunning => println!("a pass is already running"),
    }
}

fn item_target(engine: &SyncEngine, library_id: i64, key: &str) -> anyhow::Result<LockTarget> {
    let item_key = ItemKey::new(library_id, key);
    let item = engine
        .get_item(&item_key)?
        .ok_or_else(|| anyhow::anyhow!("no item {}", item_key))?;
    Ok(LockTarget::item(item.id))
}

/// name=value pairs; values parse as JSON where possible, else as strings
fn parse_fields(fields: &[String]) -> anyhow::Result<ItemPayload> {
    let mut payload = ItemPayload::new();
    for field in fields {
        let (name, raw) = field
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("field must be name=value: {}", field))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!(raw));
        payload.insert(name.to_string(), value);
    }
    Ok(payload)
}

fn payload_of(fields: &[(&str, &str)]) -> ItemPayload {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), serde_json::json!(value)))
        .collect()
}

fn default_db_path() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("refsync")
        .join("refsync.db")
        .to_string_lossy()
        .to_string()
}

fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or(s);
    if first_line.len() <= max {
        first_line.to_string()
    } else {
        format!("{}...", &first_line[..max - 3])
    }
}

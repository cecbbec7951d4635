//! claimq CLI: operator interface to a claim-coordinated item pool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use claimq::config::{Backend, Config};
use claimq::model::{Answers, ItemId, ItemState, NewWorkItem, Owner, SubmissionFilter, WorkItem};
use claimq::store::fs::FsStore;
use claimq::store::postgres::PgStore;
use claimq::telemetry::{TelemetryConfig, init_telemetry};
use claimq::{LeaseManager, Store};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

/// Exit status for "you did not get / no longer hold the item".
const CONTENTION: u8 = 2;

#[derive(Parser)]
#[command(name = "claimq", about = "Lease-based claim coordination for shared work pools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Claim one unclaimed item
    Claim {
        /// Owner token
        #[arg(long)]
        owner: Owner,
    },
    /// Extend a lease you hold
    Renew {
        id: ItemId,
        #[arg(long)]
        owner: Owner,
        /// Lease length in seconds (defaults to CLAIMQ_LEASE_TTL_SECS)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Give an item back to the pool
    Abandon {
        id: ItemId,
        #[arg(long)]
        owner: Owner,
    },
    /// Commit answers for an item you hold
    Complete {
        id: ItemId,
        #[arg(long)]
        owner: Owner,
        /// JSON object mapping question id to chosen option key
        #[arg(long)]
        answers: PathBuf,
        /// Accept answer sets with missing or unknown entries
        #[arg(long)]
        allow_partial: bool,
    },
    /// Return expired leases to the pool
    Sweep,
    /// Item counts per state
    Status,
    /// Show one item
    Show { id: ItemId },
    /// List items
    List {
        /// Filter by state (unclaimed, claimed, done)
        #[arg(long)]
        state: Option<ItemState>,
    },
    /// List recorded submissions
    Submissions {
        #[arg(long)]
        item: Option<ItemId>,
        #[arg(long)]
        owner: Option<Owner>,
    },
    /// Load JSONL item files from a directory into the configured store
    Import {
        #[arg(long)]
        from: PathBuf,
    },
    /// Apply database migrations (postgres backend)
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from(&config))?;

    let store = open_store(&config).await?;
    let leases = LeaseManager::new(store, config.lease_policy());

    match cli.command {
        Command::Claim { owner } => cmd_claim(&leases, &owner).await,
        Command::Renew {
            id,
            owner,
            ttl_secs,
        } => {
            let ttl = ttl_secs.map(Duration::from_secs).unwrap_or(leases.ttl());
            contention(
                leases.renew(&id, &owner, ttl).await?,
                &format!("Renewed {id} for {}s", ttl.as_secs()),
                &format!("{id} is no longer held by {owner}"),
            )
        }
        Command::Abandon { id, owner } => contention(
            leases.abandon(&id, &owner).await?,
            &format!("Abandoned {id}"),
            &format!("{id} was not held by {owner}; nothing to undo"),
        ),
        Command::Complete {
            id,
            owner,
            answers,
            allow_partial,
        } => cmd_complete(&leases, id, owner, &answers, allow_partial).await,
        Command::Sweep => {
            let reclaimed = leases.reap_expired().await?;
            println!("Reclaimed {reclaimed} expired lease(s)");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => cmd_status(&leases).await,
        Command::Show { id } => cmd_show(&leases, &id).await,
        Command::List { state } => cmd_list(&leases, state).await,
        Command::Submissions { item, owner } => {
            let filter = SubmissionFilter { item_id: item, owner };
            cmd_submissions(&leases, &filter).await
        }
        Command::Import { from } => cmd_import(leases.store(), &from).await,
        Command::Migrate => {
            // open_store already applied migrations.
            match config.backend {
                Backend::Postgres { .. } => println!("Migrations applied"),
                Backend::Fs { .. } => println!("Filesystem backend has no migrations"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match &config.backend {
        Backend::Fs { root } => {
            let store = FsStore::open(root)
                .with_context(|| format!("opening items directory {}", root.display()))?;
            Ok(Arc::new(store))
        }
        Backend::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PgStore::connect(database_url.expose_secret(), *max_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

fn contention(held: bool, ok: &str, lost: &str) -> anyhow::Result<ExitCode> {
    if held {
        println!("{ok}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{lost}");
        Ok(ExitCode::from(CONTENTION))
    }
}

async fn cmd_claim(leases: &LeaseManager, owner: &Owner) -> anyhow::Result<ExitCode> {
    match leases.claim(owner).await? {
        Some(item) => {
            println!("{}", item.id);
            if let Some(expiry) = item.lease_expiry() {
                println!("  lease expires {}", expiry.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!("  {} question(s)", item.payload.question_count());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("No claimable items right now.");
            Ok(ExitCode::from(CONTENTION))
        }
    }
}

async fn cmd_complete(
    leases: &LeaseManager,
    id: ItemId,
    owner: Owner,
    answers_path: &Path,
    allow_partial: bool,
) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(answers_path)
        .with_context(|| format!("reading {}", answers_path.display()))?;
    let answers: Answers = serde_json::from_str(&text)
        .with_context(|| format!("parsing answers in {}", answers_path.display()))?;

    if !allow_partial {
        let item = leases
            .item(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no work item {id}"))?;
        let problems = item.payload.validate_answers(&answers);
        if !problems.is_empty() {
            for problem in &problems {
                eprintln!("  {problem}");
            }
            anyhow::bail!(
                "{} problem(s) in answers for {id}; pass --allow-partial to submit anyway",
                problems.len()
            );
        }
    }

    contention(
        leases.complete(&id, &owner, &answers).await?,
        &format!("Completed {id}"),
        &format!("{id} is not held by {owner}; discard these answers and claim again"),
    )
}

async fn cmd_status(leases: &LeaseManager) -> anyhow::Result<ExitCode> {
    let stats = leases.stats().await?;
    println!("backend:   {}", leases.store().backend());
    println!("unclaimed: {}", stats.unclaimed);
    println!("claimed:   {}", stats.claimed);
    println!("done:      {}", stats.done);
    println!("total:     {}", stats.total());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_show(leases: &LeaseManager, id: &ItemId) -> anyhow::Result<ExitCode> {
    let item = leases
        .item(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no work item {id}"))?;

    println!("Item:      {}", item.id);
    println!("State:     {}", item.state);
    if let Some(lease) = &item.lease {
        println!("Owner:     {}", lease.owner);
        let expired = if lease.is_expired_at(chrono::Utc::now()) {
            " (expired, not yet reclaimed)"
        } else {
            ""
        };
        println!(
            "Expires:   {}{expired}",
            lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(by) = &item.completed_by {
        println!("Completed: by {by}");
    }
    if let Some(at) = item.completed_at {
        println!("           at {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !item.payload.meta.is_empty() {
        println!("Meta:      {}", serde_json::to_string(&item.payload.meta)?);
    }
    println!("Questions: {}", item.payload.question_count());
    for (i, q) in item.payload.questions.iter().enumerate() {
        let keys: Vec<&str> = q.options.iter().map(|o| o.key.as_str()).collect();
        println!("  {:>3}. [{}] {} ({})", i + 1, q.qid, q.prompt, keys.join("/"));
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(leases: &LeaseManager, state: Option<ItemState>) -> anyhow::Result<ExitCode> {
    let items: Vec<WorkItem> = leases
        .items()
        .await?
        .into_iter()
        .filter(|item| state.is_none_or(|s| item.state == s))
        .collect();

    if items.is_empty() {
        println!("No work items found.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<48}  {:<10}  {:<20}  EXPIRES", "ID", "STATE", "OWNER");
    println!("{}", "-".repeat(100));
    for item in &items {
        let owner = item
            .owner()
            .or(item.completed_by.as_ref())
            .map(Owner::as_str)
            .unwrap_or("-");
        let expires = item
            .lease_expiry()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<48}  {:<10}  {:<20}  {}", item.id, item.state, owner, expires);
    }

    println!("\n{} item(s)", items.len());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_submissions(
    leases: &LeaseManager,
    filter: &SubmissionFilter,
) -> anyhow::Result<ExitCode> {
    let submissions = leases.submissions(filter).await?;
    for submission in &submissions {
        println!("{}", serde_json::to_string(submission)?);
    }
    eprintln!("{} submission(s)", submissions.len());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_import(store: &dyn Store, from: &Path) -> anyhow::Result<ExitCode> {
    let source = FsStore::open(from)
        .with_context(|| format!("opening import directory {}", from.display()))?;
    let items: Vec<NewWorkItem> = source
        .list()
        .await?
        .into_iter()
        .map(NewWorkItem::from)
        .collect();

    let inserted = store.insert_items(&items).await?;
    println!(
        "Imported {inserted} new item(s); {} already present",
        items.len() as u64 - inserted
    );
    Ok(ExitCode::SUCCESS)
}

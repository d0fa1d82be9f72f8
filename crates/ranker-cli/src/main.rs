use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use ranker_api::auth::hash_password;
use ranker_core::{process_vote, select_pair_for_user, Item, Vote};
use ranker_store_sqlite::SqliteStore;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Ranker administration CLI")]
struct Cli {
    #[arg(long, env = "RANKER_DB", default_value = "./ranker.sqlite3")]
    db: PathBuf,

    /// Log filter for stderr output; `RUST_LOG` takes precedence.
    #[arg(long, env = "RANKER_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Item {
        #[command(subcommand)]
        command: Box<ItemCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Compare {
        #[command(subcommand)]
        command: Box<CompareCommand>,
    },
    Score {
        #[command(subcommand)]
        command: Box<ScoreCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Drop every item, user and score and recreate an empty schema.
    Reset,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    Add(ItemAddArgs),
    List,
    Show(NameArgs),
    Remove(NameArgs),
}

#[derive(Debug, Args)]
struct ItemAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
struct NameArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Add(UserAddArgs),
    List,
    Remove(NameArgs),
}

#[derive(Debug, Args)]
struct UserAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, env = "RANKER_USER_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Debug, Subcommand)]
enum CompareCommand {
    Next(CompareNextArgs),
    Vote(CompareVoteArgs),
}

#[derive(Debug, Args)]
struct CompareNextArgs {
    #[arg(long)]
    user: String,
    /// Seed the pair selection for reproducible output.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct CompareVoteArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    item1: String,
    #[arg(long)]
    item2: String,
    #[arg(long)]
    winner: String,
}

#[derive(Debug, Subcommand)]
enum ScoreCommand {
    Global(ScoreGlobalArgs),
    User(ScoreUserArgs),
    Rankings(ScoreRankingsArgs),
}

#[derive(Debug, Args)]
struct ScoreGlobalArgs {
    #[arg(long)]
    item: String,
}

#[derive(Debug, Args)]
struct ScoreUserArgs {
    #[arg(long)]
    item: String,
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
struct ScoreRankingsArgs {
    /// Rank one user's ladder instead of the global one.
    #[arg(long)]
    user: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Item { command } => {
            store.migrate()?;
            run_item(*command, &mut store)
        }
        Command::User { command } => {
            store.migrate()?;
            run_user(*command, &mut store)
        }
        Command::Compare { command } => {
            store.migrate()?;
            run_compare(*command, &mut store)
        }
        Command::Score { command } => {
            store.migrate()?;
            run_score(*command, &store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Reset => run_db_reset(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    let applied = store.migrate()?;
    let after = store.schema_status()?;
    emit_json(json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": applied,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_reset(store: &mut SqliteStore) -> Result<()> {
    store.reset()?;
    store.migrate()?;
    let status = store.schema_status()?;
    tracing::warn!("database reset");
    emit_json(json!({
        "reset": true,
        "current_version": status.current_version
    }))
}

fn run_item(command: ItemCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        ItemCommand::Add(args) => {
            let name = args.name.trim();
            if name.is_empty() {
                return Err(anyhow!("item name must not be empty"));
            }
            let item = Item { name: name.to_string(), description: args.description };
            store.upsert_item(&item)?;
            tracing::info!(item = %item.name, "item saved");
            emit_json(serde_json::to_value(&item)?)
        }
        ItemCommand::List => {
            let items = store.all_items()?;
            emit_json(json!({ "items": items }))
        }
        ItemCommand::Show(args) => {
            let item = store
                .find_item(&args.name)?
                .ok_or_else(|| anyhow!("item not found: {}", args.name))?;
            emit_json(serde_json::to_value(&item)?)
        }
        ItemCommand::Remove(args) => {
            if !store.delete_item(&args.name)? {
                return Err(anyhow!("item not found: {}", args.name));
            }
            emit_json(json!({ "deleted": args.name }))
        }
    }
}

fn run_user(command: UserCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        UserCommand::Add(args) => {
            let name = args.name.trim();
            if name.is_empty() || args.password.is_empty() {
                return Err(anyhow!("user name and password must not be empty"));
            }
            if name == ranker_api::ADMIN_USER {
                return Err(anyhow!(
                    "user name {name} is reserved; start ranker-service with --admin-password"
                ));
            }
            let hash = hash_password(&args.password)?;
            if !store.insert_user(name, &hash)? {
                return Err(anyhow!("user already exists: {name}"));
            }
            tracing::info!(user = name, "user added");
            emit_json(json!({ "name": name }))
        }
        UserCommand::List => {
            let users = store
                .list_users()?
                .into_iter()
                .map(|user| json!({ "name": user.name, "created_at": user.created_at }))
                .collect::<Vec<_>>();
            emit_json(json!({ "users": users }))
        }
        UserCommand::Remove(args) => {
            if !store.delete_user(&args.name)? {
                return Err(anyhow!("user not found: {}", args.name));
            }
            emit_json(json!({ "deleted": args.name }))
        }
    }
}

fn require_user(store: &SqliteStore, name: &str) -> Result<()> {
    store.find_user(name)?.map(|_| ()).ok_or_else(|| anyhow!("user not found: {name}"))
}

fn run_compare(command: CompareCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        CompareCommand::Next(args) => {
            require_user(store, &args.user)?;
            let mut rng: Box<dyn RngCore> = match args.seed {
                Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
                None => Box::new(rand::thread_rng()),
            };
            let pair = select_pair_for_user(&*store, &args.user, &mut *rng)
                .with_context(|| format!("failed to select a pair for {}", args.user))?;
            emit_json(json!({ "user": args.user, "item1": pair.item1, "item2": pair.item2 }))
        }
        CompareCommand::Vote(args) => {
            let vote = Vote { item1: args.item1, item2: args.item2, winner: args.winner };
            vote.validate()?;
            require_user(store, &args.user)?;
            for name in [&vote.item1, &vote.item2] {
                if store.find_item(name)?.is_none() {
                    return Err(anyhow!("item not found: {name}"));
                }
            }
            process_vote(store, &args.user, &vote)?;
            emit_json(json!({ "user": args.user, "recorded": true }))
        }
    }
}

fn run_score(command: ScoreCommand, store: &SqliteStore) -> Result<()> {
    match command {
        ScoreCommand::Global(args) => {
            let score = store
                .fetch_global_score(&args.item)?
                .ok_or_else(|| anyhow!("no votes recorded for item {}", args.item))?;
            emit_json(serde_json::to_value(&score)?)
        }
        ScoreCommand::User(args) => {
            let score = store.fetch_user_score(&args.item, &args.user)?.ok_or_else(|| {
                anyhow!("no votes by {} recorded for item {}", args.user, args.item)
            })?;
            emit_json(serde_json::to_value(&score)?)
        }
        ScoreCommand::Rankings(args) => match args.user {
            Some(user) => {
                let scores = store.user_rankings(&user)?;
                emit_json(json!({ "user": user, "rankings": scores }))
            }
            None => emit_json(json!({ "rankings": store.global_rankings()? })),
        },
    }
}

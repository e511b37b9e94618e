use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use permissions_core::{PermissionEngine, PrincipalId, PrincipalKind, Principals};
use permissions_store_sqlite::{PermissionsConfig, SqliteStore};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "perms")]
#[command(about = "Permission groups CLI")]
struct Cli {
    /// YAML file with database path, table names and busy timeout.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured database path.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
    Player {
        #[command(subcommand)]
        command: PrincipalCommand,
    },
    Tribe {
        #[command(subcommand)]
        command: PrincipalCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Create tables, upgrade older layouts and seed built-in groups.
    Init,
}

#[derive(Debug, Subcommand)]
enum GroupCommand {
    List,
    Create(GroupArgs),
    Delete(GroupArgs),
    Grant(PermissionArgs),
    Revoke(PermissionArgs),
    Show(GroupArgs),
    Members(MembersArgs),
}

#[derive(Debug, Args)]
struct GroupArgs {
    group: String,
}

#[derive(Debug, Args)]
struct PermissionArgs {
    group: String,
    permission: String,
}

#[derive(Debug, Args)]
struct MembersArgs {
    group: String,
    #[arg(long, value_enum, default_value_t = KindArg::Player)]
    kind: KindArg,
    #[command(flatten)]
    at: AtArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Player,
    Tribe,
}

#[derive(Debug, Args)]
struct AtArgs {
    /// Evaluate at this epoch second instead of now.
    #[arg(long)]
    at: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum PrincipalCommand {
    Groups(IdArgs),
    Permissions(IdArgs),
    Add(MembershipArgs),
    Remove(MembershipArgs),
    AddTimed(TimedArgs),
    RemoveTimed(MembershipArgs),
    Show(IdArgs),
}

#[derive(Debug, Args)]
struct IdArgs {
    id: String,
    #[command(flatten)]
    at: AtArgs,
}

#[derive(Debug, Args)]
struct MembershipArgs {
    id: String,
    group: String,
}

#[derive(Debug, Args)]
struct TimedArgs {
    id: String,
    group: String,
    #[arg(long, allow_negative_numbers = true)]
    duration_secs: i64,
    /// Zero or negative makes the grant active immediately.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    delay_secs: i64,
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
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(cli: &Cli) -> Result<PermissionsConfig> {
    let mut config = match cli.config.as_ref() {
        Some(path) => PermissionsConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PermissionsConfig::default(),
    };
    if let Some(db) = cli.db.as_ref() {
        config.database.clone_from(db);
    }
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = config.open_store()?;
    let engine = PermissionEngine::new(store);
    let report = engine.bootstrap().context("failed to load permission state")?;

    match cli.command {
        Command::Db { command: DbCommand::Init } => emit_json(serde_json::json!({
            "database": config.database.display().to_string(),
            "tables": config.tables,
            "groups": report.groups,
            "players": report.players,
            "tribes": report.tribes,
            "schema_upgraded": report.schema_upgraded,
            "skipped": report.skipped
        })),
        Command::Group { command } => run_group(command, &engine),
        Command::Player { command } => run_principal(command, &engine.players(), engine.now()),
        Command::Tribe { command } => run_principal(command, &engine.tribes(), engine.now()),
    }
}

fn run_group(command: GroupCommand, engine: &PermissionEngine<SqliteStore>) -> Result<()> {
    let groups = engine.groups();
    match command {
        GroupCommand::List => {
            let listed = groups
                .list_all()
                .into_iter()
                .map(|name| {
                    let permissions = groups.permissions_of(&name);
                    serde_json::json!({ "name": name, "permissions": permissions })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "groups": listed }))
        }
        GroupCommand::Create(args) => {
            groups.create(&args.group)?;
            emit_json(serde_json::json!({ "group": args.group, "created": true }))
        }
        GroupCommand::Delete(args) => {
            let purged = groups.delete(&args.group)?;
            emit_json(serde_json::json!({
                "group": args.group,
                "deleted": true,
                "purged_principals": purged
            }))
        }
        GroupCommand::Grant(args) => {
            groups.grant(&args.group, &args.permission)?;
            emit_json(serde_json::json!({
                "group": args.group,
                "granted": args.permission,
                "permissions": groups.permissions_of(&args.group)
            }))
        }
        GroupCommand::Revoke(args) => {
            groups.revoke(&args.group, &args.permission)?;
            emit_json(serde_json::json!({
                "group": args.group,
                "revoked": args.permission,
                "permissions": groups.permissions_of(&args.group)
            }))
        }
        GroupCommand::Show(args) => {
            if !groups.exists(&args.group) {
                return Err(anyhow!("group `{}` does not exist", args.group));
            }
            emit_json(serde_json::json!({
                "group": args.group,
                "permissions": groups.permissions_of(&args.group)
            }))
        }
        GroupCommand::Members(args) => {
            let at = args.at.at.unwrap_or_else(|| engine.now());
            let (kind, members) = match args.kind {
                KindArg::Player => (
                    PrincipalKind::Player,
                    serde_json::to_value(engine.players().list_members_at(&args.group, at))?,
                ),
                KindArg::Tribe => (
                    PrincipalKind::Tribe,
                    serde_json::to_value(engine.tribes().list_members_at(&args.group, at))?,
                ),
            };
            emit_json(serde_json::json!({
                "group": args.group,
                "kind": kind,
                "at": at,
                "members": members
            }))
        }
    }
}

fn parse_id<I>(raw: &str) -> Result<I>
where
    I: PrincipalId + FromStr,
    I::Err: Display,
{
    raw.parse::<I>().map_err(|err| anyhow!("invalid {} id `{raw}`: {err}", I::KIND))
}

fn run_principal<I>(
    command: PrincipalCommand,
    principals: &Principals<'_, SqliteStore, I>,
    now: i64,
) -> Result<()>
where
    I: PrincipalId + FromStr + Serialize,
    I::Err: Display,
{
    let kind = I::KIND;
    match command {
        PrincipalCommand::Groups(args) => {
            let id = parse_id::<I>(&args.id)?;
            let at = args.at.at.unwrap_or(now);
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "at": at,
                "groups": principals.effective_groups(id, at)
            }))
        }
        PrincipalCommand::Permissions(args) => {
            let id = parse_id::<I>(&args.id)?;
            let at = args.at.at.unwrap_or(now);
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "at": at,
                "permissions": principals.permissions(id, at)
            }))
        }
        PrincipalCommand::Add(args) => {
            let id = parse_id::<I>(&args.id)?;
            principals.add_to_group(id, &args.group)?;
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "group": args.group,
                "added": true
            }))
        }
        PrincipalCommand::Remove(args) => {
            let id = parse_id::<I>(&args.id)?;
            principals.remove_from_group(id, &args.group)?;
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "group": args.group,
                "removed": true
            }))
        }
        PrincipalCommand::AddTimed(args) => {
            let id = parse_id::<I>(&args.id)?;
            principals.add_to_timed_group(id, &args.group, args.duration_secs, args.delay_secs)?;
            let entry = principals
                .record(id)
                .and_then(|record| record.timed_entry(&args.group).cloned());
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "group": args.group,
                "added": true,
                "entry": entry
            }))
        }
        PrincipalCommand::RemoveTimed(args) => {
            let id = parse_id::<I>(&args.id)?;
            principals.remove_from_timed_group(id, &args.group)?;
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "group": args.group,
                "removed": true
            }))
        }
        PrincipalCommand::Show(args) => {
            let id = parse_id::<I>(&args.id)?;
            let at = args.at.at.unwrap_or(now);
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "at": at,
                "exists": principals.exists(id),
                "record": principals.record(id),
                "effective_groups": principals.effective_groups(id, at)
            }))
        }
    }
}

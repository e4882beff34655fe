//! Command surface for the IMS registry.
//!
//! [`run_cli`] opens the store at `--db`, applies migrations, resolves the
//! acting user from `--actor`, and checks the role permission matrix before
//! dispatching to a store operation. Results print as pretty JSON on stdout.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ims_core::{
    authorize, parse_rfc3339_utc, CcdId, CreateImsInput, CreateMergeInput, CreateTagInput,
    CreateUserInput, ImsFilter, ImsId, ImsStatus, MergeId, Operation, Priority, Role, SortField,
    SortOrder, TagId, UpdateImsInput, UpdateTagInput, UserId,
};
use ims_store_sqlite::SqliteImsStore;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "imsr")]
#[command(about = "IMS investigation report registry")]
pub struct Cli {
    #[arg(long, default_value = "./ims_registry.sqlite3")]
    db: PathBuf,

    /// Acting user id. Required for every command that writes.
    #[arg(long)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the database file and apply migrations.
    Init,
    Ims {
        #[command(subcommand)]
        command: Box<ImsCommand>,
    },
    Tag {
        #[command(subcommand)]
        command: Box<TagCommand>,
    },
    Merge {
        #[command(subcommand)]
        command: Box<MergeCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Dashboard {
        #[command(subcommand)]
        command: Box<DashboardCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ImsCommand {
    Create(CreateImsArgs),
    Update(UpdateImsArgs),
    Delete { id: String },
    Restore { id: String },
    Show { id: String },
    List(ListImsArgs),
    History { id: String },
    Assignments { id: String },
}

#[derive(Debug, Args)]
pub struct CreateImsArgs {
    #[arg(long)]
    report_name: String,
    #[arg(long)]
    description: String,
    /// Explicit CCD-<n> identifier; assigned from the sequence when omitted.
    #[arg(long)]
    ccd_id: Option<String>,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    link_opencti: Option<String>,
    #[arg(long)]
    link_docintel: Option<String>,
    #[arg(long)]
    comments: Option<String>,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    priority: Option<PriorityArg>,
    #[arg(long)]
    analyst: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct UpdateImsArgs {
    id: String,
    #[arg(long)]
    report_name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    link_opencti: Option<String>,
    #[arg(long)]
    link_docintel: Option<String>,
    #[arg(long)]
    comments: Option<String>,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    priority: Option<PriorityArg>,
    #[arg(long)]
    analyst: Option<String>,
    /// Replaces the full tag set when given at least once.
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ListImsArgs {
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    priority: Option<PriorityArg>,
    #[arg(long)]
    analyst: Option<String>,
    #[arg(long)]
    tag: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 10)]
    limit: u32,
    #[arg(long, default_value = "created-at")]
    sort_by: SortFieldArg,
    #[arg(long, default_value = "desc")]
    sort_order: SortOrderArg,
}

#[derive(Debug, Subcommand)]
pub enum TagCommand {
    Create {
        name: String,
        #[arg(long)]
        color: Option<String>,
    },
    List,
    Show {
        id: String,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        color: Option<String>,
    },
    Delete {
        id: String,
    },
    Popular {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[derive(Debug, Subcommand)]
pub enum MergeCommand {
    Create(CreateMergeArgs),
    Unmerge { id: String },
    Delete { id: String },
    Show { id: String },
    Active,
    History,
}

#[derive(Debug, Args)]
pub struct CreateMergeArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    reason: Option<String>,
    /// Repeatable; at least two distinct IMS ids are required.
    #[arg(long = "ims", required = true)]
    ims: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        role: RoleArg,
    },
    List,
    Show {
        id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum DashboardCommand {
    Stats,
    Analyst {
        id: String,
    },
    Timeline {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    Trends,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Draft,
    InProgress,
    Completed,
    Merged,
    Archived,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Urgent,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Admin,
    Analyst,
    Viewer,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortFieldArg {
    CreatedAt,
    UpdatedAt,
    Date,
    CcdId,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortOrderArg {
    Asc,
    Desc,
}

fn map_status(value: StatusArg) -> ImsStatus {
    match value {
        StatusArg::Draft => ImsStatus::Draft,
        StatusArg::InProgress => ImsStatus::InProgress,
        StatusArg::Completed => ImsStatus::Completed,
        StatusArg::Merged => ImsStatus::Merged,
        StatusArg::Archived => ImsStatus::Archived,
    }
}

fn map_priority(value: PriorityArg) -> Priority {
    match value {
        PriorityArg::Urgent => Priority::Urgent,
        PriorityArg::High => Priority::High,
        PriorityArg::Medium => Priority::Medium,
        PriorityArg::Low => Priority::Low,
    }
}

fn map_role(value: RoleArg) -> Role {
    match value {
        RoleArg::Admin => Role::Admin,
        RoleArg::Analyst => Role::Analyst,
        RoleArg::Viewer => Role::Viewer,
    }
}

fn map_sort_field(value: SortFieldArg) -> SortField {
    match value {
        SortFieldArg::CreatedAt => SortField::CreatedAt,
        SortFieldArg::UpdatedAt => SortField::UpdatedAt,
        SortFieldArg::Date => SortField::Date,
        SortFieldArg::CcdId => SortField::CcdId,
    }
}

fn map_sort_order(value: SortOrderArg) -> SortOrder {
    match value {
        SortOrderArg::Asc => SortOrder::Asc,
        SortOrderArg::Desc => SortOrder::Desc,
    }
}

/// Executes the parsed top-level command graph.
///
/// # Errors
/// Returns an error when store open/migrate, actor resolution, authorization,
/// or the requested operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteImsStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, cli.actor.as_deref(), &mut store)
}

fn run_command(command: Command, actor: Option<&str>, store: &mut SqliteImsStore) -> Result<()> {
    match command {
        Command::Init => print_json(&Confirmation::new("initialized")),
        Command::Ims { command } => run_ims(*command, actor, store),
        Command::Tag { command } => run_tag(*command, actor, store),
        Command::Merge { command } => run_merge(*command, actor, store),
        Command::User { command } => run_user(*command, actor, store),
        Command::Dashboard { command } => run_dashboard(*command, store),
    }
}

fn run_ims(command: ImsCommand, actor: Option<&str>, store: &mut SqliteImsStore) -> Result<()> {
    match command {
        ImsCommand::Create(args) => {
            let actor = require_actor(store, actor, Operation::CreateIms)?;
            let input = CreateImsInput {
                ccd_id: args.ccd_id.as_deref().map(CcdId::parse).transpose()?,
                report_name: args.report_name,
                description: args.description,
                date: parse_optional_utc(args.date.as_deref())?,
                link_opencti: args.link_opencti,
                link_docintel: args.link_docintel,
                comments: args.comments,
                status: args.status.map(map_status),
                priority: args.priority.map(map_priority),
                analyst_id: args.analyst.as_deref().map(UserId::parse).transpose()?,
                tag_ids: parse_tag_ids(&args.tags)?,
            };
            let record = store.create_ims(&input, actor)?;
            print_json(&record)
        }
        ImsCommand::Update(args) => {
            require_actor(store, actor, Operation::UpdateIms)?;
            let id = ImsId::parse(&args.id)?;
            let input = UpdateImsInput {
                report_name: args.report_name,
                description: args.description,
                date: parse_optional_utc(args.date.as_deref())?,
                link_opencti: args.link_opencti,
                link_docintel: args.link_docintel,
                comments: args.comments,
                status: args.status.map(map_status),
                priority: args.priority.map(map_priority),
                analyst_id: args.analyst.as_deref().map(UserId::parse).transpose()?,
                tag_ids: parse_tag_ids(&args.tags)?,
            };
            let record = store.update_ims(id, &input)?;
            print_json(&record)
        }
        ImsCommand::Delete { id } => {
            require_actor(store, actor, Operation::DeleteIms)?;
            let id = ImsId::parse(&id)?;
            store.soft_delete_ims(id)?;
            print_json(&Confirmation::new("deleted"))
        }
        ImsCommand::Restore { id } => {
            require_actor(store, actor, Operation::RestoreIms)?;
            let id = ImsId::parse(&id)?;
            let record = store.restore_ims(id)?;
            print_json(&record)
        }
        ImsCommand::Show { id } => {
            let record = store.get_ims(ImsId::parse(&id)?)?;
            print_json(&record)
        }
        ImsCommand::List(args) => {
            let filter = ImsFilter {
                search: args.search,
                status: args.status.map(map_status),
                priority: args.priority.map(map_priority),
                analyst_id: args.analyst.as_deref().map(UserId::parse).transpose()?,
                tag_id: args.tag.as_deref().map(TagId::parse).transpose()?,
                page: args.page,
                limit: args.limit,
                sort_by: map_sort_field(args.sort_by),
                sort_order: map_sort_order(args.sort_order),
            };
            let page = store.list_ims(&filter)?;
            print_json(&page)
        }
        ImsCommand::History { id } => {
            let entries = store.ims_history(ImsId::parse(&id)?)?;
            print_json(&entries)
        }
        ImsCommand::Assignments { id } => {
            let entries = store.assignment_history(ImsId::parse(&id)?)?;
            print_json(&entries)
        }
    }
}

fn run_tag(command: TagCommand, actor: Option<&str>, store: &mut SqliteImsStore) -> Result<()> {
    match command {
        TagCommand::Create { name, color } => {
            require_actor(store, actor, Operation::CreateTag)?;
            let tag = store.create_tag(&CreateTagInput { name, color })?;
            print_json(&tag)
        }
        TagCommand::List => print_json(&store.list_tags()?),
        TagCommand::Show { id } => print_json(&store.get_tag(TagId::parse(&id)?)?),
        TagCommand::Update { id, name, color } => {
            require_actor(store, actor, Operation::UpdateTag)?;
            let tag = store.update_tag(TagId::parse(&id)?, &UpdateTagInput { name, color })?;
            print_json(&tag)
        }
        TagCommand::Delete { id } => {
            require_actor(store, actor, Operation::DeleteTag)?;
            store.delete_tag(TagId::parse(&id)?)?;
            print_json(&Confirmation::new("deleted"))
        }
        TagCommand::Popular { limit } => print_json(&store.popular_tags(limit)?),
    }
}

fn run_merge(command: MergeCommand, actor: Option<&str>, store: &mut SqliteImsStore) -> Result<()> {
    match command {
        MergeCommand::Create(args) => {
            let actor = require_actor(store, actor, Operation::CreateMerge)?;
            let mut ims_ids = Vec::with_capacity(args.ims.len());
            for raw in &args.ims {
                ims_ids.push(ImsId::parse(raw)?);
            }
            let merge = store.create_merge(
                &CreateMergeInput {
                    merge_name: args.name,
                    description: args.description,
                    reason: args.reason,
                    ims_ids,
                },
                actor,
            )?;
            print_json(&merge)
        }
        MergeCommand::Unmerge { id } => {
            require_actor(store, actor, Operation::Unmerge)?;
            let merge = store.unmerge(MergeId::parse(&id)?)?;
            print_json(&merge)
        }
        MergeCommand::Delete { id } => {
            require_actor(store, actor, Operation::DeleteMerge)?;
            store.remove_merge(MergeId::parse(&id)?)?;
            print_json(&Confirmation::new("deleted"))
        }
        MergeCommand::Show { id } => print_json(&store.get_merge(MergeId::parse(&id)?)?),
        MergeCommand::Active => print_json(&store.list_active_merges()?),
        MergeCommand::History => print_json(&store.merge_history()?),
    }
}

fn run_user(command: UserCommand, actor: Option<&str>, store: &mut SqliteImsStore) -> Result<()> {
    match command {
        UserCommand::Create {
            email,
            full_name,
            role,
        } => {
            // First-run bootstrap: an empty registry accepts its first user
            // without an actor. Everything after that is admin-gated.
            if store.count_users()? > 0 {
                require_actor(store, actor, Operation::ManageUsers)?;
            }
            let user = store.create_user(&CreateUserInput {
                email,
                full_name,
                role: map_role(role),
            })?;
            print_json(&user)
        }
        UserCommand::List => print_json(&store.list_users()?),
        UserCommand::Show { id } => print_json(&store.get_user(UserId::parse(&id)?)?),
    }
}

fn run_dashboard(command: DashboardCommand, store: &SqliteImsStore) -> Result<()> {
    match command {
        DashboardCommand::Stats => print_json(&store.dashboard_stats()?),
        DashboardCommand::Analyst { id } => print_json(&store.analyst_stats(UserId::parse(&id)?)?),
        DashboardCommand::Timeline { days } => print_json(&store.dashboard_timeline(days)?),
        DashboardCommand::Trends => print_json(&store.dashboard_trends()?),
    }
}

fn require_actor(
    store: &SqliteImsStore,
    actor: Option<&str>,
    operation: Operation,
) -> Result<UserId> {
    let raw = actor.ok_or_else(|| anyhow!("--actor is required for {}", operation.as_str()))?;
    let id = UserId::parse(raw)?;
    let user = store.get_user(id)?;
    authorize(user.role, operation)?;
    tracing::debug!(actor = %user.id, operation = operation.as_str(), "authorized");
    Ok(user.id)
}

fn parse_tag_ids(raw: &[String]) -> Result<Option<Vec<TagId>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut ids = Vec::with_capacity(raw.len());
    for value in raw {
        ids.push(TagId::parse(value)?);
    }
    Ok(Some(ids))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    match raw {
        Some(value) => Ok(Some(parse_rfc3339_utc(value)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Serialize)]
struct Confirmation {
    status: &'static str,
}

impl Confirmation {
    fn new(status: &'static str) -> Self {
        Self { status }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

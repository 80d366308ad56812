//! caseflow CLI: operator interface to the case engine.

use caseflow::clock::SystemClock;
use caseflow::config::Config;
use caseflow::engine::Engine;
use caseflow::model::{CaseId, NewCase, Operator, OperatorId, Role};
use caseflow::pipeline::{AdvanceInput, Stage, TransitionTable};
use caseflow::store::{CaseStore, SqliteStore};
use caseflow::sweeper::{SweepSchedule, Sweeper};
use caseflow::telemetry::init_tracing;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "caseflow", about = "Case workflow and assignment leases")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lease sweep daemon
    Serve,
    /// Case operations
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },
    /// Lease sweep operations
    Sweep {
        #[command(subcommand)]
        action: SweepAction,
    },
    /// Show the global history feed after a sequence number
    Events {
        /// Last sequence number already seen
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[derive(Subcommand)]
enum CaseAction {
    /// Create a case in intake
    Create {
        /// External reference (application number)
        reference: String,
        /// Provenance source
        source: String,
        /// Provenance trigger info
        #[arg(long)]
        trigger: Option<String>,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Claim a case for exclusive work
    Claim {
        /// Case ID (full UUID or prefix)
        id: String,
        /// Acting operator
        #[arg(long)]
        operator: String,
        /// Acting operator's role
        #[arg(long)]
        role: String,
    },
    /// Release a held case back to the pool
    Release {
        /// Case ID (full UUID or prefix)
        id: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        role: String,
    },
    /// Hand a case to another operator (admin only)
    Reassign {
        /// Case ID (full UUID or prefix)
        id: String,
        /// Receiving operator
        to: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        role: String,
    },
    /// Move a case along the pipeline
    Advance {
        /// Case ID (full UUID or prefix)
        id: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        role: String,
        /// Approval decision, for gated transitions
        #[arg(long)]
        approved: Option<bool>,
        /// Formalization decision, for gated transitions
        #[arg(long)]
        formalized: Option<bool>,
        /// Free-form note recorded with the transition
        #[arg(long)]
        note: Option<String>,
    },
    /// Attach a note to a case's history
    Note {
        /// Case ID (full UUID or prefix)
        id: String,
        /// Note text
        text: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        role: String,
    },
    /// Show a case
    Show {
        /// Case ID (full UUID or prefix)
        id: String,
    },
    /// Show a case's history
    History {
        /// Case ID (full UUID or prefix)
        id: String,
    },
    /// List cases
    List {
        /// Filter by stage
        #[arg(long)]
        stage: Option<String>,
        /// Only cases open for claiming
        #[arg(long)]
        available: bool,
        /// Cases held by an operator
        #[arg(long)]
        holder: Option<String>,
        /// Held cases nearing lease expiry
        #[arg(long)]
        expiring: bool,
        /// Maximum cases to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SweepAction {
    /// Reclaim expired leases now
    Run,
    /// Show past sweep runs
    History {
        /// Maximum runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => cmd_serve().await,
        Command::Case { action } => {
            let config = Config::load()?;
            let engine = build_engine(&config).await?;

            match action {
                CaseAction::Create {
                    reference,
                    source,
                    trigger,
                    payload,
                } => cmd_case_create(&engine, reference, source, trigger, payload).await,
                CaseAction::Claim { id, operator, role } => {
                    cmd_case_claim(&engine, id, operator, role).await
                }
                CaseAction::Release { id, operator, role } => {
                    cmd_case_release(&engine, id, operator, role).await
                }
                CaseAction::Reassign {
                    id,
                    to,
                    operator,
                    role,
                } => cmd_case_reassign(&engine, id, to, operator, role).await,
                CaseAction::Advance {
                    id,
                    operator,
                    role,
                    approved,
                    formalized,
                    note,
                } => cmd_case_advance(&engine, id, operator, role, approved, formalized, note).await,
                CaseAction::Note {
                    id,
                    text,
                    operator,
                    role,
                } => cmd_case_note(&engine, id, text, operator, role).await,
                CaseAction::Show { id } => cmd_case_show(&engine, id).await,
                CaseAction::History { id } => cmd_case_history(&engine, id).await,
                CaseAction::List {
                    stage,
                    available,
                    holder,
                    expiring,
                    limit,
                } => cmd_case_list(&engine, stage, available, holder, expiring, limit).await,
            }
        }
        Command::Sweep { action } => {
            let config = Config::load()?;
            let engine = build_engine(&config).await?;

            match action {
                SweepAction::Run => cmd_sweep_run(engine, config.sweep_schedule()?).await,
                SweepAction::History { limit } => cmd_sweep_history(&engine, limit).await,
            }
        }
        Command::Events { since } => {
            let config = Config::load()?;
            let engine = build_engine(&config).await?;
            cmd_events(&engine, since).await
        }
    }
}

async fn build_engine(config: &Config) -> anyhow::Result<Arc<Engine>> {
    let store: Arc<dyn CaseStore> = if config.database_path == ":memory:" {
        Arc::new(SqliteStore::in_memory().await?)
    } else {
        Arc::new(SqliteStore::open(&config.database_path).await?)
    };
    let engine = Engine::new(
        store,
        Arc::new(SystemClock),
        TransitionTable::standard(),
        config.engine_config(),
    )?;
    Ok(Arc::new(engine))
}

async fn cmd_serve() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_level)?;

    let engine = build_engine(&config).await?;
    let sweeper = Arc::new(Sweeper::new(engine, config.sweep_schedule()?));

    let shutdown = sweeper.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.notify_one();
    });

    sweeper.run().await?;
    Ok(())
}

async fn cmd_case_create(
    engine: &Engine,
    reference: String,
    source: String,
    trigger: Option<String>,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewCase::new(&reference, &source).payload(payload);
    if let Some(ref trig) = trigger {
        new = new.trigger(trig);
    }

    let case = engine.create(new).await?;
    println!("Created: {} (stage: {})", case.id.0, case.stage);
    Ok(())
}

async fn cmd_case_claim(
    engine: &Engine,
    id_str: String,
    operator: String,
    role: String,
) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let op = parse_operator(&operator, &role)?;
    let case = engine.claim(id, &op).await?;

    match &case.lease {
        Some(lease) => println!(
            "Claimed: {} (stage: {}, expires: {})",
            case.id, case.stage, lease.expires_at
        ),
        None => println!("Claimed: {} (stage: {})", case.id, case.stage),
    }
    Ok(())
}

async fn cmd_case_release(
    engine: &Engine,
    id_str: String,
    operator: String,
    role: String,
) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let op = parse_operator(&operator, &role)?;
    let case = engine.release(id, &op).await?;
    println!("Released: {} (stage: {})", case.id, case.stage);
    Ok(())
}

async fn cmd_case_reassign(
    engine: &Engine,
    id_str: String,
    to: String,
    operator: String,
    role: String,
) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let op = parse_operator(&operator, &role)?;
    let case = engine.reassign(id, &OperatorId::new(to.as_str()), &op).await?;

    match &case.lease {
        Some(lease) => println!(
            "Reassigned: {} to {} (expires: {})",
            case.id, lease.holder, lease.expires_at
        ),
        None => println!("Reassigned: {} to {to}", case.id),
    }
    Ok(())
}

async fn cmd_case_advance(
    engine: &Engine,
    id_str: String,
    operator: String,
    role: String,
    approved: Option<bool>,
    formalized: Option<bool>,
    note: Option<String>,
) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let op = parse_operator(&operator, &role)?;

    let mut input = match (approved, formalized) {
        (Some(_), Some(_)) => {
            anyhow::bail!("--approved and --formalized are mutually exclusive")
        }
        (Some(value), None) => AdvanceInput::approved(value),
        (None, Some(value)) => AdvanceInput::formalized(value),
        (None, None) => AdvanceInput::plain(),
    };
    if let Some(note) = note {
        input = input.note(note);
    }

    let case = engine.advance(id, &op, input).await?;
    println!("Advanced: {} (stage: {})", case.id, case.stage);
    Ok(())
}

async fn cmd_case_note(
    engine: &Engine,
    id_str: String,
    text: String,
    operator: String,
    role: String,
) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let op = parse_operator(&operator, &role)?;
    let case = engine.annotate(id, &op, &text).await?;
    println!("Annotated: {}", case.id);
    Ok(())
}

async fn cmd_case_show(engine: &Engine, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let case = engine.get(id).await?;

    println!("ID:         {}", case.id.0);
    println!("Reference:  {}", case.reference);
    println!("Stage:      {}", case.stage);
    match &case.lease {
        Some(lease) => {
            println!("Holder:     {}", lease.holder);
            println!("Leased:     {}", lease.leased_at);
            println!("Expires:    {}", lease.expires_at);
        }
        None => println!("Holder:     -"),
    }
    println!("Source:     {}", case.provenance.source);
    println!(
        "Trigger:    {}",
        case.provenance.trigger.as_deref().unwrap_or("-")
    );
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&case.payload)?
    );
    println!("Version:    {}", case.version);
    println!("Created:    {}", case.created_at);
    println!("Updated:    {}", case.updated_at);
    Ok(())
}

async fn cmd_case_history(engine: &Engine, id_str: String) -> anyhow::Result<()> {
    let id = resolve_id(engine, &id_str).await?;
    let entries = engine.history(id).await?;

    if entries.is_empty() {
        println!("No history.");
        return Ok(());
    }

    // Header
    println!(
        "{:<5}  {:<16}  {:<14}  {:<40}  ACTOR",
        "SEQ", "AT", "ACTION", "TRANSITION"
    );
    println!("{}", "-".repeat(95));

    for entry in &entries {
        let transition = format!("{} -> {}", entry.from, entry.to);
        println!(
            "{:<5}  {:<16}  {:<14}  {:<40}  {}",
            entry.seq,
            entry.at.format("%Y-%m-%d %H:%M").to_string(),
            entry.action.to_string(),
            transition,
            entry.actor
        );
        if let Some(ref note) = entry.note {
            println!("       note: {note}");
        }
    }

    println!("\n{} entries", entries.len());
    Ok(())
}

async fn cmd_case_list(
    engine: &Engine,
    stage: Option<String>,
    available: bool,
    holder: Option<String>,
    expiring: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let stage_filter: Option<Stage> = match stage {
        Some(s) => Some(s.parse().map_err(|e: String| anyhow::anyhow!(e))?),
        None => None,
    };

    let mut cases = if expiring {
        engine.near_expiry().await?
    } else if let Some(holder) = holder {
        engine.assigned_to(&OperatorId::new(holder.as_str())).await?
    } else if available {
        engine.available(stage_filter).await?
    } else if let Some(stage) = stage_filter {
        engine.by_stage(stage).await?
    } else {
        engine.recent(limit).await?
    };
    cases.truncate(limit);

    if cases.is_empty() {
        println!("No cases found.");
        return Ok(());
    }

    // Header
    println!(
        "{:<8}  {:<20}  {:<12}  {:<16}  {:<20}  CREATED",
        "ID", "STAGE", "HOLDER", "EXPIRES", "REFERENCE"
    );
    println!("{}", "-".repeat(100));

    for case in &cases {
        let holder = case
            .holder()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string());
        let expires = case
            .lease
            .as_ref()
            .map(|l| l.expires_at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let reference = if case.reference.len() > 20 {
            &case.reference[..20]
        } else {
            &case.reference
        };
        println!(
            "{:<8}  {:<20}  {:<12}  {:<16}  {:<20}  {}",
            case.id.to_string(),
            case.stage.to_string(),
            holder,
            expires,
            reference,
            case.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} case(s)", cases.len());
    Ok(())
}

async fn cmd_sweep_run(engine: Arc<Engine>, schedule: SweepSchedule) -> anyhow::Result<()> {
    let sweeper = Sweeper::new(engine, schedule);
    let run = sweeper.run_now().await?;
    println!(
        "Swept {} expired of {} processed ({} errors) in {}ms",
        run.expired, run.processed, run.errors, run.duration_ms
    );
    Ok(())
}

async fn cmd_sweep_history(engine: &Engine, limit: usize) -> anyhow::Result<()> {
    let runs = engine.sweep_runs(limit).await?;

    if runs.is_empty() {
        println!("No sweep runs recorded.");
        return Ok(());
    }

    // Header
    println!(
        "{:<20}  {:<10}  {:>9}  {:>7}  {:>6}  DURATION",
        "STARTED", "TRIGGER", "PROCESSED", "EXPIRED", "ERRORS"
    );
    println!("{}", "-".repeat(75));

    for run in &runs {
        println!(
            "{:<20}  {:<10}  {:>9}  {:>7}  {:>6}  {}ms",
            run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.trigger.to_string(),
            run.processed,
            run.expired,
            run.errors,
            run.duration_ms
        );
    }

    println!("\n{} run(s)", runs.len());
    Ok(())
}

async fn cmd_events(engine: &Engine, since: u64) -> anyhow::Result<()> {
    let entries = engine.events_since(since).await?;

    if entries.is_empty() {
        println!("No entries after seq {since}.");
        return Ok(());
    }

    // Header
    println!(
        "{:<5}  {:<8}  {:<16}  {:<14}  {:<40}  ACTOR",
        "SEQ", "CASE", "AT", "ACTION", "TRANSITION"
    );
    println!("{}", "-".repeat(105));

    for entry in &entries {
        let transition = format!("{} -> {}", entry.from, entry.to);
        println!(
            "{:<5}  {:<8}  {:<16}  {:<14}  {:<40}  {}",
            entry.seq,
            entry.case_id.to_string(),
            entry.at.format("%Y-%m-%d %H:%M").to_string(),
            entry.action.to_string(),
            transition,
            entry.actor
        );
    }

    println!("\n{} entries", entries.len());
    Ok(())
}

/// Find a case by full UUID or unique ID prefix.
async fn resolve_id(engine: &Engine, raw: &str) -> anyhow::Result<CaseId> {
    if raw.len() < 36 {
        // Prefix search over recent cases
        let cases = engine.recent(500).await?;
        let matches: Vec<_> = cases
            .iter()
            .filter(|case| case.id.0.to_string().starts_with(raw))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no case matching prefix '{raw}'"),
            1 => Ok(matches[0].id),
            n => anyhow::bail!("{n} cases match prefix '{raw}'; be more specific"),
        }
    } else {
        Ok(CaseId(uuid::Uuid::parse_str(raw)?))
    }
}

fn parse_operator(id: &str, role: &str) -> anyhow::Result<Operator> {
    let role: Role = role
        .parse()
        .map_err(|e: String| anyhow::anyhow!("invalid role: {e}"))?;
    Ok(Operator::new(id, role))
}

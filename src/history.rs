//! The append-only history log.
//!
//! Every hand-off and stage move writes one entry, committed atomically with
//! the mutation it records. Entries are never updated or deleted; external
//! consumers poll the global sequence to build notifications or dashboards.
//! Replaying a case's entries from creation reconstructs its current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CaseId, OperatorId};
use crate::pipeline::Stage;

// ---------------------------------------------------------------------------
// History entries
// ---------------------------------------------------------------------------

/// One recorded action on a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Global monotonic sequence, assigned by the store on append.
    /// Per-case order is timestamp order with ties broken by seq.
    pub seq: u64,
    pub case_id: CaseId,
    /// Who did it. The engine itself acts as `System`.
    pub actor: Actor,
    pub action: ActionKind,
    pub from: StatePoint,
    pub to: StatePoint,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Stage and holder at a point in time. `from`/`to` pairs of consecutive
/// entries chain, which is what makes replay possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePoint {
    pub stage: Stage,
    pub holder: Option<OperatorId>,
}

impl StatePoint {
    pub fn new(stage: Stage, holder: Option<OperatorId>) -> Self {
        Self { stage, holder }
    }
}

impl std::fmt::Display for StatePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.holder {
            Some(holder) => write!(f, "{}/{}", self.stage, holder),
            None => write!(f, "{}/-", self.stage),
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Claimed,
    Released,
    Expired,
    Reassigned,
    StageAdvanced,
    Annotated,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Claimed => "claimed",
            ActionKind::Released => "released",
            ActionKind::Expired => "expired",
            ActionKind::Reassigned => "reassigned",
            ActionKind::StageAdvanced => "stage-advanced",
            ActionKind::Annotated => "annotated",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(ActionKind::Claimed),
            "released" => Ok(ActionKind::Released),
            "expired" => Ok(ActionKind::Expired),
            "reassigned" => Ok(ActionKind::Reassigned),
            "stage-advanced" => Ok(ActionKind::StageAdvanced),
            "annotated" => Ok(ActionKind::Annotated),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Who performed an action. `System` is reserved for the engine itself
/// (lease expiry); the label "system" can never collide with an operator
/// because the identity system upstream reserves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Operator(OperatorId),
    System,
}

impl Actor {
    pub fn from_label(label: &str) -> Self {
        if label == "system" {
            Actor::System
        } else {
            Actor::Operator(OperatorId::new(label))
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::Operator(id) => write!(f, "{id}"),
            Actor::System => write!(f, "system"),
        }
    }
}

/// A history entry as handed to the store, before seq/case/time stamping.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub actor: Actor,
    pub action: ActionKind,
    pub from: StatePoint,
    pub to: StatePoint,
    pub note: Option<String>,
}

/// Walk a case's entries from its creation state. Consecutive entries must
/// chain (each `from` equals the state it applies to); the result always
/// matches the case row's current stage/holder.
pub fn replay(initial: StatePoint, entries: &[HistoryEntry]) -> StatePoint {
    let mut state = initial;
    for entry in entries {
        debug_assert_eq!(entry.from, state, "history chain break at seq {}", entry.seq);
        state = entry.to.clone();
    }
    state
}

// ---------------------------------------------------------------------------
// Sweep runs
// ---------------------------------------------------------------------------

/// Summary audit record of one expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRun {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Candidates scanned.
    pub processed: u64,
    /// Leases actually reclaimed.
    pub expired: u64,
    /// Candidates that failed and were skipped.
    pub errors: u64,
    pub trigger: SweepTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    Scheduled,
    Manual,
}

impl std::fmt::Display for SweepTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SweepTrigger::Scheduled => "scheduled",
            SweepTrigger::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SweepTrigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SweepTrigger::Scheduled),
            "manual" => Ok(SweepTrigger::Manual),
            other => Err(format!("unknown sweep trigger: {other}")),
        }
    }
}

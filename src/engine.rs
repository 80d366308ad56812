//! The case engine: claims, releases, reassignment, and stage advancement.
//!
//! Every mutation is one compare-and-set against the version read at entry,
//! committing the case change and its history entries together. Conflicts
//! are reported to the caller, never retried here. Reads are pure: no view
//! ever writes, expired-but-unswept leases are simply filtered as available.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::history::{ActionKind, Actor, HistoryEntry, NewHistoryEntry, StatePoint, SweepRun};
use crate::model::{Case, CaseId, Lease, NewCase, Operator, OperatorId};
use crate::pipeline::{AdvanceInput, Stage, TransitionTable};
use crate::store::{CaseStore, CaseUpdate, LeaseChange, MemoryStore};

/// Lease and view tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a claim holds a case before the pool may take it back.
    pub lease_duration: Duration,
    /// Horizon for the near-expiry view.
    pub near_expiry_horizon: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::minutes(60),
            near_expiry_horizon: Duration::minutes(15),
        }
    }
}

/// Facade over the store. All case mutations go through here.
pub struct Engine {
    store: Arc<dyn CaseStore>,
    clock: Arc<dyn Clock>,
    table: TransitionTable,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine. The transition table is checked here once; a
    /// malformed table never reaches runtime.
    pub fn new(
        store: Arc<dyn CaseStore>,
        clock: Arc<dyn Clock>,
        table: TransitionTable,
        config: EngineConfig,
    ) -> Result<Self> {
        table.validate()?;
        Ok(Self {
            store,
            clock,
            table,
            config,
        })
    }

    /// Engine over an in-memory store with the standard pipeline
    /// (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            TransitionTable::standard(),
            EngineConfig::default(),
        )
    }

    pub fn pipeline(&self) -> &TransitionTable {
        &self.table
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Create a case in the initial stage, unleased. Import pipelines and
    /// manual entry both land here.
    pub async fn create(&self, new: NewCase) -> Result<Case> {
        let now = self.clock.now();
        let case = Case {
            id: CaseId::new(),
            reference: new.reference,
            provenance: new.provenance,
            payload: new.payload,
            stage: self.table.initial_stage(),
            lease: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_case(case.clone()).await?;
        info!(case = %case.id, reference = %case.reference, "case created");
        Ok(case)
    }

    // -----------------------------------------------------------------------
    // Lease protocol
    // -----------------------------------------------------------------------

    /// Take exclusive hold of a case. `Conflict` if anyone holds an
    /// unexpired lease, including the caller; there is no renewal.
    ///
    /// A first claim moves the case out of intake into the entry stage. An
    /// expired-but-unswept lease is claimed straight through, with the
    /// implicit expiry recorded ahead of the claim in the same commit.
    pub async fn claim(&self, id: CaseId, operator: &Operator) -> Result<Case> {
        let now = self.clock.now();
        let case = self.store.get(id).await?;

        let mut entries = Vec::new();
        let mut point = StatePoint::new(case.stage, case.holder().cloned());

        if let Some(lease) = &case.lease {
            if !lease.is_expired(now) {
                return Err(held_conflict(id, lease));
            }
            let cleared = StatePoint::new(case.stage, None);
            entries.push(NewHistoryEntry {
                actor: Actor::System,
                action: ActionKind::Expired,
                from: point.clone(),
                to: cleared.clone(),
                note: Some("lease-timeout".to_string()),
            });
            point = cleared;
        }

        let stage = self.stage_after_takeover(case.stage);
        let lease = Lease::grant(operator.id.clone(), now, self.config.lease_duration);
        entries.push(NewHistoryEntry {
            actor: Actor::Operator(operator.id.clone()),
            action: ActionKind::Claimed,
            from: point,
            to: StatePoint::new(stage, Some(operator.id.clone())),
            note: None,
        });

        let update = CaseUpdate {
            stage: (stage != case.stage).then_some(stage),
            lease: LeaseChange::Grant(lease),
        };

        match self
            .store
            .update_if(id, case.version, update, entries, now)
            .await
        {
            Ok(updated) => {
                info!(case = %id, holder = %operator.id, stage = %updated.stage, "case claimed");
                Ok(updated)
            }
            Err(Error::Conflict { .. }) => Err(self.conflict_detail(id).await),
            Err(e) => Err(e),
        }
    }

    /// Give a case back to the pool. Stage is untouched. Holder-only
    /// (expired or not), unless an admin forces it. Releasing an unheld
    /// case is a no-op.
    pub async fn release(&self, id: CaseId, operator: &Operator) -> Result<Case> {
        let now = self.clock.now();
        let case = self.store.get(id).await?;

        let Some(lease) = case.lease.clone() else {
            return Ok(case);
        };
        if lease.holder != operator.id && !operator.role.is_admin() {
            return Err(Error::Forbidden(format!(
                "case {id} is held by {}, not {}",
                lease.holder, operator.id
            )));
        }

        let entry = NewHistoryEntry {
            actor: Actor::Operator(operator.id.clone()),
            action: ActionKind::Released,
            from: StatePoint::new(case.stage, Some(lease.holder)),
            to: StatePoint::new(case.stage, None),
            note: None,
        };
        let released = self
            .store
            .update_if(
                id,
                case.version,
                CaseUpdate::lease_only(LeaseChange::Clear),
                vec![entry],
                now,
            )
            .await?;
        info!(case = %id, operator = %operator.id, "lease released");
        Ok(released)
    }

    /// Hand a case directly to another operator, without it passing through
    /// the pool. Admin only. Works on held, expired and unheld cases alike;
    /// one `reassigned` entry records both sides of the hand-off.
    pub async fn reassign(&self, id: CaseId, to: &OperatorId, acting: &Operator) -> Result<Case> {
        if !acting.role.is_admin() {
            return Err(Error::Forbidden(format!(
                "reassigning case {id} requires the admin role"
            )));
        }
        let now = self.clock.now();
        let case = self.store.get(id).await?;

        let stage = self.stage_after_takeover(case.stage);
        let lease = Lease::grant(to.clone(), now, self.config.lease_duration);
        let entry = NewHistoryEntry {
            actor: Actor::Operator(acting.id.clone()),
            action: ActionKind::Reassigned,
            from: StatePoint::new(case.stage, case.holder().cloned()),
            to: StatePoint::new(stage, Some(to.clone())),
            note: None,
        };
        let update = CaseUpdate {
            stage: (stage != case.stage).then_some(stage),
            lease: LeaseChange::Grant(lease),
        };
        let updated = self
            .store
            .update_if(id, case.version, update, vec![entry], now)
            .await?;
        info!(case = %id, to = %to, by = %acting.id, "case reassigned");
        Ok(updated)
    }

    /// Reclaim one expired lease. Sweeper-only. Losing the race to a
    /// concurrent claim or release is a clean no-op, as is calling this on
    /// a live or unheld case.
    pub(crate) async fn expire(&self, id: CaseId) -> Result<bool> {
        let now = self.clock.now();
        let case = match self.store.get(id).await {
            Ok(case) => case,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some(lease) = case.lease.clone() else {
            return Ok(false);
        };
        if !lease.is_expired(now) {
            return Ok(false);
        }

        let entry = NewHistoryEntry {
            actor: Actor::System,
            action: ActionKind::Expired,
            from: StatePoint::new(case.stage, Some(lease.holder.clone())),
            to: StatePoint::new(case.stage, None),
            note: Some("lease-timeout".to_string()),
        };
        match self
            .store
            .update_if(
                id,
                case.version,
                CaseUpdate::lease_only(LeaseChange::Clear),
                vec![entry],
                now,
            )
            .await
        {
            Ok(_) => {
                info!(case = %id, holder = %lease.holder, "lease expired");
                Ok(true)
            }
            Err(Error::Conflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Workflow
    // -----------------------------------------------------------------------

    /// Move a case along the pipeline. The caller must hold an unexpired
    /// lease (admins may move cases they don't hold), the decision must
    /// match exactly one edge out of the current stage, and the caller's
    /// role must be the edge's role. The lease is untouched either way.
    pub async fn advance(
        &self,
        id: CaseId,
        operator: &Operator,
        input: AdvanceInput,
    ) -> Result<Case> {
        let now = self.clock.now();
        let case = self.store.get(id).await?;

        if !holds(&case, operator, now) && !operator.role.is_admin() {
            return Err(Error::Forbidden(format!(
                "advancing case {id} requires holding its lease"
            )));
        }

        let edge = self.table.select_edge(case.stage, input.decision.as_ref())?;
        if edge.role != operator.role && !operator.role.is_admin() {
            return Err(Error::Forbidden(format!(
                "transition {} -> {} requires the {} role",
                case.stage, edge.to, edge.role
            )));
        }

        let entry = NewHistoryEntry {
            actor: Actor::Operator(operator.id.clone()),
            action: ActionKind::StageAdvanced,
            from: StatePoint::new(case.stage, case.holder().cloned()),
            to: StatePoint::new(edge.to, case.holder().cloned()),
            note: input.note,
        };
        let update = CaseUpdate {
            stage: Some(edge.to),
            lease: LeaseChange::Keep,
        };
        let updated = self
            .store
            .update_if(id, case.version, update, vec![entry], now)
            .await?;
        info!(
            case = %id,
            from = %case.stage,
            to = %updated.stage,
            operator = %operator.id,
            "stage advanced"
        );
        Ok(updated)
    }

    /// Attach a note to the case's history. Requires holding the case
    /// (admins exempt). Stage and lease are untouched, but the version
    /// still bumps so notes order with the rest of the log.
    pub async fn annotate(&self, id: CaseId, operator: &Operator, note: &str) -> Result<Case> {
        let now = self.clock.now();
        let case = self.store.get(id).await?;

        if !holds(&case, operator, now) && !operator.role.is_admin() {
            return Err(Error::Forbidden(format!(
                "annotating case {id} requires holding its lease"
            )));
        }

        let point = StatePoint::new(case.stage, case.holder().cloned());
        let entry = NewHistoryEntry {
            actor: Actor::Operator(operator.id.clone()),
            action: ActionKind::Annotated,
            from: point.clone(),
            to: point,
            note: Some(note.to_string()),
        };
        self.store
            .update_if(
                id,
                case.version,
                CaseUpdate::lease_only(LeaseChange::Keep),
                vec![entry],
                now,
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: CaseId) -> Result<Case> {
        self.store.get(id).await
    }

    /// A case's full audit trail, oldest first.
    pub async fn history(&self, id: CaseId) -> Result<Vec<HistoryEntry>> {
        self.store.history(id).await
    }

    /// Global feed of entries after `seq`, for external fan-out. Entries
    /// are committed before the mutating call returns, so a poller never
    /// observes a case state ahead of its log.
    pub async fn events_since(&self, seq: u64) -> Result<Vec<HistoryEntry>> {
        self.store.events_since(seq).await
    }

    /// Cases open for claiming, oldest first. An expired lease counts as
    /// open even before the sweeper has recorded it.
    pub async fn available(&self, stage: Option<Stage>) -> Result<Vec<Case>> {
        self.store.list_available(stage, self.clock.now()).await
    }

    /// Cases `holder` currently holds. A case past its deadline is not
    /// listed; the operator must not keep working on it.
    pub async fn assigned_to(&self, holder: &OperatorId) -> Result<Vec<Case>> {
        self.store.list_held_by(holder, self.clock.now()).await
    }

    pub async fn by_stage(&self, stage: Stage) -> Result<Vec<Case>> {
        self.store.list_by_stage(stage).await
    }

    /// Held cases whose lease runs out within the configured horizon.
    pub async fn near_expiry(&self) -> Result<Vec<Case>> {
        self.store
            .list_expiring_within(self.clock.now(), self.config.near_expiry_horizon)
            .await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<Case>> {
        self.store.list_recent(limit).await
    }

    pub async fn sweep_runs(&self, limit: usize) -> Result<Vec<SweepRun>> {
        self.store.sweep_runs(limit).await
    }

    pub(crate) async fn expired_cases(&self) -> Result<Vec<Case>> {
        self.store.list_expired(self.clock.now()).await
    }

    pub(crate) async fn record_sweep(&self, run: SweepRun) -> Result<()> {
        self.store.record_sweep(run).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Claim and reassign move intake cases to the entry stage; the edge
    /// role guard applies to explicit advance calls only.
    fn stage_after_takeover(&self, current: Stage) -> Stage {
        if current == self.table.initial_stage() {
            self.table.entry_stage()
        } else {
            current
        }
    }

    /// On a lost claim race, re-read once so the error can name the holder.
    async fn conflict_detail(&self, id: CaseId) -> Error {
        match self.store.get(id).await {
            Ok(current) => match &current.lease {
                Some(lease) => held_conflict(id, lease),
                None => Error::Conflict {
                    case: id.to_string(),
                    detail: "modified concurrently".to_string(),
                },
            },
            Err(e) => e,
        }
    }
}

fn holds(case: &Case, operator: &Operator, now: DateTime<Utc>) -> bool {
    case.lease
        .as_ref()
        .is_some_and(|l| l.holder == operator.id && !l.is_expired(now))
}

fn held_conflict(id: CaseId, lease: &Lease) -> Error {
    Error::Conflict {
        case: id.to_string(),
        detail: format!("held by {} until {}", lease.holder, lease.expires_at),
    }
}

//! Case persistence.
//!
//! The engine talks to storage through `CaseStore`. The contract that makes
//! the lease protocol safe is `update_if`: one compare-and-set per mutation,
//! keyed on the version the caller read, committing the case change and its
//! history entries in a single atomic step. Everything else is reads.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::history::{HistoryEntry, NewHistoryEntry, SweepRun};
use crate::model::{Case, CaseId, Lease, OperatorId};
use crate::pipeline::Stage;

/// How a mutation changes the lease.
#[derive(Debug, Clone)]
pub enum LeaseChange {
    Keep,
    Clear,
    Grant(Lease),
}

/// The mutation half of a compare-and-set update. `stage: None` leaves the
/// stage untouched.
#[derive(Debug, Clone)]
pub struct CaseUpdate {
    pub stage: Option<Stage>,
    pub lease: LeaseChange,
}

impl CaseUpdate {
    pub fn lease_only(lease: LeaseChange) -> Self {
        Self { stage: None, lease }
    }
}

/// Storage port for cases, history, and sweep records.
///
/// Time never comes from the store; callers pass `now` so the same queries
/// run identically under the system clock and a test clock.
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert a freshly built case. Duplicate ids are a `Conflict`.
    async fn insert_case(&self, case: Case) -> Result<()>;

    /// Fetch one case. Missing ids are `NotFound`.
    async fn get(&self, id: CaseId) -> Result<Case>;

    /// Compare-and-set: apply `update` and append `entries` atomically,
    /// provided the stored version still equals `expected_version`.
    ///
    /// On success the version is bumped by one, `updated_at` is set to
    /// `now`, and the updated case is returned. On a version mismatch
    /// nothing is written and the call fails with `Conflict`. There are no
    /// partial outcomes: either the case row and all entries commit, or
    /// none do.
    async fn update_if(
        &self,
        id: CaseId,
        expected_version: u64,
        update: CaseUpdate,
        entries: Vec<NewHistoryEntry>,
        now: DateTime<Utc>,
    ) -> Result<Case>;

    /// Cases open for claiming at `now`: no lease, or a lease past its
    /// deadline. Optional stage filter. Oldest first.
    async fn list_available(&self, stage: Option<Stage>, now: DateTime<Utc>) -> Result<Vec<Case>>;

    /// Cases held by `holder` under an unexpired lease at `now`.
    async fn list_held_by(&self, holder: &OperatorId, now: DateTime<Utc>) -> Result<Vec<Case>>;

    /// All cases in `stage`, leased or not.
    async fn list_by_stage(&self, stage: Stage) -> Result<Vec<Case>>;

    /// Cases whose lease is live at `now` but expires within `horizon`.
    /// Soonest deadline first.
    async fn list_expiring_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Case>>;

    /// Cases whose lease deadline has passed at `now`. The sweeper's scan.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Case>>;

    /// Most recently touched cases, newest first. Operator tooling.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Case>>;

    /// A case's full history, in seq order.
    async fn history(&self, id: CaseId) -> Result<Vec<HistoryEntry>>;

    /// All entries with seq strictly greater than `seq`, in seq order.
    /// The pull feed for external fan-out.
    async fn events_since(&self, seq: u64) -> Result<Vec<HistoryEntry>>;

    /// Append one sweep summary record.
    async fn record_sweep(&self, run: SweepRun) -> Result<()>;

    /// Most recent sweep records, newest first.
    async fn sweep_runs(&self, limit: usize) -> Result<Vec<SweepRun>>;
}

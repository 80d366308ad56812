//! In-memory reference store.
//!
//! DashMap's per-key entry guard is the atomicity mechanism: `update_if`
//! holds the case's entry while it checks the version, applies the change,
//! and appends history, so writers to the same case serialize. Used by
//! tests and `Engine::in_memory`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::history::{HistoryEntry, NewHistoryEntry, SweepRun};
use crate::model::{Case, CaseId, OperatorId};
use crate::pipeline::Stage;

use super::{CaseStore, CaseUpdate, LeaseChange};

#[derive(Default)]
pub struct MemoryStore {
    cases: DashMap<CaseId, Case>,
    history: Mutex<Vec<HistoryEntry>>,
    sweeps: Mutex<Vec<SweepRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn history_lock(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sweeps_lock(&self) -> MutexGuard<'_, Vec<SweepRun>> {
        match self.sweeps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn insert_case(&self, case: Case) -> Result<()> {
        match self.cases.entry(case.id) {
            Entry::Occupied(_) => Err(Error::Conflict {
                case: case.id.to_string(),
                detail: "case id already exists".to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(case);
                Ok(())
            }
        }
    }

    async fn get(&self, id: CaseId) -> Result<Case> {
        self.cases
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn update_if(
        &self,
        id: CaseId,
        expected_version: u64,
        update: CaseUpdate,
        entries: Vec<NewHistoryEntry>,
        now: DateTime<Utc>,
    ) -> Result<Case> {
        let mut case = self
            .cases
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if case.version != expected_version {
            return Err(Error::Conflict {
                case: id.to_string(),
                detail: format!(
                    "expected version {expected_version}, found {}",
                    case.version
                ),
            });
        }

        if let Some(stage) = update.stage {
            case.stage = stage;
        }
        match update.lease {
            LeaseChange::Keep => {}
            LeaseChange::Clear => case.lease = None,
            LeaseChange::Grant(lease) => case.lease = Some(lease),
        }
        case.version += 1;
        case.updated_at = now;

        // Append while still holding the entry guard, so no reader sees the
        // new case state ahead of its log entries.
        let mut log = self.history_lock();
        for new in entries {
            let seq = log.len() as u64 + 1;
            log.push(HistoryEntry {
                seq,
                case_id: id,
                actor: new.actor,
                action: new.action,
                from: new.from,
                to: new.to,
                at: now,
                note: new.note,
            });
        }
        drop(log);

        Ok(case.value().clone())
    }

    async fn list_available(&self, stage: Option<Stage>, now: DateTime<Utc>) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| c.available_at(now))
            .filter(|c| stage.is_none_or(|s| c.stage == s))
            .map(|c| c.value().clone())
            .collect();
        cases.sort_by_key(|c| c.created_at);
        Ok(cases)
    }

    async fn list_held_by(&self, holder: &OperatorId, now: DateTime<Utc>) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| {
                c.lease
                    .as_ref()
                    .is_some_and(|l| l.holder == *holder && !l.is_expired(now))
            })
            .map(|c| c.value().clone())
            .collect();
        cases.sort_by_key(|c| c.lease.as_ref().map(|l| l.leased_at));
        Ok(cases)
    }

    async fn list_by_stage(&self, stage: Stage) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| c.stage == stage)
            .map(|c| c.value().clone())
            .collect();
        cases.sort_by_key(|c| c.created_at);
        Ok(cases)
    }

    async fn list_expiring_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| {
                c.lease
                    .as_ref()
                    .is_some_and(|l| l.expires_within(now, horizon))
            })
            .map(|c| c.value().clone())
            .collect();
        cases.sort_by_key(|c| c.lease.as_ref().map(|l| l.expires_at));
        Ok(cases)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self
            .cases
            .iter()
            .filter(|c| c.lease.as_ref().is_some_and(|l| l.is_expired(now)))
            .map(|c| c.value().clone())
            .collect();
        cases.sort_by_key(|c| c.lease.as_ref().map(|l| l.expires_at));
        Ok(cases)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Case>> {
        let mut cases: Vec<Case> = self.cases.iter().map(|c| c.value().clone()).collect();
        cases.sort_by_key(|c| std::cmp::Reverse(c.updated_at));
        cases.truncate(limit);
        Ok(cases)
    }

    async fn history(&self, id: CaseId) -> Result<Vec<HistoryEntry>> {
        // the log is globally seq-ordered; a filter preserves that
        Ok(self
            .history_lock()
            .iter()
            .filter(|e| e.case_id == id)
            .cloned()
            .collect())
    }

    async fn events_since(&self, seq: u64) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .history_lock()
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect())
    }

    async fn record_sweep(&self, run: SweepRun) -> Result<()> {
        self.sweeps_lock().push(run);
        Ok(())
    }

    async fn sweep_runs(&self, limit: usize) -> Result<Vec<SweepRun>> {
        Ok(self
            .sweeps_lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

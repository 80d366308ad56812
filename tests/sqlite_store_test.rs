//! Tests for the SQLite-backed case store.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use caseflow::clock::ManualClock;
use caseflow::engine::{Engine, EngineConfig};
use caseflow::error::Error;
use caseflow::history::{
    ActionKind, Actor, NewHistoryEntry, StatePoint, SweepRun, SweepTrigger,
};
use caseflow::model::{Case, CaseId, Lease, NewCase, Operator, OperatorId, Provenance, Role};
use caseflow::pipeline::{AdvanceInput, Stage, TransitionTable};
use caseflow::store::{CaseStore, CaseUpdate, LeaseChange, SqliteStore};

fn now0() -> DateTime<Utc> {
    "2025-06-02T09:00:00Z".parse().expect("valid timestamp")
}

async fn test_store() -> SqliteStore {
    SqliteStore::in_memory()
        .await
        .expect("failed to open in-memory store")
}

fn sample_case(reference: &str, created: DateTime<Utc>) -> Case {
    Case {
        id: CaseId::new(),
        reference: reference.to_string(),
        provenance: Provenance {
            source: "bank-import".to_string(),
            trigger: Some("import/2025-06-02".to_string()),
        },
        payload: json!({"amount": 125_000, "term_months": 240}),
        stage: Stage::Intake,
        lease: None,
        version: 0,
        created_at: created,
        updated_at: created,
    }
}

fn claim_entry(operator: &str, stage: Stage) -> NewHistoryEntry {
    let holder = OperatorId::new(operator);
    NewHistoryEntry {
        actor: Actor::Operator(holder.clone()),
        action: ActionKind::Claimed,
        from: StatePoint::new(stage, None),
        to: StatePoint::new(stage, Some(holder)),
        note: None,
    }
}

fn grant(operator: &str, now: DateTime<Utc>) -> LeaseChange {
    LeaseChange::Grant(Lease::grant(
        OperatorId::new(operator),
        now,
        Duration::minutes(60),
    ))
}

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn insert_and_get_round_trip() {
    let store = test_store().await;
    let case = sample_case("LN-2025-0042", now0());

    store.insert_case(case.clone()).await.unwrap();
    let fetched = store.get(case.id).await.unwrap();

    assert_eq!(fetched, case);
}

#[tokio::test]
async fn duplicate_insert_is_conflict() {
    let store = test_store().await;
    let case = sample_case("LN-2025-0042", now0());

    store.insert_case(case.clone()).await.unwrap();
    let err = store.insert_case(case).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn missing_case_is_not_found() {
    let store = test_store().await;
    let err = store.get(CaseId::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Compare-and-set
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_if_applies_lease_and_appends_history() {
    let store = test_store().await;
    let case = sample_case("LN-1", now0());
    store.insert_case(case.clone()).await.unwrap();

    let later = now0() + Duration::minutes(5);
    let updated = store
        .update_if(
            case.id,
            0,
            CaseUpdate {
                stage: Some(Stage::AgentReview),
                lease: grant("op-ana", later),
            },
            vec![claim_entry("op-ana", Stage::AgentReview)],
            later,
        )
        .await
        .unwrap();

    assert_eq!(updated.version, 1);
    assert_eq!(updated.stage, Stage::AgentReview);
    assert_eq!(updated.updated_at, later);
    assert_eq!(updated.holder(), Some(&OperatorId::new("op-ana")));
    assert_eq!(store.get(case.id).await.unwrap(), updated);

    let history = store.history(case.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].seq, 1);
    assert_eq!(history[0].case_id, case.id);
    assert_eq!(history[0].at, later);
    assert_eq!(history[0].action, ActionKind::Claimed);
}

#[tokio::test]
async fn stale_version_writes_nothing() {
    let store = test_store().await;
    let case = sample_case("LN-1", now0());
    store.insert_case(case.clone()).await.unwrap();

    let err = store
        .update_if(
            case.id,
            3,
            CaseUpdate::lease_only(grant("op-ana", now0())),
            vec![claim_entry("op-ana", Stage::Intake)],
            now0(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict { .. }));
    assert_eq!(store.get(case.id).await.unwrap(), case);
    assert!(store.history(case.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn keep_preserves_and_clear_drops_the_lease() {
    let store = test_store().await;
    let case = sample_case("LN-1", now0());
    store.insert_case(case.clone()).await.unwrap();

    let leased = store
        .update_if(
            case.id,
            0,
            CaseUpdate::lease_only(grant("op-ana", now0())),
            vec![claim_entry("op-ana", Stage::Intake)],
            now0(),
        )
        .await
        .unwrap();

    let kept = store
        .update_if(
            case.id,
            1,
            CaseUpdate {
                stage: Some(Stage::AgentReview),
                lease: LeaseChange::Keep,
            },
            vec![NewHistoryEntry {
                actor: Actor::Operator(OperatorId::new("op-ana")),
                action: ActionKind::StageAdvanced,
                from: StatePoint::new(Stage::Intake, Some(OperatorId::new("op-ana"))),
                to: StatePoint::new(Stage::AgentReview, Some(OperatorId::new("op-ana"))),
                note: Some("docs verified".to_string()),
            }],
            now0() + Duration::minutes(1),
        )
        .await
        .unwrap();
    assert_eq!(kept.lease, leased.lease);
    assert_eq!(kept.stage, Stage::AgentReview);

    let cleared = store
        .update_if(
            case.id,
            2,
            CaseUpdate::lease_only(LeaseChange::Clear),
            vec![NewHistoryEntry {
                actor: Actor::Operator(OperatorId::new("op-ana")),
                action: ActionKind::Released,
                from: StatePoint::new(Stage::AgentReview, Some(OperatorId::new("op-ana"))),
                to: StatePoint::new(Stage::AgentReview, None),
                note: None,
            }],
            now0() + Duration::minutes(2),
        )
        .await
        .unwrap();
    assert!(cleared.lease.is_none());
    assert_eq!(cleared.version, 3);

    let notes: Vec<Option<String>> = store
        .history(case.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.note)
        .collect();
    assert_eq!(notes, vec![None, Some("docs verified".to_string()), None]);
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn views_split_on_the_expiry_boundary() {
    let store = test_store().await;
    let t0 = now0();

    let open = sample_case("LN-open", t0);
    let live = sample_case("LN-live", t0 + Duration::minutes(1));
    let stale = sample_case("LN-stale", t0 + Duration::minutes(2));
    for case in [&open, &live, &stale] {
        store.insert_case(case.clone()).await.unwrap();
    }

    // Live lease runs until t0+70, stale one ran out at t0+32.
    store
        .update_if(
            live.id,
            0,
            CaseUpdate::lease_only(grant("op-ana", t0 + Duration::minutes(10))),
            vec![claim_entry("op-ana", Stage::Intake)],
            t0 + Duration::minutes(10),
        )
        .await
        .unwrap();
    store
        .update_if(
            stale.id,
            0,
            CaseUpdate::lease_only(LeaseChange::Grant(Lease::grant(
                OperatorId::new("op-bea"),
                t0 + Duration::minutes(12),
                Duration::minutes(20),
            ))),
            vec![claim_entry("op-bea", Stage::Intake)],
            t0 + Duration::minutes(12),
        )
        .await
        .unwrap();

    let now = t0 + Duration::minutes(40);

    let available = store.list_available(None, now).await.unwrap();
    let ids: Vec<CaseId> = available.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![open.id, stale.id]);

    let held = store
        .list_held_by(&OperatorId::new("op-ana"), now)
        .await
        .unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].id, live.id);
    assert!(store
        .list_held_by(&OperatorId::new("op-bea"), now)
        .await
        .unwrap()
        .is_empty());

    let expired = store.list_expired(now).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, stale.id);

    // Live lease ends at t0+70, thirty minutes out; only a wide horizon
    // catches it.
    assert!(store
        .list_expiring_within(now, Duration::minutes(15))
        .await
        .unwrap()
        .is_empty());
    let closing = store
        .list_expiring_within(now, Duration::minutes(45))
        .await
        .unwrap();
    assert_eq!(closing.len(), 1);
    assert_eq!(closing[0].id, live.id);
}

#[tokio::test]
async fn available_respects_stage_filter() {
    let store = test_store().await;
    let mut reviewed = sample_case("LN-1", now0());
    reviewed.stage = Stage::AgentReview;
    let intake = sample_case("LN-2", now0() + Duration::minutes(1));
    store.insert_case(reviewed.clone()).await.unwrap();
    store.insert_case(intake.clone()).await.unwrap();

    let filtered = store
        .list_available(Some(Stage::AgentReview), now0() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, reviewed.id);

    let by_stage = store.list_by_stage(Stage::Intake).await.unwrap();
    assert_eq!(by_stage.len(), 1);
    assert_eq!(by_stage[0].id, intake.id);
}

#[tokio::test]
async fn list_recent_orders_by_last_touch() {
    let store = test_store().await;
    let older = sample_case("LN-1", now0());
    let newer = sample_case("LN-2", now0() + Duration::minutes(1));
    store.insert_case(older.clone()).await.unwrap();
    store.insert_case(newer.clone()).await.unwrap();

    // Touching the older case moves it to the front.
    store
        .update_if(
            older.id,
            0,
            CaseUpdate::lease_only(grant("op-ana", now0() + Duration::minutes(5))),
            vec![claim_entry("op-ana", Stage::Intake)],
            now0() + Duration::minutes(5),
        )
        .await
        .unwrap();

    let recent = store.list_recent(10).await.unwrap();
    let ids: Vec<CaseId> = recent.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![older.id, newer.id]);

    assert_eq!(store.list_recent(1).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Feed and sweep runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_since_spans_cases_in_seq_order() {
    let store = test_store().await;
    let c1 = sample_case("LN-1", now0());
    let c2 = sample_case("LN-2", now0());
    store.insert_case(c1.clone()).await.unwrap();
    store.insert_case(c2.clone()).await.unwrap();

    store
        .update_if(
            c1.id,
            0,
            CaseUpdate::lease_only(grant("op-ana", now0())),
            vec![claim_entry("op-ana", Stage::Intake)],
            now0(),
        )
        .await
        .unwrap();
    store
        .update_if(
            c2.id,
            0,
            CaseUpdate::lease_only(grant("op-bea", now0())),
            vec![claim_entry("op-bea", Stage::Intake)],
            now0(),
        )
        .await
        .unwrap();

    let all = store.events_since(0).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].seq, 1);
    assert_eq!(all[0].case_id, c1.id);
    assert_eq!(all[1].seq, 2);
    assert_eq!(all[1].case_id, c2.id);

    let tail = store.events_since(1).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq, 2);
}

#[tokio::test]
async fn sweep_runs_round_trip_newest_first() {
    let store = test_store().await;

    store
        .record_sweep(SweepRun {
            started_at: now0(),
            duration_ms: 12,
            processed: 4,
            expired: 3,
            errors: 1,
            trigger: SweepTrigger::Scheduled,
        })
        .await
        .unwrap();
    store
        .record_sweep(SweepRun {
            started_at: now0() + Duration::hours(1),
            duration_ms: 3,
            processed: 0,
            expired: 0,
            errors: 0,
            trigger: SweepTrigger::Manual,
        })
        .await
        .unwrap();

    let runs = store.sweep_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].trigger, SweepTrigger::Manual);
    assert_eq!(runs[0].started_at, now0() + Duration::hours(1));
    assert_eq!(runs[1].processed, 4);
    assert_eq!(runs[1].expired, 3);
    assert_eq!(runs[1].errors, 1);
    assert_eq!(runs[1].trigger, SweepTrigger::Scheduled);

    assert_eq!(store.sweep_runs(1).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Engine on SQLite
// ---------------------------------------------------------------------------

/// The engine must behave the same on the durable store as on the in-memory
/// one: a full lifecycle with an expiry takeover in the middle.
#[tokio::test]
async fn engine_walks_a_case_to_disbursed_on_sqlite() {
    let clock = Arc::new(ManualClock::starting_at(now0()));
    let engine = Engine::new(
        Arc::new(test_store().await),
        clock.clone(),
        TransitionTable::standard(),
        EngineConfig::default(),
    )
    .unwrap();

    let agent = Operator::new("op-ana", Role::Agent);
    let analyst = Operator::new("op-cyr", Role::Analyst);
    let supervisor = Operator::new("op-dee", Role::Supervisor);
    let finance = Operator::new("op-eli", Role::Finance);

    let id = engine
        .create(NewCase::new("LN-2025-0042", "bank-import"))
        .await
        .unwrap()
        .id;

    engine.claim(id, &agent).await.unwrap();
    engine
        .advance(id, &agent, AdvanceInput::formalized(true))
        .await
        .unwrap();
    engine.release(id, &agent).await.unwrap();

    engine.claim(id, &analyst).await.unwrap();
    engine
        .advance(id, &analyst, AdvanceInput::approved(true))
        .await
        .unwrap();

    // The analyst goes silent; the supervisor claims through the dead lease.
    clock.advance(Duration::minutes(61));
    let taken = engine.claim(id, &supervisor).await.unwrap();
    assert_eq!(taken.stage, Stage::CalculationApproved);
    engine
        .advance(id, &supervisor, AdvanceInput::approved(true))
        .await
        .unwrap();
    engine.release(id, &supervisor).await.unwrap();

    engine.claim(id, &finance).await.unwrap();
    let done = engine
        .advance(id, &finance, AdvanceInput::plain())
        .await
        .unwrap();

    assert_eq!(done.stage, Stage::Disbursed);
    assert_eq!(done.version, 10);

    let history = engine.history(id).await.unwrap();
    let actions: Vec<ActionKind> = history.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            ActionKind::Claimed,
            ActionKind::StageAdvanced,
            ActionKind::Released,
            ActionKind::Claimed,
            ActionKind::StageAdvanced,
            ActionKind::Expired,
            ActionKind::Claimed,
            ActionKind::StageAdvanced,
            ActionKind::Released,
            ActionKind::Claimed,
            ActionKind::StageAdvanced,
        ]
    );
    let expired = &history[5];
    assert_eq!(expired.actor, Actor::System);
    assert_eq!(expired.note.as_deref(), Some("lease-timeout"));
}

//! Tests for history replay, chaining and feed ordering.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use caseflow::clock::ManualClock;
use caseflow::engine::{Engine, EngineConfig};
use caseflow::history::{replay, ActionKind, StatePoint};
use caseflow::model::{CaseId, NewCase, Operator, OperatorId, Role};
use caseflow::pipeline::{AdvanceInput, Stage, TransitionTable};
use caseflow::store::MemoryStore;

fn start() -> DateTime<Utc> {
    "2025-06-02T09:00:00Z".parse().expect("valid timestamp")
}

fn test_engine() -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_at(start()));
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        TransitionTable::standard(),
        EngineConfig::default(),
    )
    .expect("failed to create engine");
    (engine, clock)
}

/// Drive one case through every action kind: claim, advance, release,
/// an implicit expiry, an annotation and a reassignment.
async fn rich_walk(engine: &Engine, clock: &ManualClock) -> CaseId {
    let agent = Operator::new("op-ana", Role::Agent);
    let analyst = Operator::new("op-cyr", Role::Analyst);
    let supervisor = Operator::new("op-dee", Role::Supervisor);
    let admin = Operator::new("op-fay", Role::Admin);

    let id = engine
        .create(NewCase::new("LN-2025-0007", "import"))
        .await
        .expect("create failed")
        .id;

    engine.claim(id, &agent).await.expect("agent claim");
    engine
        .advance(id, &agent, AdvanceInput::formalized(true))
        .await
        .expect("agent advance");
    engine.release(id, &agent).await.expect("agent release");

    engine.claim(id, &analyst).await.expect("analyst claim");
    engine
        .advance(id, &analyst, AdvanceInput::approved(true))
        .await
        .expect("analyst advance");

    // Analyst sits on the case past the deadline; the supervisor's claim
    // records the expiry implicitly.
    clock.advance(Duration::minutes(61));
    engine.claim(id, &supervisor).await.expect("supervisor claim");
    engine
        .advance(id, &supervisor, AdvanceInput::approved(true))
        .await
        .expect("supervisor advance");
    engine
        .annotate(id, &supervisor, "bank letter on file")
        .await
        .expect("annotate");

    engine
        .reassign(id, &OperatorId::new("op-eli"), &admin)
        .await
        .expect("reassign");

    id
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replay_reconstructs_current_state() {
    let (engine, clock) = test_engine();
    let id = rich_walk(&engine, &clock).await;

    let case = engine.get(id).await.unwrap();
    let entries = engine.history(id).await.unwrap();

    let replayed = replay(StatePoint::new(Stage::Intake, None), &entries);
    assert_eq!(
        replayed,
        StatePoint::new(case.stage, case.holder().cloned())
    );
    assert_eq!(case.stage, Stage::ClosingApproved);
    assert_eq!(case.holder(), Some(&OperatorId::new("op-eli")));
}

#[tokio::test]
async fn entries_chain_without_gaps() {
    let (engine, clock) = test_engine();
    let id = rich_walk(&engine, &clock).await;

    let entries = engine.history(id).await.unwrap();
    assert!(entries.len() >= 8);

    for pair in entries.windows(2) {
        assert_eq!(pair[1].from, pair[0].to, "broken at seq {}", pair[1].seq);
        assert!(pair[0].seq < pair[1].seq);
        assert!(pair[0].at <= pair[1].at);
    }

    let kinds: Vec<ActionKind> = entries.iter().map(|e| e.action).collect();
    for kind in [
        ActionKind::Claimed,
        ActionKind::Released,
        ActionKind::Expired,
        ActionKind::Reassigned,
        ActionKind::StageAdvanced,
        ActionKind::Annotated,
    ] {
        assert!(kinds.contains(&kind), "missing {kind}");
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn per_case_history_is_a_slice_of_the_feed() {
    let (engine, _) = test_engine();
    let agent = Operator::new("op-ana", Role::Agent);
    let other = Operator::new("op-bea", Role::Agent);

    let c1 = engine
        .create(NewCase::new("LN-1", "import"))
        .await
        .unwrap()
        .id;
    let c2 = engine
        .create(NewCase::new("LN-2", "import"))
        .await
        .unwrap()
        .id;

    // Interleave work on both cases.
    engine.claim(c1, &agent).await.unwrap();
    engine.claim(c2, &other).await.unwrap();
    engine
        .advance(c1, &agent, AdvanceInput::formalized(true))
        .await
        .unwrap();
    engine.release(c2, &other).await.unwrap();
    engine.release(c1, &agent).await.unwrap();

    let feed = engine.events_since(0).await.unwrap();
    assert_eq!(feed.len(), 5);
    assert!(feed.windows(2).all(|w| w[0].seq < w[1].seq));

    let filtered: Vec<_> = feed.iter().filter(|e| e.case_id == c1).cloned().collect();
    assert_eq!(filtered, engine.history(c1).await.unwrap());
}

//! End-to-end engine scenarios over the in-memory store.
//!
//! Everything runs under the paused tokio clock: `sleep` moves virtual time,
//! countdowns and backoffs fire deterministically, and response times come
//! out exact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::StaticIdentity;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::ServerEvent;
use crate::mtch::engine::{self, CreateMatchRequest};
use crate::mtch::{MatchEngines, MatchStatus};
use crate::questions::{PoolQuestion, StaticQuestionSource};
use crate::room::{ConnHandle, ConnId, RoomRegistry};
use crate::store::memory::MemoryStore;
use crate::store::Store;
use crate::ServerCtx;

fn question(text: &str, correct: &str, wrong: [&str; 3]) -> PoolQuestion {
    PoolQuestion {
        question_text: text.to_owned(),
        correct_option: correct.to_owned(),
        wrong_option_1: wrong[0].to_owned(),
        wrong_option_2: wrong[1].to_owned(),
        wrong_option_3: wrong[2].to_owned(),
        content_hash: format!("hash-{correct}"),
    }
}

fn gold_and_mars() -> Vec<PoolQuestion> {
    vec![
        question("Chemical symbol for gold?", "Au", ["Ag", "Fe", "Pb"]),
        question("The red planet?", "Mars", ["Venus", "Jupiter", "Saturn"]),
    ]
}

fn test_ctx(questions: Vec<PoolQuestion>) -> (ServerCtx, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let ctx = ServerCtx {
        store: store.clone(),
        identity: Arc::new(StaticIdentity::new(Vec::new())),
        questions: Arc::new(StaticQuestionSource::new(questions)),
        rooms: Arc::new(RoomRegistry::new()),
        engines: Arc::new(MatchEngines::new()),
        config: Arc::new(EngineConfig::default()),
        shutdown: CancellationToken::new(),
        tracker: TaskTracker::new(),
    };
    (ctx, store)
}

type EventRx = mpsc::Receiver<Arc<ServerEvent>>;

/// Create a match, register the extra players and join everyone with a fake
/// connection. Join-time snapshots are drained away so scenarios start clean.
async fn setup(
    ctx: &ServerCtx,
    host: &str,
    others: &[&str],
    question_count: u32,
) -> (String, HashMap<String, EventRx>) {
    let snapshot = engine::create_match(
        ctx,
        host,
        CreateMatchRequest {
            category: "science".into(),
            difficulty: "easy".into(),
            question_count,
            question_duration_sec: None,
        },
    )
    .await
    .unwrap();
    let match_id = snapshot.match_id;

    for user in others {
        engine::register_player(ctx, &match_id, user).await.unwrap();
    }

    let mut receivers = HashMap::new();
    for user in std::iter::once(host).chain(others.iter().copied()) {
        receivers.insert(user.to_owned(), join(ctx, &match_id, user).await);
    }
    for rx in receivers.values_mut() {
        drain(rx);
    }

    (match_id, receivers)
}

async fn join(ctx: &ServerCtx, match_id: &str, user: &str) -> EventRx {
    let (tx, rx) = mpsc::channel(64);
    engine::join(
        ctx,
        match_id,
        user,
        ConnHandle {
            conn_id: ConnId::generate(),
            tx,
        },
    )
    .await
    .unwrap();
    rx
}

fn drain(rx: &mut EventRx) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push((*event).clone());
    }
    events
}

fn kind(event: &ServerEvent) -> String {
    serde_json::to_value(event).unwrap()["kind"]
        .as_str()
        .unwrap()
        .to_owned()
}

/// Kinds of the room-wide events only, for cross-connection order checks.
/// The per-user payloads (`answer:confirmed`, `answer:received`) differ
/// between connections by design.
fn room_kinds(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .map(kind)
        .filter(|k| k != "answer:confirmed" && k != "answer:received" && k != "match:state")
        .collect()
}

/// The kind of the first event whose JSON carries a `correct_option`
/// anywhere, i.e. the first reveal this connection observed.
fn first_reveal(events: &[ServerEvent]) -> Option<String> {
    events.iter().find_map(|event| {
        let value = serde_json::to_value(event).unwrap();
        let revealed = value.get("correct_option").is_some()
            || value
                .get("question")
                .is_some_and(|q| q.get("correct_option").is_some());
        revealed.then(|| value["kind"].as_str().unwrap().to_owned())
    })
}

#[tokio::test(start_paused = true)]
async fn s1_two_player_happy_path() {
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    // Q1: alice answers at +3000 ms, bob at +3400 ms, both correct.
    sleep(Duration::from_millis(3_000)).await;
    let alice_q1 = engine::submit_answer(&ctx, &match_id, "alice", 1, "Au")
        .await
        .unwrap();
    assert!(alice_q1.is_correct);
    assert_eq!(alice_q1.points_awarded, 100);

    sleep(Duration::from_millis(400)).await;
    let bob_q1 = engine::submit_answer(&ctx, &match_id, "bob", 1, "Au")
        .await
        .unwrap();
    assert_eq!(bob_q1.points_awarded, 96);
    assert_eq!(bob_q1.new_score, 96);

    // Both answered: Q1 resolves immediately.
    let alice_events = drain(rxs.get_mut("alice").unwrap());
    let ended = alice_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::QuestionEnded {
                question_number,
                correct_option,
                scoreboard,
            } => Some((*question_number, correct_option.clone(), scoreboard.clone())),
            _ => None,
        })
        .expect("question 1 should have ended");
    assert_eq!(ended.0, 1);
    assert_eq!(ended.1, "Au");
    let board: Vec<(String, i64)> = ended
        .2
        .iter()
        .map(|entry| (entry.user_id.clone(), entry.score))
        .collect();
    assert_eq!(board, [("alice".to_owned(), 100), ("bob".to_owned(), 96)]);

    // Secrecy: the first reveal alice saw was her own private confirmation.
    assert_eq!(
        first_reveal(&alice_events).as_deref(),
        Some("answer:confirmed")
    );

    // Q2 begins after the auto-advance delay.
    sleep(Duration::from_secs(3)).await;

    sleep(Duration::from_millis(1_000)).await;
    let alice_q2 = engine::submit_answer(&ctx, &match_id, "alice", 2, "Venus")
        .await
        .unwrap();
    assert!(!alice_q2.is_correct);
    assert_eq!(alice_q2.points_awarded, 0);
    assert_eq!(alice_q2.correct_option, "Mars");

    sleep(Duration::from_millis(4_000)).await;
    let bob_q2 = engine::submit_answer(&ctx, &match_id, "bob", 2, "Mars")
        .await
        .unwrap();
    assert_eq!(bob_q2.points_awarded, 100);
    assert_eq!(bob_q2.new_score, 196);

    // Let the final auto-advance settle the match. Slightly past the 3 s
    // delay so the settlement task runs before we look.
    sleep(Duration::from_secs(4)).await;

    let bob_events = drain(rxs.get_mut("bob").unwrap());
    let finished = bob_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MatchFinished {
                scoreboard,
                winners,
                aborted,
            } => Some((scoreboard.clone(), winners.clone(), *aborted)),
            _ => None,
        })
        .expect("match should have finished");
    assert!(!finished.2);
    assert_eq!(finished.1, ["bob".to_owned()]);
    let totals: Vec<(String, i64)> = finished
        .0
        .iter()
        .map(|standing| (standing.user_id.clone(), standing.total_score))
        .collect();
    assert_eq!(totals, [("bob".to_owned(), 196), ("alice".to_owned(), 100)]);

    // Exactly one score row per player, and exactly one stats increment.
    let alice_score = store.get_score(&match_id, "alice").await.unwrap().unwrap();
    assert_eq!(alice_score.total_score, 100);
    assert_eq!(alice_score.correct_count, 1);
    assert_eq!(alice_score.avg_response_time_ms, Some(2_000));

    let bob_score = store.get_score(&match_id, "bob").await.unwrap().unwrap();
    assert_eq!(bob_score.total_score, 196);
    assert_eq!(bob_score.correct_count, 2);
    assert_eq!(bob_score.avg_response_time_ms, Some(4_200));

    let alice_stats = store.get_lifetime_stats("alice").await.unwrap().unwrap();
    assert_eq!(alice_stats.games_played, 1);
    assert_eq!(alice_stats.games_won, 0);
    assert_eq!(alice_stats.highest_score, 100);

    let bob_stats = store.get_lifetime_stats("bob").await.unwrap().unwrap();
    assert_eq!(bob_stats.games_played, 1);
    assert_eq!(bob_stats.games_won, 1);
    assert_eq!(bob_stats.correct_answers, 2);
    assert_eq!(bob_stats.total_answers, 2);

    // Two questions, two players: four answer rows, no more.
    assert_eq!(store.answer_count(), 4);

    let final_match = store.get_match(&match_id).await.unwrap().unwrap();
    assert_eq!(final_match.status, MatchStatus::Finished);
    assert!(final_match.ended_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn s2_timer_timeout_records_auto_miss() {
    let questions = vec![question("The red planet?", "Mars", ["Venus", "Jupiter", "Saturn"])];
    let (ctx, store) = test_ctx(questions);
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob"], 1).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    sleep(Duration::from_millis(2_000)).await;
    let alice = engine::submit_answer(&ctx, &match_id, "alice", 1, "Mars")
        .await
        .unwrap();
    assert_eq!(alice.points_awarded, 100);

    // Bob never answers; run the countdown out and let settlement follow.
    sleep(Duration::from_secs(19)).await;
    sleep(Duration::from_secs(4)).await;

    let instances = store.get_question_instances(&match_id).await.unwrap();
    let miss = store
        .get_answer(&instances[0].question_instance_id, "bob")
        .await
        .unwrap()
        .expect("bob should have an auto-miss row");
    assert_eq!(miss.selected_option, None);
    assert!(!miss.is_correct);
    assert_eq!(miss.points_awarded, 0);
    assert_eq!(miss.response_time_ms, 20_000);

    let bob_events = drain(rxs.get_mut("bob").unwrap());
    let finished = bob_events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MatchFinished {
                scoreboard,
                winners,
                ..
            } => Some((scoreboard.clone(), winners.clone())),
            _ => None,
        })
        .expect("match should have finished");
    assert_eq!(finished.1, ["alice".to_owned()]);
    let totals: Vec<(String, i64)> = finished
        .0
        .iter()
        .map(|standing| (standing.user_id.clone(), standing.total_score))
        .collect();
    assert_eq!(totals, [("alice".to_owned(), 100), ("bob".to_owned(), 0)]);

    let bob_stats = store.get_lifetime_stats("bob").await.unwrap().unwrap();
    assert_eq!(bob_stats.games_won, 0);
    assert_eq!(bob_stats.games_played, 1);

    // Every surviving connection saw the room-wide events in the same order.
    let alice_events = drain(rxs.get_mut("alice").unwrap());
    assert_eq!(room_kinds(&alice_events), room_kinds(&bob_events));
}

#[tokio::test(start_paused = true)]
async fn s3_duplicate_submission_is_rejected() {
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    sleep(Duration::from_millis(1_000)).await;

    engine::submit_answer(&ctx, &match_id, "alice", 1, "Au")
        .await
        .unwrap();
    drain(rxs.get_mut("bob").unwrap());

    let err = engine::submit_answer(&ctx, &match_id, "alice", 1, "Ag")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyAnswered);

    // No extra row, no extra broadcast.
    assert_eq!(store.answer_count(), 1);
    assert!(drain(rxs.get_mut("bob").unwrap()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn s4_non_host_cannot_start() {
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob", "carol"], 2).await;

    let err = engine::start(&ctx, &match_id, "bob").await.unwrap_err();
    assert_eq!(err, EngineError::NotHost);

    let mtch = store.get_match(&match_id).await.unwrap().unwrap();
    assert_eq!(mtch.status, MatchStatus::Scheduled);

    // Nobody saw anything.
    for rx in rxs.values_mut() {
        assert!(drain(rx).is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn s5_tie_on_score_and_correct_breaks_on_speed() {
    // Everyone answers everything correctly inside the 100 ms full-points
    // window, so totals and correct counts tie and only average response
    // time separates them.
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &["bob", "carol"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    // Q1 at +2000/+2040/+2080 ms.
    sleep(Duration::from_millis(2_000)).await;
    engine::submit_answer(&ctx, &match_id, "alice", 1, "Au")
        .await
        .unwrap();
    sleep(Duration::from_millis(40)).await;
    engine::submit_answer(&ctx, &match_id, "bob", 1, "Au")
        .await
        .unwrap();
    sleep(Duration::from_millis(40)).await;
    engine::submit_answer(&ctx, &match_id, "carol", 1, "Au")
        .await
        .unwrap();

    sleep(Duration::from_secs(3)).await;

    // Q2 at +2300 (bob), +2350 (alice), +2390 (carol) ms.
    sleep(Duration::from_millis(2_300)).await;
    engine::submit_answer(&ctx, &match_id, "bob", 2, "Mars")
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    engine::submit_answer(&ctx, &match_id, "alice", 2, "Mars")
        .await
        .unwrap();
    sleep(Duration::from_millis(40)).await;
    engine::submit_answer(&ctx, &match_id, "carol", 2, "Mars")
        .await
        .unwrap();

    sleep(Duration::from_secs(4)).await;

    for user in ["alice", "bob", "carol"] {
        let score = store.get_score(&match_id, user).await.unwrap().unwrap();
        assert_eq!(score.total_score, 200, "{user} should have full points");
        assert_eq!(score.correct_count, 2);
    }

    // alice avg 2175 ms, bob avg 2170 ms, carol avg 2235 ms.
    let bob_stats = store.get_lifetime_stats("bob").await.unwrap().unwrap();
    assert_eq!(bob_stats.games_won, 1);
    for loser in ["alice", "carol"] {
        let stats = store.get_lifetime_stats(loser).await.unwrap().unwrap();
        assert_eq!(stats.games_won, 0, "{loser} should not get a win");
    }
}

#[tokio::test(start_paused = true)]
async fn s6_settlement_failure_cancels_the_match() {
    let questions = vec![question("The red planet?", "Mars", ["Venus", "Jupiter", "Saturn"])];
    let (ctx, store) = test_ctx(questions);
    let (match_id, mut rxs) = setup(&ctx, "alice", &[], 1).await;

    store.fail_next_settlements(5);

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    sleep(Duration::from_millis(1_000)).await;
    engine::submit_answer(&ctx, &match_id, "alice", 1, "Mars")
        .await
        .unwrap();

    // Auto-advance plus five backoff attempts; give virtual time generously.
    sleep(Duration::from_secs(30)).await;

    let mtch = store.get_match(&match_id).await.unwrap().unwrap();
    assert_eq!(mtch.status, MatchStatus::Canceled);
    assert!(mtch.ended_at.is_some());

    // Nothing was half-written.
    assert!(store.get_score(&match_id, "alice").await.unwrap().is_none());
    assert!(store.get_lifetime_stats("alice").await.unwrap().is_none());

    let events = drain(rxs.get_mut("alice").unwrap());
    let aborted = events.iter().any(|e| {
        matches!(
            e,
            ServerEvent::MatchFinished { aborted: true, winners, .. } if winners.is_empty()
        )
    });
    assert!(aborted, "terminal aborted event expected, got {events:?}");
}

#[tokio::test(start_paused = true)]
async fn timer_ticks_count_down_without_gaps() {
    let questions = vec![question("The red planet?", "Mars", ["Venus", "Jupiter", "Saturn"])];
    let (ctx, _store) = test_ctx(questions);
    let (match_id, mut rxs) = setup(&ctx, "alice", &[], 1).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    sleep(Duration::from_secs(21)).await;

    let events = drain(rxs.get_mut("alice").unwrap());

    let starts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::TimerStart { time_remaining_sec } => Some(*time_remaining_sec),
            _ => None,
        })
        .collect();
    assert_eq!(starts, [20]);

    let ticks: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::TimerTick { time_remaining_sec } => Some(*time_remaining_sec),
            _ => None,
        })
        .collect();
    let expected: Vec<u32> = (0..20).rev().collect();
    assert_eq!(ticks, expected);

    let expired = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::TimerExpired { .. }))
        .count();
    assert_eq!(expired, 1);

    // Exactly one reveal per question.
    let ended = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::QuestionEnded { .. }))
        .count();
    assert_eq!(ended, 1);
}

#[tokio::test(start_paused = true)]
async fn host_advance_is_refused_while_asking() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    let err = engine::advance(&ctx, &match_id, "alice").await.unwrap_err();
    assert_eq!(err, EngineError::WrongSubState);
}

#[tokio::test(start_paused = true)]
async fn host_advance_from_resolved_skips_the_delay() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    sleep(Duration::from_millis(1_000)).await;
    engine::submit_answer(&ctx, &match_id, "alice", 1, "Au")
        .await
        .unwrap();
    engine::submit_answer(&ctx, &match_id, "bob", 1, "Au")
        .await
        .unwrap();

    // Resolved; host advances immediately instead of waiting 3 s.
    engine::advance(&ctx, &match_id, "alice").await.unwrap();

    let snapshot = engine::get_snapshot(&ctx, &match_id).await.unwrap();
    assert_eq!(snapshot.current_question_number, 2);

    // The canceled auto-advance must not fire a second advance later.
    sleep(Duration::from_secs(4)).await;
    let snapshot = engine::get_snapshot(&ctx, &match_id).await.unwrap();
    assert_eq!(snapshot.current_question_number, 2);

    let events = drain(rxs.get_mut("bob").unwrap());
    let new_questions = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::QuestionNew { .. }))
        .count();
    assert_eq!(new_questions, 2);
}

#[tokio::test(start_paused = true)]
async fn join_validates_membership_and_existence() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &[], 2).await;

    let (tx, _rx) = mpsc::channel(8);
    let err = engine::join(
        &ctx,
        &match_id,
        "mallory",
        ConnHandle {
            conn_id: ConnId::generate(),
            tx: tx.clone(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err, EngineError::NotAParticipant);

    let err = engine::join(
        &ctx,
        "no-such-match",
        "alice",
        ConnHandle {
            conn_id: ConnId::generate(),
            tx,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err, EngineError::NotFound);
}

#[tokio::test(start_paused = true)]
async fn rejoin_mid_question_keeps_the_clock_running() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    sleep(Duration::from_secs(5)).await;

    // Bob reconnects. The snapshot shows the open question with the clock
    // already run down; his response time is still measured from the start.
    drop(rxs.remove("bob"));
    let mut bob_rx = join(&ctx, &match_id, "bob").await;
    let events = drain(&mut bob_rx);
    let snapshot = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::MatchState { state } => Some(state.clone()),
            _ => None,
        })
        .expect("rejoin should reply with a snapshot");
    assert_eq!(snapshot.current_question_number, 1);
    assert_eq!(snapshot.time_remaining_sec, Some(15));
    assert!(snapshot.current_question.is_some());

    sleep(Duration::from_secs(1)).await;
    let outcome = engine::submit_answer(&ctx, &match_id, "bob", 1, "Au")
        .await
        .unwrap();
    assert_eq!(outcome.points_awarded, 100);

    let instances = ctx.store.get_question_instances(&match_id).await.unwrap();
    let row = ctx
        .store
        .get_answer(&instances[0].question_instance_id, "bob")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.response_time_ms, 6_000);
}

#[tokio::test(start_paused = true)]
async fn wrong_question_and_unknown_option_are_refused() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    let err = engine::submit_answer(&ctx, &match_id, "alice", 2, "Mars")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::WrongQuestion);

    let err = engine::submit_answer(&ctx, &match_id, "alice", 1, "Gold")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::OptionNotRecognised);

    let err = engine::submit_answer(&ctx, &match_id, "mallory", 1, "Au")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotAParticipant);
}

#[tokio::test(start_paused = true)]
async fn delete_is_scheduled_only_and_cascades() {
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    let err = engine::delete_if_scheduled(&ctx, &match_id, "bob")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotHost);

    engine::delete_if_scheduled(&ctx, &match_id, "alice")
        .await
        .unwrap();
    assert!(store.get_match(&match_id).await.unwrap().is_none());
    assert!(store
        .get_question_instances(&match_id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        engine::get_snapshot(&ctx, &match_id).await.unwrap_err(),
        EngineError::NotFound
    );
}

#[tokio::test(start_paused = true)]
async fn delete_after_start_is_refused() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &[], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    let err = engine::delete_if_scheduled(&ctx, &match_id, "alice")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotScheduled);
}

#[tokio::test(start_paused = true)]
async fn registration_closes_once_started() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &[], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();

    let err = engine::register_player(&ctx, &match_id, "late")
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotScheduled);
}

#[tokio::test(start_paused = true)]
async fn crashed_ongoing_match_is_abandoned_on_hydration() {
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &[], 2).await;
    engine::start(&ctx, &match_id, "alice").await.unwrap();

    // A fresh process over the same store: no live engine knows this match.
    let ctx2 = ServerCtx {
        engines: Arc::new(MatchEngines::new()),
        rooms: Arc::new(RoomRegistry::new()),
        ..ctx.clone()
    };

    let snapshot = engine::get_snapshot(&ctx2, &match_id).await.unwrap();
    assert_eq!(snapshot.status, MatchStatus::Canceled);

    let row = store.get_match(&match_id).await.unwrap().unwrap();
    assert_eq!(row.status, MatchStatus::Canceled);
}

#[tokio::test(start_paused = true)]
async fn transient_answer_write_failure_is_retryable() {
    let (ctx, store) = test_ctx(gold_and_mars());
    let (match_id, mut rxs) = setup(&ctx, "alice", &["bob"], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    drain(rxs.get_mut("bob").unwrap());

    store.fail_next_answer_writes(1);
    let err = engine::submit_answer(&ctx, &match_id, "alice", 1, "Au")
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // Nothing happened: no broadcast, no score, and the retry succeeds with
    // full points.
    assert!(drain(rxs.get_mut("bob").unwrap()).is_empty());
    assert_eq!(store.answer_count(), 0);

    let outcome = engine::submit_answer(&ctx, &match_id, "alice", 1, "Au")
        .await
        .unwrap();
    assert_eq!(outcome.points_awarded, 100);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_refused() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &[], 2).await;

    engine::start(&ctx, &match_id, "alice").await.unwrap();
    let err = engine::start(&ctx, &match_id, "alice").await.unwrap_err();
    assert_eq!(err, EngineError::NotScheduled);
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_new_transitions() {
    let (ctx, _store) = test_ctx(gold_and_mars());
    let (match_id, _rxs) = setup(&ctx, "alice", &[], 2).await;

    ctx.shutdown.cancel();

    let err = engine::start(&ctx, &match_id, "alice").await.unwrap_err();
    assert_eq!(err, EngineError::ShuttingDown);
}

//! The match state machine.
//!
//! Every public operation here acquires the match's cell first, so state
//! transitions, answer acceptance and the broadcasts they produce are
//! serialized per match. The store is written before in-memory state or any
//! broadcast: a rejected write leaves the match exactly as it was.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, StoreError};
use crate::events::{FinalStanding, MatchSnapshot, ServerEvent};
use crate::mtch::{
    scoring, timer, MatchRuntime, MatchStatus, QuestionRuntime, SubState, UserId,
};
use crate::questions;
use crate::room::ConnHandle;
use crate::store::{AnswerRow, MatchRow, ParticipantRow, Settlement};
use crate::ServerCtx;

/// What the host asks for when setting up a match.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMatchRequest {
    pub category: String,
    pub difficulty: String,
    pub question_count: u32,

    /// Overrides the configured default countdown.
    #[serde(default)]
    pub question_duration_sec: Option<u32>,
}

/// What a submitter gets back. The same data goes out privately as
/// `answer:confirmed`.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerOutcome {
    pub is_correct: bool,
    pub correct_option: String,
    pub points_awarded: i64,
    pub new_score: i64,
}

type Guard = OwnedMutexGuard<Option<MatchRuntime>>;

/// Acquire the per-match executor, hydrating from the store on first touch.
/// Bounded wait: a contended cell turns into a transient `Busy`.
async fn acquire(ctx: &ServerCtx, match_id: &str) -> Result<Guard, EngineError> {
    let cell = ctx.engines.cell(match_id);
    let mut guard = tokio::time::timeout(ctx.config.executor_acquire_timeout(), cell.lock_owned())
        .await
        .map_err(|_| EngineError::Busy)?;

    if guard.is_none() {
        *guard = Some(hydrate(ctx, match_id).await?);
    }

    Ok(guard)
}

fn runtime(guard: &mut Guard) -> &mut MatchRuntime {
    guard.as_mut().expect("cell hydrated by acquire")
}

/// Authoritative re-read from the store. A match found ONGOING here belonged
/// to a previous process; it is abandoned, not resumed.
async fn hydrate(ctx: &ServerCtx, match_id: &str) -> Result<MatchRuntime, EngineError> {
    let Some(mut mtch) = ctx.store.get_match(match_id).await? else {
        return Err(EngineError::NotFound);
    };
    let participants = ctx.store.get_participants(match_id).await?;
    let questions = ctx.store.get_question_instances(match_id).await?;

    if mtch.status == MatchStatus::Ongoing {
        warn!(%match_id, "found an ongoing match with no live engine, abandoning it");
        let now = Utc::now();
        ctx.store
            .set_match_status(match_id, MatchStatus::Canceled, Some(now))
            .await?;
        mtch.status = MatchStatus::Canceled;
        mtch.ended_at = Some(now);
    }

    Ok(MatchRuntime {
        mtch,
        participants,
        questions,
        question: None,
    })
}

/// Set up a new match: draw questions, shuffle their options once, persist
/// the whole thing and install the runtime.
pub async fn create_match(
    ctx: &ServerCtx,
    host_id: &str,
    request: CreateMatchRequest,
) -> Result<MatchSnapshot, EngineError> {
    if request.question_count == 0 {
        return Err(EngineError::NotEnoughQuestions);
    }
    if request.question_count > ctx.config.max_questions_per_match {
        return Err(EngineError::TooManyQuestions);
    }

    let duration_sec = request
        .question_duration_sec
        .unwrap_or(ctx.config.question_duration_sec);

    let pool = match ctx
        .questions
        .fetch_random(&request.category, &request.difficulty, request.question_count)
        .await
    {
        Ok(pool) if (pool.len() as u32) >= request.question_count => pool,
        Ok(_) | Err(StoreError::NotFound) => return Err(EngineError::NotEnoughQuestions),
        Err(_) => return Err(EngineError::Busy),
    };

    let match_id = Uuid::now_v7().hyphenated().to_string();
    let instances = {
        let mut rng = rand::rng();
        questions::build_instances(&match_id, pool, &mut rng)
    };

    let now = Utc::now();
    let mtch = MatchRow {
        match_id: match_id.clone(),
        host_id: host_id.to_owned(),
        status: MatchStatus::Scheduled,
        category: request.category,
        difficulty: request.difficulty,
        question_duration_sec: duration_sec as i64,
        current_question: 0,
        created_at: now,
        started_at: None,
        ended_at: None,
    };
    let host = ParticipantRow {
        match_id: match_id.clone(),
        user_id: host_id.to_owned(),
        score: 0,
        joined_at: now,
    };

    ctx.store
        .create_match(mtch.clone(), host.clone(), instances.clone())
        .await?;

    let runtime = MatchRuntime {
        mtch,
        participants: vec![host],
        questions: instances,
        question: None,
    };
    let snapshot = runtime.snapshot();
    ctx.engines.insert(runtime);

    info!(%match_id, host_id, "match created");
    Ok(snapshot)
}

/// Register a user on a scheduled match. Idempotent.
pub async fn register_player(
    ctx: &ServerCtx,
    match_id: &str,
    user_id: &str,
) -> Result<MatchSnapshot, EngineError> {
    let mut guard = acquire(ctx, match_id).await?;
    let rt = runtime(&mut guard);

    match rt.mtch.status {
        MatchStatus::Scheduled => {}
        MatchStatus::Canceled => return Err(EngineError::Cancelled),
        _ => return Err(EngineError::NotScheduled),
    }

    if !rt.is_participant(user_id) {
        let row = ParticipantRow {
            match_id: match_id.to_owned(),
            user_id: user_id.to_owned(),
            score: 0,
            joined_at: Utc::now(),
        };
        ctx.store.add_participant(row.clone()).await?;
        rt.participants.push(row);
    }

    Ok(rt.snapshot())
}

/// Bind a connection to the match room and reply with the public view.
/// Idempotent; rejoin after a drop lands here too. The per-question clock is
/// not reset for a rejoiner.
pub async fn join(
    ctx: &ServerCtx,
    match_id: &str,
    user_id: &str,
    conn: ConnHandle,
) -> Result<MatchSnapshot, EngineError> {
    let mut guard = acquire(ctx, match_id).await?;
    let rt = runtime(&mut guard);

    if rt.mtch.status == MatchStatus::Canceled {
        return Err(EngineError::Cancelled);
    }
    if !rt.is_participant(user_id) {
        return Err(EngineError::NotAParticipant);
    }

    ctx.rooms.attach(match_id, user_id, conn);

    let snapshot = rt.snapshot();
    ctx.rooms.send_to(
        match_id,
        user_id,
        ServerEvent::MatchState {
            state: snapshot.clone(),
        },
    );
    Ok(snapshot)
}

/// Read-only public view, for the HTTP surface.
pub async fn get_snapshot(ctx: &ServerCtx, match_id: &str) -> Result<MatchSnapshot, EngineError> {
    let mut guard = acquire(ctx, match_id).await?;
    Ok(runtime(&mut guard).snapshot())
}

/// SCHEDULED -> ONGOING. Host only.
pub async fn start(ctx: &ServerCtx, match_id: &str, caller: &str) -> Result<(), EngineError> {
    if ctx.shutdown.is_cancelled() {
        return Err(EngineError::ShuttingDown);
    }

    let mut guard = acquire(ctx, match_id).await?;
    let rt = runtime(&mut guard);

    if rt.mtch.host_id != caller {
        return Err(EngineError::NotHost);
    }
    match rt.mtch.status {
        MatchStatus::Scheduled => {}
        MatchStatus::Canceled => return Err(EngineError::Cancelled),
        _ => return Err(EngineError::NotScheduled),
    }
    if rt.participants.is_empty() {
        return Err(EngineError::NoPlayers);
    }

    let started_at = Utc::now();
    ctx.store.mark_started(match_id, started_at).await?;

    rt.mtch.status = MatchStatus::Ongoing;
    rt.mtch.started_at = Some(started_at);
    rt.mtch.current_question = 1;

    let first_question = rt
        .current_instance()
        .expect("match was created with at least one question")
        .public_view(rt.total_questions());
    ctx.rooms.broadcast(
        match_id,
        ServerEvent::MatchStarted {
            started_at,
            question: first_question,
        },
    );

    info!(%match_id, "match started");
    begin_question(ctx, rt);
    Ok(())
}

/// Accept an answer for the current question while it is open.
pub async fn submit_answer(
    ctx: &ServerCtx,
    match_id: &str,
    user_id: &str,
    question_number: u32,
    selected_option: &str,
) -> Result<AnswerOutcome, EngineError> {
    let mut guard = acquire(ctx, match_id).await?;
    let rt = runtime(&mut guard);

    match rt.mtch.status {
        MatchStatus::Ongoing => {}
        MatchStatus::Canceled => return Err(EngineError::Cancelled),
        _ => return Err(EngineError::MatchNotOngoing),
    }
    if !rt.is_participant(user_id) {
        return Err(EngineError::NotAParticipant);
    }
    if i64::from(question_number) != rt.mtch.current_question {
        return Err(EngineError::WrongQuestion);
    }

    // Acceptance timestamp: assigned under the lock, which is what makes the
    // answer log order and the scoring order one and the same.
    let now = Instant::now();

    let (ask_started, t_fastest) = {
        let qr = rt.question.as_ref().ok_or(EngineError::WrongQuestion)?;
        if qr.sub_state != SubState::Asking {
            return Err(EngineError::WrongQuestion);
        }
        if qr.answered.contains(user_id) {
            return Err(EngineError::AlreadyAnswered);
        }
        (qr.ask_started, qr.t_fastest)
    };

    let instance = rt
        .current_instance()
        .expect("an asking question has an instance");
    if !instance.has_option(selected_option) {
        return Err(EngineError::OptionNotRecognised);
    }

    let is_correct = instance.is_correct(selected_option);
    let response_time_ms = now.duration_since(ask_started).as_millis() as i64;
    let points_awarded = if is_correct {
        match t_fastest {
            None => scoring::MAX_POINTS,
            Some(fastest) => scoring::points_for_correct(now.duration_since(fastest)),
        }
    } else {
        0
    };

    let correct_option = instance.correct_option.clone();
    let answer = AnswerRow {
        question_instance_id: instance.question_instance_id.clone(),
        user_id: user_id.to_owned(),
        selected_option: Some(selected_option.to_owned()),
        is_correct,
        response_time_ms,
        points_awarded,
    };

    // Durable first. If the store refuses, nothing happened.
    ctx.store.record_answer(answer, points_awarded).await?;

    let qr = rt.question.as_mut().expect("checked above");
    qr.answered.insert(user_id.to_owned());
    if is_correct && qr.t_fastest.is_none() {
        qr.t_fastest = Some(now);
    }
    let answered_count = qr.answered.len();

    let participant = rt
        .participant_mut(user_id)
        .expect("participant checked above");
    participant.score += points_awarded;
    let new_score = participant.score;

    ctx.rooms.send_to(
        match_id,
        user_id,
        ServerEvent::AnswerConfirmed {
            question_number,
            is_correct,
            correct_option: correct_option.clone(),
            points_awarded,
            new_score,
        },
    );
    ctx.rooms.broadcast_except(
        match_id,
        user_id,
        ServerEvent::AnswerReceived {
            question_number,
            user_id: user_id.to_owned(),
        },
    );

    if answered_count == rt.participants.len() {
        resolve_current(ctx, rt).await?;
    }

    Ok(AnswerOutcome {
        is_correct,
        correct_option,
        points_awarded,
        new_score,
    })
}

/// RESOLVED -> next question or settlement. Host only; advancing an open
/// question is refused.
pub async fn advance(ctx: &ServerCtx, match_id: &str, caller: &str) -> Result<(), EngineError> {
    if ctx.shutdown.is_cancelled() {
        return Err(EngineError::ShuttingDown);
    }

    let mut guard = acquire(ctx, match_id).await?;
    let rt = runtime(&mut guard);

    if rt.mtch.host_id != caller {
        return Err(EngineError::NotHost);
    }
    match rt.mtch.status {
        MatchStatus::Ongoing => {}
        MatchStatus::Canceled => return Err(EngineError::Cancelled),
        _ => return Err(EngineError::WrongSubState),
    }

    advance_locked(ctx, rt).await
}

/// Remove a match that never started, cascading everything it owns.
pub async fn delete_if_scheduled(
    ctx: &ServerCtx,
    match_id: &str,
    caller: &str,
) -> Result<(), EngineError> {
    let mut guard = acquire(ctx, match_id).await?;
    let rt = runtime(&mut guard);

    if rt.mtch.host_id != caller {
        return Err(EngineError::NotHost);
    }
    if rt.mtch.status != MatchStatus::Scheduled {
        return Err(EngineError::NotScheduled);
    }

    ctx.store.delete_match_cascade(match_id).await?;
    rt.cancel_timers();
    *guard = None;
    ctx.engines.remove(match_id);
    ctx.rooms.drop_room(match_id);

    info!(%match_id, "scheduled match deleted");
    Ok(())
}

/// Countdown ran out. Re-checks that the question is still the open one (an
/// all-answered resolve may have beaten the abort) before resolving.
pub(crate) async fn handle_timer_expired(
    ctx: &ServerCtx,
    match_id: &str,
    question_number: i64,
) -> Result<(), EngineError> {
    let Some(cell) = ctx.engines.peek(match_id) else {
        return Ok(());
    };
    let mut guard = cell.lock_owned().await;
    let Some(rt) = guard.as_mut() else {
        return Ok(());
    };

    if rt.mtch.status != MatchStatus::Ongoing || rt.mtch.current_question != question_number {
        return Ok(());
    }
    let still_asking = rt
        .question
        .as_ref()
        .is_some_and(|q| q.sub_state == SubState::Asking);
    if !still_asking {
        return Ok(());
    }

    // This runs inside the countdown task itself: drop the handle rather
    // than letting resolution abort the task out from under us mid-write.
    if let Some(qr) = rt.question.as_mut() {
        qr.timer.take();
    }

    ctx.rooms.broadcast(
        match_id,
        ServerEvent::TimerExpired {
            time_remaining_sec: 0,
        },
    );
    resolve_current(ctx, rt).await
}

/// The post-resolution delay ran out. Same re-check discipline as expiry.
pub(crate) async fn handle_auto_advance(
    ctx: &ServerCtx,
    match_id: &str,
    question_number: i64,
) -> Result<(), EngineError> {
    if ctx.shutdown.is_cancelled() {
        return Ok(());
    }
    let Some(cell) = ctx.engines.peek(match_id) else {
        return Ok(());
    };
    let mut guard = cell.lock_owned().await;
    let Some(rt) = guard.as_mut() else {
        return Ok(());
    };

    if rt.mtch.status != MatchStatus::Ongoing || rt.mtch.current_question != question_number {
        return Ok(());
    }
    let resolved = rt
        .question
        .as_ref()
        .is_some_and(|q| q.sub_state == SubState::Resolved);
    if !resolved {
        return Ok(());
    }

    // Same self-abort hazard as expiry: this is the delay task, so its own
    // handle must be dropped, not aborted, before advancing.
    if let Some(qr) = rt.question.as_mut() {
        qr.auto_advance.take();
    }

    advance_locked(ctx, rt).await
}

/// Open the current question: fresh runtime, `question:new` + `timer:start`
/// to the room, countdown armed.
fn begin_question(ctx: &ServerCtx, rt: &mut MatchRuntime) {
    let duration_sec = rt.mtch.question_duration_sec as u32;
    let question_number = rt.mtch.current_question;
    let match_id = rt.mtch.match_id.clone();
    let question = rt
        .current_instance()
        .expect("question number stays in range")
        .public_view(rt.total_questions());

    let mut qr = QuestionRuntime::asking(Instant::now());

    ctx.rooms
        .broadcast(&match_id, ServerEvent::QuestionNew { question });
    ctx.rooms.broadcast(
        &match_id,
        ServerEvent::TimerStart {
            time_remaining_sec: duration_sec,
        },
    );

    qr.timer = Some(timer::start_question_timer(
        ctx,
        match_id,
        question_number,
        duration_sec,
    ));
    rt.question = Some(qr);
}

/// ASKING -> RESOLVED: cancel the countdown, record auto-misses for everyone
/// who never answered, reveal the correct option with the scoreboard, and arm
/// the auto-advance delay.
async fn resolve_current(ctx: &ServerCtx, rt: &mut MatchRuntime) -> Result<(), EngineError> {
    {
        let qr = rt.question.as_mut().ok_or(EngineError::WrongSubState)?;
        if qr.sub_state != SubState::Asking {
            return Err(EngineError::WrongSubState);
        }
        qr.cancel_timers();
        qr.sub_state = SubState::Resolved;
    }

    let question_number = rt.mtch.current_question;
    let match_id = rt.mtch.match_id.clone();
    let duration_ms = rt.mtch.question_duration_sec * 1_000;
    let instance = rt
        .current_instance()
        .expect("resolved question has an instance");
    let correct_option = instance.correct_option.clone();
    let question_instance_id = instance.question_instance_id.clone();

    let answered = &rt.question.as_ref().expect("just resolved").answered;
    let misses: Vec<AnswerRow> = rt
        .participants
        .iter()
        .filter(|p| !answered.contains(&p.user_id))
        .map(|p| AnswerRow {
            question_instance_id: question_instance_id.clone(),
            user_id: p.user_id.clone(),
            selected_option: None,
            is_correct: false,
            response_time_ms: duration_ms,
            points_awarded: 0,
        })
        .collect();

    if !misses.is_empty() {
        persist_auto_misses(ctx, &match_id, misses).await;
    }

    ctx.rooms.broadcast(
        &match_id,
        ServerEvent::QuestionEnded {
            question_number: question_number as u32,
            correct_option,
            scoreboard: rt.scoreboard(),
        },
    );

    let delay = ctx.config.auto_advance_delay();
    let qr = rt.question.as_mut().expect("just resolved");
    qr.auto_advance = Some(timer::start_auto_advance(
        ctx,
        match_id,
        question_number,
        delay,
    ));
    Ok(())
}

/// Auto-miss rows matter for the audit trail but must not wedge the match:
/// a store that stays down gets a few retries, then the match moves on.
async fn persist_auto_misses(ctx: &ServerCtx, match_id: &str, misses: Vec<AnswerRow>) {
    for attempt in 1..=3u32 {
        match ctx.store.record_auto_misses(misses.clone()).await {
            Ok(()) => return,
            Err(err) if err.is_retryable() && attempt < 3 => {
                warn!(%match_id, attempt, "auto-miss write failed, retrying: {err}");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            Err(err) => {
                error!(%match_id, "giving up on auto-miss rows: {err}");
                return;
            }
        }
    }
}

async fn advance_locked(ctx: &ServerCtx, rt: &mut MatchRuntime) -> Result<(), EngineError> {
    {
        let qr = rt.question.as_mut().ok_or(EngineError::WrongSubState)?;
        if qr.sub_state != SubState::Resolved {
            return Err(EngineError::WrongSubState);
        }
        qr.cancel_timers();
    }

    if rt.mtch.current_question < i64::from(rt.total_questions()) {
        let next = rt.mtch.current_question + 1;
        ctx.store
            .set_current_question(&rt.mtch.match_id, next)
            .await?;
        rt.mtch.current_question = next;
        begin_question(ctx, rt);
        Ok(())
    } else {
        settle(ctx, rt).await
    }
}

/// End-of-match settlement: one atomic store transaction, retried with
/// jittered backoff. Exhausting the retries cancels the match in a fresh
/// transaction and reports it as aborted.
async fn settle(ctx: &ServerCtx, rt: &mut MatchRuntime) -> Result<(), EngineError> {
    let match_id = rt.mtch.match_id.clone();
    let ended_at = Utc::now();
    let retries = ctx.config.settlement_retries.max(1);

    let mut settled: Option<Settlement> = None;
    for attempt in 1..=retries {
        let result: Result<Settlement, StoreError> = async {
            let answers = ctx.store.get_answers_for_match(&match_id).await?;
            let settlement = scoring::compute_settlement(
                &rt.mtch,
                &rt.participants,
                &rt.questions,
                &answers,
                ended_at,
            );
            ctx.store.commit_settlement(&settlement).await?;
            Ok(settlement)
        }
        .await;

        match result {
            Ok(settlement) => {
                settled = Some(settlement);
                break;
            }
            Err(err) if attempt < retries => {
                warn!(%match_id, attempt, "settlement attempt failed: {err}");
                tokio::time::sleep(scoring::settlement_backoff(attempt)).await;
            }
            Err(err) => {
                error!(%match_id, "settlement failed after {retries} attempts: {err}");
            }
        }
    }

    rt.question = None;
    rt.mtch.ended_at = Some(ended_at);

    match settled {
        Some(settlement) => {
            rt.mtch.status = MatchStatus::Finished;

            let scoreboard: Vec<FinalStanding> = settlement
                .scores
                .iter()
                .map(|row| FinalStanding {
                    user_id: row.user_id.clone(),
                    total_score: row.total_score,
                    correct_count: row.correct_count,
                    avg_response_time_ms: row.avg_response_time_ms,
                })
                .collect();

            info!(%match_id, winners = ?settlement.winners, "match settled");
            ctx.rooms.broadcast(
                &match_id,
                ServerEvent::MatchFinished {
                    scoreboard,
                    winners: settlement.winners.clone(),
                    aborted: false,
                },
            );
        }
        None => {
            rt.mtch.status = MatchStatus::Canceled;

            if let Err(err) = ctx
                .store
                .set_match_status(&match_id, MatchStatus::Canceled, Some(ended_at))
                .await
            {
                error!(%match_id, "could not record cancellation: {err}");
            }

            ctx.rooms.broadcast(
                &match_id,
                ServerEvent::MatchFinished {
                    scoreboard: Vec::new(),
                    winners: Vec::<UserId>::new(),
                    aborted: true,
                },
            );
        }
    }

    // The match is over either way; evict the runtime. Later reads hydrate
    // the final state from the store.
    ctx.engines.remove(&match_id);
    ctx.rooms.drop_room(&match_id);
    Ok(())
}
